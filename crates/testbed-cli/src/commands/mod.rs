pub mod check;
pub mod doctor;
pub mod run;

use std::path::{Path, PathBuf};
use testbed_schema::{read_config_file, BackendKind, TestbedConfig};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_SETUP_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Load `path` and apply command-line overrides. A missing file is only
/// accepted when `--backend` says what to run under.
pub fn load_config(
    path: &Path,
    backend: Option<BackendKind>,
    workspace: Option<PathBuf>,
) -> Result<TestbedConfig, String> {
    let mut config = if path.exists() {
        read_config_file(path).map_err(|e| format!("configuration error: {e}"))?
    } else if let Some(kind) = backend {
        TestbedConfig::for_backend(kind)
    } else {
        return Err(format!(
            "configuration error: {} not found (pass --config or --backend)",
            path.display()
        ));
    };

    if let Some(kind) = backend {
        config.environment.backend = kind;
    }
    if workspace.is_some() {
        config.environment.workspace = workspace;
    }
    config
        .validate()
        .map_err(|e| format!("configuration error: {e}"))?;
    Ok(config)
}

/// Map a handle's exit code onto a process exit status the way a shell
/// would: signal deaths become `128 + signo`.
pub fn exit_status(code: i32) -> u8 {
    match code {
        0..=255 => code as u8,
        -64..=-1 if code != testbed_runtime::UNKNOWN_EXIT_CODE => (128 - code) as u8,
        _ => EXIT_FAILURE,
    }
}
