use super::{EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;
use testbed_runtime::{check_container_prereqs, check_namespace_prereqs, format_missing};
use testbed_schema::{read_config_file, BackendKind, TestbedConfig};

pub fn run(
    config_path: &Path,
    backend: Option<BackendKind>,
    json_output: bool,
) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let config = load_optional(config_path, &mut checks);
    let selected = backend.or_else(|| config.as_ref().map(|c| c.environment.backend));
    let wanted = |kind: BackendKind| selected.is_none_or(|s| s == kind);

    if wanted(BackendKind::Namespace) {
        let tool = config
            .as_ref()
            .and_then(|c| c.namespace.as_ref())
            .map_or("bwrap", |ns| ns.tool.as_str());
        check_backend(
            "namespace_prereqs",
            "Namespace backend",
            &check_namespace_prereqs(tool),
            &mut checks,
            &mut all_pass,
        );
    }
    if wanted(BackendKind::Container) {
        let engine = config
            .as_ref()
            .and_then(|c| c.container.as_ref())
            .map_or("docker", |ct| ct.engine.as_str());
        check_backend(
            "container_prereqs",
            "Container backend",
            &check_container_prereqs(engine),
            &mut checks,
            &mut all_pass,
        );
    }
    if wanted(BackendKind::None) {
        checks.push(Check::warn(
            "direct_backend",
            "Direct backend available (no isolation: processes run on the host)",
        ));
    }
    check_temp_dir(&mut checks, &mut all_pass);

    print_results(&checks, all_pass, json_output)
}

fn load_optional(path: &Path, checks: &mut Vec<Check>) -> Option<TestbedConfig> {
    if !path.exists() {
        checks.push(Check::info(
            "config",
            &format!("No config at {} (checking all backends)", path.display()),
        ));
        return None;
    }
    match read_config_file(path).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => {
            checks.push(Check::pass(
                "config",
                &format!(
                    "Config {} valid ({} backend)",
                    path.display(),
                    config.environment.backend
                ),
            ));
            Some(config)
        }
        Err(e) => {
            checks.push(Check::warn("config", &format!("Config not usable: {e}")));
            None
        }
    }
}

fn check_backend(
    name: &str,
    label: &str,
    missing: &[testbed_runtime::MissingPrereq],
    checks: &mut Vec<Check>,
    all_pass: &mut bool,
) {
    if missing.is_empty() {
        checks.push(Check::pass(name, &format!("{label} prerequisites satisfied")));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            name,
            &format!("{label}: {}", format_missing(missing)),
        ));
    }
}

fn check_temp_dir(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let tmp = std::env::temp_dir();
    match tempfile::Builder::new().prefix("testbed-").tempdir_in(&tmp) {
        Ok(_) => checks.push(Check::pass(
            "workspace",
            &format!("Temporary workspaces can be created in {}", tmp.display()),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "workspace",
                &format!("Cannot create a workspace in {}: {e}", tmp.display()),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", super::json_pretty(&json)?);
    } else {
        println!("Testbed Doctor\n");
        for check in checks {
            let icon = match check.status.as_str() {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: String,
    message: String,
}

impl Check {
    fn with_status(name: &str, status: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: status.to_owned(),
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::with_status(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::with_status(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::with_status(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::with_status(name, "info", message)
    }
}
