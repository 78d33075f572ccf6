use crate::types::{is_valid_env_name, BackendKind, ImageSource, MountSpec};
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TestbedConfig {
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub namespace: Option<NamespaceSection>,
    #[serde(default)]
    pub container: Option<ContainerSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSection {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Root for undeclared test outputs; a temp directory when unset.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// Prefix that makes executed binaries line-buffer stdout/stderr. Used
    /// only when its tool is found in the environment; empty disables it.
    #[serde(default = "default_line_buffer")]
    pub line_buffer: Vec<String>,
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            workspace: None,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            line_buffer: default_line_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NamespaceSection {
    pub sysroot: PathBuf,
    #[serde(default = "default_sandbox_tool")]
    pub tool: String,
    #[serde(default = "default_true")]
    pub host_system_dirs: bool,
    #[serde(default)]
    pub persistent: Option<PathBuf>,
    /// Host directory collecting test artifacts, bound at `/tmp/artifacts`.
    #[serde(default)]
    pub artifacts: Option<PathBuf>,
    /// Bind the host `/dev` instead of a minimal private one.
    #[serde(default = "default_true")]
    pub device_passthrough: bool,
    #[serde(default = "default_anchor_command")]
    pub anchor_command: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub run_under: Option<RunUnderSection>,
}

/// Prefix selected binaries with a wrapper tool such as valgrind.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunUnderSection {
    pub tool: Vec<String>,
    #[serde(default)]
    pub apps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContainerSection {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub rootfs_archive: Option<PathBuf>,
    #[serde(default)]
    pub sysroot: Option<PathBuf>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_anchor_command")]
    pub anchor_command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
}

impl ContainerSection {
    pub fn image_source(&self) -> Result<ImageSource, ConfigError> {
        let mut set = Vec::new();
        if self.image.is_some() {
            set.push("image");
        }
        if self.rootfs_archive.is_some() {
            set.push("rootfs_archive");
        }
        if self.sysroot.is_some() {
            set.push("sysroot");
        }
        if set.len() > 1 {
            return Err(ConfigError::AmbiguousImageSource(set.join(", ")));
        }

        if let Some(image) = &self.image {
            let trimmed = image.trim();
            if trimmed.is_empty() {
                return Err(ConfigError::EmptyImageReference);
            }
            return Ok(ImageSource::Reference(trimmed.to_owned()));
        }
        if let Some(archive) = &self.rootfs_archive {
            return Ok(ImageSource::RootfsArchive(archive.clone()));
        }
        if let Some(dir) = &self.sysroot {
            return Ok(ImageSource::Sysroot(dir.clone()));
        }
        Err(ConfigError::MissingImageSource)
    }
}

impl TestbedConfig {
    /// A config selecting `backend` with every other value at its default.
    pub fn for_backend(backend: BackendKind) -> Self {
        Self {
            environment: EnvironmentSection {
                backend,
                ..EnvironmentSection::default()
            },
            namespace: None,
            container: None,
        }
    }

    /// Check the cross-field rules serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.stop_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        match self.environment.backend {
            BackendKind::Namespace => {
                let ns = self
                    .namespace
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingSection("namespace".to_owned()))?;
                validate_mounts(&ns.mounts)?;
                validate_env(&ns.env)?;
            }
            BackendKind::Container => {
                let ct = self
                    .container
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingSection("container".to_owned()))?;
                ct.image_source()?;
                validate_mounts(&ct.mounts)?;
                validate_env(&ct.env)?;
            }
            BackendKind::None => {}
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn validate_mounts(mounts: &[MountSpec]) -> Result<(), ConfigError> {
    mounts.iter().try_for_each(MountSpec::validate)
}

fn validate_env(env: &BTreeMap<String, String>) -> Result<(), ConfigError> {
    match env.keys().find(|k| !is_valid_env_name(k)) {
        Some(bad) => Err(ConfigError::InvalidEnvName(bad.clone())),
        None => Ok(()),
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Namespace
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

fn default_sandbox_tool() -> String {
    "bwrap".to_owned()
}

fn default_engine() -> String {
    "docker".to_owned()
}

fn default_network() -> String {
    "bridge".to_owned()
}

fn default_anchor_command() -> Vec<String> {
    vec!["sleep".to_owned(), "infinity".to_owned()]
}

pub fn default_line_buffer() -> Vec<String> {
    vec!["stdbuf".to_owned(), "-oL".to_owned(), "-eL".to_owned()]
}

fn default_true() -> bool {
    true
}

pub fn parse_config_str(input: &str) -> Result<TestbedConfig, ConfigError> {
    let config: TestbedConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<TestbedConfig, ConfigError> {
    let config = read_config_file(path)?;
    config.validate()?;
    Ok(config)
}

/// Read and parse without the cross-field checks, for callers that still
/// apply overrides before validating.
pub fn read_config_file(path: impl AsRef<Path>) -> Result<TestbedConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}
