//! Configuration schema for testbed execution environments.
//!
//! This crate defines the `testbed.toml` model (`TestbedConfig`), the closed
//! backend selection enum (`BackendKind`), bind-mount declarations
//! (`MountSpec`) and the container image source (`ImageSource`). Parsing is
//! strict: unknown keys and unknown backend names are configuration errors.

pub mod config;
pub mod types;

pub use config::{
    default_line_buffer, parse_config_file, parse_config_str, read_config_file, ContainerSection,
    EnvironmentSection, NamespaceSection, RunUnderSection, TestbedConfig,
    DEFAULT_STOP_TIMEOUT_SECS,
};
pub use types::{BackendKind, ImageSource, MountMode, MountSpec};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unknown backend '{0}', expected one of: namespace, container, none")]
    UnknownBackend(String),
    #[error("backend '{0}' requires a [{0}] section")]
    MissingSection(String),
    #[error("container image source missing: set exactly one of image, rootfs_archive, sysroot")]
    MissingImageSource,
    #[error("container image source is ambiguous: {0} are all set, expected exactly one")]
    AmbiguousImageSource(String),
    #[error("container image reference must not be empty")]
    EmptyImageReference,
    #[error("invalid mount '{host}' -> '{guest}': {reason}")]
    InvalidMount {
        host: String,
        guest: String,
        reason: String,
    },
    #[error("invalid environment variable name: '{0}'")]
    InvalidEnvName(String),
    #[error("stop timeout must be greater than zero")]
    ZeroTimeout,
}
