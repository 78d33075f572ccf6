use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The three isolation mechanisms a test run can be executed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    Namespace,
    Container,
    None,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Namespace, Self::Container, Self::None];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Container => "container",
            Self::None => "none",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "namespace" => Ok(Self::Namespace),
            "container" => Ok(Self::Container),
            "none" => Ok(Self::None),
            _ => Err(ConfigError::UnknownBackend(s.to_owned())),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_owned()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
}

impl MountMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// One declared bind mount: a host path made visible at a guest path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountSpec {
    pub host: PathBuf,
    pub guest: PathBuf,
    #[serde(default)]
    pub mode: MountMode,
}

impl MountSpec {
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<PathBuf>, mode: MountMode) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            mode,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidMount {
            host: self.host.display().to_string(),
            guest: self.guest.display().to_string(),
            reason: reason.to_owned(),
        };
        if self.host.as_os_str().is_empty() {
            return Err(invalid("host path is empty"));
        }
        if !self.guest.is_absolute() {
            return Err(invalid("guest path must be absolute"));
        }
        if self
            .guest
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(invalid("guest path must not contain '..'"));
        }
        Ok(())
    }
}

/// Where the container backend gets its root filesystem from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A reference the container engine can resolve (`name:tag`, digest, ...).
    Reference(String),
    /// A root-filesystem tar archive to import as a transient image.
    RootfsArchive(PathBuf),
    /// A host directory packed into an archive and imported.
    Sysroot(PathBuf),
}

impl ImageSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Reference(r) => format!("image {r}"),
            Self::RootfsArchive(p) => format!("rootfs archive {}", p.display()),
            Self::Sysroot(p) => format!("sysroot {}", p.display()),
        }
    }
}

pub(crate) fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && !name.as_bytes()[0].is_ascii_digit()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
