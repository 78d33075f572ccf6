use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// A missing prerequisite with actionable install instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: String,
    pub install_hint: String,
}

impl MissingPrereq {
    fn new(name: impl Into<String>, purpose: &str, install_hint: &str) -> Self {
        Self {
            name: name.into(),
            purpose: purpose.to_owned(),
            install_hint: install_hint.to_owned(),
        }
    }
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Absolute path of `name` as found on `PATH`.
pub(crate) fn find_command(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let output = Command::new("which")
        .arg(name)
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let found = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!found.is_empty()).then(|| PathBuf::from(found))
}

pub(crate) fn command_exists(name: &str) -> bool {
    find_command(name).is_some()
}

fn sandbox_tool_works(tool: &str) -> bool {
    Command::new(tool)
        .args(["--unshare-user", "--unshare-pid", "--ro-bind", "/", "/", "--", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn engine_daemon_reachable(engine: &str) -> bool {
    Command::new(engine)
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check all prerequisites for the namespace backend using sandboxing
/// binary `tool`. An empty list means everything is in place.
pub fn check_namespace_prereqs(tool: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(tool) {
        missing.push(MissingPrereq::new(
            tool,
            "mount and PID namespace sandbox",
            "zypper install bubblewrap | apt install bubblewrap | dnf install bubblewrap | pacman -S bubblewrap",
        ));
    } else if !sandbox_tool_works(tool) {
        missing.push(MissingPrereq::new(
            "user namespaces",
            "unprivileged sandbox creation",
            "enable CONFIG_USER_NS=y in kernel, or: sysctl kernel.unprivileged_userns_clone=1",
        ));
    }

    if !command_exists("nsenter") {
        missing.push(MissingPrereq::new(
            "nsenter",
            "starting processes inside the running sandbox",
            "part of util-linux (usually pre-installed)",
        ));
    }

    missing
}

/// Check prerequisites for the container backend driven by `engine`.
pub fn check_container_prereqs(engine: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(engine) {
        missing.push(MissingPrereq::new(
            engine,
            "container lifecycle and exec",
            "install docker or podman (podman-docker provides the docker command)",
        ));
    } else if !engine_daemon_reachable(engine) {
        missing.push(MissingPrereq::new(
            format!("{engine} daemon"),
            "creating and running containers",
            "start the daemon (systemctl start docker) and make sure your user may access it",
        ));
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nThe selected backend needs these tools to run processes in isolation.");
    msg
}
