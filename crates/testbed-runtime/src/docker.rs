//! Thin wrapper over a Docker-compatible engine CLI.
//!
//! Every primitive shells out to `<engine> <subcommand>`, so any engine that
//! speaks the Docker CLI (docker, podman, nerdctl) works.

use crate::container::ContainerSpec;
use crate::RuntimeError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::{debug, info};

/// Collects the descendants of `$2` from `/proc` breadth first, then sends
/// signal `$1` to all of them. Fails only when nothing was signalled.
const KILL_TREE: &str = r#"sig=$1
todo=$2
all=
while [ -n "$todo" ]; do
    next=
    for f in /proc/[0-9]*/stat; do
        read -r line 2>/dev/null < "$f" || continue
        set -- ${line##*) }
        for p in $todo; do
            if [ "$2" = "$p" ]; then
                pid=${f#/proc/}
                next="$next ${pid%/stat}"
            fi
        done
    done
    all="$all $todo"
    todo=$next
done
status=1
for p in $all; do
    kill -"$sig" "$p" 2>/dev/null && status=0
done
exit $status"#;

/// Result of a synchronous exec inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// One attached network as reported by `inspect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "Gateway", default)]
    pub gateway: String,
}

#[derive(Debug, Clone)]
pub struct ContainerDelegate {
    engine: String,
}

impl ContainerDelegate {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    fn command(&self) -> Command {
        Command::new(&self.engine)
    }

    fn output<I, S>(&self, args: I) -> Result<Output, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command();
        cmd.args(args).stdin(Stdio::null());
        debug!("{cmd:?}");
        cmd.output()
            .map_err(|e| format!("failed to run {}: {e}", self.engine))
    }

    /// Run a subcommand that must succeed; its stderr becomes the error.
    fn checked<I, S>(&self, args: I) -> Result<Output, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(args)?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_owned())
        }
    }

    /// Engine binary present and daemon reachable.
    pub fn available(&self) -> bool {
        self.output(["version", "--format", "{{.Server.Version}}"])
            .is_ok_and(|o| o.status.success())
    }

    pub fn image_exists(&self, image: &str) -> bool {
        self.output(["image", "inspect", image])
            .is_ok_and(|o| o.status.success())
    }

    pub fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        info!("pulling image {image}");
        self.checked(["pull", image])
            .map(drop)
            .map_err(|e| RuntimeError::Setup(format!("cannot pull image '{image}': {e}")))
    }

    /// Import a root-filesystem tarball as image `tag`.
    pub fn import_archive(&self, archive: &Path, tag: &str) -> Result<(), RuntimeError> {
        if !archive.is_file() {
            return Err(RuntimeError::Setup(format!(
                "rootfs archive not found: {}",
                archive.display()
            )));
        }
        info!("importing {} as {tag}", archive.display());
        let args: [&OsStr; 3] = ["import".as_ref(), archive.as_os_str(), tag.as_ref()];
        self.checked(args).map(drop).map_err(|e| {
            RuntimeError::Setup(format!("cannot import {}: {e}", archive.display()))
        })
    }

    pub fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        self.checked(["image", "rm", "-f", tag])
            .map(drop)
            .map_err(RuntimeError::Execution)
    }

    /// Create (but do not start) a container running `spec.anchor_command`
    /// under an init process.
    pub fn create(&self, name: &str, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let args = create_args(name, spec);
        self.checked(&args).map(drop).map_err(|e| {
            RuntimeError::Setup(format!(
                "cannot create container from '{}': {e}",
                spec.image_reference
            ))
        })
    }

    pub fn start(&self, container: &str) -> Result<(), RuntimeError> {
        self.checked(["start", container])
            .map(drop)
            .map_err(|e| RuntimeError::Setup(format!("cannot start {container}: {e}")))
    }

    pub fn is_running(&self, container: &str) -> bool {
        self.output(["inspect", "--format", "{{.State.Running}}", container])
            .is_ok_and(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
    }

    pub fn exists(&self, container: &str) -> bool {
        self.output(["container", "inspect", container])
            .is_ok_and(|o| o.status.success())
    }

    /// Synchronous exec: waits and returns exit code plus captured output.
    pub fn exec(
        &self,
        container: &str,
        env: &BTreeMap<String, String>,
        argv: &[String],
    ) -> Result<ExecOutput, RuntimeError> {
        let mut cmd = self.exec_streaming(container, env, None, argv);
        cmd.stdin(Stdio::null());
        debug!("{cmd:?}");
        let output = cmd
            .output()
            .map_err(|e| RuntimeError::Execution(format!("failed to run {}: {e}", self.engine)))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(crate::UNKNOWN_EXIT_CODE),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// An unspawned `exec` client. Once spawned with piped output, its
    /// stdout/stderr stream the live output of `argv` and its exit status
    /// relays the exit code.
    pub fn exec_streaming(
        &self,
        container: &str,
        env: &BTreeMap<String, String>,
        workdir: Option<&Path>,
        argv: &[String],
    ) -> Command {
        let mut cmd = self.command();
        cmd.arg("exec");
        if let Some(dir) = workdir {
            cmd.arg("-w").arg(dir);
        }
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(container).args(argv);
        cmd
    }

    /// Signal `pid` inside `container` together with everything it forked.
    pub fn kill_process(&self, container: &str, pid: u32, signal: i32) -> Result<(), RuntimeError> {
        let sig = signal.to_string();
        let pid = pid.to_string();
        self.checked([
            "exec",
            container,
            "/bin/sh",
            "-c",
            KILL_TREE,
            "testbed-kill",
            sig.as_str(),
            pid.as_str(),
        ])
        .map(drop)
        .map_err(RuntimeError::Execution)
    }

    pub fn copy_to(&self, container: &str, host: &Path, guest: &Path) -> Result<(), RuntimeError> {
        if !host.is_file() {
            return Err(RuntimeError::Transfer(format!(
                "source not found: {}",
                host.display()
            )));
        }
        if let Some(parent) = guest.parent().filter(|p| !p.as_os_str().is_empty()) {
            let parent = parent.to_string_lossy();
            self.checked(["exec", container, "mkdir", "-p", &*parent])
                .map_err(|e| RuntimeError::Transfer(format!("cannot create {parent}: {e}")))?;
        }
        let target = format!("{container}:{}", guest.display());
        let args: [&OsStr; 3] = ["cp".as_ref(), host.as_os_str(), target.as_ref()];
        self.checked(args)
            .map(drop)
            .map_err(|e| RuntimeError::Transfer(format!("{} -> {target}: {e}", host.display())))
    }

    pub fn copy_from(&self, container: &str, guest: &Path, host: &Path) -> Result<(), RuntimeError> {
        if let Some(parent) = host.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| RuntimeError::Transfer(format!("{}: {e}", parent.display())))?;
        }
        let source = format!("{container}:{}", guest.display());
        let args: [&OsStr; 3] = ["cp".as_ref(), source.as_ref(), host.as_os_str()];
        self.checked(args)
            .map(drop)
            .map_err(|e| RuntimeError::Transfer(format!("{source} -> {}: {e}", host.display())))
    }

    pub fn networks(&self, container: &str) -> Result<BTreeMap<String, NetworkEndpoint>, RuntimeError> {
        let output = self
            .checked([
                "inspect",
                "--format",
                "{{json .NetworkSettings.Networks}}",
                container,
            ])
            .map_err(RuntimeError::Execution)?;
        parse_networks(&String::from_utf8_lossy(&output.stdout))
    }

    /// IP address on `network`, or on the first attached network.
    pub fn ip_address(
        &self,
        container: &str,
        network: Option<&str>,
    ) -> Result<Option<String>, RuntimeError> {
        let networks = self.networks(container)?;
        Ok(pick_endpoint(&networks, network, |e| &e.ip_address))
    }

    pub fn gateway(
        &self,
        container: &str,
        network: Option<&str>,
    ) -> Result<Option<String>, RuntimeError> {
        let networks = self.networks(container)?;
        Ok(pick_endpoint(&networks, network, |e| &e.gateway))
    }

    /// Processes inside the container, one `pid command` line each.
    pub fn top(&self, container: &str) -> Result<Vec<String>, RuntimeError> {
        let output = self
            .checked(["top", container, "-o", "pid,comm"])
            .map_err(RuntimeError::Execution)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub fn stop(&self, container: &str, timeout_secs: u64) -> Result<(), RuntimeError> {
        let t = timeout_secs.to_string();
        self.checked(["stop", "-t", t.as_str(), container])
            .map(drop)
            .map_err(RuntimeError::Execution)
    }

    pub fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        self.checked(["rm", "-f", container])
            .map(drop)
            .map_err(RuntimeError::Execution)
    }
}

pub(crate) fn create_args(name: &str, spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_owned(),
        "--init".to_owned(),
        "--name".to_owned(),
        name.to_owned(),
        format!("--network={}", spec.network_mode),
    ];
    if spec.privileged {
        args.push("--privileged".to_owned());
    }
    for (key, value) in &spec.environment_variables {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        args.push("-v".to_owned());
        let mut volume = format!("{}:{}", mount.host_path.display(), mount.guest_path.display());
        if mount.mode.is_read_only() {
            volume.push_str(":ro");
        }
        args.push(volume);
    }
    args.push(spec.image_reference.clone());
    args.extend(spec.anchor_command.iter().cloned());
    args
}

pub(crate) fn parse_networks(json: &str) -> Result<BTreeMap<String, NetworkEndpoint>, RuntimeError> {
    let trimmed = json.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(trimmed)
        .map_err(|e| RuntimeError::Execution(format!("unexpected inspect output: {e}")))
}

fn pick_endpoint<F>(
    networks: &BTreeMap<String, NetworkEndpoint>,
    network: Option<&str>,
    field: F,
) -> Option<String>
where
    F: Fn(&NetworkEndpoint) -> &String,
{
    let value = match network {
        Some(name) => networks.get(name).map(&field),
        None => networks.values().map(&field).find(|v| !v.is_empty()),
    }?;
    if value.is_empty() {
        None
    } else {
        Some(value.clone())
    }
}
