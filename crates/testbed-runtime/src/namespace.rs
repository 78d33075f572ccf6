//! Namespace backend: a bubblewrap sandbox entered with `nsenter`.
//!
//! `setup()` starts one long-lived anchor process under the sandboxing tool
//! with private user, mount and PID namespaces and the composed mount plan.
//! Every `execute()` joins those namespaces through `nsenter`, so all test
//! processes share one filesystem view and one PID namespace. Killing the
//! namespace init at teardown takes every descendant with it.

use crate::environment::{Environment, TeardownReport};
use crate::handle::{Invocation, ProcessHandle};
use crate::lifecycle::{
    begin_setup, require_ready, require_ready_for_transfer, validate_transition, EnvState,
};
use crate::prereq::find_command;
use crate::process::{
    find_child_pid, group_members, lead_own_group, line_buffer_prefix, pid_alive, read_stat,
    send_signal, ExitRelay, HostProcess, ProcessTable,
};
use crate::workspace::Workspace;
use crate::RuntimeError;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use testbed_schema::{default_line_buffer, BackendKind, MountMode, NamespaceSection};
use tracing::{debug, info, warn};

/// Host directories exposed read-only when `host_system_dirs` is set.
pub const HOST_SYSTEM_DIRS: &[&str] = &[
    "/bin",
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/bin",
    "/usr/lib64",
    "/usr/libexec",
];

/// Guest path the artifacts directory is bound at.
pub const ARTIFACTS_GUEST_PATH: &str = "/tmp/artifacts";

/// Set for every sandboxed process unless the configuration overrides them.
pub const SANDBOX_DEFAULT_ENV: &[(&str, &str)] = &[
    ("TEST_PREMATURE_EXIT_FILE", "/tmp/gtest.exited_prematurely"),
    ("SCTF", "SCTF"),
    ("AMSR_DISABLE_INTEGRITY_CHECK", "1"),
];

const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const ANCHOR_TIMEOUT: Duration = Duration::from_secs(10);
const ANCHOR_POLL: Duration = Duration::from_millis(20);
/// How long to wait for `nsenter` to fork the target before signalling.
const CHILD_WAIT: Duration = Duration::from_secs(2);
const TEARDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_SYMLINK_DEPTH: usize = 16;

/// One bind mount of the sandbox view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxMount {
    pub host_path: PathBuf,
    pub guest_path: PathBuf,
    pub mode: MountMode,
}

impl SandboxMount {
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<PathBuf>, mode: MountMode) -> Self {
        Self {
            host_path: host.into(),
            guest_path: guest.into(),
            mode,
        }
    }

    fn tool_args(&self) -> [OsString; 3] {
        let flag = if self.mode.is_read_only() {
            "--ro-bind"
        } else {
            "--bind"
        };
        [
            flag.into(),
            self.host_path.clone().into_os_string(),
            self.guest_path.clone().into_os_string(),
        ]
    }
}

/// Compose the ordered mount plan: sysroot at `/`, the workspace at `/tmp`,
/// the persistent directory, host system directories that exist, the
/// artifacts directory, and then the declared mounts. Later entries shadow
/// earlier ones.
pub fn mount_plan(config: &NamespaceSection, workspace: &Path) -> Vec<SandboxMount> {
    let mut plan = vec![
        SandboxMount::new(&config.sysroot, "/", MountMode::ReadWrite),
        SandboxMount::new(workspace, "/tmp", MountMode::ReadWrite),
    ];
    if let Some(persistent) = &config.persistent {
        plan.push(SandboxMount::new(persistent, "/persistent", MountMode::ReadWrite));
    }
    if config.host_system_dirs {
        plan.extend(
            HOST_SYSTEM_DIRS
                .iter()
                .filter(|d| Path::new(d).is_dir())
                .map(|d| SandboxMount::new(d, d, MountMode::ReadOnly)),
        );
    }
    if let Some(artifacts) = &config.artifacts {
        plan.push(SandboxMount::new(
            artifacts,
            ARTIFACTS_GUEST_PATH,
            MountMode::ReadWrite,
        ));
    }
    plan.extend(
        config
            .mounts
            .iter()
            .map(|m| SandboxMount::new(&m.host, &m.guest, m.mode)),
    );
    plan
}

/// Lexically normalise an absolute guest path (`.`/`..` folded, never
/// escaping `/`).
pub(crate) fn normalize_guest(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Map a guest path to the host path backing it and the mount that
/// provides it. The last matching mount wins.
pub(crate) fn resolve_guest<'a>(
    plan: &'a [SandboxMount],
    guest: &Path,
) -> Option<(PathBuf, &'a SandboxMount)> {
    let guest = normalize_guest(guest);
    plan.iter().rev().find_map(|mount| {
        let rel = guest.strip_prefix(&mount.guest_path).ok()?;
        let host = if rel.as_os_str().is_empty() {
            mount.host_path.clone()
        } else {
            mount.host_path.join(rel)
        };
        Some((host, mount))
    })
}

/// Resolve an executable guest path to a host file, following symlinks in
/// guest terms so absolute link targets stay inside the sandbox view.
pub(crate) fn resolve_executable(plan: &[SandboxMount], guest: &Path) -> Option<PathBuf> {
    let mut guest = normalize_guest(guest);
    for _ in 0..MAX_SYMLINK_DEPTH {
        let (host, _) = resolve_guest(plan, &guest)?;
        let meta = fs::symlink_metadata(&host).ok()?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&host).ok()?;
            guest = if target.is_absolute() {
                normalize_guest(&target)
            } else {
                normalize_guest(&guest.parent().unwrap_or(Path::new("/")).join(target))
            };
            continue;
        }
        let executable = meta.is_file() && meta.permissions().mode() & 0o111 != 0;
        return executable.then_some(host);
    }
    None
}

/// Guest path of `path` relative to `cwd`.
pub(crate) fn guest_path(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_guest(path)
    } else {
        normalize_guest(&cwd.join(path))
    }
}

fn argv0_basename(pid: u32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let argv0 = raw.split(|b| *b == 0).next()?;
    let argv0 = String::from_utf8_lossy(argv0);
    Some(
        Path::new(argv0.as_ref())
            .file_name()
            .map_or_else(|| argv0.to_string(), |n| n.to_string_lossy().into_owned()),
    )
}

fn parent_pid(pid: u32) -> Option<u32> {
    read_stat(pid).map(|stat| stat.ppid)
}

/// Find `tool` inside the sandbox view: as given when it is a path,
/// otherwise on the guest `PATH`.
fn locate_in_plan(plan: &[SandboxMount], tool: &str) -> Option<String> {
    if tool.contains('/') {
        return resolve_executable(plan, Path::new(tool)).map(|_| tool.to_owned());
    }
    GUEST_PATH
        .split(':')
        .map(|dir| Path::new(dir).join(tool))
        .find(|guest| resolve_executable(plan, guest).is_some())
        .map(|guest| guest.to_string_lossy().into_owned())
}

/// Members of the client's process group other than the client itself:
/// the target `nsenter` forked and anything it started. Waits briefly for
/// the fork when the client was only just spawned.
fn sandboxed_members(client: u32) -> Vec<u32> {
    let deadline = Instant::now() + CHILD_WAIT;
    loop {
        let members: Vec<u32> = group_members(client)
            .into_iter()
            .filter(|pid| *pid != client)
            .collect();
        if !members.is_empty() || Instant::now() >= deadline || !pid_alive(client) {
            return members;
        }
        thread::sleep(ANCHOR_POLL);
    }
}

pub struct NamespaceBackend {
    config: NamespaceSection,
    workspace: Workspace,
    stop_timeout: Duration,
    state: EnvState,
    plan: Vec<SandboxMount>,
    nsenter: Option<PathBuf>,
    launcher: Option<Child>,
    anchor_pid: Option<u32>,
    init_pid: Option<u32>,
    line_buffer: Vec<String>,
    line_prefix: Option<Vec<String>>,
    processes: ProcessTable,
}

impl NamespaceBackend {
    pub fn new(config: NamespaceSection, workspace: Workspace, stop_timeout: Duration) -> Self {
        Self {
            config,
            workspace,
            stop_timeout,
            state: EnvState::Uninitialized,
            plan: Vec::new(),
            nsenter: None,
            launcher: None,
            anchor_pid: None,
            init_pid: None,
            line_buffer: default_line_buffer(),
            line_prefix: None,
            processes: ProcessTable::default(),
        }
    }

    /// Replace the line-buffering prefix; empty runs binaries as they are.
    #[must_use]
    pub fn with_line_buffer(mut self, line_buffer: Vec<String>) -> Self {
        self.line_buffer = line_buffer;
        self
    }

    /// Host PID of the anchor process that every execution joins.
    pub fn root_pid(&self) -> Option<u32> {
        self.anchor_pid
    }

    fn check_host(&self) -> Result<PathBuf, RuntimeError> {
        if find_command(&self.config.tool).is_none() {
            return Err(RuntimeError::Setup(format!(
                "sandboxing tool '{}' not found; install bubblewrap",
                self.config.tool
            )));
        }
        let nsenter = find_command("nsenter").ok_or_else(|| {
            RuntimeError::Setup("nsenter not found; install util-linux".to_owned())
        })?;
        if !self.config.sysroot.is_dir() {
            return Err(RuntimeError::Setup(format!(
                "sysroot is not a directory: {}",
                self.config.sysroot.display()
            )));
        }
        for dir in [&self.config.persistent, &self.config.artifacts]
            .into_iter()
            .flatten()
        {
            fs::create_dir_all(dir).map_err(|e| {
                RuntimeError::Setup(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        if let Some(missing) = self.config.mounts.iter().find(|m| !m.host.exists()) {
            return Err(RuntimeError::Setup(format!(
                "mount source does not exist: {}",
                missing.host.display()
            )));
        }
        if self.config.anchor_command.is_empty() {
            return Err(RuntimeError::Setup("anchor command is empty".to_owned()));
        }
        Ok(nsenter)
    }

    fn launch_command(&self, log: File) -> Command {
        let mut cmd = Command::new(&self.config.tool);
        cmd.args(["--die-with-parent", "--unshare-user", "--unshare-pid"]);
        for mount in &self.plan {
            cmd.args(mount.tool_args());
        }
        if self.config.device_passthrough {
            cmd.args(["--dev-bind", "/dev", "/dev"]);
        } else {
            cmd.args(["--dev", "/dev"]);
        }
        cmd.args(["--proc", "/proc", "--chdir", "/", "--"])
            .args(&self.config.anchor_command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log);
        cmd
    }

    /// Walk down from the launcher until the anchor command shows up.
    fn find_anchor(&self, launcher_pid: u32) -> Option<u32> {
        let anchor = Path::new(&self.config.anchor_command[0])
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())?;
        let mut pid = launcher_pid;
        for _ in 0..8 {
            pid = find_child_pid(pid)?;
            if argv0_basename(pid).as_deref() == Some(anchor.as_str()) {
                return Some(pid);
            }
        }
        None
    }

    fn wait_for_anchor(&mut self, log_path: &Path) -> Result<u32, RuntimeError> {
        let deadline = Instant::now() + ANCHOR_TIMEOUT;
        loop {
            let Some(launcher) = self.launcher.as_mut() else {
                return Err(RuntimeError::Setup("sandbox launcher missing".to_owned()));
            };
            if let Ok(Some(status)) = launcher.try_wait() {
                let log = fs::read_to_string(log_path).unwrap_or_default();
                return Err(RuntimeError::Setup(format!(
                    "{} exited during setup ({status}): {}",
                    self.config.tool,
                    log.trim()
                )));
            }
            let launcher_pid = launcher.id();
            if let Some(pid) = self.find_anchor(launcher_pid) {
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::Setup(format!(
                    "sandbox anchor did not appear within {ANCHOR_TIMEOUT:?}"
                )));
            }
            thread::sleep(ANCHOR_POLL);
        }
    }

    fn start_sandbox(&mut self) -> Result<(), RuntimeError> {
        self.plan = mount_plan(&self.config, self.workspace.root());
        let log_path = self.workspace.state_dir()?.join("sandbox.log");
        let log = File::create(&log_path)?;
        let mut cmd = self.launch_command(log);
        debug!("{cmd:?}");
        let launcher = cmd.spawn().map_err(|e| {
            RuntimeError::Setup(format!("failed to start {}: {e}", self.config.tool))
        })?;
        self.launcher = Some(launcher);

        let anchor = self.wait_for_anchor(&log_path)?;
        self.anchor_pid = Some(anchor);
        self.line_prefix =
            line_buffer_prefix(&self.line_buffer, |tool| locate_in_plan(&self.plan, tool));
        self.init_pid = parent_pid(anchor);
        info!(
            "namespace sandbox ready: anchor pid {anchor}, {} mounts",
            self.plan.len()
        );
        Ok(())
    }

    fn stop_sandbox(&mut self, report: &mut TeardownReport) {
        let targets = [self.init_pid.take(), self.anchor_pid.take()];
        for pid in targets.into_iter().flatten() {
            if let Err(e) = send_signal(pid, libc::SIGKILL) {
                if e.raw_os_error() != Some(libc::ESRCH) {
                    report.record("kill sandbox", Err(e.into()));
                }
            }
        }
        if let Some(mut launcher) = self.launcher.take() {
            let _ = launcher.kill();
            report.record("reap sandbox launcher", launcher.wait().map(drop).map_err(Into::into));
        }
    }

    fn nsenter_command(&self, nsenter: &Path, cwd: &Path, invocation: &Invocation) -> Command {
        let anchor = self.anchor_pid.unwrap_or_default();
        let mut cmd = Command::new(nsenter);
        cmd.arg(format!("--target={anchor}"))
            .args(["--user", "--mount", "--pid", "--root", "--preserve-credentials"])
            .arg(format!("--wd={}", cwd.display()))
            .arg("--");
        if let Some(prefix) = &self.line_prefix {
            cmd.args(prefix);
        }
        if let Some(tool) = self.run_under_for(invocation.path()) {
            cmd.args(tool);
        }
        cmd.arg(invocation.path()).args(invocation.arguments());

        cmd.env_clear()
            .env("PATH", GUEST_PATH)
            .envs(SANDBOX_DEFAULT_ENV.iter().copied())
            .envs(&self.config.env)
            .envs(invocation.environment());
        lead_own_group(&mut cmd, invocation.is_detached());
        cmd
    }

    fn run_under_for(&self, path: &Path) -> Option<&[String]> {
        let run_under = self.config.run_under.as_ref()?;
        let name = path.file_name()?.to_string_lossy();
        run_under
            .apps
            .iter()
            .any(|app| *app == name)
            .then_some(run_under.tool.as_slice())
    }

    /// Signal what runs behind the `nsenter` client, never the client
    /// itself: it would die and orphan the target inside the namespace.
    fn signal_inside(process: &HostProcess, signal: i32) -> Result<(), RuntimeError> {
        let client = process.host_pid();
        let mut delivered = false;
        for pid in sandboxed_members(client) {
            match send_signal(pid, signal) {
                Ok(()) => delivered = true,
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(RuntimeError::Execution(format!(
                "no process left behind nsenter client {client}"
            )))
        }
    }

    fn resolve_transfer(&self, env_path: &Path) -> Result<(PathBuf, &SandboxMount), RuntimeError> {
        resolve_guest(&self.plan, &guest_path(Path::new("/"), env_path)).ok_or_else(|| {
            RuntimeError::Transfer(format!("{} is outside the sandbox", env_path.display()))
        })
    }
}

impl Environment for NamespaceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Namespace
    }

    fn is_isolated(&self) -> bool {
        true
    }

    fn state(&self) -> EnvState {
        self.state
    }

    fn workspace_root(&self) -> &Path {
        self.workspace.root()
    }

    fn default_stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    fn setup(&mut self) -> Result<(), RuntimeError> {
        if !begin_setup(self.state)? {
            debug!("namespace sandbox already set up");
            return Ok(());
        }
        self.nsenter = Some(self.check_host()?);
        if let Err(e) = self.start_sandbox() {
            let mut report = TeardownReport::default();
            self.stop_sandbox(&mut report);
            return Err(e);
        }
        self.state = EnvState::Ready;
        Ok(())
    }

    fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if validate_transition(self.state, EnvState::TornDown).is_err() {
            return report;
        }

        for mut process in self.processes.take_all() {
            if process.refresh() {
                report.stopped += 1;
                process.terminate(TEARDOWN_STOP_TIMEOUT, Self::signal_inside);
            }
        }
        self.stop_sandbox(&mut report);
        self.state = EnvState::TornDown;
        info!("namespace sandbox torn down");
        report
    }

    fn execute(&mut self, invocation: Invocation) -> Result<ProcessHandle, RuntimeError> {
        require_ready(self.state, "execute")?;
        let nsenter = self
            .nsenter
            .clone()
            .ok_or_else(|| RuntimeError::Execution("nsenter not resolved".to_owned()))?;
        if !self.anchor_pid.is_some_and(pid_alive) {
            return Err(RuntimeError::Execution(
                "sandbox anchor is no longer running".to_owned(),
            ));
        }

        let cwd = guest_path(
            Path::new("/"),
            invocation.working_directory().unwrap_or(Path::new("/")),
        );
        let target = guest_path(&cwd, invocation.path());
        if resolve_executable(&self.plan, &target).is_none() {
            return Err(RuntimeError::Execution(format!(
                "{} is not an executable file inside the sandbox",
                target.display()
            )));
        }
        let invocation = invocation.with_path(target);

        let mut cmd = self.nsenter_command(&nsenter, &cwd, &invocation);
        debug!("{cmd:?}");
        let process = HostProcess::spawn(&mut cmd, &invocation, cwd, ExitRelay::Native)
            .map_err(|e| RuntimeError::Execution(format!("failed to start nsenter: {e}")))?;
        Ok(self.processes.insert(process))
    }

    fn stop_process(
        &mut self,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<i32, RuntimeError> {
        self.processes.stop(handle, timeout, Self::signal_inside)
    }

    fn is_process_running(&mut self, handle: &ProcessHandle) -> bool {
        self.processes.is_running(handle)
    }

    fn copy_to(&self, host_path: &Path, env_path: &Path) -> Result<(), RuntimeError> {
        require_ready_for_transfer(self.state)?;
        if !host_path.is_file() {
            return Err(RuntimeError::Transfer(format!(
                "source not found: {}",
                host_path.display()
            )));
        }
        let (dest, mount) = self.resolve_transfer(env_path)?;
        if mount.mode.is_read_only() {
            return Err(RuntimeError::Transfer(format!(
                "{} is on a read-only mount ({})",
                env_path.display(),
                mount.guest_path.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RuntimeError::Transfer(format!("{}: {e}", parent.display())))?;
        }
        fs::copy(host_path, &dest).map_err(|e| {
            RuntimeError::Transfer(format!("{} -> {}: {e}", host_path.display(), env_path.display()))
        })?;
        Ok(())
    }

    fn copy_from(&self, env_path: &Path, host_path: &Path) -> Result<(), RuntimeError> {
        require_ready_for_transfer(self.state)?;
        let (source, _) = self.resolve_transfer(env_path)?;
        if !source.is_file() {
            return Err(RuntimeError::Transfer(format!(
                "source not found in sandbox: {}",
                env_path.display()
            )));
        }
        if let Some(parent) = host_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| RuntimeError::Transfer(format!("{}: {e}", parent.display())))?;
        }
        fs::copy(&source, host_path).map_err(|e| {
            RuntimeError::Transfer(format!("{} -> {}: {e}", env_path.display(), host_path.display()))
        })?;
        Ok(())
    }
}

impl Drop for NamespaceBackend {
    fn drop(&mut self) {
        if self.state == EnvState::Ready {
            warn!("namespace sandbox dropped without teardown");
            let _ = self.teardown();
        }
    }
}
