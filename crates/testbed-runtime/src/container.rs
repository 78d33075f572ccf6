//! Container backend: one long-lived anchor container, processes started
//! inside it with the engine's `exec`.

use crate::docker::{ContainerDelegate, ExecOutput};
use crate::environment::{Environment, TeardownReport};
use crate::handle::{Invocation, ProcessHandle};
use crate::lifecycle::{
    begin_setup, require_ready, require_ready_for_transfer, validate_transition, EnvState,
};
use crate::namespace::{guest_path, SandboxMount, SANDBOX_DEFAULT_ENV};
use crate::process::{line_buffer_prefix, ExitRelay, HostProcess, ProcessTable};
use crate::workspace::Workspace;
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use testbed_schema::{default_line_buffer, BackendKind, ContainerSection, ImageSource, MountMode};
use tracing::{debug, info, warn};

/// Guest path the workspace is mounted at.
pub const WORKSPACE_GUEST_PATH: &str = "/tmp";

const TEARDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const PIDFILE_WAIT: Duration = Duration::from_secs(2);
const PIDFILE_POLL: Duration = Duration::from_millis(20);

/// Records the in-container pid, then becomes the target binary.
const EXEC_WRAPPER: &str = r#"echo $$ > "$1"; shift; exec "$@""#;

static NEXT_ANCHOR: AtomicU64 = AtomicU64::new(1);
static NEXT_EXEC: AtomicU64 = AtomicU64::new(1);

/// How the anchor container is created. Fixed once `setup()` has resolved
/// the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image_reference: String,
    pub environment_variables: BTreeMap<String, String>,
    pub network_mode: String,
    pub mounts: Vec<SandboxMount>,
    pub privileged: bool,
    pub anchor_command: Vec<String>,
}

/// Pack `dir` into a tar archive at `archive`, preserving symlinks.
pub(crate) fn pack_sysroot(dir: &Path, archive: &Path) -> Result<(), RuntimeError> {
    let file = File::create(archive)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| RuntimeError::Setup(format!("cannot pack {}: {e}", dir.display())))?;
    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// Content-derived tag for a transient image imported from `archive`.
pub(crate) fn transient_tag(archive: &Path) -> Result<String, RuntimeError> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(archive)?;
    std::io::copy(&mut file, &mut hasher)?;
    let hex = hasher.finalize().to_hex();
    Ok(format!("testbed-rootfs:{}", &hex[..12]))
}

pub struct ContainerBackend {
    config: ContainerSection,
    delegate: ContainerDelegate,
    workspace: Workspace,
    stop_timeout: Duration,
    state: EnvState,
    anchor: Option<String>,
    transient_image: Option<String>,
    line_buffer: Vec<String>,
    line_prefix: Option<Vec<String>>,
    processes: ProcessTable,
}

impl ContainerBackend {
    pub fn new(config: ContainerSection, workspace: Workspace, stop_timeout: Duration) -> Self {
        let delegate = ContainerDelegate::new(&config.engine);
        Self {
            config,
            delegate,
            workspace,
            stop_timeout,
            state: EnvState::Uninitialized,
            anchor: None,
            transient_image: None,
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

    pub fn delegate(&self) -> &ContainerDelegate {
        &self.delegate
    }

    /// Name of the anchor container while the environment is ready.
    pub fn anchor_name(&self) -> Option<&str> {
        self.anchor.as_deref()
    }

    fn anchor_or_err(&self) -> Result<&str, RuntimeError> {
        self.anchor
            .as_deref()
            .ok_or_else(|| RuntimeError::Execution("anchor container is not running".to_owned()))
    }

    /// Run `argv` to completion inside the anchor; for fixture setup.
    pub fn exec_sync(&self, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        require_ready(self.state, "exec")?;
        self.delegate
            .exec(self.anchor_or_err()?, &self.config.env, argv)
    }

    /// Address of the anchor on `network`, or on its first network.
    pub fn ip_address(&self, network: Option<&str>) -> Result<Option<String>, RuntimeError> {
        require_ready(self.state, "inspect")?;
        self.delegate.ip_address(self.anchor_or_err()?, network)
    }

    pub fn gateway(&self, network: Option<&str>) -> Result<Option<String>, RuntimeError> {
        require_ready(self.state, "inspect")?;
        self.delegate.gateway(self.anchor_or_err()?, network)
    }

    /// Processes currently inside the anchor container.
    pub fn processes(&self) -> Result<Vec<String>, RuntimeError> {
        require_ready(self.state, "list processes")?;
        self.delegate.top(self.anchor_or_err()?)
    }

    /// Resolve the configured image source to something the engine can
    /// create from, importing an archive when needed.
    fn resolve_image(&mut self) -> Result<String, RuntimeError> {
        let source = self.config.image_source()?;
        info!("using {}", source.describe());
        match source {
            ImageSource::Reference(image) => {
                if !self.delegate.image_exists(&image) {
                    self.delegate.pull(&image)?;
                }
                Ok(image)
            }
            ImageSource::RootfsArchive(archive) => self.import(&archive),
            ImageSource::Sysroot(dir) => {
                if !dir.is_dir() {
                    return Err(RuntimeError::Setup(format!(
                        "sysroot is not a directory: {}",
                        dir.display()
                    )));
                }
                let scratch = tempfile::Builder::new()
                    .prefix("testbed-sysroot-")
                    .suffix(".tar")
                    .tempfile()?;
                info!("packing sysroot {}", dir.display());
                pack_sysroot(&dir, scratch.path())?;
                self.import(scratch.path())
            }
        }
    }

    fn import(&mut self, archive: &Path) -> Result<String, RuntimeError> {
        let tag = transient_tag(archive)?;
        self.delegate.import_archive(archive, &tag)?;
        self.transient_image = Some(tag.clone());
        Ok(tag)
    }

    fn build_spec(&self, image_reference: String) -> ContainerSpec {
        let mut mounts = vec![SandboxMount::new(
            self.workspace.root(),
            WORKSPACE_GUEST_PATH,
            MountMode::ReadWrite,
        )];
        mounts.extend(
            self.config
                .mounts
                .iter()
                .map(|m| SandboxMount::new(&m.host, &m.guest, m.mode)),
        );
        let mut environment_variables: BTreeMap<String, String> = SANDBOX_DEFAULT_ENV
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        environment_variables.extend(self.config.env.clone());
        ContainerSpec {
            image_reference,
            environment_variables,
            network_mode: self.config.network.clone(),
            mounts,
            privileged: self.config.privileged,
            anchor_command: self.config.anchor_command.clone(),
        }
    }

    fn start_anchor(&mut self) -> Result<(), RuntimeError> {
        if !self.delegate.available() {
            return Err(RuntimeError::Setup(format!(
                "container engine '{}' is not installed or its daemon is unreachable",
                self.delegate.engine()
            )));
        }
        let image = self.resolve_image()?;
        let spec = self.build_spec(image);
        let name = format!(
            "testbed-anchor-{}-{}",
            std::process::id(),
            NEXT_ANCHOR.fetch_add(1, Ordering::Relaxed)
        );
        self.delegate.create(&name, &spec)?;
        self.anchor = Some(name.clone());
        self.delegate.start(&name)?;
        info!("anchor container {name} started from {}", spec.image_reference);
        self.line_prefix = line_buffer_prefix(&self.line_buffer, |tool| self.locate(&name, tool));
        Ok(())
    }

    /// Path of `tool` as the anchor's shell resolves it.
    fn locate(&self, anchor: &str, tool: &str) -> Option<String> {
        let argv = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            r#"command -v "$1""#.to_owned(),
            "testbed-locate".to_owned(),
            tool.to_owned(),
        ];
        let out = self.delegate.exec(anchor, &BTreeMap::new(), &argv).ok()?;
        let path = out.stdout_lossy().trim().to_owned();
        (out.success() && path.starts_with('/')).then_some(path)
    }

    fn release(&mut self, report: &mut TeardownReport) {
        if let Some(anchor) = self.anchor.take() {
            if self.delegate.is_running(&anchor) {
                if let Err(e) = self
                    .delegate
                    .stop(&anchor, TEARDOWN_STOP_TIMEOUT.as_secs())
                {
                    debug!("stopping {anchor} failed, removing it anyway: {e}");
                }
            }
            report.record("remove anchor container", self.delegate.remove(&anchor));
        }
        if let Some(image) = self.transient_image.take() {
            report.record("remove transient image", self.delegate.remove_image(&image));
        }
    }

    fn pidfile(&self, serial: u64) -> Result<(PathBuf, PathBuf), RuntimeError> {
        let host = self.workspace.state_dir()?.join(format!("exec-{serial}.pid"));
        let rel = host
            .strip_prefix(self.workspace.root())
            .map_err(|_| RuntimeError::Execution("pidfile outside workspace".to_owned()))?;
        let guest = Path::new(WORKSPACE_GUEST_PATH).join(rel);
        Ok((host, guest))
    }

    fn check_executable(&self, anchor: &str, path: &Path) -> Result<(), RuntimeError> {
        let argv = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            r#"test -f "$1" && test -x "$1""#.to_owned(),
            "testbed-check".to_owned(),
            path.to_string_lossy().into_owned(),
        ];
        let out = self.delegate.exec(anchor, &BTreeMap::new(), &argv)?;
        if out.success() {
            Ok(())
        } else {
            Err(RuntimeError::Execution(format!(
                "{} is not an executable file inside the container",
                path.display()
            )))
        }
    }

    fn signaller(
        delegate: &ContainerDelegate,
        anchor: &str,
        pidfile: &Path,
    ) -> impl FnMut(&HostProcess, i32) -> Result<(), RuntimeError> {
        let delegate = delegate.clone();
        let anchor = anchor.to_owned();
        let pidfile = pidfile.to_path_buf();
        move |_process, signal| {
            let pid = read_pidfile(&pidfile).ok_or_else(|| {
                RuntimeError::Execution("process id inside container not known yet".to_owned())
            })?;
            delegate.kill_process(&anchor, pid, signal)
        }
    }
}

fn read_pidfile(path: &Path) -> Option<u32> {
    let deadline = Instant::now() + PIDFILE_WAIT;
    loop {
        if let Some(pid) = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            return Some(pid);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(PIDFILE_POLL);
    }
}

impl Environment for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
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
            debug!("container environment already set up");
            return Ok(());
        }
        if let Err(e) = self.start_anchor() {
            let mut report = TeardownReport::default();
            self.release(&mut report);
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
        // Refuse transfers from here on.
        self.state = EnvState::TornDown;

        let anchor = self.anchor.clone();
        for mut process in self.processes.take_all() {
            if !process.refresh() {
                continue;
            }
            report.stopped += 1;
            match (&anchor, process.pidfile()) {
                (Some(anchor), Some(pidfile)) => {
                    let signal = Self::signaller(&self.delegate, anchor, &pidfile);
                    process.terminate(TEARDOWN_STOP_TIMEOUT, signal);
                }
                _ => {
                    process.terminate(TEARDOWN_STOP_TIMEOUT, |_, _| Ok(()));
                }
            }
        }
        self.release(&mut report);
        info!("container environment torn down");
        report
    }

    fn execute(&mut self, invocation: Invocation) -> Result<ProcessHandle, RuntimeError> {
        require_ready(self.state, "execute")?;
        let anchor = self.anchor_or_err()?.to_owned();
        if !self.delegate.is_running(&anchor) {
            return Err(RuntimeError::Execution(format!(
                "anchor container {anchor} is no longer running"
            )));
        }

        let cwd = guest_path(
            Path::new("/"),
            invocation.working_directory().unwrap_or(Path::new("/")),
        );
        let target = guest_path(&cwd, invocation.path());
        self.check_executable(&anchor, &target)?;
        let invocation = invocation.with_path(&target);

        let serial = NEXT_EXEC.fetch_add(1, Ordering::Relaxed);
        let (pidfile_host, pidfile_guest) = self.pidfile(serial)?;
        let _ = fs::remove_file(&pidfile_host);

        let mut argv = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            EXEC_WRAPPER.to_owned(),
            "testbed-exec".to_owned(),
            pidfile_guest.to_string_lossy().into_owned(),
        ];
        if let Some(prefix) = &self.line_prefix {
            argv.extend(prefix.iter().cloned());
        }
        argv.push(target.to_string_lossy().into_owned());
        argv.extend(invocation.arguments().iter().cloned());

        let mut env = self.config.env.clone();
        env.extend(
            invocation
                .environment()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let mut cmd = self
            .delegate
            .exec_streaming(&anchor, &env, Some(&cwd), &argv);
        debug!("{cmd:?}");
        let process = HostProcess::spawn(&mut cmd, &invocation, cwd, ExitRelay::Engine)
            .map_err(|e| {
                RuntimeError::Execution(format!("failed to run {}: {e}", self.delegate.engine()))
            })?
            .with_pidfile(pidfile_host);
        Ok(self.processes.insert(process))
    }

    fn stop_process(
        &mut self,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<i32, RuntimeError> {
        if let Some(code) = handle.exit_code() {
            return Ok(code);
        }
        let anchor = self.anchor_or_err()?.to_owned();
        let pidfile = self
            .processes
            .get(handle)
            .and_then(HostProcess::pidfile)
            .ok_or_else(|| {
                RuntimeError::Execution(format!("{} is not owned by this environment", handle.id()))
            })?;
        let signal = Self::signaller(&self.delegate, &anchor, &pidfile);
        self.processes.stop(handle, timeout, signal)
    }

    fn is_process_running(&mut self, handle: &ProcessHandle) -> bool {
        self.processes.is_running(handle)
    }

    fn copy_to(&self, host_path: &Path, env_path: &Path) -> Result<(), RuntimeError> {
        require_ready_for_transfer(self.state)?;
        let anchor = self
            .anchor
            .as_deref()
            .ok_or_else(|| RuntimeError::Transfer("anchor container is gone".to_owned()))?;
        let guest = guest_path(Path::new("/"), env_path);
        self.delegate.copy_to(anchor, host_path, &guest)
    }

    fn copy_from(&self, env_path: &Path, host_path: &Path) -> Result<(), RuntimeError> {
        require_ready_for_transfer(self.state)?;
        let anchor = self
            .anchor
            .as_deref()
            .ok_or_else(|| RuntimeError::Transfer("anchor container is gone".to_owned()))?;
        let guest = guest_path(Path::new("/"), env_path);
        self.delegate.copy_from(anchor, &guest, host_path)
    }
}

impl Drop for ContainerBackend {
    fn drop(&mut self) {
        if self.state == EnvState::Ready {
            warn!("container environment dropped without teardown");
            let _ = self.teardown();
        }
    }
}
