//! Direct backend: processes run on the host.
//!
//! There is no isolation at all. Executed binaries see the whole host
//! filesystem, inherit the caller's environment and privileges, and may
//! outlive the run if they daemonize. Use it for debugging only.

use crate::environment::{Environment, TeardownReport};
use crate::handle::{Invocation, ProcessHandle};
use crate::lifecycle::{
    begin_setup, require_ready, require_ready_for_transfer, validate_transition, EnvState,
};
use crate::prereq::find_command;
use crate::process::{
    lead_own_group, line_buffer_prefix, signal_group, ExitRelay, HostProcess, ProcessTable,
};
use crate::workspace::Workspace;
use crate::RuntimeError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use testbed_schema::{default_line_buffer, BackendKind};
use tracing::{debug, warn};

const TEARDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DirectBackend {
    workspace: Workspace,
    stop_timeout: Duration,
    state: EnvState,
    line_buffer: Vec<String>,
    line_prefix: Option<Vec<String>>,
    processes: ProcessTable,
}

impl DirectBackend {
    pub fn new(workspace: Workspace, stop_timeout: Duration) -> Self {
        Self {
            workspace,
            stop_timeout,
            state: EnvState::Uninitialized,
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

    /// Host paths are used as given; relative ones hang off `base`.
    fn host_path(base: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }

    /// Each execution leads its own process group; signal all of it.
    fn signal(process: &HostProcess, signal: i32) -> Result<(), RuntimeError> {
        signal_group(process.host_pid(), signal).map_err(Into::into)
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

impl Environment for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::None
    }

    fn is_isolated(&self) -> bool {
        false
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
            return Ok(());
        }
        warn!("direct backend: processes run on the host without any isolation");
        self.line_prefix = line_buffer_prefix(&self.line_buffer, |tool| {
            find_command(tool).map(|p| p.to_string_lossy().into_owned())
        });
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
                process.terminate(TEARDOWN_STOP_TIMEOUT, Self::signal);
            }
        }
        self.state = EnvState::TornDown;
        debug!("direct environment torn down, {} process(es) stopped", report.stopped);
        report
    }

    fn execute(&mut self, invocation: Invocation) -> Result<ProcessHandle, RuntimeError> {
        require_ready(self.state, "execute")?;

        let cwd = match invocation.working_directory() {
            Some(dir) => Self::host_path(self.workspace.root(), dir),
            None => self.workspace.root().to_path_buf(),
        };
        if !cwd.is_dir() {
            return Err(RuntimeError::Execution(format!(
                "working directory not found: {}",
                cwd.display()
            )));
        }
        let target = Self::host_path(&cwd, invocation.path());
        if !is_executable(&target) {
            return Err(RuntimeError::Execution(format!(
                "{} is not an executable file",
                target.display()
            )));
        }
        let invocation = invocation.with_path(&target);

        let mut cmd = match &self.line_prefix {
            Some(prefix) => {
                let mut cmd = Command::new(&prefix[0]);
                cmd.args(&prefix[1..]).arg(&target);
                cmd
            }
            None => Command::new(&target),
        };
        cmd.args(invocation.arguments())
            .current_dir(&cwd)
            .envs(invocation.environment());
        lead_own_group(&mut cmd, invocation.is_detached());
        debug!("{cmd:?}");
        let process = HostProcess::spawn(&mut cmd, &invocation, cwd, ExitRelay::Native)
            .map_err(|e| {
                RuntimeError::Execution(format!("failed to start {}: {e}", target.display()))
            })?;
        Ok(self.processes.insert(process))
    }

    fn stop_process(
        &mut self,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<i32, RuntimeError> {
        self.processes.stop(handle, timeout, Self::signal)
    }

    fn is_process_running(&mut self, handle: &ProcessHandle) -> bool {
        self.processes.is_running(handle)
    }

    fn copy_to(&self, host_path: &Path, env_path: &Path) -> Result<(), RuntimeError> {
        require_ready_for_transfer(self.state)?;
        let dest = Self::host_path(self.workspace.root(), env_path);
        copy_file(host_path, &dest)
    }

    fn copy_from(&self, env_path: &Path, host_path: &Path) -> Result<(), RuntimeError> {
        require_ready_for_transfer(self.state)?;
        let source = Self::host_path(self.workspace.root(), env_path);
        copy_file(&source, host_path)
    }
}

fn copy_file(source: &Path, dest: &Path) -> Result<(), RuntimeError> {
    if !source.is_file() {
        return Err(RuntimeError::Transfer(format!(
            "source not found: {}",
            source.display()
        )));
    }
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| RuntimeError::Transfer(format!("{}: {e}", parent.display())))?;
    }
    fs::copy(source, dest).map_err(|e| {
        RuntimeError::Transfer(format!("{} -> {}: {e}", source.display(), dest.display()))
    })?;
    Ok(())
}

impl Drop for DirectBackend {
    fn drop(&mut self) {
        if self.state == EnvState::Ready {
            let _ = self.teardown();
        }
    }
}
