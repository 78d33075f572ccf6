use crate::container::ContainerBackend;
use crate::direct::DirectBackend;
use crate::handle::{Invocation, ProcessHandle};
use crate::lifecycle::EnvState;
use crate::namespace::NamespaceBackend;
use crate::RuntimeError;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use testbed_schema::BackendKind;
use tracing::{debug, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The process-execution contract every backend implements.
///
/// Control operations are synchronous and expected to be driven from one
/// thread. `execute` never waits for the process; output capture and exit
/// tracking continue in the background.
pub trait Environment {
    fn kind(&self) -> BackendKind;

    /// `false` only for the direct backend: processes run on the host with
    /// the caller's privileges and see the whole host filesystem.
    fn is_isolated(&self) -> bool;

    fn state(&self) -> EnvState;

    /// Host directory for undeclared outputs, visible inside the environment.
    fn workspace_root(&self) -> &Path;

    fn default_stop_timeout(&self) -> Duration;

    /// Prepare the isolation mechanism. Calling it on a ready environment is
    /// a no-op.
    fn setup(&mut self) -> Result<(), RuntimeError>;

    /// Release everything, force-terminating processes still running.
    /// Never fails; individual step failures are collected in the report.
    /// A second call does nothing.
    fn teardown(&mut self) -> TeardownReport;

    fn execute(&mut self, invocation: Invocation) -> Result<ProcessHandle, RuntimeError>;

    /// SIGTERM, wait up to `timeout`, then SIGKILL. Returns the exit code;
    /// an already finished handle returns its recorded code unchanged.
    fn stop_process(
        &mut self,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<i32, RuntimeError>;

    /// Non-blocking. Turns `false` only after output has fully drained and
    /// the exit code has been published on the handle.
    fn is_process_running(&mut self, handle: &ProcessHandle) -> bool;

    fn copy_to(&self, host_path: &Path, env_path: &Path) -> Result<(), RuntimeError>;

    fn copy_from(&self, env_path: &Path, host_path: &Path) -> Result<(), RuntimeError>;

    /// Poll until the process finishes or `timeout` elapses.
    fn wait(&mut self, handle: &ProcessHandle, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        while self.is_process_running(handle) {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }
        handle.exit_code()
    }
}

/// Outcome of a teardown: steps that failed and processes that had to be
/// stopped.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub errors: Vec<RuntimeError>,
    pub stopped: usize,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn record(&mut self, step: &str, result: Result<(), RuntimeError>) {
        if let Err(e) = result {
            let err = RuntimeError::Teardown(format!("{step}: {e}"));
            warn!("{err}");
            self.errors.push(err);
        }
    }
}

/// One concrete backend, chosen once per run.
pub enum Sandbox {
    Namespace(NamespaceBackend),
    Container(ContainerBackend),
    Direct(DirectBackend),
}

macro_rules! dispatch {
    ($self:expr, $env:ident => $body:expr) => {
        match $self {
            Sandbox::Namespace($env) => $body,
            Sandbox::Container($env) => $body,
            Sandbox::Direct($env) => $body,
        }
    };
}

impl Environment for Sandbox {
    fn kind(&self) -> BackendKind {
        dispatch!(self, env => env.kind())
    }

    fn is_isolated(&self) -> bool {
        dispatch!(self, env => env.is_isolated())
    }

    fn state(&self) -> EnvState {
        dispatch!(self, env => env.state())
    }

    fn workspace_root(&self) -> &Path {
        dispatch!(self, env => env.workspace_root())
    }

    fn default_stop_timeout(&self) -> Duration {
        dispatch!(self, env => env.default_stop_timeout())
    }

    fn setup(&mut self) -> Result<(), RuntimeError> {
        dispatch!(self, env => env.setup())
    }

    fn teardown(&mut self) -> TeardownReport {
        dispatch!(self, env => env.teardown())
    }

    fn execute(&mut self, invocation: Invocation) -> Result<ProcessHandle, RuntimeError> {
        dispatch!(self, env => env.execute(invocation))
    }

    fn stop_process(
        &mut self,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<i32, RuntimeError> {
        dispatch!(self, env => env.stop_process(handle, timeout))
    }

    fn is_process_running(&mut self, handle: &ProcessHandle) -> bool {
        dispatch!(self, env => env.is_process_running(handle))
    }

    fn copy_to(&self, host_path: &Path, env_path: &Path) -> Result<(), RuntimeError> {
        dispatch!(self, env => env.copy_to(host_path, env_path))
    }

    fn copy_from(&self, env_path: &Path, host_path: &Path) -> Result<(), RuntimeError> {
        dispatch!(self, env => env.copy_from(env_path, host_path))
    }
}

/// A set-up environment that is torn down exactly once when the guard is
/// finished or dropped, including during a panic unwind.
pub struct EnvironmentGuard<E: Environment> {
    env: E,
    released: bool,
}

impl<E: Environment> EnvironmentGuard<E> {
    /// Run `setup()`. If it fails the environment is torn down before the
    /// error is returned.
    pub fn acquire(mut env: E) -> Result<Self, RuntimeError> {
        if let Err(e) = env.setup() {
            let report = env.teardown();
            debug!(
                "teardown after failed setup: {} error(s)",
                report.errors.len()
            );
            return Err(e);
        }
        Ok(Self {
            env,
            released: false,
        })
    }

    /// Tear down now and hand back the report.
    pub fn finish(mut self) -> TeardownReport {
        self.released = true;
        self.env.teardown()
    }
}

impl<E: Environment> Deref for EnvironmentGuard<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.env
    }
}

impl<E: Environment> DerefMut for EnvironmentGuard<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.env
    }
}

impl<E: Environment> Drop for EnvironmentGuard<E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if thread::panicking() {
            warn!("tearing down {} environment during unwind", self.env.kind());
        }
        let report = self.env.teardown();
        if !report.is_clean() {
            warn!("teardown finished with {} error(s)", report.errors.len());
        }
    }
}

/// Set up `env`, run `f` against it and tear it down on every exit path.
pub fn with_environment<E, T, F>(env: E, f: F) -> Result<T, RuntimeError>
where
    E: Environment,
    F: FnOnce(&mut E) -> T,
{
    let mut guard = EnvironmentGuard::acquire(env)?;
    let out = f(&mut guard);
    let report = guard.finish();
    if !report.is_clean() {
        debug!("teardown reported {} error(s)", report.errors.len());
    }
    Ok(out)
}
