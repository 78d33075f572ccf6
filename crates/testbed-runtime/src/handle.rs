use crate::capture::OutputBuffer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Exit code reported for a process that had to be force-killed and whose
/// status could not be read back from the backend.
pub const KILLED_EXIT_CODE: i32 = -9;

/// Exit code reported when the final status of a process is unknowable.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier assigned to every spawned process, unique per test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Exited,
    Killed,
    Unknown,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A request to start one process inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    path: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    detach: bool,
}

impl Invocation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            detach: false,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Start the process in its own process group (host-spawned backends).
    #[must_use]
    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn is_detached(&self) -> bool {
        self.detach
    }

    /// Same invocation with `path` replaced, e.g. by its resolved form.
    pub(crate) fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Basename of the binary, used to tag captured output.
    pub fn program_name(&self) -> String {
        program_name(&self.path)
    }
}

pub(crate) fn program_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.to_string_lossy().into_owned(),
        |n| n.to_string_lossy().into_owned(),
    )
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ProcessState,
    exit_code: Option<i32>,
}

struct HandleInner {
    id: ProcessId,
    command: PathBuf,
    args: Vec<String>,
    working_directory: PathBuf,
    status: Mutex<Status>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
}

/// Uniform record of one spawned process, independent of backend.
///
/// Cloning is cheap and every clone observes the same process. Callers only
/// get read access: state and exit code are written once by the owning
/// environment, and the output buffers are appended to only by the capture
/// readers.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl ProcessHandle {
    pub(crate) fn new(invocation: &Invocation, working_directory: PathBuf) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: ProcessId::next(),
                command: invocation.path.clone(),
                args: invocation.args.clone(),
                working_directory,
                status: Mutex::new(Status {
                    state: ProcessState::Running,
                    exit_code: None,
                }),
                stdout: OutputBuffer::default(),
                stderr: OutputBuffer::default(),
            }),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.inner.id
    }

    pub fn command(&self) -> &Path {
        &self.inner.command
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    pub fn working_directory(&self) -> &Path {
        &self.inner.working_directory
    }

    pub fn name(&self) -> String {
        program_name(&self.inner.command)
    }

    pub fn state(&self) -> ProcessState {
        self.status().state
    }

    /// `None` while the process is running.
    pub fn exit_code(&self) -> Option<i32> {
        self.status().exit_code
    }

    /// The last published state. Environments refresh it through
    /// `Environment::is_process_running`.
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.inner.stdout.snapshot()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.inner.stderr.snapshot()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout()).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr()).into_owned()
    }

    pub(crate) fn sinks(&self) -> (OutputBuffer, OutputBuffer) {
        (self.inner.stdout.clone(), self.inner.stderr.clone())
    }

    /// Leave `Running` for good. Returns `false` if the handle had already
    /// been finished, in which case nothing changes.
    pub(crate) fn finish(&self, state: ProcessState, exit_code: i32) -> bool {
        debug_assert_ne!(state, ProcessState::Running);
        let mut status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if status.state != ProcessState::Running {
            return false;
        }
        status.state = state;
        status.exit_code = Some(exit_code);
        true
    }

    fn status(&self) -> Status {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("ProcessHandle")
            .field("id", &self.inner.id)
            .field("command", &self.inner.command)
            .field("args", &self.inner.args)
            .field("state", &status.state)
            .field("exit_code", &status.exit_code)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ProcessHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ProcessHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ProcessHandle {
        let inv = Invocation::new("/opt/app/bin/app_main").args(["--once", "-v"]);
        ProcessHandle::new(&inv, PathBuf::from("/"))
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = ProcessId::next();
        let b = ProcessId::next();
        assert!(b > a);
        assert!(a.to_string().starts_with("proc-"));
    }

    #[test]
    fn new_handle_is_running_without_exit_code() {
        let h = handle();
        assert_eq!(h.state(), ProcessState::Running);
        assert!(h.is_running());
        assert_eq!(h.exit_code(), None);
        assert_eq!(h.name(), "app_main");
        assert_eq!(h.args(), ["--once", "-v"]);
        assert!(h.stdout().is_empty());
    }

    #[test]
    fn finish_is_set_once() {
        let h = handle();
        assert!(h.finish(ProcessState::Exited, 3));
        assert!(!h.finish(ProcessState::Killed, KILLED_EXIT_CODE));
        assert_eq!(h.state(), ProcessState::Exited);
        assert_eq!(h.exit_code(), Some(3));
    }

    #[test]
    fn clones_share_state_and_output() {
        let h = handle();
        let other = h.clone();
        let (out, _) = h.sinks();
        out.append(b"hello\n");
        h.finish(ProcessState::Killed, -15);
        assert_eq!(other.stdout_lossy(), "hello\n");
        assert_eq!(other.state(), ProcessState::Killed);
        assert_eq!(other, h);
    }

    #[test]
    fn invocation_builder_collects_fields() {
        let inv = Invocation::new("/bin/echo")
            .arg("a")
            .args(["b", "c"])
            .cwd("/tmp")
            .env("KEY", "value")
            .detach(true);
        assert_eq!(inv.arguments(), ["a", "b", "c"]);
        assert_eq!(inv.working_directory(), Some(Path::new("/tmp")));
        assert_eq!(inv.environment().get("KEY").map(String::as_str), Some("value"));
        assert!(inv.is_detached());
        assert_eq!(inv.program_name(), "echo");
    }
}
