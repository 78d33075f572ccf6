//! Host-side process bookkeeping shared by every backend.
//!
//! Each backend ends up with a host `Child` per execution: the binary itself
//! (direct), an `nsenter` client (namespace) or a container engine `exec`
//! client (container). `HostProcess` couples that child with its capture
//! readers and publishes the final state to the `ProcessHandle` only after
//! the exit has been observed and output has drained.

use crate::capture::Capture;
use crate::handle::{Invocation, ProcessHandle, ProcessId, ProcessState};
use crate::handle::{KILLED_EXIT_CODE, UNKNOWN_EXIT_CODE};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on waiting for capture readers after the process exited.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for a SIGKILLed process to be reaped before giving up on it.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long output may stay open after exit before leftovers are killed.
const SWEEP_GRACE: Duration = Duration::from_millis(200);

/// The configured line-buffering prefix with its tool replaced by where
/// `locate` finds it. `None` when disabled or the tool is missing.
pub(crate) fn line_buffer_prefix<F>(configured: &[String], locate: F) -> Option<Vec<String>>
where
    F: FnOnce(&str) -> Option<String>,
{
    let (tool, flags) = configured.split_first()?;
    let Some(found) = locate(tool) else {
        warn!("{tool} not available, output of buffered programs may only appear at exit");
        return None;
    };
    Some(std::iter::once(found).chain(flags.iter().cloned()).collect())
}

/// Put the spawned process at the head of its own process group so stop and
/// teardown reach everything it forks. Detached processes also get their
/// own session, away from the caller's controlling terminal.
#[allow(unsafe_code)]
pub(crate) fn lead_own_group(command: &mut Command, detach: bool) {
    if detach {
        // SAFETY: setsid() is async-signal-safe and touches no memory of
        // ours; the child has not started running Rust code yet.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    } else {
        command.process_group(0);
    }
}

/// How the host child's exit status maps to the tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitRelay {
    /// The child is the tracked process (or re-raises its signal).
    Native,
    /// The child is an engine client relaying the exit code of a process
    /// inside a container; signal deaths arrive as `128 + signo`.
    Engine,
}

pub(crate) struct HostProcess {
    handle: ProcessHandle,
    child: Child,
    capture: Capture,
    relay: ExitRelay,
    exit: Option<ExitStatus>,
    exited_at: Option<Instant>,
    signalled: bool,
    /// Where the process records its own pid, for backends that cannot see
    /// it from the host. Removed once the process is finished.
    pidfile: Option<PathBuf>,
}

impl HostProcess {
    /// Spawn `command` with piped output and attach capture readers.
    pub(crate) fn spawn(
        command: &mut Command,
        invocation: &Invocation,
        working_directory: PathBuf,
        relay: ExitRelay,
    ) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;
        let handle = ProcessHandle::new(invocation, working_directory);
        let capture = Capture::start(
            &handle.name(),
            child.stdout.take(),
            child.stderr.take(),
            handle.sinks(),
        );
        debug!(
            "{} started: {} (host pid {})",
            handle.id(),
            handle.command().display(),
            child.id()
        );
        Ok(Self {
            handle,
            child,
            capture,
            relay,
            exit: None,
            exited_at: None,
            signalled: false,
            pidfile: None,
        })
    }

    pub(crate) fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub(crate) fn host_pid(&self) -> u32 {
        self.child.id()
    }

    #[must_use]
    pub(crate) fn with_pidfile(mut self, path: PathBuf) -> Self {
        self.pidfile = Some(path);
        self
    }

    pub(crate) fn pidfile(&self) -> Option<PathBuf> {
        self.pidfile.clone()
    }

    /// Non-blocking check whether the host child has exited.
    pub(crate) fn poll_exit(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                self.exited_at = Some(Instant::now());
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("{}: failed to poll process: {e}", self.handle.id());
                false
            }
        }
    }

    /// Poll until exit or `timeout`. Returns whether the child exited.
    pub(crate) fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_exit() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Race-free liveness check. Reports `false` only after the exit was
    /// observed, output has drained and the exit code is published.
    pub(crate) fn refresh(&mut self) -> bool {
        if !self.poll_exit() {
            return true;
        }
        let drained = self.capture.is_drained();
        let overdue = self
            .exited_at
            .is_some_and(|at| at.elapsed() >= DRAIN_TIMEOUT);
        if !drained && !overdue {
            return true;
        }
        // The drain window has already passed; do not wait again here.
        self.publish(Duration::ZERO);
        false
    }

    /// Block until the child is reaped, join capture and publish.
    pub(crate) fn finalize(&mut self) -> i32 {
        self.publish(DRAIN_TIMEOUT)
    }

    fn publish(&mut self, drain: Duration) -> i32 {
        if self.exit.is_none() {
            match self.child.wait() {
                Ok(status) => {
                    self.exit = Some(status);
                    self.exited_at = Some(Instant::now());
                }
                Err(e) => warn!("{}: failed to reap process: {e}", self.handle.id()),
            }
        }
        if !self.capture.drain(drain) {
            warn!(
                "{}: output still open {DRAIN_TIMEOUT:?} after exit, publishing anyway",
                self.handle.id()
            );
        }

        let (state, code) = match self.exit {
            Some(status) => status_to_outcome(status, self.relay, self.signalled),
            None => (ProcessState::Unknown, UNKNOWN_EXIT_CODE),
        };
        if self.handle.finish(state, code) {
            debug!("{} finished: {state} ({code})", self.handle.id());
        }
        if let Some(path) = self.pidfile.take() {
            let _ = fs::remove_file(path);
        }
        self.handle.exit_code().unwrap_or(code)
    }

    /// Graceful stop with escalation. `signal` delivers a signal to the
    /// tracked process the way the backend can reach it.
    pub(crate) fn terminate<F>(&mut self, timeout: Duration, mut signal: F) -> i32
    where
        F: FnMut(&Self, i32) -> Result<(), RuntimeError>,
    {
        if let Some(code) = self.handle.exit_code() {
            return code;
        }
        if self.poll_exit() {
            self.sweep(&mut signal);
            return self.finalize();
        }

        self.deliver(&mut signal, libc::SIGTERM);
        if !self.wait_exit(timeout) {
            let err = RuntimeError::Timeout {
                process: self.handle.name(),
                timeout,
            };
            warn!("{}: {err}, sending SIGKILL", self.handle.id());
            self.deliver(&mut signal, libc::SIGKILL);
            if !self.wait_exit(KILL_GRACE) {
                warn!("{}: still alive after SIGKILL, killing client", self.handle.id());
                let _ = self.child.kill();
            }
        }
        self.sweep(&mut signal);
        self.finalize()
    }

    /// The tracked process is gone; kill whatever it started that still
    /// holds its output open.
    fn sweep<F>(&mut self, signal: &mut F)
    where
        F: FnMut(&Self, i32) -> Result<(), RuntimeError>,
    {
        if self.exit.is_none() || self.capture.drain(SWEEP_GRACE) {
            return;
        }
        if let Err(e) = signal(self, libc::SIGKILL) {
            debug!("{}: leftover processes not signalled: {e}", self.handle.id());
        }
    }

    fn deliver<F>(&mut self, signal: &mut F, signo: i32)
    where
        F: FnMut(&Self, i32) -> Result<(), RuntimeError>,
    {
        match signal(self, signo) {
            Ok(()) => self.signalled = true,
            Err(e) => debug!("{}: signal {signo} not delivered: {e}", self.handle.id()),
        }
    }
}

/// Map a host exit status to the published state and exit code.
pub(crate) fn status_to_outcome(
    status: ExitStatus,
    relay: ExitRelay,
    signalled: bool,
) -> (ProcessState, i32) {
    if let Some(code) = status.code() {
        let killed = relay == ExitRelay::Engine && signalled && code > 128;
        let state = if killed {
            ProcessState::Killed
        } else {
            ProcessState::Exited
        };
        return (state, code);
    }
    if let Some(sig) = status.signal() {
        let code = if relay == ExitRelay::Engine {
            KILLED_EXIT_CODE
        } else {
            -sig
        };
        return (ProcessState::Killed, code);
    }
    (ProcessState::Unknown, UNKNOWN_EXIT_CODE)
}

/// Processes an environment has spawned and not yet seen finish.
#[derive(Default)]
pub(crate) struct ProcessTable {
    entries: BTreeMap<ProcessId, HostProcess>,
}

impl ProcessTable {
    pub(crate) fn insert(&mut self, process: HostProcess) -> ProcessHandle {
        let handle = process.handle().clone();
        self.entries.insert(handle.id(), process);
        handle
    }

    pub(crate) fn get(&self, handle: &ProcessHandle) -> Option<&HostProcess> {
        self.entries.get(&handle.id())
    }

    /// Handles this table does not track report their own published state.
    pub(crate) fn is_running(&mut self, handle: &ProcessHandle) -> bool {
        let id = handle.id();
        let Some(process) = self.entries.get_mut(&id) else {
            return handle.is_running();
        };
        if process.refresh() {
            return true;
        }
        self.entries.remove(&id);
        false
    }

    /// Stop a tracked process. An already-finished handle returns its
    /// recorded exit code without touching anything.
    pub(crate) fn stop<F>(
        &mut self,
        handle: &ProcessHandle,
        timeout: Duration,
        signal: F,
    ) -> Result<i32, RuntimeError>
    where
        F: FnMut(&HostProcess, i32) -> Result<(), RuntimeError>,
    {
        if let Some(code) = handle.exit_code() {
            self.entries.remove(&handle.id());
            return Ok(code);
        }
        let mut process = self.entries.remove(&handle.id()).ok_or_else(|| {
            RuntimeError::Execution(format!("{} is not owned by this environment", handle.id()))
        })?;
        Ok(process.terminate(timeout, signal))
    }

    pub(crate) fn take_all(&mut self) -> Vec<HostProcess> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

pub(crate) fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    send_raw(pid, signal)
}

#[allow(unsafe_code)]
fn send_raw(pid: libc::pid_t, signal: i32) -> io::Result<()> {
    // SAFETY: kill() takes plain integers and touches no memory of ours;
    // a stale pid yields ESRCH.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Signal every member of process group `pgid`.
pub(crate) fn signal_group(pgid: u32, signal: i32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"))?;
    send_raw(-pgid, signal)
}

pub(crate) fn pid_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => !is_zombie(pid),
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

fn is_zombie(pid: u32) -> bool {
    read_stat(pid).is_some_and(|stat| stat.state == 'Z')
}

/// The fields of `/proc/<pid>/stat` this crate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub(crate) state: char,
    pub(crate) ppid: u32,
    pub(crate) pgrp: u32,
}

/// Parse a `/proc/<pid>/stat` line. The command name is parenthesised and
/// may itself contain spaces or parentheses.
pub(crate) fn parse_stat(stat: &str) -> Option<ProcStat> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat { state, ppid, pgrp })
}

pub(crate) fn read_stat(pid: u32) -> Option<ProcStat> {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|s| parse_stat(&s))
}

fn proc_pids() -> Vec<u32> {
    fs::read_dir("/proc")
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
                .collect()
        })
        .unwrap_or_default()
}

/// Live members of process group `pgid`, zombies excluded.
pub(crate) fn group_members(pgid: u32) -> Vec<u32> {
    let mut members: Vec<u32> = proc_pids()
        .into_iter()
        .filter(|pid| read_stat(*pid).is_some_and(|s| s.pgrp == pgid && s.state != 'Z'))
        .collect();
    members.sort_unstable();
    members
}

/// First child of `pid` as seen in the host PID namespace.
pub(crate) fn find_child_pid(pid: u32) -> Option<u32> {
    let listed = fs::read_to_string(format!("/proc/{pid}/task/{pid}/children"))
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|p| p.parse().ok()));
    if listed.is_some() {
        return listed;
    }

    proc_pids()
        .into_iter()
        .filter(|candidate| read_stat(*candidate).is_some_and(|s| s.ppid == pid))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(path: &str) -> Invocation {
        Invocation::new(path)
    }

    #[test]
    fn parse_stat_handles_odd_command_names() {
        let line = "1234 (my (weird) app) S 99 1230 1234 0 -1 4194560";
        assert_eq!(
            parse_stat(line),
            Some(ProcStat {
                state: 'S',
                ppid: 99,
                pgrp: 1230
            })
        );
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn exit_codes_map_to_states() {
        let exited = ExitStatus::from_raw(3 << 8);
        assert_eq!(
            status_to_outcome(exited, ExitRelay::Native, false),
            (ProcessState::Exited, 3)
        );

        let killed = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(
            status_to_outcome(killed, ExitRelay::Native, true),
            (ProcessState::Killed, -9)
        );

        let relayed = ExitStatus::from_raw(137 << 8);
        assert_eq!(
            status_to_outcome(relayed, ExitRelay::Engine, true),
            (ProcessState::Killed, 137)
        );
        assert_eq!(
            status_to_outcome(relayed, ExitRelay::Engine, false),
            (ProcessState::Exited, 137)
        );
    }

    #[test]
    fn refresh_publishes_after_output() {
        let inv = invocation("/bin/sh");
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "printf 'a\\nb\\n'; exit 4"]);
        let mut process =
            HostProcess::spawn(&mut cmd, &inv, PathBuf::from("/"), ExitRelay::Native).unwrap();
        let handle = process.handle().clone();

        let deadline = Instant::now() + Duration::from_secs(10);
        while process.refresh() {
            assert!(Instant::now() < deadline, "process never finished");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.exit_code(), Some(4));
        assert_eq!(handle.state(), ProcessState::Exited);
        assert_eq!(handle.stdout(), b"a\nb\n");
    }

    #[test]
    fn terminate_is_idempotent() {
        let inv = invocation("/bin/sleep");
        let mut cmd = Command::new("/bin/sleep");
        cmd.arg("30");
        let mut process =
            HostProcess::spawn(&mut cmd, &inv, PathBuf::from("/"), ExitRelay::Native).unwrap();
        let signal = |p: &HostProcess, sig| {
            send_signal(p.host_pid(), sig).map_err(RuntimeError::from)
        };
        let first = process.terminate(Duration::from_secs(5), signal);
        let second = process.terminate(Duration::from_secs(5), signal);
        assert_eq!(first, -libc::SIGTERM);
        assert_eq!(first, second);
        assert_eq!(process.handle().state(), ProcessState::Killed);
    }

    #[test]
    fn table_forgets_finished_processes() {
        let inv = invocation("/bin/true");
        let mut cmd = Command::new("/bin/true");
        let process =
            HostProcess::spawn(&mut cmd, &inv, PathBuf::from("/"), ExitRelay::Native).unwrap();
        let mut table = ProcessTable::default();
        let handle = table.insert(process);
        assert!(table.get(&handle).is_some());

        let deadline = Instant::now() + Duration::from_secs(10);
        while table.is_running(&handle) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }
        assert!(table.get(&handle).is_none());
        let code = table
            .stop(&handle, Duration::from_secs(1), |_, _| Ok(()))
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn line_buffer_prefix_uses_located_tool() {
        let configured = vec!["stdbuf".to_owned(), "-oL".to_owned(), "-eL".to_owned()];
        assert_eq!(
            line_buffer_prefix(&configured, |_| Some("/usr/bin/stdbuf".to_owned())),
            Some(vec![
                "/usr/bin/stdbuf".to_owned(),
                "-oL".to_owned(),
                "-eL".to_owned()
            ])
        );
        assert_eq!(line_buffer_prefix(&configured, |_| None), None);
        assert_eq!(line_buffer_prefix(&[], |_| unreachable!()), None);
    }

    #[test]
    fn refresh_does_not_wait_on_inherited_pipe() {
        let inv = invocation("/bin/sh");
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 8 & echo hi"]);
        lead_own_group(&mut cmd, false);
        let mut process =
            HostProcess::spawn(&mut cmd, &inv, PathBuf::from("/"), ExitRelay::Native).unwrap();
        let pgid = process.host_pid();
        let handle = process.handle().clone();

        let deadline = Instant::now() + Duration::from_secs(15);
        let mut slowest = Duration::ZERO;
        loop {
            let started = Instant::now();
            let running = process.refresh();
            slowest = slowest.max(started.elapsed());
            if !running {
                break;
            }
            assert!(Instant::now() < deadline, "process never published");
            thread::sleep(Duration::from_millis(20));
        }
        let _ = signal_group(pgid, libc::SIGKILL);

        assert!(slowest < Duration::from_secs(1), "refresh blocked for {slowest:?}");
        assert_eq!(handle.exit_code(), Some(0));
        assert!(handle.stdout().starts_with(b"hi\n"));
    }

    #[test]
    fn terminate_reaches_the_whole_group() {
        let inv = invocation("/bin/sh");
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "trap '' TERM; echo ready; sleep 60"]);
        lead_own_group(&mut cmd, false);
        let mut process =
            HostProcess::spawn(&mut cmd, &inv, PathBuf::from("/"), ExitRelay::Native).unwrap();
        let pgid = process.host_pid();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !process.handle().stdout().starts_with(b"ready") {
            assert!(Instant::now() < deadline, "shell never started");
            thread::sleep(Duration::from_millis(10));
        }

        let started = Instant::now();
        let code = process.terminate(Duration::from_secs(1), |p, sig| {
            signal_group(p.host_pid(), sig).map_err(RuntimeError::from)
        });
        let elapsed = started.elapsed();
        assert_eq!(code, -libc::SIGKILL);
        assert!(elapsed < Duration::from_secs(4), "stop took {elapsed:?}");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !group_members(pgid).is_empty() {
            assert!(Instant::now() < deadline, "group {pgid} outlived SIGKILL");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn undelivered_signal_does_not_mark_killed() {
        let inv = invocation("/bin/sh");
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 1"]);
        let mut process =
            HostProcess::spawn(&mut cmd, &inv, PathBuf::from("/"), ExitRelay::Engine).unwrap();
        let code = process.terminate(Duration::from_secs(5), |_, _| {
            Err(RuntimeError::Execution("target not found".to_owned()))
        });
        assert_eq!(code, 0);
        assert!(!process.signalled);
        assert_eq!(process.handle().state(), ProcessState::Exited);
    }

    #[test]
    fn unknown_handle_reports_its_own_state() {
        let inv = invocation("/bin/sleep");
        let mut cmd = Command::new("/bin/sleep");
        cmd.arg("30");
        let mut process =
            HostProcess::spawn(&mut cmd, &inv, PathBuf::from("/"), ExitRelay::Native).unwrap();
        let handle = process.handle().clone();

        let mut other = ProcessTable::default();
        assert!(other.is_running(&handle));
        process.terminate(Duration::from_secs(5), |p, sig| {
            send_signal(p.host_pid(), sig).map_err(RuntimeError::from)
        });
        assert!(!other.is_running(&handle));
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
