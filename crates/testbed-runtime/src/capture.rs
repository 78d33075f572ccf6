//! Concurrent stdout/stderr draining.
//!
//! Every spawned process gets exactly one reader thread per stream. A reader
//! appends raw bytes to the handle's buffer line by line and mirrors each
//! line to the `testbed::output` tracing target, tagged with the binary name.
//! Readers end when their pipe closes; callers join them through
//! [`Capture::drain`] before publishing an exit code.

use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Append-only byte buffer shared between a reader thread and the handle.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    pub(crate) fn append(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

type Finished = Arc<(Mutex<usize>, Condvar)>;

/// Bumps the finished count even if the reader panics.
struct FinishGuard(Finished);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let (count, cvar) = &*self.0;
        *count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        cvar.notify_all();
    }
}

/// The pair of reader threads attached to one process.
pub(crate) struct Capture {
    readers: Vec<JoinHandle<()>>,
    expected: usize,
    finished: Finished,
}

impl Capture {
    pub(crate) fn start<O, E>(
        process: &str,
        stdout: Option<O>,
        stderr: Option<E>,
        sinks: (OutputBuffer, OutputBuffer),
    ) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let finished: Finished = Arc::new((Mutex::new(0), Condvar::new()));
        let mut readers = Vec::with_capacity(2);
        let mut expected = 0;
        let (out_sink, err_sink) = sinks;

        if let Some(stream) = stdout {
            expected += 1;
            if let Some(h) = spawn_reader(process, StreamKind::Stdout, stream, out_sink, &finished)
            {
                readers.push(h);
            }
        }
        if let Some(stream) = stderr {
            expected += 1;
            if let Some(h) = spawn_reader(process, StreamKind::Stderr, stream, err_sink, &finished)
            {
                readers.push(h);
            }
        }

        Self {
            readers,
            expected,
            finished,
        }
    }

    /// True once every reader has seen end-of-stream.
    pub(crate) fn is_drained(&self) -> bool {
        let (count, _) = &*self.finished;
        *count.lock().unwrap_or_else(PoisonError::into_inner) >= self.expected
    }

    /// Wait up to `timeout` for both readers to finish, joining them on
    /// success. Returns `false` if a reader is still blocked, which happens
    /// when a grandchild inherited the pipe and outlived the process.
    pub(crate) fn drain(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, cvar) = &*self.finished;
        let mut done = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *done < self.expected {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            done = guard;
        }
        drop(done);

        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                warn!("output reader panicked");
            }
        }
        true
    }
}

fn spawn_reader<R>(
    process: &str,
    kind: StreamKind,
    stream: R,
    sink: OutputBuffer,
    finished: &Finished,
) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let guard = FinishGuard(Arc::clone(finished));
    let process = process.to_owned();
    let spawned = thread::Builder::new()
        .name(format!("{process}-{}", kind.as_str()))
        .spawn(move || {
            let _guard = guard;
            pump(&process, kind, stream, &sink);
        });
    match spawned {
        Ok(h) => Some(h),
        Err(e) => {
            // The guard moved into the failed closure and has already been
            // dropped, so the count still reaches `expected`.
            warn!("failed to start {} reader: {e}", kind.as_str());
            None
        }
    }
}

fn pump<R: Read>(process: &str, kind: StreamKind, stream: R, sink: &OutputBuffer) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                sink.append(&line);
                let text = String::from_utf8_lossy(&line);
                info!(
                    target: "testbed::output",
                    process = %process,
                    stream = kind.as_str(),
                    "{}",
                    text.trim_end_matches(['\n', '\r'])
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(process = %process, stream = kind.as_str(), "output read failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn buffer_appends_in_order() {
        let buf = OutputBuffer::default();
        assert!(buf.is_empty());
        buf.append(b"one\n");
        buf.append(b"two");
        assert_eq!(buf.snapshot(), b"one\ntwo");
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn capture_collects_both_streams_byte_exact() {
        let out = OutputBuffer::default();
        let err = OutputBuffer::default();
        let payload = b"line one\nline two\r\nno newline".to_vec();
        let mut capture = Capture::start(
            "fake",
            Some(Cursor::new(payload.clone())),
            Some(Cursor::new(b"oops\n".to_vec())),
            (out.clone(), err.clone()),
        );
        assert!(capture.drain(Duration::from_secs(5)));
        assert!(capture.is_drained());
        assert_eq!(out.snapshot(), payload);
        assert_eq!(err.snapshot(), b"oops\n");
    }

    #[test]
    fn capture_keeps_invalid_utf8() {
        let out = OutputBuffer::default();
        let bytes = vec![0xff, 0xfe, b'\n', 0x00];
        let mut capture = Capture::start::<_, Cursor<Vec<u8>>>(
            "bin",
            Some(Cursor::new(bytes.clone())),
            None,
            (out.clone(), OutputBuffer::default()),
        );
        assert!(capture.drain(Duration::from_secs(5)));
        assert_eq!(out.snapshot(), bytes);
    }

    #[test]
    fn capture_without_streams_is_drained() {
        let mut capture = Capture::start::<Cursor<Vec<u8>>, Cursor<Vec<u8>>>(
            "none",
            None,
            None,
            (OutputBuffer::default(), OutputBuffer::default()),
        );
        assert!(capture.is_drained());
        assert!(capture.drain(Duration::from_millis(1)));
    }

    #[test]
    fn drain_times_out_on_open_pipe() {
        struct Blocking(std::sync::mpsc::Receiver<()>);
        impl Read for Blocking {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                let _ = self.0.recv();
                Ok(0)
            }
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let mut capture = Capture::start::<_, Cursor<Vec<u8>>>(
            "slow",
            Some(Blocking(rx)),
            None,
            (OutputBuffer::default(), OutputBuffer::default()),
        );
        assert!(!capture.drain(Duration::from_millis(50)));
        assert!(!capture.is_drained());
        tx.send(()).unwrap();
        assert!(capture.drain(Duration::from_secs(5)));
    }
}
