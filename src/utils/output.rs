/// Output collection with per-stream caps
/// One reader thread per stream keeps draining past the cap (discarding the
/// excess) so the program never blocks on a full pipe; the supervisor only
/// waits a bounded time for collectors after the run is reaped.
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputIntegrity {
    /// Stream reached EOF within the cap
    #[default]
    #[serde(rename = "complete")]
    Complete,
    /// More bytes arrived than the cap allowed
    #[serde(rename = "truncated")]
    Truncated,
    /// Reading failed before EOF
    #[serde(rename = "read_error")]
    ReadError,
    /// Something still held the write end when the drain window closed
    #[serde(rename = "abandoned")]
    Abandoned,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::Truncated => write!(f, "truncated"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
            OutputIntegrity::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Captured stream, at most `limit` bytes
#[derive(Clone, Debug, Default)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    /// Everything the program wrote, including discarded bytes
    pub total_bytes: u64,
    pub integrity: OutputIntegrity,
}

impl CapturedOutput {
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Background reader for one child stream
pub struct StreamCollector {
    name: &'static str,
    shared: Arc<Mutex<CapturedOutput>>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl StreamCollector {
    pub fn spawn<R: Read + Send + 'static>(
        name: &'static str,
        stream: R,
        limit: usize,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Mutex::new(CapturedOutput::default()));
        let (tx, done) = bounded(1);
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name(format!("execbox-{}", name))
            .spawn(move || {
                collect_stream(stream, limit, &thread_shared);
                let _ = tx.send(());
            })?;

        Ok(Self {
            name,
            shared,
            done,
            handle,
        })
    }

    /// Wait up to `timeout` for EOF and return what was captured.
    ///
    /// On timeout the reader thread is left to finish on its own once the
    /// last writer is gone; the partial capture is returned as `Abandoned`.
    pub fn finish(self, timeout: Duration) -> CapturedOutput {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
                take(&self.shared)
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "{} collector still open after {:?}; returning partial output",
                    self.name,
                    timeout
                );
                let mut captured = take(&self.shared);
                captured.integrity = OutputIntegrity::Abandoned;
                captured
            }
        }
    }
}

fn take(shared: &Mutex<CapturedOutput>) -> CapturedOutput {
    let mut guard = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *guard)
}

fn collect_stream<R: Read>(mut stream: R, limit: usize, shared: &Mutex<CapturedOutput>) {
    let mut chunk = [0u8; 8192];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let mut out = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                out.total_bytes += n as u64;
                let room = limit.saturating_sub(out.bytes.len());
                if n > room {
                    out.bytes.extend_from_slice(&chunk[..room]);
                    out.truncated = true;
                    out.integrity = OutputIntegrity::Truncated;
                } else {
                    out.bytes.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("output read failed: {}", e);
                let mut out = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if out.integrity == OutputIntegrity::Complete {
                    out.integrity = OutputIntegrity::ReadError;
                }
                break;
            }
        }
    }
}

/// Write `data` to the child's stdin on a helper thread, then close it.
///
/// A program that exits without reading is not an error.
pub fn spawn_stdin_feeder<W: Write + Send + 'static>(
    mut stdin: W,
    data: Vec<u8>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("execbox-stdin".to_string())
        .spawn(move || {
            if let Err(e) = stdin.write_all(&data) {
                if e.kind() != ErrorKind::BrokenPipe {
                    log::debug!("stdin feed stopped: {}", e);
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_small_output_is_complete() {
        let collector = StreamCollector::spawn("stdout", Cursor::new(b"hello\n".to_vec()), 1024).unwrap();
        let out = collector.finish(Duration::from_secs(1));
        assert_eq!(out.bytes, b"hello\n");
        assert!(!out.truncated);
        assert_eq!(out.integrity, OutputIntegrity::Complete);
        assert_eq!(out.to_text(), "hello\n");
    }

    #[test]
    fn test_cap_truncates_but_keeps_counting() {
        let data = vec![b'x'; 100_000];
        let collector = StreamCollector::spawn("stdout", Cursor::new(data), 1000).unwrap();
        let out = collector.finish(Duration::from_secs(1));
        assert_eq!(out.bytes.len(), 1000);
        assert!(out.truncated);
        assert_eq!(out.total_bytes, 100_000);
        assert_eq!(out.integrity, OutputIntegrity::Truncated);
    }

    #[test]
    fn test_exact_cap_is_not_truncated() {
        let collector = StreamCollector::spawn("stderr", Cursor::new(vec![b'y'; 64]), 64).unwrap();
        let out = collector.finish(Duration::from_secs(1));
        assert_eq!(out.bytes.len(), 64);
        assert!(!out.truncated);
    }

    #[test]
    fn test_open_writer_is_abandoned_after_timeout() {
        let (reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
        (&writer).write_all(b"partial").unwrap();

        let collector = StreamCollector::spawn("stdout", reader, 1024).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let out = collector.finish(Duration::from_millis(50));
        assert_eq!(out.integrity, OutputIntegrity::Abandoned);
        assert_eq!(out.bytes, b"partial");
        drop(writer);
    }

    #[test]
    fn test_stdin_feeder_tolerates_closed_reader() {
        let (reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
        drop(reader);
        let handle = spawn_stdin_feeder(writer, vec![0u8; 1 << 20]).unwrap();
        handle.join().unwrap();
    }
}
