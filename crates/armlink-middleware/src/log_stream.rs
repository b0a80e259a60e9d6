//! Bounded, drop-on-full stream of operator log lines.
//!
//! Built on a Tokio `mpsc` channel. Pushing uses `try_send`, so a full
//! channel drops the new line instead of blocking the producer; the number
//! of dropped lines is counted.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::trace;

/// Capacity used by [`LogStream::default`].
pub const DEFAULT_LOG_CAPACITY: usize = 10;

/// Shared handle to a bounded log channel. Clones share the same channel.
#[derive(Clone, Debug)]
pub struct LogStream {
    tx: mpsc::Sender<String>,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    dropped: Arc<AtomicU64>,
}

impl LogStream {
    /// Create a stream buffering at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push a line prefixed with the local wall-clock time (`[HH:MM:SS]`).
    pub fn log(&self, message: impl Display) -> bool {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.push(format!("[{stamp}] {message}"))
    }

    /// Push a line verbatim. Returns `false` when the line was dropped.
    pub fn push(&self, line: String) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(e) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(dropped, line = %e.into_inner(), "log line dropped");
                false
            }
        }
    }

    /// Wait for the next line.
    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    /// Take the next line if one is buffered and no other consumer is
    /// currently waiting.
    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Take every buffered line.
    pub fn drain(&self) -> Vec<String> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Number of lines dropped because the stream was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn full_stream_drops_new_lines() {
        let logs = LogStream::new(3);
        assert!(logs.push("a".into()));
        assert!(logs.push("b".into()));
        assert!(logs.push("c".into()));
        assert!(!logs.push("d".into()));
        assert_eq!(logs.dropped(), 1);
        assert_eq!(logs.drain(), vec!["a", "b", "c"]);
    }

    #[test]
    fn log_prefixes_wall_clock_time() {
        let logs = LogStream::default();
        logs.log("Follower arm: torque enabled");
        let line = logs.try_recv().expect("line buffered");
        assert!(line.starts_with('['));
        assert_eq!(&line[9..11], "] ");
        assert!(line.ends_with("Follower arm: torque enabled"));
    }

    #[test]
    fn draining_frees_capacity() {
        let logs = LogStream::new(1);
        assert!(logs.push("first".into()));
        assert!(!logs.push("second".into()));
        assert_eq!(logs.drain(), vec!["first"]);
        assert!(logs.push("third".into()));
    }

    #[tokio::test]
    async fn recv_waits_for_line() {
        let logs = LogStream::default();
        let producer = logs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.log("Teleoperation started at 60 Hz");
        });
        let line = tokio::time::timeout(Duration::from_secs(1), logs.recv())
            .await
            .expect("line must arrive")
            .expect("channel open");
        assert!(line.contains("60 Hz"));
    }
}
