//! Capture of node output.
//!
//! Only the most recent output of a node is kept, up to the buffer's
//! capacity. Older bytes are dropped and counted, and a snapshot starts
//! with a marker saying how many.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Bytes of output kept per node by default.
pub const DEFAULT_LOG_CAPACITY: usize = 8 * 1024 * 1024;

#[derive(Debug, Default)]
struct Tail {
    bytes: VecDeque<u8>,
    dropped: u64,
}

impl Tail {
    fn append(&mut self, chunk: &[u8], capacity: usize) {
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(capacity);
        if excess > 0 {
            self.bytes.drain(..excess);
            self.dropped += u64::try_from(excess).unwrap_or(u64::MAX);
        }
    }
}

/// The most recent stdout and stderr of one node.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    tail: Arc<Mutex<Tail>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    /// Creates a buffer keeping at most `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tail: Arc::new(Mutex::new(Tail::default())),
            capacity,
        }
    }

    /// Starts copying `source` into the buffer until end of stream.
    pub fn capture<R>(&self, mut source: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = self.tail.clone();
        let capacity = self.capacity;
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            while let Ok(n) = source.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                tail.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .append(&chunk[..n], capacity);
            }
        })
    }

    /// Returns how many of the oldest bytes were dropped to stay in capacity.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.tail.lock().unwrap_or_else(PoisonError::into_inner).dropped
    }

    /// Returns everything kept so far.
    #[must_use]
    pub fn snapshot(&self) -> String {
        let tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let (front, back) = tail.bytes.as_slices();
        let mut bytes = Vec::with_capacity(tail.bytes.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        let text = String::from_utf8_lossy(&bytes);
        if tail.dropped == 0 {
            text.into_owned()
        } else {
            format!("[{} earlier bytes dropped]\n{text}", tail.dropped)
        }
    }

    /// Writes everything kept so far to `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn persist(&self, path: &Path) -> std::io::Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.snapshot())?;
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capture_and_persist() {
        let buffer = LogBuffer::default();
        buffer
            .capture(&b"line one\nline two\n"[..])
            .await
            .unwrap();
        assert_eq!(buffer.snapshot(), "line one\nline two\n");
        assert_eq!(buffer.dropped(), 0);

        let dir = tempfile::tempdir().unwrap();
        let path = buffer.persist(&dir.path().join("a/b/node.log")).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "line one\nline two\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capture_keeps_only_the_tail() {
        let buffer = LogBuffer::with_capacity(10);
        buffer.capture(&b"0123456789"[..]).await.unwrap();
        buffer.capture(&b"abcdef"[..]).await.unwrap();
        assert_eq!(buffer.dropped(), 6);
        assert_eq!(buffer.snapshot(), "[6 earlier bytes dropped]\n6789abcdef");

        let noisy = vec![b'x'; 3 * 4096 + 7];
        buffer.capture(std::io::Cursor::new(noisy)).await.unwrap();
        assert_eq!(buffer.dropped(), 6 + 3 * 4096 + 7);
        assert!(buffer.snapshot().ends_with("xxxxxxxxxx"));
    }
}
