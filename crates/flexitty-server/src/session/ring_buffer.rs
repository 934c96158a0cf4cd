//! Circular buffer holding a session's recent terminal output.
//!
//! Late-joining clients get a scrollback snapshot from here before they
//! start receiving live output. The buffer keeps the last `capacity` bytes
//! ever written; older bytes are overwritten silently.

use flexitty_core::{FlexiError, FlexiResult};
use std::sync::{Mutex, MutexGuard};

/// Default history capacity (1 MiB).
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

#[derive(Debug)]
struct Inner {
    buf: Vec<u8>,
    /// Index of the oldest retained byte.
    head: usize,
    /// Number of retained bytes, `<= buf.len()`.
    len: usize,
    /// Set by the first write; distinguishes "never written" from "wrapped".
    has_data: bool,
    total_written: u64,
}

impl Inner {
    fn tail(&self) -> usize {
        (self.head + self.len) % self.buf.len()
    }
}

/// A fixed-capacity, overwrite-oldest byte buffer safe to share across threads.
///
/// `write` and `read` take the same lock for their whole duration, so a reader
/// never sees a half-applied wraparound.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity],
                head: 0,
                len: 0,
                has_data: false,
                total_written: 0,
            }),
            capacity,
        }
    }

    // Poisoning only means another writer panicked mid-copy; the cursors are
    // still in range, so keep serving history.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append data, dropping the oldest bytes once the buffer is full.
    pub fn write(&self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }

        let mut inner = self.lock();
        inner.has_data = true;
        inner.total_written += data.len() as u64;

        // Only the last `capacity` bytes of an oversized write can survive.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let mut tail = inner.tail();
        let mut remaining = data;
        while !remaining.is_empty() {
            let chunk = remaining.len().min(self.capacity - tail);
            inner.buf[tail..tail + chunk].copy_from_slice(&remaining[..chunk]);
            tail = (tail + chunk) % self.capacity;
            remaining = &remaining[chunk..];
        }

        let new_len = inner.len + data.len();
        if new_len > self.capacity {
            let overwritten = new_len - self.capacity;
            inner.head = (inner.head + overwritten) % self.capacity;
            inner.len = self.capacity;
        } else {
            inner.len = new_len;
        }
    }

    /// Snapshot of all retained bytes, oldest first.
    ///
    /// Does not consume anything: repeated reads return the same bytes until
    /// the next write.
    pub fn read(&self) -> FlexiResult<Vec<u8>> {
        let inner = self.lock();
        Self::copy_out(&inner, self.capacity)
    }

    fn copy_out(inner: &Inner, capacity: usize) -> FlexiResult<Vec<u8>> {
        if !inner.has_data || inner.len == 0 {
            return Err(FlexiError::BufferEmpty);
        }

        let mut out = Vec::with_capacity(inner.len);
        let first = inner.len.min(capacity - inner.head);
        out.extend_from_slice(&inner.buf[inner.head..inner.head + first]);
        out.extend_from_slice(&inner.buf[..inner.len - first]);
        Ok(out)
    }

    /// Snapshot plus the stream offset it ends at, taken under one lock.
    pub fn snapshot(&self) -> FlexiResult<(Vec<u8>, u64)> {
        let inner = self.lock();
        let bytes = Self::copy_out(&inner, self.capacity)?;
        Ok((bytes, inner.total_written))
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever written, including those since overwritten.
    pub fn total_written(&self) -> u64 {
        self.lock().total_written
    }
}
