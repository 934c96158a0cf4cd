//! PTY-backed terminal using portable-pty.
//!
//! Spawns a child process on a fresh pseudo-terminal and exposes blocking
//! read/write plus resize. Every chunk read from the terminal is recorded in
//! the session's history buffer before it is handed back to the caller.

use super::ring_buffer::RingBuffer;
use flexitty_core::{FlexiError, FlexiResult};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Maximum number of bytes returned by a single [`TerminalSession::read_output`].
pub const READ_CHUNK_SIZE: usize = 512;

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn closed_error() -> FlexiError {
    FlexiError::Io(std::io::Error::new(
        ErrorKind::BrokenPipe,
        "terminal is closed",
    ))
}

/// One child process attached to a pseudo-terminal, plus its output history.
pub struct TerminalSession {
    command: String,
    reader: Mutex<Box<dyn Read + Send>>,
    /// `None` once closed.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    history: RingBuffer,
    size: Mutex<(u16, u16)>,
    closed: AtomicBool,
}

impl TerminalSession {
    /// Launch `command` with `args` on a new PTY of the given size.
    pub fn spawn(
        command: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        history_capacity: usize,
    ) -> FlexiResult<Self> {
        if command.trim().is_empty() {
            return Err(FlexiError::Spawn("empty command".into()));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| FlexiError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| FlexiError::Spawn(format!("failed to spawn {command}: {e}")))?;
        // The parent must not hold the slave side open, otherwise the reader
        // never observes the child's exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| FlexiError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| FlexiError::Spawn(format!("failed to take PTY writer: {e}")))?;

        info!(command, pid = ?child.process_id(), cols, rows, "terminal spawned");

        Ok(Self {
            command: command.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            history: RingBuffer::new(history_capacity),
            size: Mutex::new((cols, rows)),
            closed: AtomicBool::new(false),
        })
    }

    /// Write bytes to the terminal's input. Blocking.
    ///
    /// Concurrent callers are serialized, so one payload is never split by another.
    pub fn write(&self, data: &[u8]) -> FlexiResult<()> {
        let mut writer = lock(&self.writer);
        let writer = writer.as_mut().ok_or_else(closed_error)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Block until the terminal produces output and return it.
    ///
    /// The chunk is appended to the history buffer before it is returned.
    /// Returns [`FlexiError::Eof`] once the terminal has no more output.
    pub fn read_output(&self) -> FlexiResult<Vec<u8>> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut reader = lock(&self.reader);
        let n = loop {
            match reader.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FlexiError::Io(e)),
            }
        };
        drop(reader);

        if n == 0 {
            return Err(FlexiError::Eof);
        }
        self.history.write(&buf[..n]);
        Ok(buf[..n].to_vec())
    }

    /// Change the terminal geometry.
    pub fn resize(&self, cols: u16, rows: u16) -> FlexiResult<()> {
        if cols == 0 || rows == 0 {
            return Err(FlexiError::Other(format!(
                "invalid terminal size {cols}x{rows}"
            )));
        }
        let master = lock(&self.master);
        let master = master.as_ref().ok_or_else(closed_error)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| {
                FlexiError::Io(std::io::Error::new(
                    ErrorKind::Other,
                    format!("PTY resize failed: {e}"),
                ))
            })?;
        *lock(&self.size) = (cols, rows);
        debug!(cols, rows, "terminal resized");
        Ok(())
    }

    /// Release the PTY and terminate the child. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.writer).take();
        lock(&self.master).take();

        let mut child = lock(&self.child);
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = child.kill() {
                    warn!(command = %self.command, error = %e, "failed to kill terminal child");
                }
            }
        }
        debug!(command = %self.command, "terminal closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Exit code of the child, if it has exited.
    pub fn exit_code(&self) -> Option<u32> {
        match lock(&self.child).try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Snapshot of recent output.
    pub fn history(&self) -> FlexiResult<Vec<u8>> {
        self.history.read()
    }

    pub fn history_buffer(&self) -> &RingBuffer {
        &self.history
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Current `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.close();
    }
}
