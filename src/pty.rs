//! Shell processes under a pseudo-terminal.
//!
//! A [`PtyHandle`] couples three resources: the child shell, the PTY master,
//! and a cancellation token fired when the handle closes. `portable-pty`
//! supplies the platform backend (openpty on POSIX, ConPTY on Windows).
//!
//! The master's read half is claimed exactly once via [`PtyHandle::take_reader`]
//! and driven from a dedicated thread; writes go through a blocking task so the
//! async caller never stalls a runtime worker. `close` drops the master and
//! writer, which unblocks an in-flight read, then terminates the child without
//! waiting for it.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Window size used when a session creates its PTY implicitly.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty open failed: {0}")]
    Open(String),
    #[error("pty resize failed: {0}")]
    Resize(String),
    #[error("pty signal failed: {0}")]
    Signal(String),
    #[error("pty is closed")]
    Closed,
    #[error("pty lock poisoned")]
    Poisoned,
    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The shell this host spawns: `$SHELL` with a `/bin/bash` fallback on POSIX,
/// `cmd.exe` on Windows.
#[cfg(unix)]
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

#[cfg(windows)]
pub fn default_shell() -> String {
    "cmd.exe".to_string()
}

pub struct PtyHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    child_pid: Option<u32>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl PtyHandle {
    /// Spawn `shell` under a fresh PTY with the given window size. The child
    /// inherits this process's environment; `TERM` is set to a sane default
    /// when absent.
    pub fn open(shell: &str, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        if std::env::var("TERM").is_err() {
            cmd.env("TERM", "xterm-256color");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Open(e.to_string()))?;
        // The master keeps the PTY alive from here on.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let killer = child.clone_killer();
        let child_pid = child.process_id();

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            writer: Arc::new(Mutex::new(Some(writer))),
            reader: Mutex::new(Some(reader)),
            child: Mutex::new(Some(child)),
            killer: Mutex::new(killer),
            child_pid,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Process id of the child shell, when the platform exposes one.
    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Resolves once the handle has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Claim the master's read half. There is exactly one reader per handle;
    /// a second claim (or a claim after close) fails with [`PtyError::Closed`].
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.reader
            .lock()
            .map_err(|_| PtyError::Poisoned)?
            .take()
            .ok_or(PtyError::Closed)
    }

    /// Write the whole buffer to the child's terminal. Runs the blocking write
    /// on the blocking pool so the runtime is never stalled.
    pub async fn write(&self, data: Bytes) -> Result<usize, PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        let writer = Arc::clone(&self.writer);
        let n = data.len();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().map_err(|_| PtyError::Poisoned)?;
            let w = guard.as_mut().ok_or(PtyError::Closed)?;
            w.write_all(&data)?;
            w.flush()?;
            Ok(n)
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e)))?
    }

    /// Apply a new window size to the master. The kernel raises SIGWINCH in
    /// the child's foreground group; nothing else is injected here.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let guard = self.master.lock().map_err(|_| PtyError::Poisoned)?;
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// Deliver `sig` to the child shell.
    #[cfg(unix)]
    pub fn signal(&self, sig: u8) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        let pid = self
            .child_pid
            .ok_or_else(|| PtyError::Signal("child pid unknown".to_string()))?;
        let rc = unsafe { libc::kill(pid as i32, sig as i32) };
        if rc == 0 {
            Ok(())
        } else {
            Err(PtyError::Signal(
                std::io::Error::last_os_error().to_string(),
            ))
        }
    }

    /// Windows has no per-signal facility at this level: any control request
    /// terminates the child.
    #[cfg(windows)]
    pub fn signal(&self, _sig: u8) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        let mut killer = self.killer.lock().map_err(|_| PtyError::Poisoned)?;
        killer.kill().map_err(|e| PtyError::Signal(e.to_string()))
    }

    /// Close the handle. Idempotent. Drops the master and writer, requests
    /// termination of the child, and fires the handle's token. The reader
    /// unblocks once the child exits and the slave side goes away. Does not
    /// wait for the child; see [`PtyHandle::wait`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.master.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.writer.lock() {
            guard.take();
        }
        self.request_termination();
        self.cancel.cancel();
    }

    /// Best-effort polite termination: SIGTERM on POSIX, kill on Windows.
    #[cfg(unix)]
    fn request_termination(&self) {
        if let Some(pid) = self.child_pid {
            let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
    }

    #[cfg(windows)]
    fn request_termination(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }

    /// Force-kill the child. Backstop for shells that ignore the polite
    /// termination sent by [`PtyHandle::close`].
    pub fn force_kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }

    /// Reap the child and return its exit status. One-shot; safe to call
    /// after [`PtyHandle::close`]. A second call fails with
    /// [`PtyError::Closed`].
    pub async fn wait(&self) -> Result<ExitStatus, PtyError> {
        let child = self
            .child
            .lock()
            .map_err(|_| PtyError::Poisoned)?
            .take()
            .ok_or(PtyError::Closed)?;
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child;
            child.wait()
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e)))??;
        Ok(status)
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn open_cat() -> PtyHandle {
        PtyHandle::open("cat", DEFAULT_COLS, DEFAULT_ROWS).expect("open pty")
    }

    /// Read from the PTY on a helper thread until `needle` shows up or the
    /// deadline passes.
    fn read_until(reader: Box<dyn Read + Send>, needle: &[u8], timeout: Duration) -> Vec<u8> {
        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 || tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        });
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(chunk) => {
                    collected.extend_from_slice(&chunk);
                    if collected
                        .windows(needle.len())
                        .any(|window| window == needle)
                    {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        collected
    }

    #[tokio::test]
    async fn write_is_echoed_back() {
        let pty = open_cat();
        let reader = pty.take_reader().unwrap();
        pty.write(Bytes::from_static(b"hello\n")).await.unwrap();
        let output = read_until(reader, b"hello", Duration::from_secs(5));
        assert!(
            output.windows(5).any(|w| w == b"hello"),
            "expected echo in {output:?}"
        );
        pty.close();
    }

    #[tokio::test]
    async fn reader_can_be_taken_once() {
        let pty = open_cat();
        assert!(pty.take_reader().is_ok());
        assert!(matches!(pty.take_reader(), Err(PtyError::Closed)));
        pty.close();
    }

    #[tokio::test]
    async fn resize_applies_while_live() {
        let pty = open_cat();
        pty.resize(132, 50).unwrap();
        pty.close();
        assert!(matches!(pty.resize(80, 24), Err(PtyError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_ops() {
        let pty = open_cat();
        pty.close();
        pty.close();
        assert!(pty
            .write(Bytes::from_static(b"x"))
            .await
            .is_err_and(|e| matches!(e, PtyError::Closed)));
        assert!(matches!(pty.signal(15), Err(PtyError::Closed)));
    }

    #[tokio::test]
    async fn close_fires_token_and_wait_reaps() {
        let pty = open_cat();
        pty.close();
        tokio::time::timeout(Duration::from_secs(1), pty.closed())
            .await
            .expect("token fires on close");
        let status = tokio::time::timeout(Duration::from_secs(5), pty.wait())
            .await
            .expect("child exits after close")
            .expect("wait succeeds");
        // cat dies from SIGTERM/SIGHUP, so anything but a hang is fine.
        let _ = status.exit_code();
        assert!(matches!(pty.wait().await, Err(PtyError::Closed)));
    }

    #[tokio::test]
    async fn signal_terminates_child() {
        let pty = open_cat();
        pty.signal(libc::SIGTERM as u8).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), pty.wait())
            .await
            .expect("child exits after signal")
            .expect("wait succeeds");
        assert!(!status.success());
    }
}
