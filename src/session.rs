//! Per-connection session driver.
//!
//! One session couples one transport to at most one PTY and runs three
//! activities until something ends the connection:
//!
//!   - the reader loop: decodes peer frames and dispatches them,
//!   - the output pump: forwards PTY output to the peer as DATA frames,
//!   - the heartbeat ticker: transport-level pings on a fixed interval.
//!
//! The only shared resource between them is the transport's outbound side,
//! serialized by [`FrameWriter`]. Everything else is torn down through the
//! session's cancellation token: any activity that hits a fatal condition
//! fires it, the reader loop observes it, and cleanup runs exactly once.
//!
//! The PTY is created lazily on the first DATA or RESIZE frame so connections
//! that never get that far never pay the spawn cost.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{self, CodecError, FrameKind, HEADER_LEN, MAX_PAYLOAD};
use crate::pty::PtyHandle;
use crate::state::AppState;
use crate::transport::{Incoming, Transport, TransportError, TransportReader, TransportWriter};

/// A peer that neither sends nor pongs for this long is gone.
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Every outbound write, pings included, must finish within this.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Transport-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Read size for the PTY output pump.
const PUMP_BUF: usize = 4096;
/// How long a closed child may linger before it is force-killed.
const CHILD_GRACE: Duration = Duration::from_secs(3);

/// Why a session left its reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Transport-level close or EOF from the peer.
    PeerClosed,
    /// In-band CLOSE frame.
    CloseFrame,
    /// Read deadline expired.
    Timeout,
    /// Transport read or write failure.
    Transport,
    /// PTY open, write, or signal failure.
    Pty,
    /// Session token fired: registry shutdown, pump exit, or ping failure.
    Cancelled,
    /// Outbound encoding bug.
    Internal,
}

enum Flow {
    Continue,
    Drain(CloseReason),
}

#[derive(Debug)]
enum SendError {
    Encode(CodecError),
    Transport(TransportError),
}

/// Serializes every outbound transport write and applies the write deadline.
struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: TransportWriter> FrameWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    async fn send(&self, kind: FrameKind, payload: &[u8]) -> Result<(), SendError> {
        let frame = protocol::encode(kind, payload).map_err(SendError::Encode)?;
        let mut writer = self.inner.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, writer.send_binary(Bytes::from(frame))).await {
            Ok(result) => result.map_err(SendError::Transport),
            Err(_) => Err(SendError::Transport(TransportError::Timeout)),
        }
    }

    async fn send_error(&self, message: &str) -> Result<(), SendError> {
        self.send(FrameKind::Error, clip_error_text(message)).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut writer = self.inner.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, writer.ping()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) {
        let mut writer = self.inner.lock().await;
        let _ = tokio::time::timeout(WRITE_TIMEOUT, writer.close()).await;
    }
}

/// ERROR payloads are UTF-8 text; keep them inside the frame limit without
/// splitting a character.
fn clip_error_text(message: &str) -> &[u8] {
    if message.len() <= MAX_PAYLOAD {
        return message.as_bytes();
    }
    let mut end = MAX_PAYLOAD;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    &message.as_bytes()[..end]
}

/// One connection's session. Constructed via [`Session::register`] and
/// consumed by [`Session::run`].
pub struct Session {
    id: u64,
    state: AppState,
    cancel: CancellationToken,
    done: CancellationToken,
    cleaned: AtomicBool,
}

impl Session {
    /// Register a new session with the global state. Returns `None` once
    /// shutdown has begun.
    pub fn register(state: AppState) -> Option<Self> {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let id = state.register(cancel.clone(), done.clone())?;
        info!(id, "session opened");
        Some(Self {
            id,
            state,
            cancel,
            done,
            cleaned: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drive the session to completion. Returns once every resource (PTY,
    /// child, tasks, transport, registry entry) has been released.
    pub async fn run<T: Transport>(self, transport: T) {
        let (mut reader, writer) = transport.split();
        let writer = Arc::new(FrameWriter::new(writer));

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&writer),
            self.cancel.clone(),
            self.id,
        ));

        let mut pty: Option<Arc<PtyHandle>> = None;
        let mut pump: Option<JoinHandle<()>> = None;

        let reason = self
            .reader_loop(&mut reader, &writer, &mut pty, &mut pump)
            .await;

        self.cleanup(&writer, pty, pump, heartbeat, reason).await;
    }

    async fn reader_loop<R, W>(
        &self,
        reader: &mut R,
        writer: &Arc<FrameWriter<W>>,
        pty: &mut Option<Arc<PtyHandle>>,
        pump: &mut Option<JoinHandle<()>>,
    ) -> CloseReason
    where
        R: TransportReader,
        W: TransportWriter,
    {
        let mut deadline = Instant::now() + READ_TIMEOUT;
        loop {
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => return CloseReason::Cancelled,
                received = reader.recv(deadline) => received,
            };
            let bytes = match incoming {
                Ok(Incoming::Binary(bytes)) => {
                    deadline = Instant::now() + READ_TIMEOUT;
                    bytes
                }
                // Pong, ping, or text: liveness only.
                Ok(Incoming::Other) => {
                    deadline = Instant::now() + READ_TIMEOUT;
                    continue;
                }
                Err(TransportError::PeerClosed) => return CloseReason::PeerClosed,
                Err(TransportError::Timeout) => {
                    warn!(id = self.id, "peer unresponsive past read deadline");
                    return CloseReason::Timeout;
                }
                Err(TransportError::Io(e)) => {
                    warn!(id = self.id, error = %e, "transport read failed");
                    return CloseReason::Transport;
                }
            };
            match self.dispatch(&bytes, writer, pty, pump).await {
                Flow::Continue => {}
                Flow::Drain(reason) => return reason,
            }
        }
    }

    async fn dispatch<W: TransportWriter>(
        &self,
        bytes: &Bytes,
        writer: &Arc<FrameWriter<W>>,
        pty: &mut Option<Arc<PtyHandle>>,
        pump: &mut Option<JoinHandle<()>>,
    ) -> Flow {
        let frame = match protocol::decode(bytes) {
            Ok((frame, _consumed)) => frame,
            // The transport already consumed the message boundary, so a
            // malformed frame is local: report it and keep reading.
            Err(e) => return self.report(writer, &format!("bad frame: {e}")).await,
        };

        match frame.kind {
            FrameKind::Data => {
                let handle = match self.ensure_pty(writer, pty, pump).await {
                    Ok(handle) => handle,
                    Err(flow) => return flow,
                };
                let payload = bytes.slice(HEADER_LEN..HEADER_LEN + frame.payload.len());
                match handle.write(payload).await {
                    Ok(_) => Flow::Continue,
                    Err(e) => {
                        warn!(id = self.id, error = %e, "pty write failed");
                        let _ = writer.send_error(&format!("pty write failed: {e}")).await;
                        Flow::Drain(CloseReason::Pty)
                    }
                }
            }
            FrameKind::Resize => {
                let handle = match self.ensure_pty(writer, pty, pump).await {
                    Ok(handle) => handle,
                    Err(flow) => return flow,
                };
                match protocol::decode_resize(frame.payload) {
                    Err(e) => self.report(writer, &e.to_string()).await,
                    Ok((cols, rows)) if cols == 0 || rows == 0 => {
                        self.report(
                            writer,
                            &format!("resize dimensions must be nonzero, got {cols}x{rows}"),
                        )
                        .await
                    }
                    Ok((cols, rows)) => match handle.resize(cols, rows) {
                        Ok(()) => {
                            debug!(id = self.id, cols, rows, "pty resized");
                            Flow::Continue
                        }
                        Err(e) => self.report(writer, &format!("resize failed: {e}")).await,
                    },
                }
            }
            FrameKind::Control => {
                if frame.payload.is_empty() {
                    return self.report(writer, "control frame has an empty payload").await;
                }
                // No PTY yet means nothing to signal; don't spawn one for this.
                let Some(handle) = pty.as_ref() else {
                    return self
                        .report(writer, "no pty yet, send data or resize first")
                        .await;
                };
                let sig = frame.payload[0];
                match handle.signal(sig) {
                    Ok(()) => {
                        debug!(id = self.id, sig, "signal delivered");
                        Flow::Continue
                    }
                    Err(e) => {
                        warn!(id = self.id, sig, error = %e, "signal delivery failed");
                        let _ = writer.send_error(&format!("signal failed: {e}")).await;
                        Flow::Drain(CloseReason::Pty)
                    }
                }
            }
            // Liveness rides on transport pings; the in-band type exists for
            // clients that cannot reach them.
            FrameKind::Heartbeat => Flow::Continue,
            FrameKind::Close => Flow::Drain(CloseReason::CloseFrame),
            FrameKind::Error => {
                debug!(id = self.id, "ignoring error frame from peer");
                Flow::Continue
            }
            FrameKind::Unknown(byte) => {
                self.report(writer, &format!("unknown frame type 0x{byte:02x}"))
                    .await
            }
        }
    }

    /// Send an ERROR frame for a condition the session survives. Failing to
    /// send it is a transport failure, which the session does not survive.
    async fn report<W: TransportWriter>(&self, writer: &FrameWriter<W>, message: &str) -> Flow {
        debug!(id = self.id, message, "reporting error to peer");
        match writer.send_error(message).await {
            Ok(()) => Flow::Continue,
            Err(SendError::Encode(e)) => {
                error!(id = self.id, error = %e, "outbound frame encoding bug");
                Flow::Drain(CloseReason::Internal)
            }
            Err(SendError::Transport(_)) => Flow::Drain(CloseReason::Transport),
        }
    }

    /// Get the session's PTY, creating it (and starting the output pump) on
    /// first use. Open failure is fatal to the session.
    async fn ensure_pty<W: TransportWriter>(
        &self,
        writer: &Arc<FrameWriter<W>>,
        pty: &mut Option<Arc<PtyHandle>>,
        pump: &mut Option<JoinHandle<()>>,
    ) -> Result<Arc<PtyHandle>, Flow> {
        if let Some(handle) = pty {
            return Ok(Arc::clone(handle));
        }
        let config = self.state.config();
        let handle = match PtyHandle::open(&config.shell, config.initial_cols, config.initial_rows)
        {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                error!(id = self.id, shell = %config.shell, error = %e, "pty open failed");
                let _ = writer.send_error(&e.to_string()).await;
                return Err(Flow::Drain(CloseReason::Pty));
            }
        };
        info!(
            id = self.id,
            shell = %config.shell,
            pid = handle.child_pid(),
            "shell spawned"
        );
        let output = match handle.take_reader() {
            Ok(output) => output,
            Err(e) => {
                let _ = writer.send_error(&e.to_string()).await;
                return Err(Flow::Drain(CloseReason::Pty));
            }
        };
        *pump = Some(tokio::spawn(pump_loop(
            output,
            Arc::clone(&handle),
            Arc::clone(writer),
            self.cancel.clone(),
            self.id,
        )));
        *pty = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Release everything, exactly once: fire cancel, let the subordinate
    /// tasks drain, close the PTY, close the transport, deregister, then
    /// mark the session done.
    async fn cleanup<W: TransportWriter>(
        &self,
        writer: &FrameWriter<W>,
        pty: Option<Arc<PtyHandle>>,
        pump: Option<JoinHandle<()>>,
        heartbeat: JoinHandle<()>,
        reason: CloseReason,
    ) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = self.id, ?reason, "session draining");
        self.cancel.cancel();
        let _ = heartbeat.await;
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        if let Some(pty) = pty {
            pty.close();
            reap_child(pty, self.id);
        }
        writer.close().await;
        self.state.remove(self.id);
        self.done.cancel();
        info!(id = self.id, ?reason, "session closed");
    }
}

/// Reap the child in the background so cleanup never blocks on a shell that
/// ignores polite termination. After the grace period the child is killed
/// outright and reaped.
fn reap_child(pty: Arc<PtyHandle>, id: u64) {
    tokio::spawn(async move {
        let mut wait = Box::pin(pty.wait());
        match tokio::time::timeout(CHILD_GRACE, wait.as_mut()).await {
            Ok(Ok(status)) => debug!(id, code = status.exit_code(), "child reaped"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(id, "child still alive after close, killing");
                pty.force_kill();
                if let Ok(status) = wait.await {
                    debug!(id, code = status.exit_code(), "child reaped after kill");
                }
            }
        }
    });
}

/// PTY-to-peer pump. Blocking reads happen on a named OS thread and cross
/// into async through a bounded channel; this task wraps each chunk in a DATA
/// frame. Clean EOF (child exited) drains the session silently; any other
/// read error is reported first.
async fn pump_loop<W: TransportWriter>(
    output: Box<dyn Read + Send>,
    pty: Arc<PtyHandle>,
    writer: Arc<FrameWriter<W>>,
    cancel: CancellationToken,
    id: u64,
) {
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);

    let spawned = std::thread::Builder::new()
        .name(format!("pty-pump-{id}"))
        .spawn(move || {
            let mut output = output;
            let mut buf = [0u8; PUMP_BUF];
            loop {
                match output.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            break;
                        }
                    }
                    Err(e) if read_is_transient(&e) => continue,
                    // How the master reports a vanished child on Linux.
                    Err(e) if read_is_child_gone(&e) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        error!(id, error = %e, "failed to start pty pump thread");
        let _ = writer.send_error("pty output pump failed to start").await;
        cancel.cancel();
        return;
    }

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pty.closed() => break,
            chunk = rx.recv() => chunk,
        };
        match chunk {
            None => {
                debug!(id, "pty output reached eof");
                cancel.cancel();
                break;
            }
            Some(Ok(data)) => {
                if writer.send(FrameKind::Data, &data).await.is_err() {
                    warn!(id, "forwarding pty output failed");
                    cancel.cancel();
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(id, error = %e, "pty read failed");
                let _ = writer.send_error(&format!("pty read failed: {e}")).await;
                cancel.cancel();
                break;
            }
        }
    }
}

#[cfg(unix)]
fn read_is_transient(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN))
}

#[cfg(not(unix))]
fn read_is_transient(_e: &std::io::Error) -> bool {
    false
}

#[cfg(unix)]
fn read_is_child_gone(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn read_is_child_gone(_e: &std::io::Error) -> bool {
    false
}

/// Heartbeat ticker. A single failed or timed-out ping is treated as a dead
/// peer and drains the session.
async fn heartbeat_loop<W: TransportWriter>(
    writer: Arc<FrameWriter<W>>,
    cancel: CancellationToken,
    id: u64,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = writer.ping().await {
                    warn!(id, error = %e, "ping failed, draining session");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}
