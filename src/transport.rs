//! Transport adapter over an upgraded peer connection.
//!
//! The session engine needs a small capability set from its peer: a
//! deadline-bounded receive of discrete messages, binary send, ping, and
//! close. [`Transport`] captures that surface so the driver can run against
//! an in-memory peer in tests; [`WsTransport`] is the production
//! implementation over an `axum` WebSocket.
//!
//! The writer half is not safe for concurrent sends; the session serializes
//! every outbound write behind one lock.

use std::future::Future;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("read deadline expired")]
    Timeout,
    #[error("transport io error: {0}")]
    Io(String),
}

/// One message from the peer. The session acts on `Binary`; everything else
/// (text, ping, pong) only counts as liveness.
#[derive(Debug)]
pub enum Incoming {
    Binary(Bytes),
    Other,
}

pub trait Transport {
    type Reader: TransportReader;
    type Writer: TransportWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

pub trait TransportReader: Send + 'static {
    /// Wait for the next message, failing with [`TransportError::Timeout`]
    /// once `deadline` passes.
    fn recv(
        &mut self,
        deadline: Instant,
    ) -> impl Future<Output = Result<Incoming, TransportError>> + Send;
}

pub trait TransportWriter: Send + 'static {
    fn send_binary(
        &mut self,
        data: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Transport-level liveness beacon. The peer's pong comes back through
    /// [`TransportReader::recv`] as [`Incoming::Other`].
    fn ping(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// WebSocket-backed transport. Split once into its two halves by the session.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WsTransport {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn split(self) -> (WsReader, WsWriter) {
        let (sink, stream) = self.socket.split();
        (WsReader { stream }, WsWriter { sink })
    }
}

pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

impl TransportReader for WsReader {
    async fn recv(&mut self, deadline: Instant) -> Result<Incoming, TransportError> {
        match tokio::time::timeout_at(deadline, self.stream.next()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(None) => Err(TransportError::PeerClosed),
            Ok(Some(Err(e))) => Err(TransportError::Io(e.to_string())),
            Ok(Some(Ok(message))) => match message {
                Message::Binary(data) => Ok(Incoming::Binary(data)),
                Message::Close(_) => Err(TransportError::PeerClosed),
                // Pings are answered by the websocket layer itself; pong and
                // text just refresh the peer's liveness.
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) => Ok(Incoming::Other),
            },
        }
    }
}

pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

impl TransportWriter for WsWriter {
    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(data))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}
