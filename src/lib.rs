//! term-relay: interactive shell sessions over a framed WebSocket transport.
//!
//! A single endpoint upgrades each connection into a session that owns one
//! shell under a PTY. Frames go both ways: DATA carries terminal bytes,
//! RESIZE and CONTROL carry window changes and signals, ERROR carries
//! human-readable diagnostics. The [`protocol`] module is the shared codec;
//! Rust clients can link it directly.

pub mod config;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod state;
pub mod transport;
pub mod ws;
