//! Process configuration, read once at startup from the environment.

use std::net::SocketAddr;

use tracing::warn;

use crate::pty;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the HTTP/WebSocket surface.
    pub bind: SocketAddr,
    /// Shell spawned for every session.
    pub shell: String,
    /// Window size used when a session creates its PTY implicitly.
    pub initial_cols: u16,
    pub initial_rows: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            shell: pty::default_shell(),
            initial_cols: pty::DEFAULT_COLS,
            initial_rows: pty::DEFAULT_ROWS,
        }
    }
}

impl ServerConfig {
    /// Build a config from `TERM_RELAY_BIND` and `TERM_RELAY_SHELL`, falling
    /// back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("TERM_RELAY_BIND") {
            match value.parse() {
                Ok(addr) => config.bind = addr,
                Err(_) => warn!(value = %value, "ignoring unparsable TERM_RELAY_BIND"),
            }
        }
        if let Ok(value) = std::env::var("TERM_RELAY_SHELL") {
            if !value.is_empty() {
                config.shell = value;
            }
        }
        config
    }
}
