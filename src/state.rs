//! Server-global session registry.
//!
//! The registry never owns a session: it keeps just enough of each one (the
//! cancel and done tokens) to request shutdown and to observe completion.
//! Every driver removes its own entry during cleanup, so a session's lifetime
//! is bounded by its connection, not by the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Cancellation handles for one live session.
#[derive(Clone)]
pub struct SessionEntry {
    /// Fired to request the session drain and close.
    pub cancel: CancellationToken,
    /// Fired by the session once its cleanup has fully run.
    pub done: CancellationToken,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    sessions: DashMap<u64, SessionEntry>,
    next_id: AtomicU64,
    closing: CancellationToken,
    config: ServerConfig,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
                closing: CancellationToken::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Register a new session, returning its id. Refused once shutdown has
    /// begun.
    pub fn register(&self, cancel: CancellationToken, done: CancellationToken) -> Option<u64> {
        if self.inner.closing.is_cancelled() {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sessions
            .insert(id, SessionEntry { cancel: cancel.clone(), done });
        // A shutdown racing the check above either sees this entry when it
        // enumerates or is caught here; both paths cancel the session.
        if self.inner.closing.is_cancelled() {
            cancel.cancel();
        }
        tracing::debug!(id, "session registered");
        Some(id)
    }

    /// Remove a session by id (the session calls this during cleanup).
    pub fn remove(&self, id: u64) {
        if self.inner.sessions.remove(&id).is_some() {
            tracing::debug!(id, "session removed");
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Cancel every live session and wait until each one present at call time
    /// has finished its cleanup. New registrations are refused from the first
    /// moment of the call.
    pub async fn shutdown_all(&self) {
        self.inner.closing.cancel();
        let entries: Vec<SessionEntry> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::info!(sessions = entries.len(), "shutting down all sessions");
        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in &entries {
            entry.done.cancelled().await;
        }
    }
}
