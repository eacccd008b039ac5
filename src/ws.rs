//! HTTP surface: the WebSocket upgrade endpoint and a health probe.
//!
//! The upgrade handler is the acceptor: it registers a session, hands the
//! socket to the driver, and never waits for it. Origin gating is deliberately
//! absent here; embedders put the endpoint behind whatever front door they
//! trust.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::session::Session;
use crate::state::AppState;
use crate::transport::WsTransport;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        match Session::register(state) {
            Some(session) => session.run(WsTransport::new(socket)).await,
            // Dropping the socket is the close; there is nothing to drain.
            None => info!("refusing connection, shutdown in progress"),
        }
    })
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    format!("ok {}\n", state.session_count())
}
