use tracing::info;

use term_relay::config::ServerConfig;
use term_relay::state::AppState;
use term_relay::ws;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ServerConfig::from_env();
    let state = AppState::new(config.clone());
    let app = ws::router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, shell = %config.shell, "term-relay listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining sessions");
            shutdown_state.shutdown_all().await;
        })
        .await?;

    info!("term-relay stopped");
    Ok(())
}
