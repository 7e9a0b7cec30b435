use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use tandem_hub::config::HubConfig;
use tandem_hub::{router, sweep, HubState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HubConfig::from_env();
    let state = HubState::new(config.clone());

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind hub listener on {}", config.bind))?;
    info!(
        bind = %config.bind,
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        client_timeout_ms = config.client_timeout.as_millis() as u64,
        "starting hub"
    );

    let sweeper = tokio::spawn(sweep::sweep_loop(state.clone()));
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("hub exited unexpectedly");
    sweeper.abort();
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
