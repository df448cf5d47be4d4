use spread_engine::{ArbitrageEngine, EngineConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Spread Arbitrage Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    info!(
        bybit_authenticated = config.bybit.is_some(),
        binance_authenticated = config.binance.is_some(),
        poll_interval_ms = config.poll_interval_ms,
        "configuration loaded"
    );

    let engine = Arc::new(ArbitrageEngine::new(config));
    engine.start().await?;
    info!("engine started");

    // Mirror engine events into the log until an external API layer takes
    // over as the consumer
    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "engine event"),
                    Err(e) => error!("failed to serialize engine event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    error!(missed = missed, "event consumer lagged, events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await;

    engine.stop().await;
    event_task.abort();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping engine...");
}
