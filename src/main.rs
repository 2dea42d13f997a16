//! Conduit event substrate daemon.
//!
//! Entry point for `conduitd`. Loads configuration, brings the event
//! framework up on the resolved backend tier, and keeps the outbox
//! drainer running until a shutdown signal arrives.

use anyhow::Result;
use conduit_framework::{Config, EventFramework};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting conduit event substrate");
    info!(
        backend = %config.backend,
        database_url = %config.database_url_masked(),
        "Configuration loaded"
    );

    let framework = EventFramework::init(config).await?;
    info!(tier = %framework.tier(), "Conduit is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    framework.shutdown().await;
    info!("Conduit shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for SIGINT or SIGTERM.
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
        () = ctrl_c => {},
        _ = terminate => {},
    }
}
