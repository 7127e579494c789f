use anyhow::{Context, Result};
use poem::{listener::TcpListener, Server};
use std::env;
use tokio::signal;

mod api;
mod config;
mod forward;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("beacon_relay=info,poem=info")),
        )
        .init();

    // Load configuration
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "relay-config.toml".to_string());
    tracing::info!("Loading configuration from: {}", config_path);

    let config = config::ConfigFile::load(&config_path)?;
    config.validate()?;

    let forwarder =
        forward::Forwarder::new(config.relay.timeout(), config.relay.user_agent.as_deref())?;
    let app = api::build_app(forwarder, config.web.static_dir.as_deref());

    let addr = config.server.bind_addr();
    tracing::info!("🚀 Beacon relay listening on {}", addr);
    tracing::info!("   📍 POST /api/position {{serverUrl, deviceId, lat, lon, timestamp}}");
    tracing::info!("   ⏱️  Upstream timeout: {}s", config.relay.timeout_secs);
    tracing::info!("   📖 Documentation: http://{}/docs", addr);
    if let Some(dir) = &config.web.static_dir {
        tracing::info!("   🌐 Serving web bundle from {}", dir);
    }

    Server::new(TcpListener::bind(addr))
        .run_with_graceful_shutdown(app, shutdown_signal(), None)
        .await
        .context("Relay server failed")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
