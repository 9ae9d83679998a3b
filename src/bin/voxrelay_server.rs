//! Voice relay server binary.
//!
//! Usage: `voxrelay-server [CONFIG_PATH]`. Without a path the default
//! config location is used; a missing file means built-in defaults.
//! Engine keys come from the environment and may be overridden by each
//! client over its socket.

use std::path::PathBuf;
use std::sync::Arc;

use voxrelay::config::RelayConfig;
use voxrelay::credentials::EngineCredentials;
use voxrelay::session::engines::VendorEngineFactory;
use voxrelay::transport::server::{AppState, RelayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(RelayConfig::default_config_path);
    let config = RelayConfig::load_or_default(&config_path).map_err(|e| {
        tracing::error!(path = %config_path.display(), error = %e, "invalid config");
        anyhow::anyhow!("failed to load {}: {e}", config_path.display())
    })?;
    tracing::info!(path = %config_path.display(), "voxrelay-server starting");

    let credentials = EngineCredentials::from_env();
    let missing = credentials.missing_required();
    if !missing.is_empty() {
        tracing::warn!(
            "no server key for {}; clients must provide one",
            missing.join(", ")
        );
    }

    let config = Arc::new(config);
    let factory = Arc::new(VendorEngineFactory::new(Arc::clone(&config)));
    let state = AppState::new(Arc::clone(&config), factory, credentials);
    let server = RelayServer::start(state, &config.server).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            // Dropping the pending wait aborts the server task.
            tracing::info!("interrupt received, shutting down");
        }
        result = server.wait() => {
            result?;
            tracing::warn!("relay server stopped");
        }
    }

    tracing::info!("voxrelay-server shut down cleanly");
    Ok(())
}
