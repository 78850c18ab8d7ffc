//! Courier notification delivery server.
//!
//! Entry point: loads configuration, initializes logging, and hands over to
//! the startup wiring.

mod startup;

use courier_shared::ConfigLoader;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::new(None)
        .load()
        .map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(port = config.http.port, "starting courier server");
    startup::run(config).await
}
