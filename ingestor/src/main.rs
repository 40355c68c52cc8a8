use anyhow::Context;
use clap::Parser;
use ingestor::config::Config;
use ingestor::lifecycle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting IoT Ingestor");
    info!("MQTT topic filter: {}", config.mqtt.topic_filter());
    info!("HTTP server: {}", config.http_addr);

    lifecycle::run(config)
        .await
        .context("ingestor terminated with an error")?;

    info!("Ingestor stopped");
    Ok(())
}
