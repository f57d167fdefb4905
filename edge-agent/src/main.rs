//! Edge Agent - gateway agent for the IoT control plane
//!
//! Startup:
//! - Environment (`MF_AGENT_*`, `.env`) and bootstrap produce the config
//! - MQTT client, local bus and EdgeX client are connected
//! - The agent subscribes to the control channel and serves the admin API
//! - Ctrl-C closes terminals, stops tickers and disconnects

use anyhow::{Context, Result};
use edge_agent::bootstrap::{self, BootstrapSettings};
use edge_agent::bus::NatsBus;
use edge_agent::config::{load_certificates, Config};
use edge_agent::edgex::HttpEdgexClient;
use edge_agent::http;
use edge_agent::logging;
use edge_agent::mqtt::RumqttClient;
use edge_agent::Agent;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let env_config = Config::from_env();
    let log_level = logging::init(&env_config.log.level);

    info!("Edge Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let settings = BootstrapSettings::from_env();
    let mut config = bootstrap::load(&settings, env_config)
        .await
        .context("Failed to load configuration")?;
    config.mqtt = load_certificates(config.mqtt)
        .await
        .context("Failed to load MQTT certificates")?;
    config.validate().context("Invalid configuration")?;
    if let Err(e) = log_level.apply(&config.log.level) {
        warn!("could not apply log level {}: {}", config.log.level, e);
    }

    let client_id = format!("edge-agent-{}", uuid::Uuid::new_v4());
    let mqtt = RumqttClient::connect(&config.mqtt, &client_id)
        .context("Failed to create MQTT client")?;
    let bus = NatsBus::connect(&config.server.local_bus_url)
        .await
        .context("Failed to connect to local bus")?;
    let edgex = HttpEdgexClient::new(&config.edgex.url).context("Failed to create EdgeX client")?;

    let port = config.server.port.clone();
    let agent = Agent::new(Arc::new(mqtt), config, Arc::new(edgex), Arc::new(bus))
        .await
        .context("Failed to create agent")?;
    agent
        .start()
        .await
        .context("Failed to subscribe to control channel")?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn({
        let service = agent.clone();
        async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            if let Err(e) = http::serve(service, &port, shutdown).await {
                error!("admin API stopped: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    let _ = stop_tx.send(());
    agent.shutdown().await;
    let _ = server.await;

    info!("Edge Agent stopped");
    Ok(())
}
