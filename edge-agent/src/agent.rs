//! Agent facade
//!
//! Owns the MQTT bridge, the local bus, the terminal sessions and the heartbeat
//! registry, holds the EdgeX client and the current configuration snapshot, and
//! implements the `Service` operations the router dispatches to.

use crate::bus::{config_reload_subject, parse_heartbeat_subject, LocalBus, HEARTBEAT_SUBJECT};
use crate::config::Config;
use crate::edgex::EdgexClient;
use crate::error::{AgentError, Result};
use crate::execution::CommandExecutor;
use crate::heartbeat::{HeartbeatRegistry, ServiceInfo};
use crate::mqtt::{MqttBridge, MqttClient, Target};
use crate::router::{
    ConfigCommand, Router, Service, TerminalAction, EDGEX_CONFIG, EDGEX_METRICS, EDGEX_OPERATION,
    EDGEX_PING,
};
use crate::senml;
use crate::services;
use crate::terminal::{TerminalManager, TerminalSink, DEFAULT_SHELL, DEFAULT_TICK};
use crate::transport::{Message, MessageHandler};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shell and countdown tick used for terminal sessions
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub shell: String,
    pub tick: Duration,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            tick: DEFAULT_TICK,
        }
    }
}

type SharedConfig = Arc<RwLock<Arc<Config>>>;

/// Maps publish targets onto topics of the current channel pair
struct Outbound {
    bridge: Arc<MqttBridge>,
    config: SharedConfig,
}

#[async_trait]
impl TerminalSink for Outbound {
    async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<()> {
        let topic = target.topic(&self.config.read().channels);
        debug!(%topic, bytes = payload.len(), "publishing");
        self.bridge.publish(&topic, payload).await
    }
}

pub struct Agent {
    bridge: Arc<MqttBridge>,
    bus: Arc<dyn LocalBus>,
    edgex: Arc<dyn EdgexClient>,
    outbound: Arc<Outbound>,
    terminals: TerminalManager,
    heartbeats: Arc<HeartbeatRegistry>,
    config: SharedConfig,
}

impl Agent {
    pub async fn new(
        mqtt: Arc<dyn MqttClient>,
        config: Config,
        edgex: Arc<dyn EdgexClient>,
        bus: Arc<dyn LocalBus>,
    ) -> Result<Arc<Self>> {
        Self::with_terminal_options(mqtt, config, edgex, bus, TerminalOptions::default()).await
    }

    /// Build the agent and start watching sibling heartbeats; a failed bus
    /// subscription is fatal
    pub async fn with_terminal_options(
        mqtt: Arc<dyn MqttClient>,
        config: Config,
        edgex: Arc<dyn EdgexClient>,
        bus: Arc<dyn LocalBus>,
        terminal: TerminalOptions,
    ) -> Result<Arc<Self>> {
        let bridge = Arc::new(MqttBridge::new(mqtt, bus.clone(), &config.mqtt));
        let heartbeats = Arc::new(HeartbeatRegistry::new(config.heartbeat.interval));
        let config: SharedConfig = Arc::new(RwLock::new(Arc::new(config)));
        let outbound = Arc::new(Outbound {
            bridge: bridge.clone(),
            config: config.clone(),
        });
        let terminals = TerminalManager::with_options(outbound.clone(), &terminal.shell, terminal.tick);

        bus.subscribe(HEARTBEAT_SUBJECT, heartbeat_handler(heartbeats.clone()))
            .await?;
        info!(subject = HEARTBEAT_SUBJECT, "watching service heartbeats");

        Ok(Arc::new(Self {
            bridge,
            bus,
            edgex,
            outbound,
            terminals,
            heartbeats,
            config,
        }))
    }

    /// Subscribe the router to the control channel
    pub async fn start(self: &Arc<Self>) -> Result<Arc<Router>> {
        let router = Router::new(self.clone());
        let channel = self.config().channels.control.clone();
        self.bridge.subscribe_control(&channel, router.handler()).await?;
        info!(channel = %channel, "subscribed to control channel");
        Ok(router)
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    /// Close terminals, stop heartbeat tickers, close the bus and disconnect MQTT
    pub async fn shutdown(&self) {
        info!("shutting down agent");
        self.terminals.shutdown().await;
        self.heartbeats.shutdown();
        self.bus.close().await;
        if let Err(e) = self.bridge.disconnect().await {
            warn!("mqtt disconnect failed: {}", e);
        }
    }

    async fn respond(&self, uuid: &str, name: &str, value: &str) -> Result<()> {
        let payload = senml::encode(uuid, name, value)?;
        self.outbound.publish(Target::Control, payload).await
    }
}

fn heartbeat_handler(heartbeats: Arc<HeartbeatRegistry>) -> MessageHandler {
    Arc::new(move |msg: Message| match parse_heartbeat_subject(&msg.topic) {
        Some(source) => heartbeats.observe(&source.name, &source.kind),
        None => warn!(subject = %msg.topic, "dropping malformed heartbeat subject"),
    })
}

#[async_trait]
impl Service for Agent {
    async fn execute(&self, uuid: &str, program: &str, args: &[String]) -> Result<String> {
        let result = CommandExecutor::run(program, args).await?;
        self.respond(uuid, program, &result.output).await?;
        Ok(result.output)
    }

    async fn control(&self, uuid: &str, verb: &str, args: &[String]) -> Result<()> {
        let response = match verb {
            EDGEX_OPERATION => self.edgex.push_operation(args).await?,
            EDGEX_CONFIG => self.edgex.fetch_config(args).await?,
            EDGEX_METRICS => self.edgex.fetch_metrics(args).await?,
            EDGEX_PING => self.edgex.ping().await?,
            other => return Err(AgentError::UnknownCommand(format!("control {other}"))),
        };
        self.respond(uuid, verb, &response).await
    }

    async fn service_config(&self, uuid: &str, command: ConfigCommand) -> Result<()> {
        match command {
            ConfigCommand::View => {
                let listing = serde_json::to_string(&self.services())
                    .map_err(|e| AgentError::EncodeFailed(e.to_string()))?;
                self.respond(uuid, "view", &listing).await
            }
            ConfigCommand::Save {
                service,
                filename,
                content,
            } => {
                services::write_service_config(&service, &filename, &content).await?;
                let subject = config_reload_subject(&service);
                self.bus.publish(&subject, Vec::new()).await?;
                info!(service = %service, %subject, "reload requested");
                Ok(())
            }
        }
    }

    async fn terminal(&self, uuid: &str, action: TerminalAction) -> Result<()> {
        let timeout = self.config().terminal.session_timeout;
        match action {
            TerminalAction::Open => self.terminals.open(uuid, timeout).await,
            TerminalAction::Write(bytes) => self.terminals.write(uuid, timeout, bytes).await,
            TerminalAction::Close => self.terminals.close(uuid).await,
        }
    }

    async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<()> {
        self.outbound.publish(target, payload).await
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.heartbeats.list()
    }

    fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    async fn add_config(&self, mut config: Config) -> Result<()> {
        if config.file.is_empty() {
            config.file = self.config().file.clone();
        }
        config.validate()?;
        config.save().await?;
        *self.config.write() = Arc::new(config);
        info!("configuration updated");
        Ok(())
    }
}
