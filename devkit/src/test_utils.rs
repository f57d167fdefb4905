/*!
Test harness for the edge agent

Builds a real `Agent` over the in-memory MQTT client, local bus and EdgeX stub,
with its config file in a temporary directory, and offers helpers to drive it
the way the control plane and sibling services would.
*/

use crate::bus_stub::MockBus;
use crate::edgex_stub::StubEdgex;
use crate::fixtures;
use crate::mqtt_stub::MockMqttClient;
use anyhow::Result;
use edge_agent::bus::LocalBus;
use edge_agent::config::Config;
use edge_agent::mqtt::{request_topic, Target};
use edge_agent::router::Router;
use edge_agent::senml::Frame;
use edge_agent::{Agent, TerminalOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const CONTROL_CHANNEL: &str = "CTRL";
pub const DATA_CHANNEL: &str = "DATA";

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub bus: MockBus,
    pub edgex: StubEdgex,
    pub agent: Arc<Agent>,
    pub router: Arc<Router>,
    workdir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    /// Start an agent on `CTRL`/`DATA` after applying `customize` to the config
    pub async fn with_config(customize: impl FnOnce(&mut Config)) -> Result<Self> {
        env_logger::try_init().ok();

        let workdir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.file = workdir.path().join("config.toml").to_string_lossy().to_string();
        config.channels.control = CONTROL_CHANNEL.to_string();
        config.channels.data = DATA_CHANNEL.to_string();
        customize(&mut config);

        let mqtt_client = MockMqttClient::new();
        let bus = MockBus::new();
        let edgex = StubEdgex::default();
        let agent = Agent::with_terminal_options(
            Arc::new(mqtt_client.clone()),
            config,
            Arc::new(edgex.clone()),
            Arc::new(bus.clone()),
            terminal_options(),
        )
        .await?;
        let router = agent.start().await?;
        log::info!("Test agent started on {}", CONTROL_CHANNEL);

        Ok(Self {
            mqtt_client,
            bus,
            edgex,
            agent,
            router,
            workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn control_topic(&self) -> String {
        self.topic(Target::Control)
    }

    pub fn terminal_topic(&self, uuid: &str) -> String {
        self.topic(Target::terminal(uuid))
    }

    pub fn topic(&self, target: Target) -> String {
        let config = edge_agent::router::Service::config(self.agent.as_ref());
        target.topic(&config.channels)
    }

    /// Deliver a SenML command on the control request topic
    pub fn send_command(&self, uuid: &str, kind: &str, body: &str) -> usize {
        self.mqtt_client
            .simulate_incoming(request_topic(CONTROL_CHANNEL), fixtures::command(uuid, kind, body))
    }

    pub fn send_terminal(&self, uuid: &str, text: &str) -> usize {
        self.mqtt_client
            .simulate_incoming(request_topic(CONTROL_CHANNEL), fixtures::term(uuid, text))
    }

    /// Heartbeat from a sibling service on the local bus
    pub async fn send_heartbeat(&self, name: &str, kind: &str) -> Result<()> {
        self.bus
            .publish(&format!("channels.heartbeat.{name}.{kind}"), Vec::new())
            .await?;
        Ok(())
    }

    /// Poll until a frame published on `topic` satisfies `accept`
    pub async fn wait_for_frame(
        &self,
        topic: &str,
        timeout: Duration,
        accept: impl Fn(&Frame) -> bool,
    ) -> Option<Frame> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let found = self
                .mqtt_client
                .find_messages_by_topic(topic)
                .iter()
                .filter_map(|m| m.frame())
                .find(|f| accept(f));
            if found.is_some() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        log::warn!("Timeout waiting for frame on {}", topic);
        None
    }

    /// Poll `check` until it holds or `timeout` elapses
    pub async fn wait_until(&self, timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    pub async fn shutdown(&self) {
        self.agent.shutdown().await;
    }
}

/// bash when available, plain sh otherwise
fn terminal_options() -> TerminalOptions {
    let mut options = TerminalOptions::default();
    if !["/bin/bash", "/usr/bin/bash"].iter().any(|p| Path::new(p).exists()) {
        options.shell = "sh".to_string();
    }
    options
}
