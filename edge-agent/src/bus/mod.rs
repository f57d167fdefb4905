//! Local message bus shared with sibling services on the gateway
//!
//! The agent listens for heartbeats on `channels.heartbeat.<name>.<type>` and
//! pushes reload notices / relayed commands on `commands.*`.

pub mod nats;

use crate::error::Result;
use crate::transport::MessageHandler;
use async_trait::async_trait;

pub use nats::NatsBus;

/// Wildcard subject sibling services heartbeat on
pub const HEARTBEAT_SUBJECT: &str = "channels.heartbeat.>";

/// Capability set the agent needs from the local bus
#[async_trait]
pub trait LocalBus: Send + Sync {
    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<()>;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Stop every subscription task and flush pending publishes
    async fn close(&self);
}

/// Subject a service listens on for configuration reloads
pub fn config_reload_subject(service: &str) -> String {
    format!("commands.{service}.config")
}

/// Service identity carried by a heartbeat subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSource {
    pub name: String,
    pub kind: String,
}

/// Parse `channels.heartbeat.<name>[.<type>]`; the type defaults to "unknown"
pub fn parse_heartbeat_subject(subject: &str) -> Option<HeartbeatSource> {
    let tokens: Vec<&str> = subject.split('.').collect();
    if tokens.len() < 3 || tokens[2].is_empty() {
        return None;
    }
    let kind = tokens
        .get(3)
        .filter(|t| !t.is_empty())
        .copied()
        .unwrap_or("unknown");
    Some(HeartbeatSource {
        name: tokens[2].to_string(),
        kind: kind.to_string(),
    })
}
