//! MQTT side of the agent
//!
//! - `MqttClient`: narrow client capability set (subscribe/publish/disconnect)
//! - `client`: rumqttc-backed implementation with automatic reconnection
//! - `tls`: rustls client configuration for (m)TLS brokers
//! - `bridge`: control-channel subscriptions, service relay, outbound publish

pub mod bridge;
pub mod client;
pub mod tls;

use crate::config::ChannelsConfig;
use crate::error::Result;
use crate::transport::MessageHandler;
use async_trait::async_trait;
use rumqttc::QoS;

pub use bridge::MqttBridge;
pub use client::RumqttClient;

/// Capability set the agent needs from an MQTT client
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Subscribe to `filter`; every matching publish is handed to `handler`
    async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<()>;

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Map a configured QoS level onto rumqttc's enum (levels above 2 clamp to 2)
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Where an outbound message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `channels/<control>/messages/res`
    Control,
    /// `channels/<data>/messages/res`
    Data,
    /// `channels/<control>/messages/res/<subtopic>`
    Subtopic(String),
}

impl Target {
    pub fn terminal(uuid: &str) -> Self {
        Target::Subtopic(format!("term/{uuid}"))
    }

    /// Parse the kind names used by the admin API ("control", "data", anything else is a subtopic)
    pub fn parse(kind: &str) -> Self {
        match kind {
            "control" => Target::Control,
            "data" => Target::Data,
            other => Target::Subtopic(other.trim_matches('/').to_string()),
        }
    }

    pub fn topic(&self, channels: &ChannelsConfig) -> String {
        match self {
            Target::Control => response_topic(&channels.control),
            Target::Data => response_topic(&channels.data),
            Target::Subtopic(sub) => format!("{}/{}", response_topic(&channels.control), sub),
        }
    }
}

pub fn request_topic(channel: &str) -> String {
    format!("channels/{channel}/messages/req")
}

pub fn services_filter(channel: &str) -> String {
    format!("channels/{channel}/messages/services/#")
}

pub fn response_topic(channel: &str) -> String {
    format!("channels/{channel}/messages/res")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> ChannelsConfig {
        ChannelsConfig {
            control: "CTRL".to_string(),
            data: "DATA".to_string(),
        }
    }

    #[test]
    fn test_topic_shapes() {
        assert_eq!(request_topic("CTRL"), "channels/CTRL/messages/req");
        assert_eq!(services_filter("CTRL"), "channels/CTRL/messages/services/#");
        assert_eq!(Target::Control.topic(&channels()), "channels/CTRL/messages/res");
        assert_eq!(Target::Data.topic(&channels()), "channels/DATA/messages/res");
        assert_eq!(
            Target::terminal("T1").topic(&channels()),
            "channels/CTRL/messages/res/term/T1"
        );
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("control"), Target::Control);
        assert_eq!(Target::parse("data"), Target::Data);
        assert_eq!(Target::parse("/term/X/"), Target::Subtopic("term/X".to_string()));
    }

    #[test]
    fn test_control_filters_route_their_topics() {
        use rumqttc::matches;
        let services = services_filter("C");
        assert!(matches("channels/C/messages/services/a/b", &services));
        assert!(!matches("channels/D/messages/services/a", &services));
        assert!(matches("channels/C/messages/req", &request_topic("C")));
        assert!(!matches("channels/C/messages/res", &request_topic("C")));
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }
}
