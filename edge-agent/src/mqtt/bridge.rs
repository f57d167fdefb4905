//! MQTT bridge: control-channel subscriptions, service relay and outbound publish

use super::{qos_from_level, request_topic, services_filter, MqttClient};
use crate::bus::LocalBus;
use crate::config::MqttConfig;
use crate::error::Result;
use crate::transport::{Message, MessageHandler};
use once_cell::sync::Lazy;
use regex::Regex;
use rumqttc::QoS;
use std::sync::Arc;
use tracing::{debug, warn};

static SERVICES_TOPIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^channels/([^/]+)/messages/services(/[^?]*)?(\?.*)?$").expect("valid regex")
});

pub struct MqttBridge {
    client: Arc<dyn MqttClient>,
    bus: Arc<dyn LocalBus>,
    qos: QoS,
    retain: bool,
}

impl MqttBridge {
    pub fn new(client: Arc<dyn MqttClient>, bus: Arc<dyn LocalBus>, mqtt: &MqttConfig) -> Self {
        Self {
            client,
            bus,
            qos: qos_from_level(mqtt.qos),
            retain: mqtt.retain,
        }
    }

    /// Subscribe to the control request topic (delivered to `handler`) and to the
    /// services subtree, which is relayed onto the local bus as `commands.<subtopic>`
    pub async fn subscribe_control(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        self.client
            .subscribe(&request_topic(channel), QoS::AtMostOnce, handler)
            .await?;

        let bus = self.bus.clone();
        let relay: MessageHandler = Arc::new(move |msg: Message| {
            let Some(subject) = relay_subject(&msg.topic) else {
                warn!(topic = %msg.topic, "dropping service message without subtopic");
                return;
            };
            let bus = bus.clone();
            tokio::spawn(async move {
                debug!(subject = %subject, "relaying service message to local bus");
                if let Err(e) = bus.publish(&subject, msg.payload.to_vec()).await {
                    warn!(subject = %subject, "relay failed: {}", e);
                }
            });
        });
        self.client
            .subscribe(&services_filter(channel), QoS::AtMostOnce, relay)
            .await
    }

    /// Publish with the configured QoS and retain flag
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, self.qos, self.retain, payload).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }
}

/// Bus subject for a service-relay topic: `commands.<segments joined by dots>`
pub fn relay_subject(topic: &str) -> Option<String> {
    let captures = SERVICES_TOPIC.captures(topic)?;
    let subtopic = captures.get(2)?.as_str();
    let segments: Vec<&str> = subtopic.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    Some(format!("commands.{}", segments.join(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_subject() {
        assert_eq!(
            relay_subject("channels/C/messages/services/export/config").as_deref(),
            Some("commands.export.config")
        );
        assert_eq!(
            relay_subject("channels/C/messages/services//a///b/?x=1").as_deref(),
            Some("commands.a.b")
        );
        assert_eq!(relay_subject("channels/C/messages/services"), None);
        assert_eq!(relay_subject("channels/C/messages/services/"), None);
        assert_eq!(relay_subject("channels/C/messages/req"), None);
    }
}
