/*!
Mock MQTT client for running the agent without a broker

Records every publish and subscription, and delivers simulated incoming
messages to the handlers whose filter matches, exactly like the broker would.
*/

use async_trait::async_trait;
use edge_agent::error::{AgentError, Result};
use edge_agent::mqtt::MqttClient;
use edge_agent::senml::{self, Frame};
use edge_agent::transport::{Message, MessageHandler};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    /// Decode the payload as a SenML frame
    pub fn frame(&self) -> Option<Frame> {
        senml::decode(&self.payload).ok()
    }
}

struct Subscription {
    filter: String,
    handler: MessageHandler,
}

/// In-memory stand-in for the MQTT connection
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    fail_subscribe: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `subscribe` fail
    pub fn fail_subscriptions(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Deliver a message as if the broker had sent it; returns the number of handlers reached
    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> usize
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        let payload = payload.into();
        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| rumqttc::matches(&topic, &s.filter))
            .map(|s| s.handler.clone())
            .collect();

        for handler in &handlers {
            handler(Message::new(topic.clone(), payload.clone()));
        }
        log::info!("[MOCK] Simulated incoming on {} ({} handlers)", topic, handlers.len());
        handlers.len()
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().map(|s| s.filter.clone()).collect()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Last SenML frame published on `topic`
    pub fn last_frame(&self, topic: &str) -> Option<Frame> {
        self.find_messages_by_topic(topic).last().and_then(MockMessage::frame)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

#[async_trait]
impl MqttClient for MockMqttClient {
    async fn subscribe(&self, filter: &str, _qos: QoS, handler: MessageHandler) -> Result<()> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(AgentError::SubscribeFailed(format!("{filter}: refused by mock")));
        }
        self.subscriptions.lock().push(Subscription {
            filter: filter.to_string(),
            handler,
        });
        log::info!("[MOCK] Subscribed to {}", filter);
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        log::info!("[MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_publish_subscribe() {
        let client = MockMqttClient::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client
            .subscribe(
                "channels/C/messages/services/#",
                QoS::AtMostOnce,
                Arc::new(move |msg: Message| sink.lock().push(msg.topic)),
            )
            .await
            .unwrap();
        assert_eq!(client.get_subscriptions(), vec!["channels/C/messages/services/#"]);

        assert_eq!(client.simulate_incoming("channels/C/messages/services/a/b", b"x".to_vec()), 1);
        assert_eq!(client.simulate_incoming("channels/C/messages/req", b"x".to_vec()), 0);
        assert_eq!(*seen.lock(), vec!["channels/C/messages/services/a/b"]);

        client
            .publish("test/topic", QoS::AtLeastOnce, true, b"payload".to_vec())
            .await
            .unwrap();
        let messages = client.find_messages_by_topic("test/topic");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].retain);
    }

    #[tokio::test]
    async fn test_failing_subscriptions() {
        let client = MockMqttClient::new();
        client.fail_subscriptions();
        let err = client
            .subscribe("a/b", QoS::AtMostOnce, Arc::new(|_: Message| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SubscribeFailed(_)));
    }
}
