//! Message shape shared by the MQTT client and the local bus

use bytes::Bytes;
use std::sync::Arc;

/// A message delivered by a subscription (`topic` is the MQTT topic or bus subject)
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Subscription callback; must not block, long work is spawned
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
