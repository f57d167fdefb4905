//! NATS implementation of the local bus

use super::LocalBus;
use crate::error::{AgentError, Result};
use crate::transport::{Message, MessageHandler};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct NatsBus {
    client: async_nats::Client,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| AgentError::BusSubscribeFailed(format!("connect {url}: {e}")))?;
        info!(url, "connected to local bus");
        Ok(Self {
            client,
            subscriptions: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LocalBus for NatsBus {
    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<()> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| AgentError::BusSubscribeFailed(format!("{subject}: {e}")))?;

        let owned_subject = subject.to_string();
        let task = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                handler(Message::new(msg.subject.to_string(), msg.payload));
            }
            debug!(subject = %owned_subject, "bus subscription ended");
        });
        self.subscriptions.lock().push(task);
        info!(subject, "subscribed on local bus");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| AgentError::PublishFailed(format!("{subject}: {e}")))
    }

    async fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = self.subscriptions.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self.client.flush().await {
            warn!("failed to flush local bus: {}", e);
        }
    }
}
