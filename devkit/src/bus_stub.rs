/*!
Mock local bus

Publishes are recorded and delivered synchronously to every subscription whose
subject pattern matches (`*` matches one token, `>` the remaining tokens).
*/

use async_trait::async_trait;
use edge_agent::bus::LocalBus;
use edge_agent::error::Result;
use edge_agent::transport::{Message, MessageHandler};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Subscription {
    subject: String,
    handler: MessageHandler,
}

#[derive(Clone, Default)]
pub struct MockBus {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    closed: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subjects published so far, in order
    pub fn published_subjects(&self) -> Vec<String> {
        self.published.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn subscribed_subjects(&self) -> Vec<String> {
        self.subscriptions.lock().iter().map(|s| s.subject.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, subject: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| subject_matches(&s.subject, subject))
            .map(|s| s.handler.clone())
            .collect();
        for handler in handlers {
            handler(Message::new(subject.to_string(), payload.to_vec()));
        }
    }
}

#[async_trait]
impl LocalBus for MockBus {
    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<()> {
        self.subscriptions.lock().push(Subscription {
            subject: subject.to_string(),
            handler,
        });
        log::info!("[MOCK BUS] Subscribed to {}", subject);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        log::info!("[MOCK BUS] Published to {}", subject);
        self.published.lock().push((subject.to_string(), payload.clone()));
        self.deliver(subject, &payload);
        Ok(())
    }

    async fn close(&self) {
        self.subscriptions.lock().clear();
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// NATS subject matching
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
