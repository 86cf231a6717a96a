use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Broker-specific errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Not connected to the broker")]
    NotConnected,
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub retain: bool,
}

impl PublishOptions {
    pub fn retained() -> Self {
        Self { retain: true }
    }
}

/// Connection lifecycle notifications emitted by a broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Publish sink with connection-lifecycle notifications.
///
/// Reconnection is the implementation's business; consumers only observe it
/// through [`connection_events`](Broker::connection_events).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<()>;
    fn is_ready(&self) -> bool;
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Flush pending publications and disconnect
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Broker keeping its publications in memory, optionally only the latest ones
pub struct InMemoryBroker {
    messages: Mutex<VecDeque<PublishedMessage>>,
    history_limit: Option<usize>,
    ready: AtomicBool,
    fail_publishes: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            messages: Mutex::new(VecDeque::new()),
            history_limit: None,
            ready: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
            events,
        }
    }

    /// Broker that is already connected when handed out
    pub fn connected() -> Self {
        let broker = Self::new();
        broker.ready.store(true, Ordering::SeqCst);
        broker
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    pub fn connect(&self) {
        self.ready.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Connected);
    }

    pub fn disconnect(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    pub fn raise_error(&self, reason: &str) {
        let _ = self.events.send(ConnectionEvent::Error(reason.to_string()));
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<()> {
        if !self.is_ready() {
            return Err(BrokerError::NotConnected.into());
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            }
            .into());
        }
        debug!(topic, payload, retain = options.retain, "published");
        let mut messages = self.messages.lock();
        messages.push_back(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain: options.retain,
        });
        if let Some(limit) = self.history_limit {
            while messages.len() > limit {
                messages.pop_front();
            }
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
