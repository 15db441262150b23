//! Publish/subscribe transport
//!
//! `InMemoryBus` serves a single process (dev, tests, one-replica deploys);
//! `NatsBus` fans out across replicas so an SSE client attached to any
//! instance sees every notification.

use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A message received from the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe to subject: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe with NATS-style wildcards: `*` is one token, `>` the rest
    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}

/// Serialize `value` as JSON and publish it
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn EventBus,
    subject: &str,
    value: &T,
) -> BusResult<()> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(subject, payload).await
}

/// NATS subject matching
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Broadcast-channel bus for a single process
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Slow subscribers lose the oldest messages once `buffer_size` is exceeded
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        // No subscribers is not an error
        let _ = self.sender.send(BusMessage {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if subject_matches(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(pattern = %pattern, skipped, "Bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}

/// NATS core pub/sub bus
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        Ok(subscriber
            .map(|msg| BusMessage {
                subject: msg.subject.to_string(),
                payload: msg.payload.to_vec(),
            })
            .boxed())
    }
}
