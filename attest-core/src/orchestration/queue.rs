//! Durable at-least-once dispatch channel between orchestrator roles.
//!
//! Messages are keyed; publishing a key that is still pending on the topic is
//! acknowledged as a duplicate instead of enqueuing a second copy. A received
//! message stays invisible to other consumers until it is acked, nacked or
//! its visibility window lapses, after which it is redelivered.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn json<T: Serialize>(key: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self {
            key: key.into(),
            payload: serde_json::to_vec(body)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// A message with the same key is already pending on the topic.
    Duplicate,
}

/// Handle used to settle a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub message_id: Uuid,
    pub lease_id: Uuid,
}

#[derive(Clone, Debug)]
pub struct Delivery {
    pub receipt: DeliveryReceipt,
    pub key: String,
    pub payload: Vec<u8>,
    /// Number of times this message has been handed out, including this one.
    pub attempts: u32,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<PublishOutcome>;

    /// Wait up to `wait` for a message on `topic`.
    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Settle a delivery. Acking a receipt whose lease already lapsed is a
    /// no-op.
    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<()>;

    /// Make a delivery visible again immediately.
    async fn nack(&self, receipt: &DeliveryReceipt) -> Result<()>;

    /// Messages pending on the topic, leased or not.
    async fn depth(&self, topic: &str) -> Result<u64>;
}
