use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify},
    time::Instant,
};
use uuid::Uuid;

use super::queue::{Delivery, DeliveryReceipt, DispatchQueue, OutboundMessage, PublishOutcome};
use crate::error::{ComplianceError, Result};

/// Upper bound on a single wait slice so lapsed leases are noticed promptly.
const LEASE_POLL_SLICE: Duration = Duration::from_millis(50);

struct StoredMessage {
    id: Uuid,
    key: String,
    payload: Vec<u8>,
    attempts: u32,
}

struct LeasedMessage {
    message: StoredMessage,
    lease_id: Uuid,
    visible_at: Instant,
}

#[derive(Default)]
struct TopicState {
    ready: VecDeque<StoredMessage>,
    leased: HashMap<Uuid, LeasedMessage>,
    pending_keys: HashSet<String>,
}

impl TopicState {
    fn reclaim_lapsed(&mut self, now: Instant) {
        let lapsed: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, leased)| leased.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in lapsed {
            if let Some(leased) = self.leased.remove(&id) {
                self.ready.push_back(leased.message);
            }
        }
    }
}

/// In-process dispatch queue with the same delivery semantics as the
/// Postgres queue: key de-duplication, visibility leases and redelivery.
pub struct InProcDispatchQueue {
    topics: AsyncMutex<HashMap<String, TopicState>>,
    notify: Notify,
    visibility_timeout: Duration,
    reject_publishes: AtomicU32,
}

impl fmt::Debug for InProcDispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcDispatchQueue")
            .field("visibility_timeout", &self.visibility_timeout)
            .field("reject_publishes", &self.reject_publishes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for InProcDispatchQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl InProcDispatchQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            topics: AsyncMutex::new(HashMap::new()),
            notify: Notify::new(),
            visibility_timeout,
            reject_publishes: AtomicU32::new(0),
        }
    }

    /// Make the next `count` publishes fail, as a broker outage would.
    pub fn fail_next_publishes(&self, count: u32) {
        self.reject_publishes.store(count, Ordering::SeqCst);
    }

    /// Drain every ready message on `topic` without leasing it.
    pub async fn drain(&self, topic: &str) -> Vec<(String, Vec<u8>)> {
        let mut topics = self.topics.lock().await;
        let Some(state) = topics.get_mut(topic) else {
            return Vec::new();
        };
        let drained: Vec<StoredMessage> = state.ready.drain(..).collect();
        for message in &drained {
            state.pending_keys.remove(&message.key);
        }
        drained
            .into_iter()
            .map(|message| (message.key, message.payload))
            .collect()
    }

    async fn try_take(&self, topic: &str) -> Option<Delivery> {
        let mut topics = self.topics.lock().await;
        let state = topics.get_mut(topic)?;
        let now = Instant::now();
        state.reclaim_lapsed(now);
        let mut message = state.ready.pop_front()?;
        message.attempts += 1;
        let lease_id = Uuid::now_v7();
        let delivery = Delivery {
            receipt: DeliveryReceipt {
                topic: topic.to_string(),
                message_id: message.id,
                lease_id,
            },
            key: message.key.clone(),
            payload: message.payload.clone(),
            attempts: message.attempts,
        };
        state.leased.insert(
            message.id,
            LeasedMessage {
                message,
                lease_id,
                visible_at: now + self.visibility_timeout,
            },
        );
        Some(delivery)
    }

    fn take_rejection(&self) -> bool {
        self.reject_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl DispatchQueue for InProcDispatchQueue {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<PublishOutcome> {
        if self.take_rejection() {
            return Err(ComplianceError::Queue(format!(
                "publish to {topic} rejected"
            )));
        }
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        if !state.pending_keys.insert(message.key.clone()) {
            return Ok(PublishOutcome::Duplicate);
        }
        state.ready.push_back(StoredMessage {
            id: Uuid::now_v7(),
            key: message.key,
            payload: message.payload,
            attempts: 0,
        });
        drop(topics);
        self.notify.notify_waiters();
        Ok(PublishOutcome::Accepted)
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(topic).await {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = deadline.min(now + LEASE_POLL_SLICE);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(slice) => {}
            }
        }
    }

    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let Some(state) = topics.get_mut(&receipt.topic) else {
            return Ok(());
        };
        state.reclaim_lapsed(Instant::now());
        if state
            .leased
            .get(&receipt.message_id)
            .is_some_and(|leased| leased.lease_id == receipt.lease_id)
            && let Some(leased) = state.leased.remove(&receipt.message_id)
        {
            state.pending_keys.remove(&leased.message.key);
        }
        Ok(())
    }

    async fn nack(&self, receipt: &DeliveryReceipt) -> Result<()> {
        let mut topics = self.topics.lock().await;
        if let Some(state) = topics.get_mut(&receipt.topic)
            && state
                .leased
                .get(&receipt.message_id)
                .is_some_and(|leased| leased.lease_id == receipt.lease_id)
            && let Some(leased) = state.leased.remove(&receipt.message_id)
        {
            state.ready.push_front(leased.message);
        }
        drop(topics);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self, topic: &str) -> Result<u64> {
        let topics = self.topics.lock().await;
        Ok(topics
            .get(topic)
            .map(|state| (state.ready.len() + state.leased.len()) as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> OutboundMessage {
        OutboundMessage {
            key: key.into(),
            payload: key.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn pending_keys_are_deduplicated() -> Result<()> {
        let queue = InProcDispatchQueue::default();
        assert_eq!(queue.publish("t", message("job-1-0")).await?, PublishOutcome::Accepted);
        assert_eq!(queue.publish("t", message("job-1-0")).await?, PublishOutcome::Duplicate);
        assert_eq!(queue.publish("t", message("job-1-1")).await?, PublishOutcome::Accepted);
        assert_eq!(queue.depth("t").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_after_visibility_lapses() -> Result<()> {
        let queue = InProcDispatchQueue::new(Duration::from_millis(20));
        queue.publish("t", message("k")).await?;

        let first = queue.receive("t", Duration::from_millis(10)).await?.unwrap();
        assert_eq!(first.attempts, 1);
        assert!(queue.receive("t", Duration::from_millis(5)).await?.is_none());

        let second = queue.receive("t", Duration::from_millis(200)).await?.unwrap();
        assert_eq!(second.key, "k");
        assert_eq!(second.attempts, 2);

        // The first lease lapsed, so acking it must not remove the message.
        queue.ack(&first.receipt).await?;
        assert_eq!(queue.depth("t").await?, 1);
        queue.ack(&second.receipt).await?;
        assert_eq!(queue.depth("t").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn ack_after_lease_lapsed_keeps_the_message() -> Result<()> {
        let queue = InProcDispatchQueue::new(Duration::from_millis(20));
        queue.publish("t", message("k")).await?;
        let late = queue.receive("t", Duration::from_millis(10)).await?.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        queue.ack(&late.receipt).await?;
        assert_eq!(queue.depth("t").await?, 1);

        let again = queue.receive("t", Duration::from_millis(10)).await?.unwrap();
        assert_eq!(again.attempts, 2);
        queue.ack(&again.receipt).await?;
        assert_eq!(queue.depth("t").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn nack_makes_message_visible_again() -> Result<()> {
        let queue = InProcDispatchQueue::default();
        queue.publish("t", message("k")).await?;
        let delivery = queue.receive("t", Duration::from_millis(10)).await?.unwrap();
        queue.nack(&delivery.receipt).await?;
        let again = queue.receive("t", Duration::from_millis(10)).await?.unwrap();
        assert_eq!(again.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() -> Result<()> {
        let queue = std::sync::Arc::new(InProcDispatchQueue::default());
        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.receive("t", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.publish("t", message("k")).await?;
        let delivery = consumer.await.unwrap()?;
        assert_eq!(delivery.map(|d| d.key), Some("k".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn injected_publish_failures_are_consumed() {
        let queue = InProcDispatchQueue::default();
        queue.fail_next_publishes(1);
        assert!(queue.publish("t", message("a")).await.is_err());
        assert!(queue.publish("t", message("a")).await.is_ok());
    }
}
