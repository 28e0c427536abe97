//! Dispatch queue backed by the `dispatch_messages` table.
//!
//! Consumers lease rows with `FOR UPDATE SKIP LOCKED`, so any number of
//! workers can poll the same topic without handing out a message twice
//! while its lease is live.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::queue::{Delivery, DeliveryReceipt, DispatchQueue, OutboundMessage, PublishOutcome};
use crate::error::Result;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(FromRow)]
struct LeasedRow {
    id: Uuid,
    message_key: String,
    payload: Vec<u8>,
    attempts: i32,
}

#[derive(Clone)]
pub struct PostgresDispatchQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl fmt::Debug for PostgresDispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDispatchQueue")
            .field("visibility_timeout", &self.visibility_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl PostgresDispatchQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_lease(&self, topic: &str) -> Result<Option<Delivery>> {
        let lease_id = Uuid::now_v7();
        let visibility_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let row: Option<LeasedRow> = sqlx::query_as(
            "UPDATE dispatch_messages \
             SET lease_id = $2, \
                 attempts = attempts + 1, \
                 visible_at = NOW() + ($3 * INTERVAL '1 millisecond') \
             WHERE id = ( \
                 SELECT id FROM dispatch_messages \
                 WHERE topic = $1 AND visible_at <= NOW() \
                 ORDER BY visible_at, created_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING id, message_key, payload, attempts",
        )
        .bind(topic)
        .bind(lease_id)
        .bind(visibility_ms as f64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Delivery {
            receipt: DeliveryReceipt {
                topic: topic.to_string(),
                message_id: row.id,
                lease_id,
            },
            key: row.message_key,
            payload: row.payload,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl DispatchQueue for PostgresDispatchQueue {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<PublishOutcome> {
        let result = sqlx::query(
            "INSERT INTO dispatch_messages (id, topic, message_key, payload) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (topic, message_key) DO NOTHING",
        )
        .bind(Uuid::now_v7())
        .bind(topic)
        .bind(&message.key)
        .bind(&message.payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(target: "compliance::queue", topic, key = %message.key, "duplicate message ignored");
            return Ok(PublishOutcome::Duplicate);
        }
        Ok(PublishOutcome::Accepted)
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_lease(topic).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<()> {
        sqlx::query(
            "DELETE FROM dispatch_messages \
             WHERE id = $1 AND lease_id = $2 AND visible_at > NOW()",
        )
        .bind(receipt.message_id)
        .bind(receipt.lease_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn nack(&self, receipt: &DeliveryReceipt) -> Result<()> {
        sqlx::query(
            "UPDATE dispatch_messages SET visible_at = NOW(), lease_id = NULL \
             WHERE id = $1 AND lease_id = $2",
        )
        .bind(receipt.message_id)
        .bind(receipt.lease_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn depth(&self, topic: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_messages WHERE topic = $1")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
