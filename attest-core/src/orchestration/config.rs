use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::condition::AlertRule;

/// Upper bound for age thresholds (about a century). Larger values are
/// clamped so `now - threshold` stays representable.
pub const MAX_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn age(secs: u64) -> chrono::TimeDelta {
    i64::try_from(secs.min(MAX_AGE_SECS))
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .unwrap_or(chrono::TimeDelta::zero())
}

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so a deployment only has to supply the values it
/// wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Dispatch cadence and batching.
    pub publisher: PublisherConfig,
    /// Bounded retry policy shared by runners and summarizers.
    pub retry: RetryConfig,
    /// Staleness thresholds used by the timeout sweeps.
    pub timeouts: TimeoutConfig,
    /// Worker concurrency and per-message deadline.
    pub worker: WorkerConfig,
    /// Fan-in cadence.
    pub reconciler: ReconcilerConfig,
    /// Retention sweep for old rows.
    pub retention: RetentionConfig,
    /// Topic names and queue visibility settings.
    pub queue: QueueConfig,
    /// Finding-count alert rules evaluated when a job finishes.
    pub alerts: Vec<AlertRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub interval_ms: u64,
    /// Upper bound on runner batches dispatched per cycle.
    pub max_batches_per_cycle: usize,
    pub batch_size: usize,
    /// Jobs expanded into runner rows per cycle.
    pub max_jobs_expanded_per_cycle: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_batches_per_cycle: 10,
            batch_size: 500,
            max_jobs_expanded_per_cycle: 16,
        }
    }
}

impl PublisherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Execution failures tolerated before a unit is permanently failed.
    pub max_retries: u32,
    /// Publish failures tolerated before a unit is permanently failed. Tracked
    /// separately from execution failures.
    pub max_publish_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_publish_failures: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a unit may sit in `QUEUED` before it is timed out.
    pub queued_secs: u64,
    /// How long a unit may stay `IN_PROGRESS` before it is timed out.
    pub in_progress_secs: u64,
    /// Maximum job age (from creation) before the whole job is timed out.
    pub job_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            queued_secs: 12 * 60 * 60,
            in_progress_secs: 15 * 60,
            job_secs: 24 * 60 * 60,
        }
    }
}

impl TimeoutConfig {
    pub fn queued(&self) -> chrono::Duration {
        age(self.queued_secs)
    }

    pub fn in_progress(&self) -> chrono::Duration {
        age(self.in_progress_secs)
    }

    pub fn job(&self) -> chrono::Duration {
        age(self.job_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Per-message processing deadline.
    pub processing_timeout_ms: u64,
    /// Concurrent executions per worker process.
    pub max_in_flight: usize,
    /// Long-poll wait when the queue is empty.
    pub poll_wait_ms: u64,
    /// Number of runner worker loops per process.
    pub runner_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            processing_timeout_ms: 10_000,
            max_in_flight: 16,
            poll_wait_ms: 1_000,
            runner_workers: 1,
        }
    }
}

impl WorkerConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub interval_ms: u64,
    /// Rows whose `updated_at` is older than this are purged.
    pub max_age_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60 * 60 * 1_000,
            max_age_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_age(&self) -> chrono::Duration {
        age(self.max_age_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub runner_topic: String,
    pub runner_result_topic: String,
    pub summarizer_topic: String,
    pub summarizer_result_topic: String,
    /// A leased message not acked within this window is redelivered.
    pub visibility_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            runner_topic: "compliance-runner-job-queue".into(),
            runner_result_topic: "compliance-runner-job-result".into(),
            summarizer_topic: "compliance-summarizer-job-queue".into(),
            summarizer_result_topic: "compliance-summarizer-job-result".into(),
            visibility_timeout_ms: 60_000,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_ages_are_clamped() {
        let timeouts = TimeoutConfig {
            queued_secs: u64::MAX,
            in_progress_secs: MAX_AGE_SECS + 1,
            job_secs: 60,
        };
        let ceiling = chrono::TimeDelta::seconds(MAX_AGE_SECS as i64);
        assert_eq!(timeouts.queued(), ceiling);
        assert_eq!(timeouts.in_progress(), ceiling);
        assert_eq!(timeouts.job(), chrono::TimeDelta::seconds(60));
        // still subtractable from the current time
        let _ = chrono::Utc::now() - timeouts.queued();

        let retention = RetentionConfig {
            max_age_secs: u64::MAX,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.max_age(), ceiling);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"retry":{"max_retries":5},"worker":{"max_in_flight":2}}"#)
                .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_publish_failures, 5);
        assert_eq!(config.worker.max_in_flight, 2);
        assert_eq!(config.worker.processing_timeout_ms, 10_000);
        assert_eq!(config.publisher.max_batches_per_cycle, 10);
        assert_eq!(config.queue.runner_topic, "compliance-runner-job-queue");
    }
}
