//! Side-channel counters.
//!
//! Components bump these as they work; nothing in the orchestrator reads them
//! back to make a decision. Exporters take a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        /// Process-wide orchestration counters.
        #[derive(Debug, Default)]
        pub struct OrchestratorMetrics {
            $(pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of [`OrchestratorMetrics`].
        #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct MetricsSnapshot {
            pub taken_at: Option<DateTime<Utc>>,
            $(pub $field: u64,)*
        }

        impl OrchestratorMetrics {
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    taken_at: Some(Utc::now()),
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    jobs_created,
    jobs_expanded,
    jobs_summarizing,
    jobs_succeeded,
    jobs_failed,
    jobs_timed_out,
    runners_created,
    runners_published,
    runners_publish_failed,
    runners_unresolved,
    runners_timed_out,
    runners_retried,
    summarizers_published,
    summarizers_publish_failed,
    summarizers_timed_out,
    summarizers_retried,
    results_applied,
    results_ignored,
    results_malformed,
    worker_executions,
    worker_failures,
    worker_deadline_exceeded,
    findings_ingested,
    alerts_raised,
    rows_purged,
);

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}
