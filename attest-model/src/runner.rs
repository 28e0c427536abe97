use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::Severity,
    ids::{JobId, RunnerId, SummarizerId},
    status::RunnerStatus,
};

/// One benchmark path through which a query was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub root_benchmark: String,
    /// Benchmarks between the root and the policy, root first.
    pub parent_benchmark_ids: Vec<String>,
    pub policy_id: String,
    #[serde(default)]
    pub severity: Severity,
}

/// Execution of one query against one connection (or globally).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub id: RunnerId,
    pub parent_job_id: JobId,
    pub query_id: String,
    pub connection_id: Option<String>,
    pub callers: Vec<Caller>,
    pub status: RunnerStatus,
    pub retry_count: u32,
    pub publish_failure_count: u32,
    pub total_finding_count: Option<i64>,
    pub failure_message: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunnerRecord {
    pub fn new(
        parent_job_id: JobId,
        query_id: impl Into<String>,
        connection_id: Option<String>,
        callers: Vec<Caller>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunnerId::new(),
            parent_job_id,
            query_id: query_id.into(),
            connection_id,
            callers,
            status: RunnerStatus::Created,
            retry_count: 0,
            publish_failure_count: 0,
            total_finding_count: None,
            failure_message: None,
            queued_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Summarization unit of a job. Shares the runner status vocabulary and
/// retry/timeout rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizerRecord {
    pub id: SummarizerId,
    pub parent_job_id: JobId,
    pub status: RunnerStatus,
    pub retry_count: u32,
    pub publish_failure_count: u32,
    pub failure_message: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SummarizerRecord {
    pub fn new(parent_job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            id: SummarizerId::new(),
            parent_job_id,
            status: RunnerStatus::Created,
            retry_count: 0,
            publish_failure_count: 0,
            failure_message: None,
            queued_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
