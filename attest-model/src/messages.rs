//! Envelopes carried by the dispatch queue.
//!
//! Every message carries the attempt (`retry_count`) it belongs to so that a
//! result from a superseded attempt can be told apart from the current one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::QueryDefinition,
    ids::{JobId, RunnerId, SummarizerId},
    runner::Caller,
    status::RunnerStatus,
};

/// Deterministic queue key for one attempt of one unit of work.
pub fn message_key(prefix: &str, id: impl std::fmt::Display, retry_count: u32) -> String {
    format!("{prefix}-{id}-{retry_count}")
}

/// Self-contained execution plan for a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerJob {
    pub runner_id: RunnerId,
    pub retry_count: u32,
    pub parent_job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub query: QueryDefinition,
    pub callers: Vec<Caller>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub provider_connection_id: Option<String>,
}

impl RunnerJob {
    pub fn message_key(&self) -> String {
        message_key("job", self.runner_id, self.retry_count)
    }
}

/// Outcome (or progress) of one runner attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerResult {
    pub runner_id: RunnerId,
    #[serde(default)]
    pub retry_count: u32,
    pub status: RunnerStatus,
    #[serde(default)]
    pub total_finding_count: Option<i64>,
    #[serde(default)]
    pub error_text: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunnerResult {
    pub fn in_progress(runner_id: RunnerId, retry_count: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            runner_id,
            retry_count,
            status: RunnerStatus::InProgress,
            total_finding_count: None,
            error_text: None,
            started_at,
        }
    }

    pub fn succeeded(
        runner_id: RunnerId,
        retry_count: u32,
        started_at: DateTime<Utc>,
        total_finding_count: i64,
    ) -> Self {
        Self {
            runner_id,
            retry_count,
            status: RunnerStatus::Succeeded,
            total_finding_count: Some(total_finding_count),
            error_text: None,
            started_at,
        }
    }

    pub fn failed(
        runner_id: RunnerId,
        retry_count: u32,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            runner_id,
            retry_count,
            status: RunnerStatus::Failed,
            total_finding_count: None,
            error_text: Some(error.into()),
            started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizerJob {
    pub summarizer_id: SummarizerId,
    pub retry_count: u32,
    pub parent_job_id: JobId,
    pub benchmark_id: String,
    pub created_at: DateTime<Utc>,
}

impl SummarizerJob {
    pub fn message_key(&self) -> String {
        message_key("summarizer", self.summarizer_id, self.retry_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizerResult {
    pub summarizer_id: SummarizerId,
    #[serde(default)]
    pub retry_count: u32,
    pub status: RunnerStatus,
    #[serde(default)]
    pub error_text: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SummarizerResult {
    pub fn in_progress(
        summarizer_id: SummarizerId,
        retry_count: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            summarizer_id,
            retry_count,
            status: RunnerStatus::InProgress,
            error_text: None,
            started_at,
        }
    }

    pub fn succeeded(
        summarizer_id: SummarizerId,
        retry_count: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            summarizer_id,
            retry_count,
            status: RunnerStatus::Succeeded,
            error_text: None,
            started_at,
        }
    }

    pub fn failed(
        summarizer_id: SummarizerId,
        retry_count: u32,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            summarizer_id,
            retry_count,
            status: RunnerStatus::Failed,
            error_text: Some(error.into()),
            started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_key_is_stable_per_attempt() {
        let job = RunnerJob {
            runner_id: RunnerId::new(),
            retry_count: 2,
            parent_job_id: JobId::new(),
            created_at: Utc::now(),
            query: QueryDefinition {
                id: "q".into(),
                connector: None,
                query_to_execute: "select 1".into(),
                engine: None,
                global: true,
                list_of_tables: vec![],
            },
            callers: vec![],
            connection_id: None,
            provider_connection_id: None,
        };
        assert_eq!(job.message_key(), format!("job-{}-2", job.runner_id));
        assert_eq!(job.message_key(), job.clone().message_key());
    }

    #[test]
    fn result_without_attempt_defaults_to_first() {
        let id = RunnerId::new();
        let raw = format!(
            r#"{{"runner_id":"{id}","status":"SUCCEEDED","total_finding_count":4,"started_at":"2024-01-01T00:00:00Z"}}"#
        );
        let parsed: RunnerResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.retry_count, 0);
        assert_eq!(parsed.total_finding_count, Some(4));
    }
}
