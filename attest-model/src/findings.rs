//! Query output, findings and the per-job report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    catalog::Severity,
    ids::{JobId, RunnerId},
    status::RunnerStatus,
};

/// Tabular result returned by the execution engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryOutput {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    /// Look up `column` in `row`, matching headers case-insensitively.
    pub fn cell<'a>(&self, row: &'a [Value], column: &str) -> Option<&'a Value> {
        let index = self
            .headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case(column))?;
        row.get(index)
    }

    /// String form of a cell; non-string scalars are rendered as JSON.
    pub fn text(&self, row: &[Value], column: &str) -> Option<String> {
        match self.cell(row, column)? {
            Value::Null => None,
            Value::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceResult {
    Ok,
    Alarm,
    Info,
    Skip,
    Error,
}

impl ComplianceResult {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ok" | "passed" => ComplianceResult::Ok,
            "alarm" | "failed" => ComplianceResult::Alarm,
            "skip" => ComplianceResult::Skip,
            "error" => ComplianceResult::Error,
            _ => ComplianceResult::Info,
        }
    }
}

/// One evaluated resource for one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub job_id: JobId,
    pub runner_id: RunnerId,
    pub query_id: String,
    pub connection_id: Option<String>,
    pub benchmark_id: String,
    pub parent_benchmark_ids: Vec<String>,
    pub policy_id: String,
    pub severity: Severity,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub resource_type: Option<String>,
    pub resource_location: Option<String>,
    pub reason: Option<String>,
    pub status: ComplianceResult,
    pub evaluated_at: DateTime<Utc>,
}

/// Failure detail for a runner that will not run again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerFailure {
    pub runner_id: RunnerId,
    pub query_id: String,
    pub connection_id: Option<String>,
    pub status: RunnerStatus,
    pub retry_count: u32,
    pub message: Option<String>,
}

impl std::fmt::Display for RunnerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "runner {} (query {}, connection {}) {} after {} attempt(s)",
            self.runner_id,
            self.query_id,
            self.connection_id.as_deref().unwrap_or("global"),
            self.status,
            self.retry_count,
        )?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Final report produced by the summarizer for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub benchmark_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_finding_count: i64,
    pub succeeded_runners: u64,
    pub failed_runners: u64,
    pub timed_out_runners: u64,
    pub findings_by_connection: BTreeMap<String, i64>,
    pub failures: Vec<RunnerFailure>,
}
