//! Persistence ports for jobs, runners, summarizers and reports.
//!
//! Every mutating operation is conditional on the current state of the row,
//! so concurrent publishers, consumers and reconcilers can apply the same
//! transition without coordinating. The boolean or count returned by each
//! operation tells the caller whether it won.

use std::fmt;

use async_trait::async_trait;
use attest_model::{
    ComplianceJob, JobId, JobReport, JobStatus, RunnerId, RunnerRecord, RunnerResult,
    RunnerStatus, SummarizerId, SummarizerRecord, SummarizerResult,
};
use chrono::{DateTime, Utc};

use super::config::{RetryConfig, TimeoutConfig};
use crate::error::Result;

mod memory;

pub use memory::InMemoryComplianceStore;

/// Narrows [`JobRepository::list_jobs`].
#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub benchmark_id: Option<String>,
    pub limit: Option<usize>,
}

/// What happened when a worker result was applied to its row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The row is already terminal; terminal rows are never overwritten.
    AlreadyTerminal,
    /// The result belongs to an earlier attempt than the row's current one.
    StaleAttempt,
    /// The transition does not apply to the row's current state.
    NotApplicable,
    Unknown,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::AlreadyTerminal => "already_terminal",
            ApplyOutcome::StaleAttempt => "stale_attempt",
            ApplyOutcome::NotApplicable => "not_applicable",
            ApplyOutcome::Unknown => "unknown",
        }
    }
}

/// Shared state machine for applying a worker result to a runner or
/// summarizer row. Returns the outcome and, when applied, the new status.
pub(crate) fn next_status(
    current: RunnerStatus,
    current_attempt: u32,
    reported: RunnerStatus,
    reported_attempt: u32,
) -> std::result::Result<RunnerStatus, ApplyOutcome> {
    if current.is_terminal() {
        return Err(ApplyOutcome::AlreadyTerminal);
    }
    if current_attempt != reported_attempt {
        return Err(ApplyOutcome::StaleAttempt);
    }
    match reported {
        RunnerStatus::InProgress
            if matches!(current, RunnerStatus::Created | RunnerStatus::Queued) =>
        {
            Ok(RunnerStatus::InProgress)
        }
        RunnerStatus::Succeeded | RunnerStatus::Failed | RunnerStatus::TimedOut => Ok(reported),
        _ => Err(ApplyOutcome::NotApplicable),
    }
}

pub(crate) fn timeout_message(status: RunnerStatus) -> String {
    format!("timed out while {}", status.as_str().to_ascii_lowercase())
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job. Duplicate ids or request ids are a conflict.
    async fn create_job(&self, job: &ComplianceJob) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<ComplianceJob>>;

    async fn find_job_by_request_id(&self, request_id: &str) -> Result<Option<ComplianceJob>>;

    /// Newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ComplianceJob>>;

    /// Non-terminal jobs whose runner rows have not been created yet, in
    /// random order.
    async fn list_jobs_with_unqueued_runners(&self, limit: usize) -> Result<Vec<ComplianceJob>>;

    /// `CREATED -> RUNNERS_IN_PROGRESS` for every job with at least one runner.
    async fn advance_jobs_with_runners(&self) -> Result<u64>;

    /// Jobs in a runner phase with all runners created and none left undone.
    /// Manual triggers come first.
    async fn list_jobs_ready_for_summarization(
        &self,
        retry: &RetryConfig,
    ) -> Result<Vec<ComplianceJob>>;

    /// Jobs in `SUMMARIZER_IN_PROGRESS` whose summarizers are all done.
    async fn list_jobs_ready_to_finish(&self, retry: &RetryConfig) -> Result<Vec<ComplianceJob>>;

    /// `SUMMARIZER_IN_PROGRESS -> status` (terminal), recording the total.
    async fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        total_finding_count: i64,
        failure_message: Option<String>,
    ) -> Result<bool>;

    /// Any non-terminal state to `FAILED`.
    async fn fail_job(&self, id: JobId, message: &str) -> Result<bool>;

    /// Non-terminal jobs created before `now - max_age` become `TIMED_OUT`.
    async fn mark_timed_out_jobs(&self, max_age: chrono::Duration) -> Result<u64>;

    async fn purge_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait RunnerRepository: Send + Sync {
    /// Insert every runner of a job and set `are_all_runners_queued` in the
    /// same unit of work. Fails with a conflict if the job was already
    /// expanded.
    async fn insert_runners_for_job(&self, job_id: JobId, runners: &[RunnerRecord]) -> Result<()>;

    async fn get_runner(&self, id: RunnerId) -> Result<Option<RunnerRecord>>;

    async fn list_runners_for_job(&self, job_id: JobId) -> Result<Vec<RunnerRecord>>;

    /// `CREATED` runners in random order so no job starves another.
    async fn list_runners_created(&self, limit: usize) -> Result<Vec<RunnerRecord>>;

    /// Runners of the job that are not done. Fan-in is complete at zero.
    async fn count_not_done_runners_for_job(
        &self,
        job_id: JobId,
        retry: &RetryConfig,
    ) -> Result<u64>;

    /// `CREATED -> QUEUED` for the given attempt.
    async fn mark_runner_queued(&self, id: RunnerId, retry_count: u32) -> Result<bool>;

    /// `CREATED -> FAILED` after the queue rejected the message.
    async fn mark_runner_publish_failed(
        &self,
        id: RunnerId,
        retry_count: u32,
        error: &str,
    ) -> Result<bool>;

    async fn apply_runner_result(&self, result: &RunnerResult) -> Result<ApplyOutcome>;

    /// Stale `QUEUED`/`IN_PROGRESS` runners become `TIMED_OUT`.
    async fn mark_timed_out_runners(&self, timeouts: &TimeoutConfig) -> Result<u64>;

    /// `FAILED` runners with budget left go back to `CREATED`.
    async fn retry_failed_runners(&self, retry: &RetryConfig) -> Result<u64>;

    /// `sum(coalesce(total_finding_count, 0))` over the job's runners.
    async fn sum_runner_findings(&self, job_id: JobId) -> Result<i64>;

    async fn purge_runners_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SummarizerRepository: Send + Sync {
    /// Move a fan-in complete job to `SUMMARIZER_IN_PROGRESS` and insert its
    /// summarizer. Returns false if another reconciler got there first or the
    /// job is no longer ready.
    async fn begin_summarization(
        &self,
        job_id: JobId,
        summarizer: &SummarizerRecord,
        retry: &RetryConfig,
    ) -> Result<bool>;

    async fn get_summarizer(&self, id: SummarizerId) -> Result<Option<SummarizerRecord>>;

    async fn list_summarizers_for_job(&self, job_id: JobId) -> Result<Vec<SummarizerRecord>>;

    async fn list_summarizers_created(&self, limit: usize) -> Result<Vec<SummarizerRecord>>;

    async fn mark_summarizer_queued(&self, id: SummarizerId, retry_count: u32) -> Result<bool>;

    async fn mark_summarizer_publish_failed(
        &self,
        id: SummarizerId,
        retry_count: u32,
        error: &str,
    ) -> Result<bool>;

    async fn apply_summarizer_result(&self, result: &SummarizerResult) -> Result<ApplyOutcome>;

    async fn mark_timed_out_summarizers(&self, timeouts: &TimeoutConfig) -> Result<u64>;

    async fn retry_failed_summarizers(&self, retry: &RetryConfig) -> Result<u64>;

    async fn purge_summarizers_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Destination of the per-job report produced by the summarizer.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Insert or replace the report of a job.
    async fn store_report(&self, report: &JobReport) -> Result<()>;

    async fn get_report(&self, job_id: JobId) -> Result<Option<JobReport>>;

    async fn purge_reports_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Everything the orchestrator needs from its store.
pub trait ComplianceStore:
    JobRepository + RunnerRepository + SummarizerRepository + ReportStore + fmt::Debug
{
}

impl<T> ComplianceStore for T where
    T: JobRepository + RunnerRepository + SummarizerRepository + ReportStore + fmt::Debug
{
}
