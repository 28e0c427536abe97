//! In-process store used by tests and single-node runs.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use attest_model::{
    ComplianceJob, JobId, JobReport, JobStatus, RunnerId, RunnerRecord, RunnerResult,
    RunnerStatus, SummarizerId, SummarizerRecord, SummarizerResult, TriggerType,
};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::Mutex as AsyncMutex;

use super::{
    ApplyOutcome, JobFilter, JobRepository, ReportStore, RunnerRepository, SummarizerRepository,
    next_status, timeout_message,
};
use crate::{
    error::{ComplianceError, Result},
    orchestration::config::{RetryConfig, TimeoutConfig},
};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, ComplianceJob>,
    runners: HashMap<RunnerId, RunnerRecord>,
    summarizers: HashMap<SummarizerId, SummarizerRecord>,
    reports: HashMap<JobId, (JobReport, DateTime<Utc>)>,
}

impl MemoryState {
    fn not_done_runners(&self, job_id: JobId, retry: &RetryConfig) -> u64 {
        self.runners
            .values()
            .filter(|runner| runner.parent_job_id == job_id)
            .filter(|runner| !runner_done(runner, retry))
            .count() as u64
    }

    fn fan_in_complete(&self, job: &ComplianceJob, retry: &RetryConfig) -> bool {
        matches!(
            job.status,
            JobStatus::RunnersInProgress | JobStatus::SinkInProgress
        ) && job.are_all_runners_queued
            && self.not_done_runners(job.id, retry) == 0
    }
}

fn runner_done(runner: &RunnerRecord, retry: &RetryConfig) -> bool {
    runner.status.is_done(
        runner.retry_count,
        runner.publish_failure_count,
        retry.max_retries,
        retry.max_publish_failures,
    )
}

fn summarizer_done(summarizer: &SummarizerRecord, retry: &RetryConfig) -> bool {
    summarizer.status.is_done(
        summarizer.retry_count,
        summarizer.publish_failure_count,
        retry.max_retries,
        retry.max_publish_failures,
    )
}

fn sort_manual_first(jobs: &mut [ComplianceJob]) {
    jobs.sort_by_key(|job| (job.trigger_type != TriggerType::Manual, job.created_at));
}

fn is_stale(status: RunnerStatus, updated_at: DateTime<Utc>, timeouts: &TimeoutConfig) -> bool {
    let now = Utc::now();
    match status {
        RunnerStatus::Queued => updated_at < now - timeouts.queued(),
        RunnerStatus::InProgress => updated_at < now - timeouts.in_progress(),
        _ => false,
    }
}

fn shuffled<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    items.shuffle(&mut rand::rng());
    items.truncate(limit);
    items
}

/// Store backed by process memory. Behaves like the Postgres store, including
/// conditional transitions and randomized listing.
#[derive(Default)]
pub struct InMemoryComplianceStore {
    state: AsyncMutex<MemoryState>,
}

impl fmt::Debug for InMemoryComplianceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Ok(state) => f
                .debug_struct("InMemoryComplianceStore")
                .field("jobs", &state.jobs.len())
                .field("runners", &state.runners.len())
                .field("summarizers", &state.summarizers.len())
                .finish(),
            Err(_) => f
                .debug_struct("InMemoryComplianceStore")
                .field("state", &"<locked>")
                .finish(),
        }
    }
}

impl InMemoryComplianceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift a job and all of its child rows back in time, as if they had
    /// been idle for `by`.
    pub async fn backdate_job(&self, job_id: JobId, by: chrono::Duration) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.created_at -= by;
            job.updated_at -= by;
        }
        for runner in state.runners.values_mut() {
            if runner.parent_job_id == job_id {
                runner.created_at -= by;
                runner.updated_at -= by;
            }
        }
        for summarizer in state.summarizers.values_mut() {
            if summarizer.parent_job_id == job_id {
                summarizer.created_at -= by;
                summarizer.updated_at -= by;
            }
        }
        if let Some((_, stored_at)) = state.reports.get_mut(&job_id) {
            *stored_at -= by;
        }
    }

    /// Shift a single runner back in time.
    pub async fn backdate_runner(&self, runner_id: RunnerId, by: chrono::Duration) {
        let mut state = self.state.lock().await;
        if let Some(runner) = state.runners.get_mut(&runner_id) {
            runner.updated_at -= by;
        }
    }
}

#[async_trait]
impl JobRepository for InMemoryComplianceStore {
    async fn create_job(&self, job: &ComplianceJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(ComplianceError::Conflict(format!("job {} already exists", job.id)));
        }
        if let Some(request_id) = job.external_request_id.as_deref()
            && state
                .jobs
                .values()
                .any(|existing| existing.external_request_id.as_deref() == Some(request_id))
        {
            return Err(ComplianceError::Conflict(format!(
                "request id {request_id} already used"
            )));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ComplianceJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn find_job_by_request_id(&self, request_id: &str) -> Result<Option<ComplianceJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .find(|job| job.external_request_id.as_deref() == Some(request_id))
            .cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ComplianceJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ComplianceJob> = state
            .jobs
            .values()
            .filter(|job| filter.status.is_none_or(|status| job.status == status))
            .filter(|job| {
                filter
                    .benchmark_id
                    .as_deref()
                    .is_none_or(|benchmark| job.benchmark_id == benchmark)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn list_jobs_with_unqueued_runners(&self, limit: usize) -> Result<Vec<ComplianceJob>> {
        let state = self.state.lock().await;
        let jobs: Vec<ComplianceJob> = state
            .jobs
            .values()
            .filter(|job| !job.are_all_runners_queued)
            .filter(|job| {
                matches!(
                    job.status,
                    JobStatus::Created | JobStatus::RunnersInProgress
                )
            })
            .cloned()
            .collect();
        Ok(shuffled(jobs, limit))
    }

    async fn advance_jobs_with_runners(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let parents: std::collections::HashSet<JobId> =
            state.runners.values().map(|runner| runner.parent_job_id).collect();
        let now = Utc::now();
        let mut advanced = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Created && parents.contains(&job.id) {
                job.status = JobStatus::RunnersInProgress;
                job.updated_at = now;
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    async fn list_jobs_ready_for_summarization(
        &self,
        retry: &RetryConfig,
    ) -> Result<Vec<ComplianceJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ComplianceJob> = state
            .jobs
            .values()
            .filter(|job| state.fan_in_complete(job, retry))
            .cloned()
            .collect();
        sort_manual_first(&mut jobs);
        Ok(jobs)
    }

    async fn list_jobs_ready_to_finish(&self, retry: &RetryConfig) -> Result<Vec<ComplianceJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ComplianceJob> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::SummarizerInProgress)
            .filter(|job| {
                let mut summarizers = state
                    .summarizers
                    .values()
                    .filter(|summarizer| summarizer.parent_job_id == job.id)
                    .peekable();
                summarizers.peek().is_some()
                    && summarizers.all(|summarizer| summarizer_done(summarizer, retry))
            })
            .cloned()
            .collect();
        sort_manual_first(&mut jobs);
        Ok(jobs)
    }

    async fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        total_finding_count: i64,
        failure_message: Option<String>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(ComplianceError::InvalidInput(format!(
                "{status} is not a terminal job status"
            )));
        }
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::SummarizerInProgress => {
                job.status = status;
                job.total_finding_count = Some(total_finding_count);
                job.failure_message = failure_message;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(&self, id: JobId, message: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Failed;
                job.failure_message = Some(message.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_timed_out_jobs(&self, max_age: chrono::Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - max_age;
        let mut timed_out = 0;
        for job in state.jobs.values_mut() {
            if !job.status.is_terminal() && job.created_at < cutoff {
                job.status = JobStatus::TimedOut;
                job.failure_message = Some("Job timed out".into());
                job.updated_at = now;
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    async fn purge_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| job.updated_at >= cutoff);
        Ok((before - state.jobs.len()) as u64)
    }
}

#[async_trait]
impl RunnerRepository for InMemoryComplianceStore {
    async fn insert_runners_for_job(&self, job_id: JobId, runners: &[RunnerRecord]) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get(&job_id) else {
            return Err(ComplianceError::NotFound(format!("job {job_id}")));
        };
        if job.are_all_runners_queued {
            return Err(ComplianceError::Conflict(format!(
                "runners for job {job_id} already created"
            )));
        }
        if let Some(duplicate) = runners.iter().find(|r| state.runners.contains_key(&r.id)) {
            return Err(ComplianceError::Conflict(format!(
                "runner {} already exists",
                duplicate.id
            )));
        }
        for runner in runners {
            state.runners.insert(runner.id, runner.clone());
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.are_all_runners_queued = true;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_runner(&self, id: RunnerId) -> Result<Option<RunnerRecord>> {
        Ok(self.state.lock().await.runners.get(&id).cloned())
    }

    async fn list_runners_for_job(&self, job_id: JobId) -> Result<Vec<RunnerRecord>> {
        let state = self.state.lock().await;
        let mut runners: Vec<RunnerRecord> = state
            .runners
            .values()
            .filter(|runner| runner.parent_job_id == job_id)
            .cloned()
            .collect();
        runners.sort_by_key(|runner| runner.id);
        Ok(runners)
    }

    async fn list_runners_created(&self, limit: usize) -> Result<Vec<RunnerRecord>> {
        let state = self.state.lock().await;
        let runners = state
            .runners
            .values()
            .filter(|runner| runner.status == RunnerStatus::Created)
            .cloned()
            .collect();
        Ok(shuffled(runners, limit))
    }

    async fn count_not_done_runners_for_job(
        &self,
        job_id: JobId,
        retry: &RetryConfig,
    ) -> Result<u64> {
        Ok(self.state.lock().await.not_done_runners(job_id, retry))
    }

    async fn mark_runner_queued(&self, id: RunnerId, retry_count: u32) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runners.get_mut(&id) {
            Some(runner)
                if runner.status == RunnerStatus::Created && runner.retry_count == retry_count =>
            {
                let now = Utc::now();
                runner.status = RunnerStatus::Queued;
                runner.queued_at = Some(now);
                runner.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_runner_publish_failed(
        &self,
        id: RunnerId,
        retry_count: u32,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runners.get_mut(&id) {
            Some(runner)
                if runner.status == RunnerStatus::Created && runner.retry_count == retry_count =>
            {
                runner.status = RunnerStatus::Failed;
                runner.publish_failure_count += 1;
                runner.failure_message = Some(error.to_string());
                runner.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_runner_result(&self, result: &RunnerResult) -> Result<ApplyOutcome> {
        let mut state = self.state.lock().await;
        let Some(runner) = state.runners.get_mut(&result.runner_id) else {
            return Ok(ApplyOutcome::Unknown);
        };
        let next = match next_status(
            runner.status,
            runner.retry_count,
            result.status,
            result.retry_count,
        ) {
            Ok(next) => next,
            Err(outcome) => return Ok(outcome),
        };
        runner.status = next;
        runner.started_at.get_or_insert(result.started_at);
        runner.updated_at = Utc::now();
        match next {
            RunnerStatus::Succeeded => {
                runner.total_finding_count = result.total_finding_count;
                runner.failure_message = None;
            }
            RunnerStatus::Failed => {
                runner.retry_count += 1;
                runner.failure_message = result.error_text.clone();
            }
            RunnerStatus::TimedOut => {
                runner.failure_message = result.error_text.clone();
            }
            _ => {}
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn mark_timed_out_runners(&self, timeouts: &TimeoutConfig) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut timed_out = 0;
        for runner in state.runners.values_mut() {
            if is_stale(runner.status, runner.updated_at, timeouts) {
                runner.failure_message = Some(timeout_message(runner.status));
                runner.status = RunnerStatus::TimedOut;
                runner.updated_at = now;
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    async fn retry_failed_runners(&self, retry: &RetryConfig) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut retried = 0;
        for runner in state.runners.values_mut() {
            if runner.status == RunnerStatus::Failed && !runner_done(runner, retry) {
                runner.status = RunnerStatus::Created;
                runner.updated_at = now;
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn sum_runner_findings(&self, job_id: JobId) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .runners
            .values()
            .filter(|runner| runner.parent_job_id == job_id)
            .map(|runner| runner.total_finding_count.unwrap_or(0))
            .sum())
    }

    async fn purge_runners_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.runners.len();
        state.runners.retain(|_, runner| runner.updated_at >= cutoff);
        Ok((before - state.runners.len()) as u64)
    }
}

#[async_trait]
impl SummarizerRepository for InMemoryComplianceStore {
    async fn begin_summarization(
        &self,
        job_id: JobId,
        summarizer: &SummarizerRecord,
        retry: &RetryConfig,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let ready = state
            .jobs
            .get(&job_id)
            .is_some_and(|job| state.fan_in_complete(job, retry));
        if !ready {
            return Ok(false);
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = JobStatus::SummarizerInProgress;
            job.updated_at = Utc::now();
        }
        state.summarizers.insert(summarizer.id, summarizer.clone());
        Ok(true)
    }

    async fn get_summarizer(&self, id: SummarizerId) -> Result<Option<SummarizerRecord>> {
        Ok(self.state.lock().await.summarizers.get(&id).cloned())
    }

    async fn list_summarizers_for_job(&self, job_id: JobId) -> Result<Vec<SummarizerRecord>> {
        let state = self.state.lock().await;
        let mut summarizers: Vec<SummarizerRecord> = state
            .summarizers
            .values()
            .filter(|summarizer| summarizer.parent_job_id == job_id)
            .cloned()
            .collect();
        summarizers.sort_by_key(|summarizer| summarizer.id);
        Ok(summarizers)
    }

    async fn list_summarizers_created(&self, limit: usize) -> Result<Vec<SummarizerRecord>> {
        let state = self.state.lock().await;
        let summarizers = state
            .summarizers
            .values()
            .filter(|summarizer| summarizer.status == RunnerStatus::Created)
            .cloned()
            .collect();
        Ok(shuffled(summarizers, limit))
    }

    async fn mark_summarizer_queued(&self, id: SummarizerId, retry_count: u32) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.summarizers.get_mut(&id) {
            Some(summarizer)
                if summarizer.status == RunnerStatus::Created
                    && summarizer.retry_count == retry_count =>
            {
                let now = Utc::now();
                summarizer.status = RunnerStatus::Queued;
                summarizer.queued_at = Some(now);
                summarizer.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_summarizer_publish_failed(
        &self,
        id: SummarizerId,
        retry_count: u32,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.summarizers.get_mut(&id) {
            Some(summarizer)
                if summarizer.status == RunnerStatus::Created
                    && summarizer.retry_count == retry_count =>
            {
                summarizer.status = RunnerStatus::Failed;
                summarizer.publish_failure_count += 1;
                summarizer.failure_message = Some(error.to_string());
                summarizer.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_summarizer_result(&self, result: &SummarizerResult) -> Result<ApplyOutcome> {
        let mut state = self.state.lock().await;
        let Some(summarizer) = state.summarizers.get_mut(&result.summarizer_id) else {
            return Ok(ApplyOutcome::Unknown);
        };
        let next = match next_status(
            summarizer.status,
            summarizer.retry_count,
            result.status,
            result.retry_count,
        ) {
            Ok(next) => next,
            Err(outcome) => return Ok(outcome),
        };
        summarizer.status = next;
        summarizer.started_at.get_or_insert(result.started_at);
        summarizer.updated_at = Utc::now();
        match next {
            RunnerStatus::Succeeded => summarizer.failure_message = None,
            RunnerStatus::Failed => {
                summarizer.retry_count += 1;
                summarizer.failure_message = result.error_text.clone();
            }
            RunnerStatus::TimedOut => summarizer.failure_message = result.error_text.clone(),
            _ => {}
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn mark_timed_out_summarizers(&self, timeouts: &TimeoutConfig) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut timed_out = 0;
        for summarizer in state.summarizers.values_mut() {
            if is_stale(summarizer.status, summarizer.updated_at, timeouts) {
                summarizer.failure_message = Some(timeout_message(summarizer.status));
                summarizer.status = RunnerStatus::TimedOut;
                summarizer.updated_at = now;
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    async fn retry_failed_summarizers(&self, retry: &RetryConfig) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut retried = 0;
        for summarizer in state.summarizers.values_mut() {
            if summarizer.status == RunnerStatus::Failed && !summarizer_done(summarizer, retry) {
                summarizer.status = RunnerStatus::Created;
                summarizer.updated_at = now;
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn purge_summarizers_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.summarizers.len();
        state
            .summarizers
            .retain(|_, summarizer| summarizer.updated_at >= cutoff);
        Ok((before - state.summarizers.len()) as u64)
    }
}

#[async_trait]
impl ReportStore for InMemoryComplianceStore {
    async fn store_report(&self, report: &JobReport) -> Result<()> {
        let mut state = self.state.lock().await;
        state.reports.insert(report.job_id, (report.clone(), Utc::now()));
        Ok(())
    }

    async fn get_report(&self, job_id: JobId) -> Result<Option<JobReport>> {
        let state = self.state.lock().await;
        Ok(state.reports.get(&job_id).map(|(report, _)| report.clone()))
    }

    async fn purge_reports_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.reports.len();
        state.reports.retain(|_, (_, stored_at)| *stored_at >= cutoff);
        Ok((before - state.reports.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_model::JobScope;

    fn job() -> ComplianceJob {
        ComplianceJob::new("bench", JobScope::default(), TriggerType::Manual, None)
    }

    async fn seeded(runner_count: usize) -> (InMemoryComplianceStore, JobId, Vec<RunnerId>) {
        let store = InMemoryComplianceStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();
        let runners: Vec<RunnerRecord> = (0..runner_count)
            .map(|i| RunnerRecord::new(job.id, format!("q{i}"), Some("c1".into()), vec![]))
            .collect();
        let ids = runners.iter().map(|r| r.id).collect();
        store.insert_runners_for_job(job.id, &runners).await.unwrap();
        (store, job.id, ids)
    }

    #[tokio::test]
    async fn expanding_twice_is_a_conflict() {
        let (store, job_id, _) = seeded(1).await;
        let again = vec![RunnerRecord::new(job_id, "q", None, vec![])];
        let err = store.insert_runners_for_job(job_id, &again).await.unwrap_err();
        assert!(matches!(err, ComplianceError::Conflict(_)));
    }

    #[tokio::test]
    async fn queued_mark_requires_matching_attempt() {
        let (store, _, ids) = seeded(1).await;
        assert!(!store.mark_runner_queued(ids[0], 1).await.unwrap());
        assert!(store.mark_runner_queued(ids[0], 0).await.unwrap());
        assert!(!store.mark_runner_queued(ids[0], 0).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_rows_are_never_overwritten() {
        let (store, _, ids) = seeded(1).await;
        store.mark_runner_queued(ids[0], 0).await.unwrap();
        let done = RunnerResult::succeeded(ids[0], 0, Utc::now(), 7);
        assert_eq!(store.apply_runner_result(&done).await.unwrap(), ApplyOutcome::Applied);
        let late = RunnerResult::failed(ids[0], 0, Utc::now(), "boom");
        assert_eq!(
            store.apply_runner_result(&late).await.unwrap(),
            ApplyOutcome::AlreadyTerminal
        );
        let runner = store.get_runner(ids[0]).await.unwrap().unwrap();
        assert_eq!(runner.status, RunnerStatus::Succeeded);
        assert_eq!(runner.total_finding_count, Some(7));
        assert_eq!(runner.retry_count, 0);
    }

    #[tokio::test]
    async fn stale_queued_runners_time_out() {
        let (store, _, ids) = seeded(2).await;
        store.mark_runner_queued(ids[0], 0).await.unwrap();
        store.mark_runner_queued(ids[1], 0).await.unwrap();
        store.backdate_runner(ids[0], chrono::Duration::hours(13)).await;

        let timed_out = store.mark_timed_out_runners(&TimeoutConfig::default()).await.unwrap();
        assert_eq!(timed_out, 1);
        let again = store.mark_timed_out_runners(&TimeoutConfig::default()).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(
            store.get_runner(ids[1]).await.unwrap().unwrap().status,
            RunnerStatus::Queued
        );
    }

    #[tokio::test]
    async fn success_after_in_progress_timeout_is_discarded() {
        let (store, job_id, ids) = seeded(1).await;
        let started = Utc::now();
        store.mark_runner_queued(ids[0], 0).await.unwrap();
        let progress = RunnerResult::in_progress(ids[0], 0, started);
        assert_eq!(
            store.apply_runner_result(&progress).await.unwrap(),
            ApplyOutcome::Applied
        );
        store.backdate_runner(ids[0], chrono::Duration::minutes(16)).await;

        assert_eq!(
            store.mark_timed_out_runners(&TimeoutConfig::default()).await.unwrap(),
            1
        );
        let late = RunnerResult::succeeded(ids[0], 0, started, 9);
        assert_eq!(
            store.apply_runner_result(&late).await.unwrap(),
            ApplyOutcome::AlreadyTerminal
        );

        let runner = store.get_runner(ids[0]).await.unwrap().unwrap();
        assert_eq!(runner.status, RunnerStatus::TimedOut);
        assert_eq!(runner.total_finding_count, None);
        assert_eq!(
            runner.failure_message.as_deref(),
            Some("timed out while in_progress")
        );
        assert_eq!(store.sum_runner_findings(job_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_only_touches_old_rows() {
        let (store, job_id, _) = seeded(2).await;
        let other = job();
        store.create_job(&other).await.unwrap();
        store.backdate_job(job_id, chrono::Duration::days(40)).await;

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.purge_runners_older_than(cutoff).await.unwrap(), 2);
        assert_eq!(store.purge_jobs_older_than(cutoff).await.unwrap(), 1);
        assert!(store.get_job(other.id).await.unwrap().is_some());
    }
}
