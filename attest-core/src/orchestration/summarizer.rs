//! Summarizer worker: turns the runner rows of a job into its [`JobReport`].

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use attest_model::{
    JobId, JobReport, RunnerFailure, RunnerRecord, RunnerStatus, SummarizerJob, SummarizerResult,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    config::RetryConfig,
    metrics::OrchestratorMetrics,
    queue::{Delivery, DispatchQueue},
    repository::ComplianceStore,
    worker::{MessageHandler, Settlement, publish_result, result_key},
};
use crate::error::{ComplianceError, Result};

/// Aggregate runner outcomes. Runners that are not done yet are neither
/// counted as succeeded nor as failed.
pub fn summarize_runners(
    job_id: JobId,
    benchmark_id: &str,
    runners: &[RunnerRecord],
    retry: &RetryConfig,
) -> JobReport {
    let mut report = JobReport {
        job_id,
        benchmark_id: benchmark_id.to_string(),
        generated_at: Utc::now(),
        total_finding_count: 0,
        succeeded_runners: 0,
        failed_runners: 0,
        timed_out_runners: 0,
        findings_by_connection: BTreeMap::new(),
        failures: Vec::new(),
    };

    for runner in runners {
        let findings = runner.total_finding_count.unwrap_or(0);
        report.total_finding_count += findings;
        let connection = runner.connection_id.as_deref().unwrap_or("global");
        *report
            .findings_by_connection
            .entry(connection.to_string())
            .or_default() += findings;

        match runner.status {
            RunnerStatus::Succeeded => report.succeeded_runners += 1,
            RunnerStatus::TimedOut => {
                report.timed_out_runners += 1;
                report.failures.push(failure_of(runner));
            }
            RunnerStatus::Failed
                if runner.status.is_done(
                    runner.retry_count,
                    runner.publish_failure_count,
                    retry.max_retries,
                    retry.max_publish_failures,
                ) =>
            {
                report.failed_runners += 1;
                report.failures.push(failure_of(runner));
            }
            _ => {}
        }
    }
    report
}

fn failure_of(runner: &RunnerRecord) -> RunnerFailure {
    RunnerFailure {
        runner_id: runner.id,
        query_id: runner.query_id.clone(),
        connection_id: runner.connection_id.clone(),
        status: runner.status,
        retry_count: runner.retry_count,
        message: runner.failure_message.clone(),
    }
}

pub struct SummarizerExecutor {
    store: Arc<dyn ComplianceStore>,
    queue: Arc<dyn DispatchQueue>,
    result_topic: String,
    retry: RetryConfig,
    processing_timeout: Duration,
    metrics: Arc<OrchestratorMetrics>,
}

impl fmt::Debug for SummarizerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummarizerExecutor")
            .field("result_topic", &self.result_topic)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SummarizerExecutor {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        queue: Arc<dyn DispatchQueue>,
        result_topic: impl Into<String>,
        retry: RetryConfig,
        processing_timeout: Duration,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            store,
            queue,
            result_topic: result_topic.into(),
            retry,
            processing_timeout,
            metrics,
        }
    }

    async fn build_report(&self, job: &SummarizerJob) -> Result<JobReport> {
        if self.store.get_job(job.parent_job_id).await?.is_none() {
            return Err(ComplianceError::NotFound(format!("job {}", job.parent_job_id)));
        }
        let runners = self.store.list_runners_for_job(job.parent_job_id).await?;
        let report = summarize_runners(job.parent_job_id, &job.benchmark_id, &runners, &self.retry);
        self.store.store_report(&report).await?;
        Ok(report)
    }

    async fn report(&self, result: &SummarizerResult) -> Settlement {
        let key = result_key(
            "summarizer",
            result.summarizer_id,
            result.retry_count,
            result.status.as_str(),
        );
        publish_result(self.queue.as_ref(), &self.result_topic, key, result).await
    }
}

#[async_trait]
impl MessageHandler for SummarizerExecutor {
    fn name(&self) -> &'static str {
        "summarizer"
    }

    async fn handle(&self, delivery: &Delivery) -> Settlement {
        let started_at = Utc::now();
        let job: SummarizerJob = match delivery.decode() {
            Ok(job) => job,
            Err(err) => {
                OrchestratorMetrics::incr(&self.metrics.worker_failures);
                warn!(
                    target: "compliance::worker",
                    key = %delivery.key,
                    error = %err,
                    "dropping malformed summarizer job"
                );
                return Settlement::Ack;
            }
        };

        let progress = SummarizerResult::in_progress(job.summarizer_id, job.retry_count, started_at);
        if self.report(&progress).await == Settlement::Nack {
            debug!(
                target: "compliance::worker",
                summarizer_id = %job.summarizer_id,
                "progress update not published"
            );
        }

        let result = match tokio::time::timeout(self.processing_timeout, self.build_report(&job))
            .await
        {
            Ok(Ok(report)) => {
                info!(
                    target: "compliance::worker",
                    job_id = %job.parent_job_id,
                    findings = report.total_finding_count,
                    failed = report.failed_runners,
                    timed_out = report.timed_out_runners,
                    "job report stored"
                );
                SummarizerResult::succeeded(job.summarizer_id, job.retry_count, started_at)
            }
            Ok(Err(err)) => {
                OrchestratorMetrics::incr(&self.metrics.worker_failures);
                SummarizerResult::failed(job.summarizer_id, job.retry_count, started_at, err.to_string())
            }
            Err(_) => {
                OrchestratorMetrics::incr(&self.metrics.worker_deadline_exceeded);
                SummarizerResult::failed(
                    job.summarizer_id,
                    job.retry_count,
                    started_at,
                    "summarizer processing deadline exceeded",
                )
            }
        };
        self.report(&result).await
    }
}
