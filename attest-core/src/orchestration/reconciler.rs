//! Fan-in and job completion.
//!
//! The reconciler never looks at messages. It counts child rows: once no
//! runner of a job is left undone, the job moves to summarization, and once
//! its summarizer is done the job reaches a terminal state.

use std::{fmt, sync::Arc};

use attest_model::{ComplianceJob, JobStatus, RunnerStatus, SummarizerRecord};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    condition::{AlertSink, JobAlert},
    config::OrchestratorConfig,
    metrics::OrchestratorMetrics,
    repository::ComplianceStore,
    summarizer::summarize_runners,
};
use crate::error::Result;

/// Failure details listed in a job's message before truncating.
const MAX_LISTED_FAILURES: usize = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub jobs_advanced: u64,
    pub jobs_summarizing: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub alerts_raised: u64,
}

impl ReconcileReport {
    pub fn is_idle(&self) -> bool {
        self == &ReconcileReport::default()
    }
}

pub struct Reconciler {
    store: Arc<dyn ComplianceStore>,
    config: OrchestratorConfig,
    metrics: Arc<OrchestratorMetrics>,
    alerts: Arc<dyn AlertSink>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("store", &self.store)
            .field("alert_rules", &self.config.alerts.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        config: OrchestratorConfig,
        metrics: Arc<OrchestratorMetrics>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            alerts,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.reconciler.interval();
        loop {
            match self.run_cycle().await {
                Ok(report) if report.is_idle() => {
                    debug!(target: "compliance::reconciler", "reconciler cycle idle")
                }
                Ok(report) => info!(
                    target: "compliance::reconciler",
                    advanced = report.jobs_advanced,
                    summarizing = report.jobs_summarizing,
                    succeeded = report.jobs_succeeded,
                    failed = report.jobs_failed,
                    "reconciler cycle complete"
                ),
                Err(err) => warn!(
                    target: "compliance::reconciler",
                    error = %err,
                    "reconciler cycle aborted; retrying next tick"
                ),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "compliance::reconciler", "reconciler shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    #[instrument(skip(self), target = "compliance::reconciler", level = "debug")]
    pub async fn run_cycle(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            jobs_advanced: self.store.advance_jobs_with_runners().await?,
            ..ReconcileReport::default()
        };
        let retry = &self.config.retry;

        for job in self.store.list_jobs_ready_for_summarization(retry).await? {
            let summarizer = SummarizerRecord::new(job.id);
            if self
                .store
                .begin_summarization(job.id, &summarizer, retry)
                .await?
            {
                report.jobs_summarizing += 1;
                OrchestratorMetrics::incr(&self.metrics.jobs_summarizing);
                debug!(
                    target: "compliance::reconciler",
                    job_id = %job.id,
                    summarizer_id = %summarizer.id,
                    "fan-in complete; summarizer created"
                );
            }
        }

        for job in self.store.list_jobs_ready_to_finish(retry).await? {
            self.finish(&job, &mut report).await?;
        }

        Ok(report)
    }

    async fn finish(&self, job: &ComplianceJob, report: &mut ReconcileReport) -> Result<()> {
        let summarizers = self.store.list_summarizers_for_job(job.id).await?;
        let summarized = summarizers
            .iter()
            .any(|summarizer| summarizer.status == RunnerStatus::Succeeded);
        let total = self.store.sum_runner_findings(job.id).await?;

        let (status, message) = if summarized {
            let runners = self.store.list_runners_for_job(job.id).await?;
            let outcome = summarize_runners(job.id, &job.benchmark_id, &runners, &self.config.retry);
            let message = (!outcome.failures.is_empty()).then(|| {
                let listed: Vec<String> = outcome
                    .failures
                    .iter()
                    .take(MAX_LISTED_FAILURES)
                    .map(ToString::to_string)
                    .collect();
                let mut message = format!(
                    "{} of {} runners did not succeed: {}",
                    outcome.failures.len(),
                    runners.len(),
                    listed.join("; ")
                );
                if outcome.failures.len() > MAX_LISTED_FAILURES {
                    message.push_str("; ...");
                }
                message
            });
            (JobStatus::Succeeded, message)
        } else {
            let reason = summarizers
                .iter()
                .find_map(|summarizer| summarizer.failure_message.clone())
                .unwrap_or_else(|| "summarizer did not complete".to_string());
            (JobStatus::Failed, Some(format!("summarizer failed: {reason}")))
        };

        if !self
            .store
            .finish_job(job.id, status, total, message.clone())
            .await?
        {
            return Ok(());
        }

        info!(
            target: "compliance::reconciler",
            job_id = %job.id,
            benchmark_id = %job.benchmark_id,
            status = %status,
            total_finding_count = total,
            "job finished"
        );

        if status == JobStatus::Succeeded {
            report.jobs_succeeded += 1;
            OrchestratorMetrics::incr(&self.metrics.jobs_succeeded);
            self.evaluate_alerts(job, total, report).await;
        } else {
            report.jobs_failed += 1;
            OrchestratorMetrics::incr(&self.metrics.jobs_failed);
        }
        Ok(())
    }

    /// Alert delivery is best effort and never affects the job.
    async fn evaluate_alerts(&self, job: &ComplianceJob, total: i64, report: &mut ReconcileReport) {
        for rule in &self.config.alerts {
            if !rule.matches(job, total) {
                continue;
            }
            let alert = JobAlert {
                rule: rule.name.clone(),
                job_id: job.id,
                benchmark_id: job.benchmark_id.clone(),
                total_finding_count: total,
                raised_at: Utc::now(),
            };
            match self.alerts.raise(alert).await {
                Ok(()) => {
                    report.alerts_raised += 1;
                    OrchestratorMetrics::incr(&self.metrics.alerts_raised);
                }
                Err(err) => warn!(
                    target: "compliance::reconciler",
                    rule = %rule.name,
                    job_id = %job.id,
                    error = %err,
                    "alert delivery failed"
                ),
            }
        }
    }
}
