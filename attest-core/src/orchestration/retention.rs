//! Background retention sweep.
//!
//! Periodically deletes jobs, runners, summarizers and reports that have not
//! been touched within the retention window. Child rows go first so a job is
//! never removed while rows still point at it.

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{config::RetentionConfig, metrics::OrchestratorMetrics, repository::ComplianceStore};
use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub reports: u64,
    pub summarizers: u64,
    pub runners: u64,
    pub jobs: u64,
}

impl RetentionReport {
    pub fn total(&self) -> u64 {
        self.reports + self.summarizers + self.runners + self.jobs
    }
}

pub struct RetentionSweeper {
    store: Arc<dyn ComplianceStore>,
    config: RetentionConfig,
    metrics: Arc<OrchestratorMetrics>,
}

impl fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        config: RetentionConfig,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval: Duration = self.config.interval();
        info!(
            target: "compliance::retention",
            interval_ms = interval.as_millis(),
            max_age_secs = self.config.max_age_secs,
            "retention sweep started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "compliance::retention", "retention sweep shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.sweep().await {
                        error!(target: "compliance::retention", error = %err, "retention sweep failed");
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<RetentionReport> {
        let cutoff = Utc::now() - self.config.max_age();
        let report = RetentionReport {
            reports: self.store.purge_reports_older_than(cutoff).await?,
            summarizers: self.store.purge_summarizers_older_than(cutoff).await?,
            runners: self.store.purge_runners_older_than(cutoff).await?,
            jobs: self.store.purge_jobs_older_than(cutoff).await?,
        };

        OrchestratorMetrics::add(&self.metrics.rows_purged, report.total());
        if report.total() > 0 {
            info!(
                target: "compliance::retention",
                jobs = report.jobs,
                runners = report.runners,
                summarizers = report.summarizers,
                reports = report.reports,
                "retention sweep deleted old rows"
            );
        } else {
            debug!(target: "compliance::retention", %cutoff, "nothing to purge");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::repository::{
        InMemoryComplianceStore, JobRepository, ReportStore, RunnerRepository,
    };
    use attest_model::{ComplianceJob, JobReport, JobScope, RunnerRecord, TriggerType};
    use std::collections::BTreeMap;

    fn report_for(job: &ComplianceJob) -> JobReport {
        JobReport {
            job_id: job.id,
            benchmark_id: job.benchmark_id.clone(),
            generated_at: Utc::now(),
            total_finding_count: 0,
            succeeded_runners: 0,
            failed_runners: 0,
            timed_out_runners: 0,
            findings_by_connection: BTreeMap::new(),
            failures: vec![],
        }
    }

    #[tokio::test]
    async fn sweep_removes_expired_job_and_children() -> Result<()> {
        let store = Arc::new(InMemoryComplianceStore::new());
        let metrics = Arc::new(OrchestratorMetrics::new());
        let old = ComplianceJob::new("bench", JobScope::default(), TriggerType::Scheduled, None);
        let fresh = ComplianceJob::new("bench", JobScope::default(), TriggerType::Scheduled, None);
        for job in [&old, &fresh] {
            store.create_job(job).await?;
            store
                .insert_runners_for_job(job.id, &[RunnerRecord::new(job.id, "q", None, vec![])])
                .await?;
            store.store_report(&report_for(job)).await?;
        }
        store.backdate_job(old.id, chrono::Duration::days(31)).await;

        let sweeper = RetentionSweeper::new(store.clone(), RetentionConfig::default(), metrics.clone());
        let report = sweeper.sweep().await?;

        assert_eq!(
            report,
            RetentionReport {
                reports: 1,
                summarizers: 0,
                runners: 1,
                jobs: 1,
            }
        );
        assert!(store.get_job(old.id).await?.is_none());
        assert!(store.get_report(old.id).await?.is_none());
        assert!(store.get_job(fresh.id).await?.is_some());
        assert_eq!(store.list_runners_for_job(fresh.id).await?.len(), 1);
        assert_eq!(metrics.snapshot().rows_purged, 3);

        assert_eq!(sweeper.sweep().await?.total(), 0);
        Ok(())
    }
}
