//! Periodic dispatcher of runner and summarizer work.
//!
//! One cycle sweeps timeouts, loads reference data, expands new jobs into
//! runner rows, publishes `CREATED` runners in bounded batches, publishes
//! `CREATED` summarizers and finally returns failed units with budget left to
//! `CREATED` so the next cycle picks them up.

use std::{collections::HashMap, fmt, sync::Arc};

use attest_model::{
    ComplianceJob, Connection, QueryDefinition, RunnerJob, RunnerRecord, SummarizerJob,
    SummarizerRecord,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    catalog::{ConnectionDirectory, QueryCatalog},
    config::OrchestratorConfig,
    expansion::expand_job,
    metrics::OrchestratorMetrics,
    queue::{DispatchQueue, OutboundMessage, PublishOutcome},
    repository::ComplianceStore,
};
use crate::error::{ComplianceError, Result};

/// Counts of what one publisher cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub jobs_timed_out: u64,
    pub runners_timed_out: u64,
    pub summarizers_timed_out: u64,
    pub jobs_expanded: u64,
    pub jobs_failed_empty: u64,
    pub jobs_advanced: u64,
    pub batches: u64,
    pub runners_published: u64,
    pub runners_duplicate: u64,
    pub runners_publish_failed: u64,
    pub runners_unresolved: u64,
    pub summarizers_published: u64,
    pub summarizers_publish_failed: u64,
    pub runners_retried: u64,
    pub summarizers_retried: u64,
}

impl PublishReport {
    pub fn is_idle(&self) -> bool {
        self == &PublishReport::default()
    }
}

/// Query catalog and connection directory snapshot, loaded once per cycle.
#[derive(Debug, Default)]
pub struct ReferenceData {
    pub queries: HashMap<String, QueryDefinition>,
    pub connections: Vec<Connection>,
    by_connection_id: HashMap<String, usize>,
}

impl ReferenceData {
    pub fn new(queries: Vec<QueryDefinition>, connections: Vec<Connection>) -> Self {
        let by_connection_id = connections
            .iter()
            .enumerate()
            .map(|(idx, connection)| (connection.id.clone(), idx))
            .collect();
        Self {
            queries: queries
                .into_iter()
                .map(|query| (query.id.clone(), query))
                .collect(),
            connections,
            by_connection_id,
        }
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.by_connection_id
            .get(id)
            .and_then(|idx| self.connections.get(*idx))
    }

    /// Resolve everything a worker needs to execute `runner`.
    pub fn runner_job(&self, runner: &RunnerRecord) -> Result<RunnerJob> {
        let query = self.queries.get(&runner.query_id).ok_or_else(|| {
            ComplianceError::Resolution(format!("query {} not found", runner.query_id))
        })?;
        let provider_connection_id = match runner.connection_id.as_deref() {
            Some(connection_id) => Some(
                self.connection(connection_id)
                    .ok_or_else(|| {
                        ComplianceError::Resolution(format!(
                            "connection {connection_id} not found"
                        ))
                    })?
                    .provider_connection_id
                    .clone(),
            ),
            None => None,
        };
        Ok(RunnerJob {
            runner_id: runner.id,
            retry_count: runner.retry_count,
            parent_job_id: runner.parent_job_id,
            created_at: runner.created_at,
            query: query.clone(),
            callers: runner.callers.clone(),
            connection_id: runner.connection_id.clone(),
            provider_connection_id,
        })
    }
}

pub struct Publisher {
    store: Arc<dyn ComplianceStore>,
    queue: Arc<dyn DispatchQueue>,
    catalog: Arc<dyn QueryCatalog>,
    directory: Arc<dyn ConnectionDirectory>,
    config: OrchestratorConfig,
    metrics: Arc<OrchestratorMetrics>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("store", &self.store)
            .field("publisher", &self.config.publisher)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        queue: Arc<dyn DispatchQueue>,
        catalog: Arc<dyn QueryCatalog>,
        directory: Arc<dyn ConnectionDirectory>,
        config: OrchestratorConfig,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            store,
            queue,
            catalog,
            directory,
            config,
            metrics,
        }
    }

    /// Run cycles on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.publisher.interval();
        loop {
            match self.run_cycle().await {
                Ok(report) if report.is_idle() => {
                    debug!(target: "compliance::publisher", "publisher cycle idle")
                }
                Ok(report) => info!(
                    target: "compliance::publisher",
                    published = report.runners_published,
                    publish_failed = report.runners_publish_failed,
                    unresolved = report.runners_unresolved,
                    expanded = report.jobs_expanded,
                    retried = report.runners_retried,
                    timed_out = report.runners_timed_out,
                    summarizers = report.summarizers_published,
                    "publisher cycle complete"
                ),
                Err(err) => warn!(
                    target: "compliance::publisher",
                    error = %err,
                    "publisher cycle aborted; retrying next tick"
                ),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "compliance::publisher", "publisher shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    #[instrument(skip(self), target = "compliance::publisher", level = "debug")]
    pub async fn run_cycle(&self) -> Result<PublishReport> {
        let mut report = PublishReport::default();

        self.sweep_timeouts(&mut report).await;

        let reference = self.load_reference_data().await?;

        self.expand_pending_jobs(&reference, &mut report).await?;
        report.jobs_advanced = self.store.advance_jobs_with_runners().await?;

        self.publish_runners(&reference, &mut report).await?;
        self.publish_summarizers(&mut report).await?;

        report.runners_retried = self.store.retry_failed_runners(&self.config.retry).await?;
        OrchestratorMetrics::add(&self.metrics.runners_retried, report.runners_retried);
        report.summarizers_retried = self
            .store
            .retry_failed_summarizers(&self.config.retry)
            .await?;
        OrchestratorMetrics::add(&self.metrics.summarizers_retried, report.summarizers_retried);

        Ok(report)
    }

    pub async fn load_reference_data(&self) -> Result<ReferenceData> {
        let queries = self.catalog.list_queries().await?;
        let connections = self.directory.list_connections().await?;
        Ok(ReferenceData::new(queries, connections))
    }

    /// Timeout sweeps are best effort: a failure is logged and the cycle goes on.
    async fn sweep_timeouts(&self, report: &mut PublishReport) {
        let timeouts = &self.config.timeouts;

        match self.store.mark_timed_out_runners(timeouts).await {
            Ok(count) => {
                report.runners_timed_out = count;
                OrchestratorMetrics::add(&self.metrics.runners_timed_out, count);
            }
            Err(err) => warn!(
                target: "compliance::publisher",
                error = %err,
                "runner timeout sweep failed"
            ),
        }

        match self.store.mark_timed_out_summarizers(timeouts).await {
            Ok(count) => {
                report.summarizers_timed_out = count;
                OrchestratorMetrics::add(&self.metrics.summarizers_timed_out, count);
            }
            Err(err) => warn!(
                target: "compliance::publisher",
                error = %err,
                "summarizer timeout sweep failed"
            ),
        }

        match self.store.mark_timed_out_jobs(timeouts.job()).await {
            Ok(count) => {
                report.jobs_timed_out = count;
                OrchestratorMetrics::add(&self.metrics.jobs_timed_out, count);
            }
            Err(err) => warn!(
                target: "compliance::publisher",
                error = %err,
                "job timeout sweep failed"
            ),
        }
    }

    async fn expand_pending_jobs(
        &self,
        reference: &ReferenceData,
        report: &mut PublishReport,
    ) -> Result<()> {
        let jobs = self
            .store
            .list_jobs_with_unqueued_runners(self.config.publisher.max_jobs_expanded_per_cycle)
            .await?;

        for job in jobs {
            if let Err(err) = self.expand_one(&job, reference, report).await {
                warn!(
                    target: "compliance::publisher",
                    job_id = %job.id,
                    benchmark_id = %job.benchmark_id,
                    error = %err,
                    "job expansion failed; will retry"
                );
            }
        }
        Ok(())
    }

    async fn expand_one(
        &self,
        job: &ComplianceJob,
        reference: &ReferenceData,
        report: &mut PublishReport,
    ) -> Result<()> {
        let runners = expand_job(
            job,
            self.catalog.as_ref(),
            &reference.queries,
            &reference.connections,
        )
        .await?;

        if runners.is_empty() {
            let message = format!(
                "benchmark {} has no runnable queries for the requested scope",
                job.benchmark_id
            );
            if self.store.fail_job(job.id, &message).await? {
                report.jobs_failed_empty += 1;
                OrchestratorMetrics::incr(&self.metrics.jobs_failed);
                info!(target: "compliance::publisher", job_id = %job.id, "{message}");
            }
            return Ok(());
        }

        match self.store.insert_runners_for_job(job.id, &runners).await {
            Ok(()) => {
                report.jobs_expanded += 1;
                OrchestratorMetrics::incr(&self.metrics.jobs_expanded);
                OrchestratorMetrics::add(&self.metrics.runners_created, runners.len() as u64);
                debug!(
                    target: "compliance::publisher",
                    job_id = %job.id,
                    runners = runners.len(),
                    "job expanded"
                );
                Ok(())
            }
            Err(ComplianceError::Conflict(reason)) => {
                debug!(
                    target: "compliance::publisher",
                    job_id = %job.id,
                    reason,
                    "job already expanded elsewhere"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn publish_runners(
        &self,
        reference: &ReferenceData,
        report: &mut PublishReport,
    ) -> Result<()> {
        let settings = &self.config.publisher;

        for _ in 0..settings.max_batches_per_cycle {
            let runners = self.store.list_runners_created(settings.batch_size).await?;
            if runners.is_empty() {
                break;
            }
            report.batches += 1;

            let mut progressed = false;
            for runner in &runners {
                let job = match reference.runner_job(runner) {
                    Ok(job) => job,
                    Err(err) => {
                        report.runners_unresolved += 1;
                        OrchestratorMetrics::incr(&self.metrics.runners_unresolved);
                        warn!(
                            target: "compliance::publisher",
                            runner_id = %runner.id,
                            job_id = %runner.parent_job_id,
                            error = %err,
                            "runner left in CREATED: execution context unresolved"
                        );
                        continue;
                    }
                };
                progressed = true;
                self.dispatch_runner(&job, report).await?;
            }

            // Everything left is unresolvable until reference data changes.
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch_runner(&self, job: &RunnerJob, report: &mut PublishReport) -> Result<()> {
        let publish = match OutboundMessage::json(job.message_key(), job) {
            Ok(message) => self.queue.publish(&self.config.queue.runner_topic, message).await,
            Err(err) => Err(err),
        };

        match publish {
            Ok(outcome) => {
                if outcome == PublishOutcome::Duplicate {
                    report.runners_duplicate += 1;
                }
                if self
                    .store
                    .mark_runner_queued(job.runner_id, job.retry_count)
                    .await?
                {
                    report.runners_published += 1;
                    OrchestratorMetrics::incr(&self.metrics.runners_published);
                }
            }
            Err(err) => {
                report.runners_publish_failed += 1;
                OrchestratorMetrics::incr(&self.metrics.runners_publish_failed);
                warn!(
                    target: "compliance::publisher",
                    runner_id = %job.runner_id,
                    retry_count = job.retry_count,
                    error = %err,
                    "runner publish failed"
                );
                self.store
                    .mark_runner_publish_failed(job.runner_id, job.retry_count, &err.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn publish_summarizers(&self, report: &mut PublishReport) -> Result<()> {
        let summarizers = self
            .store
            .list_summarizers_created(self.config.publisher.batch_size)
            .await?;

        for summarizer in summarizers {
            let Some(job) = self.store.get_job(summarizer.parent_job_id).await? else {
                warn!(
                    target: "compliance::publisher",
                    summarizer_id = %summarizer.id,
                    job_id = %summarizer.parent_job_id,
                    "summarizer parent job is gone"
                );
                continue;
            };
            self.dispatch_summarizer(&summarizer, &job, report).await?;
        }
        Ok(())
    }

    async fn dispatch_summarizer(
        &self,
        summarizer: &SummarizerRecord,
        job: &ComplianceJob,
        report: &mut PublishReport,
    ) -> Result<()> {
        let message = SummarizerJob {
            summarizer_id: summarizer.id,
            retry_count: summarizer.retry_count,
            parent_job_id: job.id,
            benchmark_id: job.benchmark_id.clone(),
            created_at: summarizer.created_at,
        };
        let publish = match OutboundMessage::json(message.message_key(), &message) {
            Ok(outbound) => {
                self.queue
                    .publish(&self.config.queue.summarizer_topic, outbound)
                    .await
            }
            Err(err) => Err(err),
        };

        match publish {
            Ok(_) => {
                if self
                    .store
                    .mark_summarizer_queued(summarizer.id, summarizer.retry_count)
                    .await?
                {
                    report.summarizers_published += 1;
                    OrchestratorMetrics::incr(&self.metrics.summarizers_published);
                }
            }
            Err(err) => {
                report.summarizers_publish_failed += 1;
                OrchestratorMetrics::incr(&self.metrics.summarizers_publish_failed);
                warn!(
                    target: "compliance::publisher",
                    summarizer_id = %summarizer.id,
                    error = %err,
                    "summarizer publish failed"
                );
                self.store
                    .mark_summarizer_publish_failed(
                        summarizer.id,
                        summarizer.retry_count,
                        &err.to_string(),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{
        repository::{JobRepository, RunnerRepository},
        testing::Harness,
    };
    use attest_model::{JobStatus, RunnerJob as Job, RunnerStatus, TriggerType};

    #[tokio::test]
    async fn cycle_expands_and_publishes_every_runner() -> Result<()> {
        let harness = Harness::two_policies_three_connections().await;
        let report = harness.publisher.run_cycle().await?;

        assert_eq!(report.jobs_expanded, 1);
        assert_eq!(report.jobs_advanced, 1);
        assert_eq!(report.runners_published, 6);
        assert_eq!(harness.queue.depth(&harness.config.queue.runner_topic).await?, 6);

        let job = harness.store.get_job(harness.job_id).await?.unwrap();
        assert!(job.are_all_runners_queued);
        assert_eq!(job.status, JobStatus::RunnersInProgress);
        for runner in harness.store.list_runners_for_job(harness.job_id).await? {
            assert_eq!(runner.status, RunnerStatus::Queued);
        }
        Ok(())
    }

    #[tokio::test]
    async fn published_plans_carry_the_attempt_key() -> Result<()> {
        let harness = Harness::two_policies_three_connections().await;
        harness.publisher.run_cycle().await?;

        let messages = harness.queue.drain(&harness.config.queue.runner_topic).await;
        for (key, payload) in messages {
            let job: Job = serde_json::from_slice(&payload)?;
            assert_eq!(key, format!("job-{}-0", job.runner_id));
            assert!(job.provider_connection_id.is_some());
            assert!(!job.callers.is_empty());
        }
        Ok(())
    }

    #[tokio::test]
    async fn publish_failure_fails_runner_and_retry_returns_it() -> Result<()> {
        let harness = Harness::two_policies_three_connections().await;
        harness.queue.fail_next_publishes(1);

        let report = harness.publisher.run_cycle().await?;
        assert_eq!(report.runners_publish_failed, 1);
        assert_eq!(report.runners_published, 5);
        // The same cycle hands the failed runner back for the next one.
        assert_eq!(report.runners_retried, 1);

        let runners = harness.store.list_runners_for_job(harness.job_id).await?;
        let failed: Vec<_> = runners
            .iter()
            .filter(|runner| runner.publish_failure_count == 1)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, RunnerStatus::Created);
        assert_eq!(failed[0].retry_count, 0);

        let report = harness.publisher.run_cycle().await?;
        assert_eq!(report.runners_published, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unresolvable_runner_stays_created() -> Result<()> {
        let harness = Harness::two_policies_three_connections().await;
        harness.publisher.run_cycle().await?;

        // A runner whose connection is unknown to the directory.
        let other = ComplianceJob::new("bench", Default::default(), TriggerType::Scheduled, None);
        harness.store.create_job(&other).await?;
        let orphan = RunnerRecord::new(other.id, "q1", Some("gone".into()), vec![]);
        harness
            .store
            .insert_runners_for_job(other.id, std::slice::from_ref(&orphan))
            .await?;

        let report = harness.publisher.run_cycle().await?;
        assert_eq!(report.runners_unresolved, 1);
        assert_eq!(report.runners_published, 0);
        assert_eq!(
            harness.store.get_runner(orphan.id).await?.unwrap().status,
            RunnerStatus::Created
        );
        Ok(())
    }

    #[tokio::test]
    async fn benchmark_without_runnable_queries_fails_job() -> Result<()> {
        let harness = Harness::with_connections(vec![]).await;
        let report = harness.publisher.run_cycle().await?;
        assert_eq!(report.jobs_failed_empty, 1);
        let job = harness.store.get_job(harness.job_id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_message.unwrap().contains("no runnable queries"));
        Ok(())
    }

    #[tokio::test]
    async fn pending_duplicate_key_still_marks_runner_queued() -> Result<()> {
        let harness = Harness::two_policies_three_connections().await;
        let reference = harness.publisher.load_reference_data().await?;
        let runners = expand_job(
            &harness.store.get_job(harness.job_id).await?.unwrap(),
            harness.catalog.as_ref(),
            &reference.queries,
            &reference.connections,
        )
        .await?;
        harness.store.insert_runners_for_job(harness.job_id, &runners).await?;

        // A previous publisher crashed after publishing but before marking.
        let plan = reference.runner_job(&runners[0])?;
        harness
            .queue
            .publish(
                &harness.config.queue.runner_topic,
                OutboundMessage::json(plan.message_key(), &plan)?,
            )
            .await?;

        let report = harness.publisher.run_cycle().await?;
        assert_eq!(report.runners_duplicate, 1);
        assert_eq!(report.runners_published, 6);
        assert_eq!(harness.queue.depth(&harness.config.queue.runner_topic).await?, 6);
        Ok(())
    }
}
