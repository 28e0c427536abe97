//! Trigger and status API used by schedulers and operators.

use std::{fmt, sync::Arc};

use attest_model::{
    ComplianceJob, Connector, JobId, JobReport, JobScope, RunnerRecord, SummarizerRecord,
    TriggerType,
};
use tracing::info;

use super::{
    metrics::{MetricsSnapshot, OrchestratorMetrics},
    repository::{ComplianceStore, JobFilter},
};
use crate::error::{ComplianceError, Result};

/// Request to evaluate a benchmark.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerRequest {
    pub benchmark_id: String,
    /// Empty means every connection.
    pub connection_ids: Vec<String>,
    pub connector: Option<Connector>,
    pub trigger_type: TriggerType,
    /// Caller supplied id; repeating it returns the job it created.
    pub request_id: Option<String>,
}

impl TriggerRequest {
    pub fn manual(benchmark_id: impl Into<String>) -> Self {
        Self {
            benchmark_id: benchmark_id.into(),
            connection_ids: Vec::new(),
            connector: None,
            trigger_type: TriggerType::Manual,
            request_id: None,
        }
    }

    pub fn scheduled(benchmark_id: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Scheduled,
            ..Self::manual(benchmark_id)
        }
    }

    pub fn with_connections(mut self, connection_ids: Vec<String>) -> Self {
        self.connection_ids = connection_ids;
        self
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct TriggerOutcome {
    pub job: ComplianceJob,
    /// False when the request id matched an existing job.
    pub created: bool,
}

pub struct ComplianceService {
    store: Arc<dyn ComplianceStore>,
    metrics: Arc<OrchestratorMetrics>,
}

impl fmt::Debug for ComplianceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplianceService")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ComplianceService {
    pub fn new(store: Arc<dyn ComplianceStore>, metrics: Arc<OrchestratorMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Create a job in `CREATED`. The publisher expands it on its next cycle.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerOutcome> {
        let benchmark_id = request.benchmark_id.trim();
        if benchmark_id.is_empty() {
            return Err(ComplianceError::InvalidInput(
                "benchmark id must not be empty".into(),
            ));
        }
        let request_id = request
            .request_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        if let Some(existing) = self.existing(request_id.as_deref()).await? {
            return Ok(TriggerOutcome {
                job: existing,
                created: false,
            });
        }

        let scope = JobScope::new(request.connection_ids, request.connector)?;
        let job = ComplianceJob::new(benchmark_id, scope, request.trigger_type, request_id.clone());

        match self.store.create_job(&job).await {
            Ok(()) => {}
            // Lost a race against an identical request.
            Err(ComplianceError::Conflict(_)) if request_id.is_some() => {
                if let Some(existing) = self.existing(request_id.as_deref()).await? {
                    return Ok(TriggerOutcome {
                        job: existing,
                        created: false,
                    });
                }
                return Err(ComplianceError::Conflict(format!(
                    "request id {} is in use",
                    request_id.unwrap_or_default()
                )));
            }
            Err(err) => return Err(err),
        }

        OrchestratorMetrics::incr(&self.metrics.jobs_created);
        info!(
            target: "compliance::service",
            job_id = %job.id,
            benchmark_id = %job.benchmark_id,
            trigger = %job.trigger_type,
            connections = job.scope.connection_ids.len(),
            "compliance job created"
        );
        Ok(TriggerOutcome { job, created: true })
    }

    async fn existing(&self, request_id: Option<&str>) -> Result<Option<ComplianceJob>> {
        match request_id {
            Some(request_id) => self.store.find_job_by_request_id(request_id).await,
            None => Ok(None),
        }
    }

    pub async fn get_job(&self, id: JobId) -> Result<ComplianceJob> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| ComplianceError::NotFound(format!("job {id}")))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ComplianceJob>> {
        self.store.list_jobs(filter).await
    }

    pub async fn list_runners_for_job(&self, id: JobId) -> Result<Vec<RunnerRecord>> {
        self.get_job(id).await?;
        self.store.list_runners_for_job(id).await
    }

    pub async fn list_summarizers_for_job(&self, id: JobId) -> Result<Vec<SummarizerRecord>> {
        self.get_job(id).await?;
        self.store.list_summarizers_for_job(id).await
    }

    pub async fn get_report(&self, id: JobId) -> Result<Option<JobReport>> {
        self.store.get_report(id).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::repository::InMemoryComplianceStore;
    use attest_model::JobStatus;

    fn service() -> ComplianceService {
        ComplianceService::new(
            Arc::new(InMemoryComplianceStore::new()),
            Arc::new(OrchestratorMetrics::new()),
        )
    }

    #[tokio::test]
    async fn trigger_creates_a_job_in_created() -> Result<()> {
        let service = service();
        let outcome = service
            .trigger(
                TriggerRequest::manual("cis")
                    .with_connections(vec!["c2".into(), "c1".into(), "c1".into()])
                    .with_connector(Connector::Aws),
            )
            .await?;

        assert!(outcome.created);
        let job = service.get_job(outcome.job.id).await?;
        assert_eq!(job.status, JobStatus::Created);
        assert!(!job.are_all_runners_queued);
        assert_eq!(job.scope.connection_ids, vec!["c1", "c2"]);
        assert_eq!(service.metrics().jobs_created, 1);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_request_id_returns_the_same_job() -> Result<()> {
        let service = service();
        let first = service
            .trigger(TriggerRequest::scheduled("cis").with_request_id("req-1"))
            .await?;
        let second = service
            .trigger(TriggerRequest::scheduled("cis").with_request_id(" req-1 "))
            .await?;

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(service.list_jobs(&JobFilter::default()).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn blank_benchmark_is_rejected() {
        let err = service().trigger(TriggerRequest::manual("  ")).await.unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let err = service().list_runners_for_job(JobId::new()).await.unwrap_err();
        assert!(matches!(err, ComplianceError::NotFound(_)));
    }
}
