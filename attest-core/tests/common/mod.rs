#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use attest_core::{
    ComplianceService, InMemoryComplianceStore, OrchestratorConfig, OrchestratorMetrics,
    orchestration::{
        catalog::{MemoryFindingsSink, StaticConnectionDirectory, StaticQueryCatalog, StaticQueryEngine},
        condition::RecordingAlertSink,
        memory_queue::InProcDispatchQueue,
        publisher::Publisher,
        reconciler::Reconciler,
        repository::JobRepository,
        results::{RunnerResultHandler, SummarizerResultHandler},
        summarizer::SummarizerExecutor,
        worker::{RunnerExecutor, WorkerLoop},
    },
};
use attest_model::{
    Benchmark, ComplianceJob, Connection, Connector, HealthState, JobId, Policy, QueryDefinition,
    QueryOutput, Severity,
};
use serde_json::json;

pub fn connection(id: &str, connector: Connector) -> Connection {
    Connection {
        id: id.into(),
        provider_connection_id: format!("provider-{id}"),
        connector,
        health_state: HealthState::Healthy,
        enabled: true,
    }
}

pub fn query(id: &str) -> QueryDefinition {
    QueryDefinition {
        id: id.into(),
        connector: None,
        query_to_execute: format!("select * from {id}"),
        engine: None,
        global: false,
        list_of_tables: vec![],
    }
}

pub fn output(rows: usize) -> QueryOutput {
    QueryOutput {
        headers: vec!["resource".into(), "status".into(), "reason".into()],
        rows: (0..rows)
            .map(|idx| vec![json!(format!("arn:res:{idx}")), json!("alarm"), json!("open")])
            .collect(),
    }
}

/// `cis` with `p1 -> q1` (two findings per connection) and `p2 -> q2` (one).
pub fn cis_catalog() -> StaticQueryCatalog {
    StaticQueryCatalog::new()
        .with_benchmark(Benchmark {
            id: "cis".into(),
            title: "CIS".into(),
            connector: None,
            children: vec![],
            policies: vec!["p1".into(), "p2".into()],
        })
        .with_policy(Policy {
            id: "p1".into(),
            title: "public buckets".into(),
            query_id: Some("q1".into()),
            severity: Severity::High,
        })
        .with_policy(Policy {
            id: "p2".into(),
            title: "root mfa".into(),
            query_id: Some("q2".into()),
            severity: Severity::Critical,
        })
        .with_query(query("q1"))
        .with_query(query("q2"))
}

pub fn three_connections() -> Vec<Connection> {
    vec![
        connection("c1", Connector::Aws),
        connection("c2", Connector::Aws),
        connection("c3", Connector::Azure),
    ]
}

/// Every role wired over in-memory collaborators and driven by hand.
pub struct Pipeline {
    pub store: Arc<InMemoryComplianceStore>,
    pub queue: Arc<InProcDispatchQueue>,
    pub engine: Arc<StaticQueryEngine>,
    pub sink: Arc<MemoryFindingsSink>,
    pub alerts: Arc<RecordingAlertSink>,
    pub metrics: Arc<OrchestratorMetrics>,
    pub service: ComplianceService,
    pub config: OrchestratorConfig,
    pub publisher: Publisher,
    pub reconciler: Reconciler,
    runner_worker: WorkerLoop,
    runner_results: WorkerLoop,
    summarizer_worker: WorkerLoop,
    summarizer_results: WorkerLoop,
}

impl Pipeline {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_connections(config, three_connections())
    }

    pub fn with_connections(config: OrchestratorConfig, connections: Vec<Connection>) -> Self {
        let store = Arc::new(InMemoryComplianceStore::new());
        let queue = Arc::new(InProcDispatchQueue::new(config.queue.visibility_timeout()));
        let engine = Arc::new(
            StaticQueryEngine::new()
                .with_output("q1", output(2))
                .with_output("q2", output(1)),
        );
        let sink = Arc::new(MemoryFindingsSink::default());
        let alerts = Arc::new(RecordingAlertSink::default());
        let metrics = Arc::new(OrchestratorMetrics::new());

        let publisher = Publisher::new(
            store.clone(),
            queue.clone(),
            Arc::new(cis_catalog()),
            Arc::new(StaticConnectionDirectory::new(connections)),
            config.clone(),
            metrics.clone(),
        );
        let reconciler =
            Reconciler::new(store.clone(), config.clone(), metrics.clone(), alerts.clone());

        let topics = &config.queue;
        let runner_worker = WorkerLoop::new(
            "runner-test",
            queue.clone(),
            topics.runner_topic.clone(),
            Arc::new(RunnerExecutor::new(
                queue.clone(),
                engine.clone(),
                sink.clone(),
                topics.runner_result_topic.clone(),
                config.worker.processing_timeout(),
                metrics.clone(),
            )),
            &config.worker,
        );
        let runner_results = WorkerLoop::new(
            "runner-results-test",
            queue.clone(),
            topics.runner_result_topic.clone(),
            Arc::new(RunnerResultHandler::new(store.clone(), metrics.clone())),
            &config.worker,
        );
        let summarizer_worker = WorkerLoop::new(
            "summarizer-test",
            queue.clone(),
            topics.summarizer_topic.clone(),
            Arc::new(SummarizerExecutor::new(
                store.clone(),
                queue.clone(),
                topics.summarizer_result_topic.clone(),
                config.retry.clone(),
                config.worker.processing_timeout(),
                metrics.clone(),
            )),
            &config.worker,
        );
        let summarizer_results = WorkerLoop::new(
            "summarizer-results-test",
            queue.clone(),
            topics.summarizer_result_topic.clone(),
            Arc::new(SummarizerResultHandler::new(store.clone(), metrics.clone())),
            &config.worker,
        );

        let service = ComplianceService::new(store.clone(), metrics.clone());

        Self {
            store,
            queue,
            engine,
            sink,
            alerts,
            metrics,
            service,
            config,
            publisher,
            reconciler,
            runner_worker,
            runner_results,
            summarizer_worker,
            summarizer_results,
        }
    }

    /// One pass of every role in dependency order.
    pub async fn tick(&self) -> Result<()> {
        self.step(true).await
    }

    /// Like [`Pipeline::tick`], but runner messages are never consumed.
    pub async fn tick_with_stalled_runners(&self) -> Result<()> {
        self.step(false).await
    }

    async fn step(&self, run_runners: bool) -> Result<()> {
        self.publisher.run_cycle().await?;
        if run_runners {
            self.runner_worker.drain().await?;
        }
        self.runner_results.drain().await?;
        self.reconciler.run_cycle().await?;
        self.summarizer_worker.drain().await?;
        self.summarizer_results.drain().await?;
        self.reconciler.run_cycle().await?;
        Ok(())
    }

    /// Tick until the job is terminal, giving up after `max_ticks`.
    pub async fn run_until_terminal(&self, job_id: JobId, max_ticks: usize) -> Result<ComplianceJob> {
        for _ in 0..max_ticks {
            self.tick().await?;
            let job = self.job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
        }
        anyhow::bail!("job {job_id} not terminal after {max_ticks} ticks")
    }

    pub async fn job(&self, job_id: JobId) -> Result<ComplianceJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} missing"))
    }
}

/// Long enough for `created_at`/`updated_at` to fall behind a zero threshold.
pub async fn let_clock_advance() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
