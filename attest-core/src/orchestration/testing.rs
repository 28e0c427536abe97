//! Builders shared by the unit tests of the orchestration modules.

use std::sync::Arc;

use attest_model::{
    Benchmark, Caller, Connection, Connector, ComplianceJob, HealthState, JobId, JobScope,
    Policy, QueryDefinition, QueryOutput, RunnerId, RunnerJob, Severity, TriggerType,
};
use chrono::Utc;
use serde_json::json;

use super::{
    catalog::{StaticConnectionDirectory, StaticQueryCatalog},
    config::OrchestratorConfig,
    memory_queue::InProcDispatchQueue,
    metrics::OrchestratorMetrics,
    publisher::Publisher,
    repository::{InMemoryComplianceStore, JobRepository},
};

pub(crate) fn benchmark(id: &str, children: &[&str], policies: &[&str]) -> Benchmark {
    Benchmark {
        id: id.into(),
        title: format!("{id} benchmark"),
        connector: None,
        children: children.iter().map(|c| c.to_string()).collect(),
        policies: policies.iter().map(|p| p.to_string()).collect(),
    }
}

pub(crate) fn policy(id: &str, query_id: Option<&str>) -> Policy {
    Policy {
        id: id.into(),
        title: format!("{id} policy"),
        query_id: query_id.map(str::to_string),
        severity: Severity::High,
    }
}

pub(crate) fn query(id: &str, connector: Option<Connector>, global: bool) -> QueryDefinition {
    QueryDefinition {
        id: id.into(),
        connector,
        query_to_execute: format!("select * from {id}"),
        engine: None,
        global,
        list_of_tables: vec![],
    }
}

pub(crate) fn connection(id: &str, connector: Connector) -> Connection {
    Connection {
        id: id.into(),
        provider_connection_id: format!("provider-{id}"),
        connector,
        health_state: HealthState::Healthy,
        enabled: true,
    }
}

pub(crate) fn runner_job(query_id: &str, connection_id: Option<&str>, callers: usize) -> RunnerJob {
    RunnerJob {
        runner_id: RunnerId::new(),
        retry_count: 0,
        parent_job_id: JobId::new(),
        created_at: Utc::now(),
        query: query(query_id, None, connection_id.is_none()),
        callers: (0..callers)
            .map(|idx| Caller {
                root_benchmark: "bench".into(),
                parent_benchmark_ids: vec!["bench".into()],
                policy_id: format!("p{idx}"),
                severity: Severity::Medium,
            })
            .collect(),
        connection_id: connection_id.map(str::to_string),
        provider_connection_id: connection_id.map(|id| format!("provider-{id}")),
    }
}

pub(crate) fn sample_output(rows: usize) -> QueryOutput {
    QueryOutput {
        headers: vec![
            "resource".into(),
            "name".into(),
            "region".into(),
            "status".into(),
            "reason".into(),
        ],
        rows: (0..rows)
            .map(|idx| {
                vec![
                    json!(format!("arn:res:{idx}")),
                    json!(format!("res-{idx}")),
                    json!("eu-west-1"),
                    json!("alarm"),
                    json!("public access enabled"),
                ]
            })
            .collect(),
    }
}

/// A publisher over in-memory collaborators with one job already created.
pub(crate) struct Harness {
    pub publisher: Publisher,
    pub store: Arc<InMemoryComplianceStore>,
    pub queue: Arc<InProcDispatchQueue>,
    pub catalog: Arc<StaticQueryCatalog>,
    pub config: OrchestratorConfig,
    pub job_id: JobId,
}

impl Harness {
    /// `bench` with two per-connection queries over three connections.
    pub async fn two_policies_three_connections() -> Self {
        Self::with_connections(vec![
            connection("c1", Connector::Aws),
            connection("c2", Connector::Aws),
            connection("c3", Connector::Azure),
        ])
        .await
    }

    pub async fn with_connections(connections: Vec<Connection>) -> Self {
        let catalog = Arc::new(
            StaticQueryCatalog::new()
                .with_benchmark(benchmark("bench", &[], &["p1", "p2"]))
                .with_policy(policy("p1", Some("q1")))
                .with_policy(policy("p2", Some("q2")))
                .with_query(query("q1", None, false))
                .with_query(query("q2", None, false)),
        );
        let store = Arc::new(InMemoryComplianceStore::new());
        let queue = Arc::new(InProcDispatchQueue::default());
        let config = OrchestratorConfig::default();

        let job = ComplianceJob::new("bench", JobScope::default(), TriggerType::Manual, None);
        store.create_job(&job).await.expect("create job");

        let publisher = Publisher::new(
            store.clone(),
            queue.clone(),
            catalog.clone(),
            Arc::new(StaticConnectionDirectory::new(connections)),
            config.clone(),
            Arc::new(OrchestratorMetrics::new()),
        );

        Self {
            publisher,
            store,
            queue,
            catalog,
            config,
            job_id: job.id,
        }
    }
}
