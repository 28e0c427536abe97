//! External collaborators: query catalog, connection directory, execution
//! engine and findings sink.
//!
//! The orchestrator only talks to these through the traits below. Static
//! implementations are provided for tests and single-node runs; HTTP clients
//! live in [`super::http`].

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use attest_model::{
    Benchmark, Connection, Finding, Policy, QueryDefinition, QueryOutput, RunnerJob,
};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{ComplianceError, Result};

#[async_trait]
pub trait QueryCatalog: Send + Sync {
    async fn get_query(&self, id: &str) -> Result<Option<QueryDefinition>>;

    async fn list_queries(&self) -> Result<Vec<QueryDefinition>>;

    async fn get_benchmark(&self, id: &str) -> Result<Option<Benchmark>>;

    async fn get_policy(&self, id: &str) -> Result<Option<Policy>>;
}

#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn list_connections(&self) -> Result<Vec<Connection>>;
}

/// Runs a query against the data view of one connection.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, job: &RunnerJob) -> Result<QueryOutput>;
}

#[async_trait]
pub trait FindingsSink: Send + Sync {
    async fn ingest(&self, findings: Vec<Finding>) -> Result<()>;
}

/// Catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticQueryCatalog {
    queries: HashMap<String, QueryDefinition>,
    benchmarks: HashMap<String, Benchmark>,
    policies: HashMap<String, Policy>,
}

impl StaticQueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: QueryDefinition) -> Self {
        self.queries.insert(query.id.clone(), query);
        self
    }

    pub fn with_benchmark(mut self, benchmark: Benchmark) -> Self {
        self.benchmarks.insert(benchmark.id.clone(), benchmark);
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.insert(policy.id.clone(), policy);
        self
    }
}

#[async_trait]
impl QueryCatalog for StaticQueryCatalog {
    async fn get_query(&self, id: &str) -> Result<Option<QueryDefinition>> {
        Ok(self.queries.get(id).cloned())
    }

    async fn list_queries(&self) -> Result<Vec<QueryDefinition>> {
        Ok(self.queries.values().cloned().collect())
    }

    async fn get_benchmark(&self, id: &str) -> Result<Option<Benchmark>> {
        Ok(self.benchmarks.get(id).cloned())
    }

    async fn get_policy(&self, id: &str) -> Result<Option<Policy>> {
        Ok(self.policies.get(id).cloned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticConnectionDirectory {
    connections: Vec<Connection>,
}

impl StaticConnectionDirectory {
    pub fn new(connections: Vec<Connection>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl ConnectionDirectory for StaticConnectionDirectory {
    async fn list_connections(&self) -> Result<Vec<Connection>> {
        Ok(self.connections.clone())
    }
}

type FailureKey = (String, Option<String>);

/// Engine that answers every query with a canned output. Failures and delays
/// can be scripted per query and connection.
#[derive(Default)]
pub struct StaticQueryEngine {
    outputs: HashMap<String, QueryOutput>,
    failures: AsyncMutex<HashMap<FailureKey, u32>>,
    delay: Option<Duration>,
    executions: AtomicU64,
}

impl fmt::Debug for StaticQueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticQueryEngine")
            .field("queries", &self.outputs.len())
            .field("delay", &self.delay)
            .field("executions", &self.executions.load(Ordering::Relaxed))
            .finish()
    }
}

impl StaticQueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, query_id: impl Into<String>, output: QueryOutput) -> Self {
        self.outputs.insert(query_id.into(), output);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` executions of `query_id` on `connection_id`.
    pub async fn fail(&self, query_id: &str, connection_id: Option<&str>, times: u32) {
        self.failures.lock().await.insert(
            (query_id.to_string(), connection_id.map(str::to_string)),
            times,
        );
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueryEngine for StaticQueryEngine {
    async fn execute(&self, job: &RunnerJob) -> Result<QueryOutput> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        {
            let mut failures = self.failures.lock().await;
            let key = (job.query.id.clone(), job.connection_id.clone());
            if let Some(remaining) = failures.get_mut(&key)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(ComplianceError::Execution(format!(
                    "query {} failed on {}",
                    job.query.id,
                    job.connection_id.as_deref().unwrap_or("global")
                )));
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.outputs.get(&job.query.id).cloned().unwrap_or_default())
    }
}

/// Keeps every ingested finding in memory.
#[derive(Default)]
pub struct MemoryFindingsSink {
    findings: AsyncMutex<Vec<Finding>>,
}

impl fmt::Debug for MemoryFindingsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.findings.try_lock() {
            Ok(guard) => f
                .debug_struct("MemoryFindingsSink")
                .field("findings", &guard.len())
                .finish(),
            Err(_) => f
                .debug_struct("MemoryFindingsSink")
                .field("findings", &"<locked>")
                .finish(),
        }
    }
}

impl MemoryFindingsSink {
    pub async fn findings(&self) -> Vec<Finding> {
        self.findings.lock().await.clone()
    }
}

#[async_trait]
impl FindingsSink for MemoryFindingsSink {
    async fn ingest(&self, findings: Vec<Finding>) -> Result<()> {
        self.findings.lock().await.extend(findings);
        Ok(())
    }
}

/// Logs a summary of each batch instead of storing it.
#[derive(Debug, Clone, Default)]
pub struct TracingFindingsSink;

#[async_trait]
impl FindingsSink for TracingFindingsSink {
    async fn ingest(&self, findings: Vec<Finding>) -> Result<()> {
        if let Some(first) = findings.first() {
            tracing::debug!(
                target: "compliance::findings",
                job_id = %first.job_id,
                runner_id = %first.runner_id,
                count = findings.len(),
                "findings ingested"
            );
        }
        Ok(())
    }
}
