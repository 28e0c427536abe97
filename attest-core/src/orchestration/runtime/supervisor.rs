use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Role;
use crate::{
    error::{ComplianceError, Result},
    orchestration::{
        catalog::{ConnectionDirectory, FindingsSink, QueryCatalog, QueryEngine, TracingFindingsSink},
        condition::{AlertSink, TracingAlertSink},
        config::OrchestratorConfig,
        metrics::OrchestratorMetrics,
        publisher::Publisher,
        queue::DispatchQueue,
        reconciler::Reconciler,
        repository::ComplianceStore,
        results::{RunnerResultHandler, SummarizerResultHandler},
        retention::RetentionSweeper,
        service::ComplianceService,
        summarizer::SummarizerExecutor,
        worker::{MessageHandler, RunnerExecutor, WorkerLoop},
    },
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct OrchestratorRuntimeBuilder {
    config: OrchestratorConfig,
    store: Arc<dyn ComplianceStore>,
    queue: Arc<dyn DispatchQueue>,
    catalog: Option<Arc<dyn QueryCatalog>>,
    directory: Option<Arc<dyn ConnectionDirectory>>,
    engine: Option<Arc<dyn QueryEngine>>,
    findings: Arc<dyn FindingsSink>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<OrchestratorMetrics>,
    instance: String,
}

impl fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("instance", &self.instance)
            .field("has_catalog", &self.catalog.is_some())
            .field("has_directory", &self.directory.is_some())
            .field("has_engine", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl OrchestratorRuntimeBuilder {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn ComplianceStore>,
        queue: Arc<dyn DispatchQueue>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            catalog: None,
            directory: None,
            engine: None,
            findings: Arc::new(TracingFindingsSink),
            alerts: Arc::new(TracingAlertSink),
            metrics: Arc::new(OrchestratorMetrics::new()),
            instance: "attest".into(),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn QueryCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn ConnectionDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_findings_sink(mut self, findings: Arc<dyn FindingsSink>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestratorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Prefix for worker ids in logs.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn build(self) -> OrchestratorRuntime {
        OrchestratorRuntime {
            config: self.config,
            store: self.store,
            queue: self.queue,
            catalog: self.catalog,
            directory: self.directory,
            engine: self.engine,
            findings: self.findings,
            alerts: self.alerts,
            metrics: self.metrics,
            instance: self.instance,
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }
}

/// Owns the tasks of every role started in this process.
pub struct OrchestratorRuntime {
    config: OrchestratorConfig,
    store: Arc<dyn ComplianceStore>,
    queue: Arc<dyn DispatchQueue>,
    catalog: Option<Arc<dyn QueryCatalog>>,
    directory: Option<Arc<dyn ConnectionDirectory>>,
    engine: Option<Arc<dyn QueryEngine>>,
    findings: Arc<dyn FindingsSink>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<OrchestratorMetrics>,
    instance: String,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("OrchestratorRuntime")
            .field("instance", &self.instance)
            .field("store", &self.store)
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl OrchestratorRuntime {
    pub fn builder(
        config: OrchestratorConfig,
        store: Arc<dyn ComplianceStore>,
        queue: Arc<dyn DispatchQueue>,
    ) -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new(config, store, queue)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<OrchestratorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn service(&self) -> ComplianceService {
        ComplianceService::new(Arc::clone(&self.store), Arc::clone(&self.metrics))
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the loops of `roles`. Fails before spawning anything if a role
    /// is missing a collaborator.
    pub async fn start(&self, roles: &[Role]) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(ComplianceError::Cancelled("runtime already shut down".into()));
        }
        for role in roles {
            self.check_role(*role)?;
        }
        for role in roles {
            self.spawn_role(*role).await?;
        }
        info!(
            target: "compliance::runtime",
            instance = %self.instance,
            roles = ?roles,
            "orchestrator roles started"
        );
        Ok(())
    }

    fn check_role(&self, role: Role) -> Result<()> {
        let missing = match role {
            Role::Publisher if self.catalog.is_none() => Some("query catalog"),
            Role::Publisher if self.directory.is_none() => Some("connection directory"),
            Role::Worker if self.engine.is_none() => Some("query engine"),
            _ => None,
        };
        match missing {
            Some(what) => Err(ComplianceError::InvalidInput(format!(
                "role {role} requires a {what}"
            ))),
            None => Ok(()),
        }
    }

    async fn spawn_role(&self, role: Role) -> Result<()> {
        let queue_config = &self.config.queue;
        let worker_config = &self.config.worker;
        match role {
            Role::Publisher => {
                let (Some(catalog), Some(directory)) = (&self.catalog, &self.directory) else {
                    return self.check_role(role);
                };
                let publisher = Arc::new(Publisher::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.queue),
                    Arc::clone(catalog),
                    Arc::clone(directory),
                    self.config.clone(),
                    Arc::clone(&self.metrics),
                ));
                let shutdown = self.shutdown_token.clone();
                self.track("publisher", tokio::spawn(publisher.run(shutdown)))
                    .await;
            }
            Role::Reconciler => {
                let reconciler = Arc::new(Reconciler::new(
                    Arc::clone(&self.store),
                    self.config.clone(),
                    Arc::clone(&self.metrics),
                    Arc::clone(&self.alerts),
                ));
                let shutdown = self.shutdown_token.clone();
                self.track("reconciler", tokio::spawn(reconciler.run(shutdown)))
                    .await;
            }
            Role::Results => {
                let runner_results: Arc<dyn MessageHandler> = Arc::new(RunnerResultHandler::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.metrics),
                ));
                self.spawn_consumer("runner-results", &queue_config.runner_result_topic, runner_results)
                    .await;
                let summarizer_results: Arc<dyn MessageHandler> =
                    Arc::new(SummarizerResultHandler::new(
                        Arc::clone(&self.store),
                        Arc::clone(&self.metrics),
                    ));
                self.spawn_consumer(
                    "summarizer-results",
                    &queue_config.summarizer_result_topic,
                    summarizer_results,
                )
                .await;
            }
            Role::Worker => {
                let Some(engine) = &self.engine else {
                    return self.check_role(role);
                };
                let executor: Arc<dyn MessageHandler> = Arc::new(RunnerExecutor::new(
                    Arc::clone(&self.queue),
                    Arc::clone(engine),
                    Arc::clone(&self.findings),
                    queue_config.runner_result_topic.clone(),
                    worker_config.processing_timeout(),
                    Arc::clone(&self.metrics),
                ));
                for idx in 0..worker_config.runner_workers.max(1) {
                    self.spawn_consumer(
                        &format!("runner-{idx}"),
                        &queue_config.runner_topic,
                        Arc::clone(&executor),
                    )
                    .await;
                }
            }
            Role::Summarizer => {
                let executor: Arc<dyn MessageHandler> = Arc::new(SummarizerExecutor::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.queue),
                    queue_config.summarizer_result_topic.clone(),
                    self.config.retry.clone(),
                    worker_config.processing_timeout(),
                    Arc::clone(&self.metrics),
                ));
                self.spawn_consumer("summarizer", &queue_config.summarizer_topic, executor)
                    .await;
            }
            Role::Retention => {
                let sweeper = Arc::new(RetentionSweeper::new(
                    Arc::clone(&self.store),
                    self.config.retention.clone(),
                    Arc::clone(&self.metrics),
                ));
                let shutdown = self.shutdown_token.clone();
                self.track("retention", tokio::spawn(sweeper.run(shutdown)))
                    .await;
            }
        }
        Ok(())
    }

    async fn spawn_consumer(&self, name: &str, topic: &str, handler: Arc<dyn MessageHandler>) {
        let worker_id = format!("{}-{name}", self.instance);
        let worker = WorkerLoop::new(
            worker_id.clone(),
            Arc::clone(&self.queue),
            topic,
            handler,
            &self.config.worker,
        );
        let shutdown = self.shutdown_token.clone();
        self.track(&worker_id, tokio::spawn(worker.run(shutdown)))
            .await;
    }

    async fn track(&self, name: &str, handle: JoinHandle<()>) {
        self.handles.lock().await.push((name.to_string(), handle));
    }

    /// Cancel every loop and wait for in-flight work to settle.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "compliance::runtime", instance = %self.instance, "shutting down orchestrator runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for (name, handle) in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "compliance::runtime", task = %name, error = %err, "task failed"),
                Err(_) => warn!(target: "compliance::runtime", task = %name, "task did not stop in time"),
            }
        }

        info!(target: "compliance::runtime", instance = %self.instance, "orchestrator runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{
        catalog::StaticQueryEngine,
        memory_queue::InProcDispatchQueue,
        repository::InMemoryComplianceStore,
    };

    #[tokio::test]
    async fn worker_role_requires_an_engine() {
        let runtime = OrchestratorRuntime::builder(
            OrchestratorConfig::default(),
            Arc::new(InMemoryComplianceStore::new()),
            Arc::new(InProcDispatchQueue::default()),
        )
        .build();

        let err = runtime.start(&[Role::Results, Role::Worker]).await.unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidInput(_)));
        // nothing was spawned
        assert_eq!(runtime.handles.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_joins_every_task() -> Result<()> {
        let mut config = OrchestratorConfig::default();
        config.worker.runner_workers = 2;
        config.worker.poll_wait_ms = 10;
        let runtime = OrchestratorRuntime::builder(
            config,
            Arc::new(InMemoryComplianceStore::new()),
            Arc::new(InProcDispatchQueue::default()),
        )
        .with_engine(Arc::new(StaticQueryEngine::new()))
        .build();

        runtime
            .start(&[Role::Worker, Role::Results, Role::Summarizer, Role::Reconciler])
            .await?;
        // two runner loops, two result loops, summarizer, reconciler
        assert_eq!(runtime.handles.lock().await.len(), 6);

        runtime.shutdown().await?;
        assert!(runtime.handles.lock().await.is_empty());
        assert!(runtime.start(&[Role::Reconciler]).await.is_err());
        Ok(())
    }
}
