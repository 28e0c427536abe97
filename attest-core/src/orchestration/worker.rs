//! Queue consumers.
//!
//! [`WorkerLoop`] pulls deliveries from one topic and hands each to a
//! [`MessageHandler`] on its own task, bounded by a semaphore. The handler
//! decides whether the delivery is acked or nacked. [`RunnerExecutor`] is the
//! handler that executes runner jobs.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use attest_model::{
    ComplianceResult, Finding, QueryOutput, RunnerId, RunnerJob, RunnerResult,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    catalog::{FindingsSink, QueryEngine},
    config::WorkerConfig,
    metrics::OrchestratorMetrics,
    queue::{Delivery, DispatchQueue, OutboundMessage},
};
use crate::error::Result;

/// How a handled delivery is settled with the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Redeliver; used when the outcome could not be recorded.
    Nack,
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle(&self, delivery: &Delivery) -> Settlement;
}

pub struct WorkerLoop {
    worker_id: String,
    queue: Arc<dyn DispatchQueue>,
    topic: String,
    handler: Arc<dyn MessageHandler>,
    max_in_flight: usize,
    poll_wait: Duration,
}

impl fmt::Debug for WorkerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("worker_id", &self.worker_id)
            .field("topic", &self.topic)
            .field("handler", &self.handler.name())
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

impl WorkerLoop {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<dyn DispatchQueue>,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            topic: topic.into(),
            handler,
            max_in_flight: config.max_in_flight.max(1),
            poll_wait: config.poll_wait(),
        }
    }

    /// Consume until `shutdown` fires, then wait for in-flight messages.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            target: "compliance::worker",
            worker_id = %self.worker_id,
            topic = %self.topic,
            handler = self.handler.name(),
            max_in_flight = self.max_in_flight,
            "worker started"
        );
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(&self.topic, self.poll_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let queue = Arc::clone(&self.queue);
                    let handler = Arc::clone(&self.handler);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        settle(queue.as_ref(), handler.as_ref(), delivery).await;
                    });
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    drop(permit);
                    warn!(
                        target: "compliance::worker",
                        worker_id = %self.worker_id,
                        error = %err,
                        "receive failed; backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_wait) => {}
                    }
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(err) = joined {
                    error!(target: "compliance::worker", error = %err, "message task panicked");
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!(target: "compliance::worker", worker_id = %self.worker_id, "worker stopped");
    }

    /// Handle at most one delivery inline. Returns whether one was handled.
    pub async fn poll_once(&self, wait: Duration) -> Result<bool> {
        match self.queue.receive(&self.topic, wait).await? {
            Some(delivery) => {
                settle(self.queue.as_ref(), self.handler.as_ref(), delivery).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handle deliveries inline until the topic is empty.
    pub async fn drain(&self) -> Result<u64> {
        let mut handled = 0;
        while self.poll_once(Duration::ZERO).await? {
            handled += 1;
        }
        Ok(handled)
    }
}

async fn settle(queue: &dyn DispatchQueue, handler: &dyn MessageHandler, delivery: Delivery) {
    let settled = match handler.handle(&delivery).await {
        Settlement::Ack => queue.ack(&delivery.receipt).await,
        Settlement::Nack => queue.nack(&delivery.receipt).await,
    };
    if let Err(err) = settled {
        warn!(
            target: "compliance::worker",
            key = %delivery.key,
            error = %err,
            "failed to settle delivery; it will be redelivered"
        );
    }
}

/// Publish a result message. Encoding failures cannot be retried and are
/// acked after logging; queue failures are nacked so the work is redone.
pub(crate) async fn publish_result<T: serde::Serialize + Sync>(
    queue: &dyn DispatchQueue,
    topic: &str,
    key: String,
    result: &T,
) -> Settlement {
    let message = match OutboundMessage::json(key, result) {
        Ok(message) => message,
        Err(err) => {
            error!(
                target: "compliance::worker",
                topic,
                error = %err,
                "result could not be encoded; dropping"
            );
            return Settlement::Ack;
        }
    };
    match queue.publish(topic, message).await {
        Ok(_) => Settlement::Ack,
        Err(err) => {
            warn!(
                target: "compliance::worker",
                topic,
                error = %err,
                "result publish failed; message will be redelivered"
            );
            Settlement::Nack
        }
    }
}

pub(crate) fn result_key(kind: &str, id: impl fmt::Display, retry_count: u32, status: &str) -> String {
    format!("{kind}-result-{id}-{retry_count}-{}", status.to_ascii_lowercase())
}

/// Identity fields that can still be read from a payload that failed to
/// decode as a full runner job.
#[derive(Deserialize)]
struct RunnerIdentity {
    runner_id: RunnerId,
    #[serde(default)]
    retry_count: u32,
}

/// Executes runner jobs against the query engine and reports results.
pub struct RunnerExecutor {
    queue: Arc<dyn DispatchQueue>,
    engine: Arc<dyn QueryEngine>,
    sink: Arc<dyn FindingsSink>,
    result_topic: String,
    processing_timeout: Duration,
    metrics: Arc<OrchestratorMetrics>,
}

impl fmt::Debug for RunnerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerExecutor")
            .field("result_topic", &self.result_topic)
            .field("processing_timeout", &self.processing_timeout)
            .finish_non_exhaustive()
    }
}

impl RunnerExecutor {
    pub fn new(
        queue: Arc<dyn DispatchQueue>,
        engine: Arc<dyn QueryEngine>,
        sink: Arc<dyn FindingsSink>,
        result_topic: impl Into<String>,
        processing_timeout: Duration,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            queue,
            engine,
            sink,
            result_topic: result_topic.into(),
            processing_timeout,
            metrics,
        }
    }

    async fn execute(&self, job: &RunnerJob) -> Result<i64> {
        let output = self.engine.execute(job).await?;
        let findings = extract_findings(job, &output);
        let count = findings.len();
        if !findings.is_empty() {
            self.sink.ingest(findings).await?;
        }
        OrchestratorMetrics::add(&self.metrics.findings_ingested, count as u64);
        Ok(count as i64)
    }

    async fn report(&self, result: &RunnerResult) -> Settlement {
        let key = result_key("runner", result.runner_id, result.retry_count, result.status.as_str());
        publish_result(self.queue.as_ref(), &self.result_topic, key, result).await
    }
}

#[async_trait]
impl MessageHandler for RunnerExecutor {
    fn name(&self) -> &'static str {
        "runner"
    }

    async fn handle(&self, delivery: &Delivery) -> Settlement {
        let started_at = Utc::now();
        let job: RunnerJob = match delivery.decode() {
            Ok(job) => job,
            Err(err) => {
                OrchestratorMetrics::incr(&self.metrics.worker_failures);
                warn!(
                    target: "compliance::worker",
                    key = %delivery.key,
                    error = %err,
                    "malformed runner job"
                );
                if let Ok(identity) = serde_json::from_slice::<RunnerIdentity>(&delivery.payload) {
                    let result = RunnerResult::failed(
                        identity.runner_id,
                        identity.retry_count,
                        started_at,
                        format!("malformed runner job: {err}"),
                    );
                    self.report(&result).await;
                }
                return Settlement::Ack;
            }
        };

        OrchestratorMetrics::incr(&self.metrics.worker_executions);
        let progress = RunnerResult::in_progress(job.runner_id, job.retry_count, started_at);
        if self.report(&progress).await == Settlement::Nack {
            debug!(
                target: "compliance::worker",
                runner_id = %job.runner_id,
                "progress update not published"
            );
        }

        let result = match tokio::time::timeout(self.processing_timeout, self.execute(&job)).await
        {
            Ok(Ok(count)) => RunnerResult::succeeded(job.runner_id, job.retry_count, started_at, count),
            Ok(Err(err)) => {
                OrchestratorMetrics::incr(&self.metrics.worker_failures);
                RunnerResult::failed(job.runner_id, job.retry_count, started_at, err.to_string())
            }
            Err(_) => {
                OrchestratorMetrics::incr(&self.metrics.worker_deadline_exceeded);
                RunnerResult::failed(
                    job.runner_id,
                    job.retry_count,
                    started_at,
                    format!(
                        "processing deadline of {}ms exceeded",
                        self.processing_timeout.as_millis()
                    ),
                )
            }
        };

        debug!(
            target: "compliance::worker",
            runner_id = %job.runner_id,
            retry_count = job.retry_count,
            status = %result.status,
            findings = result.total_finding_count.unwrap_or(0),
            "runner job finished"
        );
        self.report(&result).await
    }
}

/// One finding per output row per caller.
pub fn extract_findings(job: &RunnerJob, output: &QueryOutput) -> Vec<Finding> {
    let evaluated_at = Utc::now();
    let mut findings = Vec::with_capacity(output.rows.len() * job.callers.len());
    for row in &output.rows {
        let status = output
            .text(row, "status")
            .map(|raw| ComplianceResult::parse_lenient(&raw))
            .unwrap_or(ComplianceResult::Info);
        let resource_id = output
            .text(row, "resource")
            .or_else(|| output.text(row, "resource_id"));
        let resource_name = output
            .text(row, "name")
            .or_else(|| output.text(row, "title"));
        let resource_type = output.text(row, "resource_type");
        let resource_location = output
            .text(row, "region")
            .or_else(|| output.text(row, "location"));
        let reason = output.text(row, "reason");

        for caller in &job.callers {
            findings.push(Finding {
                job_id: job.parent_job_id,
                runner_id: job.runner_id,
                query_id: job.query.id.clone(),
                connection_id: job.connection_id.clone(),
                benchmark_id: caller.root_benchmark.clone(),
                parent_benchmark_ids: caller.parent_benchmark_ids.clone(),
                policy_id: caller.policy_id.clone(),
                severity: caller.severity,
                resource_id: resource_id.clone(),
                resource_name: resource_name.clone(),
                resource_type: resource_type.clone(),
                resource_location: resource_location.clone(),
                reason: reason.clone(),
                status,
                evaluated_at,
            });
        }
    }
    findings
}
