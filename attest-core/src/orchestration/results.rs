//! Result consumer.
//!
//! Applies runner and summarizer results to their rows. A result that no
//! longer applies (stale attempt, row already terminal) is acknowledged and
//! dropped; only transient store failures cause redelivery.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use attest_model::{RunnerResult, SummarizerResult};
use tracing::{debug, error, warn};

use super::{
    metrics::OrchestratorMetrics,
    queue::Delivery,
    repository::{ApplyOutcome, ComplianceStore},
    worker::{MessageHandler, Settlement},
};
use crate::error::Result;

fn record(metrics: &OrchestratorMetrics, outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Applied => OrchestratorMetrics::incr(&metrics.results_applied),
        _ => OrchestratorMetrics::incr(&metrics.results_ignored),
    }
}

fn settle_apply(outcome: Result<ApplyOutcome>, key: &str, metrics: &OrchestratorMetrics) -> Settlement {
    match outcome {
        Ok(outcome) => {
            record(metrics, outcome);
            if outcome != ApplyOutcome::Applied {
                debug!(
                    target: "compliance::results",
                    key,
                    outcome = outcome.as_str(),
                    "result ignored"
                );
            }
            Settlement::Ack
        }
        Err(err) if err.is_transient() => {
            warn!(
                target: "compliance::results",
                key,
                error = %err,
                "failed to apply result; will be redelivered"
            );
            Settlement::Nack
        }
        Err(err) => {
            OrchestratorMetrics::incr(&metrics.results_ignored);
            error!(
                target: "compliance::results",
                key,
                error = %err,
                "dropping result that cannot be applied"
            );
            Settlement::Ack
        }
    }
}

pub struct RunnerResultHandler {
    store: Arc<dyn ComplianceStore>,
    metrics: Arc<OrchestratorMetrics>,
}

impl fmt::Debug for RunnerResultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerResultHandler")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl RunnerResultHandler {
    pub fn new(store: Arc<dyn ComplianceStore>, metrics: Arc<OrchestratorMetrics>) -> Self {
        Self { store, metrics }
    }
}

#[async_trait]
impl MessageHandler for RunnerResultHandler {
    fn name(&self) -> &'static str {
        "runner-result"
    }

    async fn handle(&self, delivery: &Delivery) -> Settlement {
        let result: RunnerResult = match delivery.decode() {
            Ok(result) => result,
            Err(err) => {
                OrchestratorMetrics::incr(&self.metrics.results_malformed);
                warn!(
                    target: "compliance::results",
                    key = %delivery.key,
                    error = %err,
                    "dropping malformed runner result"
                );
                return Settlement::Ack;
            }
        };
        let outcome = self.store.apply_runner_result(&result).await;
        settle_apply(outcome, &delivery.key, &self.metrics)
    }
}

pub struct SummarizerResultHandler {
    store: Arc<dyn ComplianceStore>,
    metrics: Arc<OrchestratorMetrics>,
}

impl fmt::Debug for SummarizerResultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummarizerResultHandler")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl SummarizerResultHandler {
    pub fn new(store: Arc<dyn ComplianceStore>, metrics: Arc<OrchestratorMetrics>) -> Self {
        Self { store, metrics }
    }
}

#[async_trait]
impl MessageHandler for SummarizerResultHandler {
    fn name(&self) -> &'static str {
        "summarizer-result"
    }

    async fn handle(&self, delivery: &Delivery) -> Settlement {
        let result: SummarizerResult = match delivery.decode() {
            Ok(result) => result,
            Err(err) => {
                OrchestratorMetrics::incr(&self.metrics.results_malformed);
                warn!(
                    target: "compliance::results",
                    key = %delivery.key,
                    error = %err,
                    "dropping malformed summarizer result"
                );
                return Settlement::Ack;
            }
        };
        let outcome = self.store.apply_summarizer_result(&result).await;
        settle_apply(outcome, &delivery.key, &self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComplianceError;
    use crate::orchestration::{
        config::WorkerConfig,
        memory_queue::InProcDispatchQueue,
        queue::{DispatchQueue, OutboundMessage},
        repository::{InMemoryComplianceStore, JobRepository, RunnerRepository},
        worker::WorkerLoop,
    };
    use attest_model::{ComplianceJob, JobScope, RunnerRecord, RunnerStatus, TriggerType};
    use chrono::Utc;
    use std::time::Duration;

    const TOPIC: &str = "results";

    struct Fixture {
        store: Arc<InMemoryComplianceStore>,
        queue: Arc<InProcDispatchQueue>,
        metrics: Arc<OrchestratorMetrics>,
        consumer: WorkerLoop,
        runner: RunnerRecord,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryComplianceStore::new());
        let queue = Arc::new(InProcDispatchQueue::default());
        let metrics = Arc::new(OrchestratorMetrics::new());
        let job = ComplianceJob::new("bench", JobScope::default(), TriggerType::Manual, None);
        store.create_job(&job).await.unwrap();
        let runner = RunnerRecord::new(job.id, "q1", Some("c1".into()), vec![]);
        store
            .insert_runners_for_job(job.id, std::slice::from_ref(&runner))
            .await
            .unwrap();
        store.mark_runner_queued(runner.id, 0).await.unwrap();

        let handler = RunnerResultHandler::new(store.clone(), metrics.clone());
        let consumer = WorkerLoop::new(
            "results-0",
            queue.clone(),
            TOPIC,
            Arc::new(handler),
            &WorkerConfig::default(),
        );
        Fixture {
            store,
            queue,
            metrics,
            consumer,
            runner,
        }
    }

    async fn send(queue: &InProcDispatchQueue, key: &str, result: &RunnerResult) {
        queue
            .publish(TOPIC, OutboundMessage::json(key, result).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn progress_then_success_is_applied() -> Result<()> {
        let fx = fixture().await;
        let started = Utc::now();
        send(&fx.queue, "p", &RunnerResult::in_progress(fx.runner.id, 0, started)).await;
        send(&fx.queue, "s", &RunnerResult::succeeded(fx.runner.id, 0, started, 4)).await;

        assert_eq!(fx.consumer.drain().await?, 2);

        let runner = fx.store.get_runner(fx.runner.id).await?.unwrap();
        assert_eq!(runner.status, RunnerStatus::Succeeded);
        assert_eq!(runner.total_finding_count, Some(4));
        assert_eq!(runner.started_at, Some(started));
        assert_eq!(fx.metrics.snapshot().results_applied, 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_result_increments_retry_count() -> Result<()> {
        let fx = fixture().await;
        send(&fx.queue, "f", &RunnerResult::failed(fx.runner.id, 0, Utc::now(), "boom")).await;
        fx.consumer.drain().await?;

        let runner = fx.store.get_runner(fx.runner.id).await?.unwrap();
        assert_eq!(runner.status, RunnerStatus::Failed);
        assert_eq!(runner.retry_count, 1);
        assert_eq!(runner.failure_message.as_deref(), Some("boom"));
        Ok(())
    }

    #[tokio::test]
    async fn stale_and_late_results_are_acked_without_effect() -> Result<()> {
        let fx = fixture().await;
        let started = Utc::now();
        // result of an attempt that is no longer current
        send(&fx.queue, "old", &RunnerResult::succeeded(fx.runner.id, 3, started, 9)).await;
        send(&fx.queue, "ok", &RunnerResult::succeeded(fx.runner.id, 0, started, 1)).await;
        // redelivered progress after the terminal result
        send(&fx.queue, "late", &RunnerResult::in_progress(fx.runner.id, 0, started)).await;

        fx.consumer.drain().await?;

        let runner = fx.store.get_runner(fx.runner.id).await?.unwrap();
        assert_eq!(runner.status, RunnerStatus::Succeeded);
        assert_eq!(runner.total_finding_count, Some(1));
        let snapshot = fx.metrics.snapshot();
        assert_eq!(snapshot.results_applied, 1);
        assert_eq!(snapshot.results_ignored, 2);
        assert_eq!(fx.queue.depth(TOPIC).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_result_is_dropped() -> Result<()> {
        let fx = fixture().await;
        fx.queue
            .publish(
                TOPIC,
                OutboundMessage {
                    key: "junk".into(),
                    payload: b"{not json".to_vec(),
                },
            )
            .await?;

        assert!(fx.consumer.poll_once(Duration::ZERO).await?);
        assert_eq!(fx.metrics.snapshot().results_malformed, 1);
        assert_eq!(fx.queue.depth(TOPIC).await?, 0);
        Ok(())
    }

    #[test]
    fn only_transient_store_errors_are_redelivered() {
        let metrics = OrchestratorMetrics::new();
        let busy = Err(ComplianceError::Queue("connection reset".into()));
        assert_eq!(settle_apply(busy, "r", &metrics), Settlement::Nack);
        assert_eq!(metrics.snapshot().results_ignored, 0);

        let corrupt = Err(ComplianceError::Internal("unreadable row".into()));
        assert_eq!(settle_apply(corrupt, "r", &metrics), Settlement::Ack);
        assert_eq!(metrics.snapshot().results_ignored, 1);
    }

    #[tokio::test]
    async fn unknown_summarizer_result_is_ignored() -> Result<()> {
        let store = Arc::new(InMemoryComplianceStore::new());
        let metrics = Arc::new(OrchestratorMetrics::new());
        let handler = SummarizerResultHandler::new(store, metrics.clone());

        let result = SummarizerResult::succeeded(attest_model::SummarizerId::new(), 0, Utc::now());
        let queue = InProcDispatchQueue::default();
        queue.publish(TOPIC, OutboundMessage::json("s", &result)?).await?;
        let delivery = queue.receive(TOPIC, Duration::ZERO).await?.unwrap();

        assert_eq!(handler.handle(&delivery).await, Settlement::Ack);
        assert_eq!(metrics.snapshot().results_ignored, 1);
        Ok(())
    }
}
