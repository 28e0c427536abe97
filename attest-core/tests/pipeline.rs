mod common;

use std::collections::HashSet;

use anyhow::Result;
use attest_core::{
    OrchestratorConfig, TriggerRequest,
    orchestration::{
        condition::{AlertRule, CompareOp, Condition},
        queue::{DispatchQueue, OutboundMessage},
        repository::{ReportStore, RunnerRepository, SummarizerRepository},
    },
};
use attest_model::{Connector, JobStatus, RunnerResult, RunnerStatus};
use chrono::Utc;
use common::{Pipeline, connection, let_clock_advance};

#[tokio::test]
async fn every_runner_succeeds_and_the_job_reports_the_total() -> Result<()> {
    let pipeline = Pipeline::new(OrchestratorConfig::default());
    let job = pipeline.service.trigger(TriggerRequest::manual("cis")).await?.job;

    let job = pipeline.run_until_terminal(job.id, 5).await?;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.failure_message, None);
    // q1 yields two rows and q2 one row on each of the three connections.
    assert_eq!(job.total_finding_count, Some(9));

    let runners = pipeline.store.list_runners_for_job(job.id).await?;
    assert_eq!(runners.len(), 6);
    assert!(runners.iter().all(|r| r.status == RunnerStatus::Succeeded));
    let pairs: HashSet<_> = runners
        .iter()
        .map(|r| (r.query_id.clone(), r.connection_id.clone()))
        .collect();
    assert_eq!(pairs.len(), 6);

    let summarizers = pipeline.store.list_summarizers_for_job(job.id).await?;
    assert_eq!(summarizers.len(), 1);
    assert_eq!(summarizers[0].status, RunnerStatus::Succeeded);

    let report = pipeline.store.get_report(job.id).await?.expect("report stored");
    assert_eq!(report.total_finding_count, 9);
    assert_eq!(report.succeeded_runners, 6);
    assert_eq!(report.findings_by_connection.get("c1"), Some(&3));

    assert_eq!(pipeline.sink.findings().await.len(), 9);
    assert_eq!(pipeline.engine.executions(), 6);
    let metrics = pipeline.service.metrics();
    assert_eq!(metrics.jobs_succeeded, 1);
    assert_eq!(metrics.runners_published, 6);
    Ok(())
}

#[tokio::test]
async fn runner_that_keeps_failing_is_retried_then_reported() -> Result<()> {
    let pipeline = Pipeline::new(OrchestratorConfig::default());
    pipeline.engine.fail("q1", Some("c1"), 3).await;
    let job = pipeline.service.trigger(TriggerRequest::manual("cis")).await?.job;

    let job = pipeline.run_until_terminal(job.id, 10).await?;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.total_finding_count, Some(7));
    let message = job.failure_message.expect("partial failure is reported");
    assert!(message.starts_with("1 of 6 runners did not succeed"));
    assert!(message.contains("query q1 failed on c1"));

    let runners = pipeline.store.list_runners_for_job(job.id).await?;
    let failed = runners
        .iter()
        .find(|r| r.query_id == "q1" && r.connection_id.as_deref() == Some("c1"))
        .expect("runner for q1 on c1");
    assert_eq!(failed.status, RunnerStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert_eq!(pipeline.service.metrics().runners_retried, 2);
    // Three attempts on the failing pair plus one for each other runner.
    assert_eq!(pipeline.engine.executions(), 8);
    Ok(())
}

#[tokio::test]
async fn runner_that_recovers_on_retry_counts_its_findings() -> Result<()> {
    let pipeline = Pipeline::new(OrchestratorConfig::default());
    pipeline.engine.fail("q2", Some("c3"), 1).await;
    let job = pipeline.service.trigger(TriggerRequest::manual("cis")).await?.job;

    let job = pipeline.run_until_terminal(job.id, 10).await?;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.total_finding_count, Some(9));
    assert_eq!(job.failure_message, None);
    Ok(())
}

#[tokio::test]
async fn silent_workers_cannot_hold_a_job_forever() -> Result<()> {
    let mut config = OrchestratorConfig::default();
    config.timeouts.queued_secs = 0;
    let pipeline = Pipeline::new(config);
    let job = pipeline.service.trigger(TriggerRequest::manual("cis")).await?.job;

    pipeline.tick_with_stalled_runners().await?;
    let mut current = pipeline.job(job.id).await?;
    for _ in 0..5 {
        if current.status.is_terminal() {
            break;
        }
        let_clock_advance().await;
        pipeline.tick_with_stalled_runners().await?;
        current = pipeline.job(job.id).await?;
    }

    assert_eq!(current.status, JobStatus::Succeeded);
    assert_eq!(current.total_finding_count, Some(0));
    assert!(
        current
            .failure_message
            .as_deref()
            .is_some_and(|m| m.starts_with("6 of 6 runners did not succeed"))
    );
    let runners = pipeline.store.list_runners_for_job(job.id).await?;
    assert!(runners.iter().all(|r| r.status == RunnerStatus::TimedOut));
    assert!(
        runners
            .iter()
            .all(|r| r.failure_message.as_deref() == Some("timed out while queued"))
    );
    assert_eq!(pipeline.engine.executions(), 0);
    Ok(())
}

#[tokio::test]
async fn job_past_its_deadline_times_out_and_stays_terminal() -> Result<()> {
    let mut config = OrchestratorConfig::default();
    config.timeouts.job_secs = 0;
    let pipeline = Pipeline::new(config);
    let job = pipeline.service.trigger(TriggerRequest::manual("cis")).await?.job;
    let_clock_advance().await;

    pipeline.tick().await?;
    pipeline.tick().await?;

    let job = pipeline.job(job.id).await?;
    assert_eq!(job.status, JobStatus::TimedOut);
    assert_eq!(job.failure_message.as_deref(), Some("Job timed out"));
    assert!(pipeline.store.list_runners_for_job(job.id).await?.is_empty());
    assert_eq!(pipeline.service.metrics().jobs_timed_out, 1);
    Ok(())
}

#[tokio::test]
async fn repeated_triggers_and_late_results_change_nothing() -> Result<()> {
    let pipeline = Pipeline::new(OrchestratorConfig::default());
    let first = pipeline
        .service
        .trigger(TriggerRequest::scheduled("cis").with_request_id("nightly-42"))
        .await?;
    let job = pipeline.run_until_terminal(first.job.id, 5).await?;

    let again = pipeline
        .service
        .trigger(TriggerRequest::scheduled("cis").with_request_id("nightly-42"))
        .await?;
    assert!(!again.created);
    assert_eq!(again.job.id, job.id);
    assert_eq!(again.job.status, JobStatus::Succeeded);

    // A stray failure for an already finished attempt arrives late.
    let runner = pipeline.store.list_runners_for_job(job.id).await?.remove(0);
    let late = RunnerResult::failed(runner.id, runner.retry_count, Utc::now(), "late failure");
    pipeline
        .queue
        .publish(
            &pipeline.config.queue.runner_result_topic,
            OutboundMessage::json("late-result", &late)?,
        )
        .await?;
    pipeline.tick().await?;

    let runner = pipeline
        .store
        .get_runner(runner.id)
        .await?
        .expect("runner still present");
    assert_eq!(runner.status, RunnerStatus::Succeeded);
    let job = pipeline.job(job.id).await?;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.total_finding_count, Some(9));
    assert_eq!(pipeline.service.metrics().results_ignored, 1);
    Ok(())
}

#[tokio::test]
async fn small_batches_still_finish_every_job() -> Result<()> {
    let mut config = OrchestratorConfig::default();
    config.publisher.batch_size = 2;
    config.publisher.max_batches_per_cycle = 1;
    let connections = (0..5)
        .map(|idx| connection(&format!("c{idx}"), Connector::Aws))
        .collect();
    let pipeline = Pipeline::with_connections(config, connections);

    let scheduled = pipeline.service.trigger(TriggerRequest::scheduled("cis")).await?.job;
    let manual = pipeline
        .service
        .trigger(TriggerRequest::manual("cis").with_connections(vec!["c0".into()]))
        .await?
        .job;

    let mut finished = false;
    for _ in 0..20 {
        pipeline.tick().await?;
        let both = [
            pipeline.job(scheduled.id).await?,
            pipeline.job(manual.id).await?,
        ];
        if both.iter().all(|job| job.status == JobStatus::Succeeded) {
            finished = true;
            break;
        }
    }

    assert!(finished, "both jobs should finish under a two-runner budget");
    assert_eq!(pipeline.job(scheduled.id).await?.total_finding_count, Some(15));
    assert_eq!(pipeline.job(manual.id).await?.total_finding_count, Some(3));
    Ok(())
}

#[tokio::test]
async fn matching_alert_rule_fires_once_per_job() -> Result<()> {
    let mut config = OrchestratorConfig::default();
    config.alerts = vec![
        AlertRule {
            name: "many-findings".into(),
            benchmark_id: Some("cis".into()),
            condition: Condition::Compare {
                op: CompareOp::Ge,
                value: 5,
            },
        },
        AlertRule {
            name: "other-benchmark".into(),
            benchmark_id: Some("pci".into()),
            condition: Condition::Compare {
                op: CompareOp::Ge,
                value: 0,
            },
        },
    ];
    let pipeline = Pipeline::new(config);
    let job = pipeline.service.trigger(TriggerRequest::manual("cis")).await?.job;

    pipeline.run_until_terminal(job.id, 5).await?;
    pipeline.tick().await?;

    let alerts = pipeline.alerts.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule, "many-findings");
    assert_eq!(alerts[0].job_id, job.id);
    assert_eq!(alerts[0].total_finding_count, 9);
    Ok(())
}
