//! PostgreSQL implementation of the repository ports.
//!
//! Every transition is a single conditional `UPDATE` (or a short transaction
//! when a row has to be read before it is changed), so concurrent processes
//! can issue the same transition and only one of them wins.

use std::fmt;

use async_trait::async_trait;
use attest_model::{
    Caller, ComplianceJob, Connector, JobId, JobReport, JobScope, JobStatus, RunnerId,
    RunnerRecord, RunnerResult, RunnerStatus, SummarizerId, SummarizerRecord, SummarizerResult,
    TriggerType,
};
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, PgPool, Postgres, QueryBuilder, Transaction, postgres::PgPoolOptions, types::Json,
};
use tracing::info;
use uuid::Uuid;

use super::{
    config::{RetryConfig, TimeoutConfig},
    repository::{
        ApplyOutcome, JobFilter, JobRepository, ReportStore, RunnerRepository,
        SummarizerRepository, next_status,
    },
};
use crate::error::{ComplianceError, Result};

const JOB_COLUMNS: &str = "id, benchmark_id, connection_ids, connector, status, \
    are_all_runners_queued, trigger_type, external_request_id, total_finding_count, \
    failure_message, created_at, updated_at";

const RUNNER_COLUMNS: &str = "id, parent_job_id, query_id, connection_id, callers, status, \
    retry_count, publish_failure_count, total_finding_count, failure_message, queued_at, \
    started_at, created_at, updated_at";

const SUMMARIZER_COLUMNS: &str = "id, parent_job_id, status, retry_count, \
    publish_failure_count, failure_message, queued_at, started_at, created_at, updated_at";

/// Rows per multi-row `INSERT`; ten binds each keeps a statement under the
/// 65535 bind parameter limit.
const INSERT_CHUNK_ROWS: usize = 5_000;

const NON_TERMINAL_JOB: &str =
    "status IN ('CREATED', 'RUNNERS_IN_PROGRESS', 'SINK_IN_PROGRESS', 'SUMMARIZER_IN_PROGRESS')";

/// SQL predicate for "this unit will never run again". `$retries` and
/// `$publish` are the positional parameters holding the two budgets.
fn done_predicate(alias: &str, retries: u8, publish: u8) -> String {
    format!(
        "({alias}.status IN ('SUCCEEDED', 'TIMED_OUT') OR ({alias}.status = 'FAILED' AND \
         ({alias}.retry_count >= ${retries} OR {alias}.publish_failure_count >= ${publish})))"
    )
}

fn fan_in_complete(job: &str) -> String {
    format!(
        "{job}.status IN ('RUNNERS_IN_PROGRESS', 'SINK_IN_PROGRESS') \
         AND {job}.are_all_runners_queued \
         AND NOT EXISTS (SELECT 1 FROM compliance_runners r \
                         WHERE r.parent_job_id = {job}.id AND NOT {})",
        done_predicate("r", 1, 2)
    )
}

fn budget(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

fn conflict_or(err: sqlx::Error, what: impl FnOnce() -> String) -> ComplianceError {
    let unique_violation = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505");
    if unique_violation {
        ComplianceError::Conflict(what())
    } else {
        ComplianceError::Database(err)
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    benchmark_id: String,
    connection_ids: Vec<String>,
    connector: Option<String>,
    status: String,
    are_all_runners_queued: bool,
    trigger_type: String,
    external_request_id: Option<String>,
    total_finding_count: Option<i64>,
    failure_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ComplianceJob {
    type Error = ComplianceError;

    fn try_from(row: JobRow) -> Result<Self> {
        let connector = row
            .connector
            .as_deref()
            .map(str::parse::<Connector>)
            .transpose()?;
        Ok(ComplianceJob {
            id: JobId(row.id),
            benchmark_id: row.benchmark_id,
            scope: JobScope {
                connection_ids: row.connection_ids,
                connector,
            },
            status: row.status.parse::<JobStatus>()?,
            are_all_runners_queued: row.are_all_runners_queued,
            trigger_type: row.trigger_type.parse::<TriggerType>()?,
            external_request_id: row.external_request_id,
            total_finding_count: row.total_finding_count,
            failure_message: row.failure_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct RunnerRow {
    id: Uuid,
    parent_job_id: Uuid,
    query_id: String,
    connection_id: Option<String>,
    callers: Json<Vec<Caller>>,
    status: String,
    retry_count: i32,
    publish_failure_count: i32,
    total_finding_count: Option<i64>,
    failure_message: Option<String>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunnerRow> for RunnerRecord {
    type Error = ComplianceError;

    fn try_from(row: RunnerRow) -> Result<Self> {
        Ok(RunnerRecord {
            id: RunnerId(row.id),
            parent_job_id: JobId(row.parent_job_id),
            query_id: row.query_id,
            connection_id: row.connection_id,
            callers: row.callers.0,
            status: row.status.parse::<RunnerStatus>()?,
            retry_count: count(row.retry_count),
            publish_failure_count: count(row.publish_failure_count),
            total_finding_count: row.total_finding_count,
            failure_message: row.failure_message,
            queued_at: row.queued_at,
            started_at: row.started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SummarizerRow {
    id: Uuid,
    parent_job_id: Uuid,
    status: String,
    retry_count: i32,
    publish_failure_count: i32,
    failure_message: Option<String>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SummarizerRow> for SummarizerRecord {
    type Error = ComplianceError;

    fn try_from(row: SummarizerRow) -> Result<Self> {
        Ok(SummarizerRecord {
            id: SummarizerId(row.id),
            parent_job_id: JobId(row.parent_job_id),
            status: row.status.parse::<RunnerStatus>()?,
            retry_count: count(row.retry_count),
            publish_failure_count: count(row.publish_failure_count),
            failure_message: row.failure_message,
            queued_at: row.queued_at,
            started_at: row.started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = ComplianceError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Current state of a unit row, read under lock before applying a result.
#[derive(FromRow)]
struct UnitState {
    status: String,
    retry_count: i32,
}

#[derive(Clone)]
pub struct PostgresComplianceStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresComplianceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresComplianceStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresComplianceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| ComplianceError::Internal(format!("migration failed: {e}")))?;
        info!(target: "compliance::persistence", "database migrations applied");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ComplianceError::Internal(format!("database health check failed: {e}")))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| ComplianceError::Internal(format!("begin transaction failed: {e}")))
    }

    async fn fetch_jobs(&self, sql: &str, retry: &RetryConfig) -> Result<Vec<ComplianceJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(sql)
            .bind(budget(retry.max_retries))
            .bind(budget(retry.max_publish_failures))
            .fetch_all(&self.pool)
            .await?;
        convert(rows)
    }
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|e| ComplianceError::Internal(format!("transaction commit failed: {e}")))
}

#[async_trait]
impl JobRepository for PostgresComplianceStore {
    async fn create_job(&self, job: &ComplianceJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO compliance_jobs (id, benchmark_id, connection_ids, connector, status, \
             are_all_runners_queued, trigger_type, external_request_id, total_finding_count, \
             failure_message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(job.id.to_uuid())
        .bind(&job.benchmark_id)
        .bind(&job.scope.connection_ids)
        .bind(job.scope.connector.map(|c| c.as_str()))
        .bind(job.status.as_str())
        .bind(job.are_all_runners_queued)
        .bind(job.trigger_type.as_str())
        .bind(job.external_request_id.as_deref())
        .bind(job.total_finding_count)
        .bind(job.failure_message.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| conflict_or(err, || format!("job {} conflicts with an existing job", job.id)))?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ComplianceJob>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM compliance_jobs WHERE id = $1"))
                .bind(id.to_uuid())
                .fetch_optional(&self.pool)
                .await?;
        row.map(ComplianceJob::try_from).transpose()
    }

    async fn find_job_by_request_id(&self, request_id: &str) -> Result<Option<ComplianceJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM compliance_jobs WHERE external_request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ComplianceJob::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ComplianceJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM compliance_jobs \
             WHERE ($1::TEXT IS NULL OR status = $1) \
               AND ($2::TEXT IS NULL OR benchmark_id = $2) \
             ORDER BY created_at DESC \
             LIMIT $3"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.benchmark_id.as_deref())
        .bind(filter.limit.map(|limit| limit as i64))
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn list_jobs_with_unqueued_runners(&self, limit: usize) -> Result<Vec<ComplianceJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM compliance_jobs \
             WHERE NOT are_all_runners_queued \
               AND status IN ('CREATED', 'RUNNERS_IN_PROGRESS') \
             ORDER BY random() \
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn advance_jobs_with_runners(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE compliance_jobs j \
             SET status = 'RUNNERS_IN_PROGRESS', updated_at = NOW() \
             WHERE j.status = 'CREATED' \
               AND EXISTS (SELECT 1 FROM compliance_runners r WHERE r.parent_job_id = j.id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_jobs_ready_for_summarization(
        &self,
        retry: &RetryConfig,
    ) -> Result<Vec<ComplianceJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM compliance_jobs j WHERE {} \
             ORDER BY (j.trigger_type = 'MANUAL') DESC, j.created_at",
            fan_in_complete("j")
        );
        self.fetch_jobs(&sql, retry).await
    }

    async fn list_jobs_ready_to_finish(&self, retry: &RetryConfig) -> Result<Vec<ComplianceJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM compliance_jobs j \
             WHERE j.status = 'SUMMARIZER_IN_PROGRESS' \
               AND EXISTS (SELECT 1 FROM compliance_summarizers s WHERE s.parent_job_id = j.id) \
               AND NOT EXISTS (SELECT 1 FROM compliance_summarizers s \
                               WHERE s.parent_job_id = j.id AND NOT {}) \
             ORDER BY (j.trigger_type = 'MANUAL') DESC, j.created_at",
            done_predicate("s", 1, 2)
        );
        self.fetch_jobs(&sql, retry).await
    }

    async fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        total_finding_count: i64,
        failure_message: Option<String>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(ComplianceError::InvalidInput(format!(
                "{status} is not a terminal job status"
            )));
        }
        let result = sqlx::query(
            "UPDATE compliance_jobs \
             SET status = $2, total_finding_count = $3, failure_message = $4, updated_at = NOW() \
             WHERE id = $1 AND status = 'SUMMARIZER_IN_PROGRESS'",
        )
        .bind(id.to_uuid())
        .bind(status.as_str())
        .bind(total_finding_count)
        .bind(failure_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(&self, id: JobId, message: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE compliance_jobs \
             SET status = 'FAILED', failure_message = $2, updated_at = NOW() \
             WHERE id = $1 AND {NON_TERMINAL_JOB}"
        ))
        .bind(id.to_uuid())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_timed_out_jobs(&self, max_age: chrono::Duration) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE compliance_jobs \
             SET status = 'TIMED_OUT', failure_message = 'Job timed out', updated_at = NOW() \
             WHERE {NON_TERMINAL_JOB} AND created_at < $1"
        ))
        .bind(Utc::now() - max_age)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM compliance_jobs WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RunnerRepository for PostgresComplianceStore {
    async fn insert_runners_for_job(&self, job_id: JobId, runners: &[RunnerRecord]) -> Result<()> {
        let mut tx = self.begin().await?;

        let expanded: Option<bool> = sqlx::query_scalar(
            "SELECT are_all_runners_queued FROM compliance_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id.to_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        match expanded {
            None => return Err(ComplianceError::NotFound(format!("job {job_id}"))),
            Some(true) => {
                return Err(ComplianceError::Conflict(format!(
                    "runners for job {job_id} already created"
                )));
            }
            Some(false) => {}
        }

        for chunk in runners.chunks(INSERT_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO compliance_runners (id, parent_job_id, query_id, connection_id, \
                 callers, status, retry_count, publish_failure_count, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, runner| {
                row.push_bind(runner.id.to_uuid())
                    .push_bind(job_id.to_uuid())
                    .push_bind(&runner.query_id)
                    .push_bind(runner.connection_id.as_deref())
                    .push_bind(Json(&runner.callers))
                    .push_bind(runner.status.as_str())
                    .push_bind(budget(runner.retry_count))
                    .push_bind(budget(runner.publish_failure_count))
                    .push_bind(runner.created_at)
                    .push_bind(runner.updated_at);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|err| {
                    conflict_or(err, || format!("runners for job {job_id} already exist"))
                })?;
        }

        sqlx::query(
            "UPDATE compliance_jobs SET are_all_runners_queued = TRUE, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id.to_uuid())
        .execute(&mut *tx)
        .await?;

        commit(tx).await
    }

    async fn get_runner(&self, id: RunnerId) -> Result<Option<RunnerRecord>> {
        let row: Option<RunnerRow> = sqlx::query_as(&format!(
            "SELECT {RUNNER_COLUMNS} FROM compliance_runners WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunnerRecord::try_from).transpose()
    }

    async fn list_runners_for_job(&self, job_id: JobId) -> Result<Vec<RunnerRecord>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "SELECT {RUNNER_COLUMNS} FROM compliance_runners WHERE parent_job_id = $1 ORDER BY id"
        ))
        .bind(job_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn list_runners_created(&self, limit: usize) -> Result<Vec<RunnerRecord>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "SELECT {RUNNER_COLUMNS} FROM compliance_runners \
             WHERE status = 'CREATED' ORDER BY random() LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn count_not_done_runners_for_job(
        &self,
        job_id: JobId,
        retry: &RetryConfig,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM compliance_runners r WHERE r.parent_job_id = $3 AND NOT {}",
            done_predicate("r", 1, 2)
        ))
        .bind(budget(retry.max_retries))
        .bind(budget(retry.max_publish_failures))
        .bind(job_id.to_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn mark_runner_queued(&self, id: RunnerId, retry_count: u32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE compliance_runners \
             SET status = 'QUEUED', queued_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'CREATED' AND retry_count = $2",
        )
        .bind(id.to_uuid())
        .bind(budget(retry_count))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_runner_publish_failed(
        &self,
        id: RunnerId,
        retry_count: u32,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE compliance_runners \
             SET status = 'FAILED', publish_failure_count = publish_failure_count + 1, \
                 failure_message = $3, updated_at = NOW() \
             WHERE id = $1 AND status = 'CREATED' AND retry_count = $2",
        )
        .bind(id.to_uuid())
        .bind(budget(retry_count))
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_runner_result(&self, result: &RunnerResult) -> Result<ApplyOutcome> {
        let mut tx = self.begin().await?;
        let current: Option<UnitState> = sqlx::query_as(
            "SELECT status, retry_count FROM compliance_runners WHERE id = $1 FOR UPDATE",
        )
        .bind(result.runner_id.to_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = current else {
            return Ok(ApplyOutcome::Unknown);
        };
        let next = match next_status(
            current.status.parse::<RunnerStatus>()?,
            count(current.retry_count),
            result.status,
            result.retry_count,
        ) {
            Ok(next) => next,
            Err(outcome) => return Ok(outcome),
        };

        sqlx::query(
            "UPDATE compliance_runners SET \
                 status = $2, \
                 started_at = COALESCE(started_at, $3), \
                 total_finding_count = CASE WHEN $2 = 'SUCCEEDED' THEN $4 ELSE total_finding_count END, \
                 failure_message = CASE WHEN $2 = 'SUCCEEDED' THEN NULL \
                                        WHEN $2 IN ('FAILED', 'TIMED_OUT') THEN $5 \
                                        ELSE failure_message END, \
                 retry_count = retry_count + CASE WHEN $2 = 'FAILED' THEN 1 ELSE 0 END, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(result.runner_id.to_uuid())
        .bind(next.as_str())
        .bind(result.started_at)
        .bind(result.total_finding_count)
        .bind(result.error_text.as_deref())
        .execute(&mut *tx)
        .await?;

        commit(tx).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn mark_timed_out_runners(&self, timeouts: &TimeoutConfig) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE compliance_runners \
             SET failure_message = 'timed out while ' || LOWER(status), \
                 status = 'TIMED_OUT', updated_at = NOW() \
             WHERE (status = 'QUEUED' AND updated_at < $1) \
                OR (status = 'IN_PROGRESS' AND updated_at < $2)",
        )
        .bind(now - timeouts.queued())
        .bind(now - timeouts.in_progress())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn retry_failed_runners(&self, retry: &RetryConfig) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE compliance_runners SET status = 'CREATED', updated_at = NOW() \
             WHERE status = 'FAILED' AND retry_count < $1 AND publish_failure_count < $2",
        )
        .bind(budget(retry.max_retries))
        .bind(budget(retry.max_publish_failures))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sum_runner_findings(&self, job_id: JobId) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(COALESCE(total_finding_count, 0)), 0)::BIGINT \
             FROM compliance_runners WHERE parent_job_id = $1",
        )
        .bind(job_id.to_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn purge_runners_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM compliance_runners WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SummarizerRepository for PostgresComplianceStore {
    async fn begin_summarization(
        &self,
        job_id: JobId,
        summarizer: &SummarizerRecord,
        retry: &RetryConfig,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        let advanced = sqlx::query(&format!(
            "UPDATE compliance_jobs j \
             SET status = 'SUMMARIZER_IN_PROGRESS', updated_at = NOW() \
             WHERE j.id = $3 AND {}",
            fan_in_complete("j")
        ))
        .bind(budget(retry.max_retries))
        .bind(budget(retry.max_publish_failures))
        .bind(job_id.to_uuid())
        .execute(&mut *tx)
        .await?;
        if advanced.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO compliance_summarizers (id, parent_job_id, status, retry_count, \
             publish_failure_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(summarizer.id.to_uuid())
        .bind(job_id.to_uuid())
        .bind(summarizer.status.as_str())
        .bind(budget(summarizer.retry_count))
        .bind(budget(summarizer.publish_failure_count))
        .bind(summarizer.created_at)
        .bind(summarizer.updated_at)
        .execute(&mut *tx)
        .await?;

        commit(tx).await?;
        Ok(true)
    }

    async fn get_summarizer(&self, id: SummarizerId) -> Result<Option<SummarizerRecord>> {
        let row: Option<SummarizerRow> = sqlx::query_as(&format!(
            "SELECT {SUMMARIZER_COLUMNS} FROM compliance_summarizers WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SummarizerRecord::try_from).transpose()
    }

    async fn list_summarizers_for_job(&self, job_id: JobId) -> Result<Vec<SummarizerRecord>> {
        let rows: Vec<SummarizerRow> = sqlx::query_as(&format!(
            "SELECT {SUMMARIZER_COLUMNS} FROM compliance_summarizers \
             WHERE parent_job_id = $1 ORDER BY id"
        ))
        .bind(job_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn list_summarizers_created(&self, limit: usize) -> Result<Vec<SummarizerRecord>> {
        let rows: Vec<SummarizerRow> = sqlx::query_as(&format!(
            "SELECT {SUMMARIZER_COLUMNS} FROM compliance_summarizers \
             WHERE status = 'CREATED' ORDER BY random() LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn mark_summarizer_queued(&self, id: SummarizerId, retry_count: u32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE compliance_summarizers \
             SET status = 'QUEUED', queued_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'CREATED' AND retry_count = $2",
        )
        .bind(id.to_uuid())
        .bind(budget(retry_count))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_summarizer_publish_failed(
        &self,
        id: SummarizerId,
        retry_count: u32,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE compliance_summarizers \
             SET status = 'FAILED', publish_failure_count = publish_failure_count + 1, \
                 failure_message = $3, updated_at = NOW() \
             WHERE id = $1 AND status = 'CREATED' AND retry_count = $2",
        )
        .bind(id.to_uuid())
        .bind(budget(retry_count))
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_summarizer_result(&self, result: &SummarizerResult) -> Result<ApplyOutcome> {
        let mut tx = self.begin().await?;
        let current: Option<UnitState> = sqlx::query_as(
            "SELECT status, retry_count FROM compliance_summarizers WHERE id = $1 FOR UPDATE",
        )
        .bind(result.summarizer_id.to_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = current else {
            return Ok(ApplyOutcome::Unknown);
        };
        let next = match next_status(
            current.status.parse::<RunnerStatus>()?,
            count(current.retry_count),
            result.status,
            result.retry_count,
        ) {
            Ok(next) => next,
            Err(outcome) => return Ok(outcome),
        };

        sqlx::query(
            "UPDATE compliance_summarizers SET \
                 status = $2, \
                 started_at = COALESCE(started_at, $3), \
                 failure_message = CASE WHEN $2 = 'SUCCEEDED' THEN NULL \
                                        WHEN $2 IN ('FAILED', 'TIMED_OUT') THEN $4 \
                                        ELSE failure_message END, \
                 retry_count = retry_count + CASE WHEN $2 = 'FAILED' THEN 1 ELSE 0 END, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(result.summarizer_id.to_uuid())
        .bind(next.as_str())
        .bind(result.started_at)
        .bind(result.error_text.as_deref())
        .execute(&mut *tx)
        .await?;

        commit(tx).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn mark_timed_out_summarizers(&self, timeouts: &TimeoutConfig) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE compliance_summarizers \
             SET failure_message = 'timed out while ' || LOWER(status), \
                 status = 'TIMED_OUT', updated_at = NOW() \
             WHERE (status = 'QUEUED' AND updated_at < $1) \
                OR (status = 'IN_PROGRESS' AND updated_at < $2)",
        )
        .bind(now - timeouts.queued())
        .bind(now - timeouts.in_progress())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn retry_failed_summarizers(&self, retry: &RetryConfig) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE compliance_summarizers SET status = 'CREATED', updated_at = NOW() \
             WHERE status = 'FAILED' AND retry_count < $1 AND publish_failure_count < $2",
        )
        .bind(budget(retry.max_retries))
        .bind(budget(retry.max_publish_failures))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_summarizers_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM compliance_summarizers WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReportStore for PostgresComplianceStore {
    async fn store_report(&self, report: &JobReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO compliance_reports (job_id, report) VALUES ($1, $2) \
             ON CONFLICT (job_id) DO UPDATE SET report = EXCLUDED.report, updated_at = NOW()",
        )
        .bind(report.job_id.to_uuid())
        .bind(Json(report))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_report(&self, job_id: JobId) -> Result<Option<JobReport>> {
        let report: Option<Json<JobReport>> =
            sqlx::query_scalar("SELECT report FROM compliance_reports WHERE job_id = $1")
                .bind(job_id.to_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(report.map(|Json(report)| report))
    }

    async fn purge_reports_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM compliance_reports WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_predicate_uses_the_given_parameters() {
        let sql = done_predicate("r", 1, 2);
        assert!(sql.contains("r.retry_count >= $1"));
        assert!(sql.contains("r.publish_failure_count >= $2"));
        assert!(sql.contains("'SUCCEEDED', 'TIMED_OUT'"));
    }

    #[test]
    fn oversized_budgets_saturate() {
        assert_eq!(budget(u32::MAX), i32::MAX);
        assert_eq!(count(-1), 0);
    }
}
