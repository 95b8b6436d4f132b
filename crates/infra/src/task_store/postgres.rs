//! Postgres-backed task store implementation.
//!
//! Persists the projection queue and its dead-letter table in PostgreSQL
//! (DDL in `crates/infra/migrations/`). Two properties are enforced at the
//! database level:
//!
//! - **Transactional enqueue**: [`PostgresTaskStore::enqueue_in_tx`] appends
//!   the task inside the write path's own transaction, so a committed primary
//!   mutation always carries its projection task and a rolled-back one never
//!   does.
//! - **Atomic claiming**: `claim_batch` selects due rows with
//!   `FOR UPDATE SKIP LOCKED` and stamps a claim lease in the same statement.
//!   Two workers — threads or separate processes — can never claim the same
//!   row, and a row whose worker died mid-apply becomes claimable again once
//!   its lease expires.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `TaskStoreError::Storage` through
//! [`map_sqlx_error`]:
//!
//! | SQLx Error | PostgreSQL Error Code | Scenario |
//! |------------|----------------------|----------|
//! | Database (unique violation) | `23505` | Duplicate task id (should not occur with UUIDv7 ids) |
//! | Database (check constraint violation) | `23514` | Invalid data (e.g. negative retry_count) |
//! | Database (other) | Any other | Other database errors |
//! | PoolClosed | N/A | Connection pool was closed |
//! | Other | N/A | Network errors, connection failures, etc. |
//!
//! ## Thread Safety
//!
//! The [`TaskStore`] trait is synchronous, while SQLx is async. The store
//! carries a [`tokio::runtime::Handle`] captured at construction and bridges
//! with `block_on`, so the polling worker thread can drive it without owning
//! a runtime. Do not call the sync methods from inside an async task; use the
//! `*_async` inherent methods there instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use datahive_core::{
    CounterDeltas, DeadLetterId, DeletionDirective, SubjectId, SubjectKind, SubjectRef, TaskId,
};
use datahive_projection::{
    DeadLetterTask, EnqueueRequest, FailureOutcome, ProjectionTask, RetryPolicy, TaskCounts,
    TaskStatus, TaskStore, TaskStoreError,
};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

const TASK_COLUMNS: &str = "id, subject_kind, subject_id, delta_download, delta_like, \
     delta_comment, delta_view, deletion_directive, status, retry_count, next_run_at, \
     claimed_until, last_error, created_at, updated_at";

/// Postgres-backed projection task store.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
    retry_policy: RetryPolicy,
    lease_duration: Duration,
}

impl PostgresTaskStore {
    /// Create a store over the given pool.
    ///
    /// `runtime` is the handle the sync [`TaskStore`] methods block on; pass
    /// `tokio::runtime::Handle::current()` from the process entry point.
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            retry_policy: RetryPolicy::default(),
            lease_duration: DEFAULT_LEASE,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Enqueue a task inside the caller's transaction.
    ///
    /// This is the write path's entry point: the task commits or rolls back
    /// together with the primary mutation that produced it.
    pub async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        request: &EnqueueRequest,
    ) -> Result<TaskId, TaskStoreError> {
        let task = ProjectionTask::new(request.subject, request.deltas, request.directive, Utc::now());
        insert_task(&mut **tx, &task).await?;
        Ok(task.id)
    }

    #[instrument(skip(self), fields(subject = %request.subject), err)]
    pub async fn enqueue_async(&self, request: &EnqueueRequest) -> Result<TaskId, TaskStoreError> {
        let task = ProjectionTask::new(request.subject, request.deltas, request.directive, Utc::now());
        insert_task(&*self.pool, &task).await?;
        Ok(task.id)
    }

    pub async fn enqueue_batch_async(
        &self,
        requests: &[EnqueueRequest],
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        if requests.is_empty() {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let task = ProjectionTask::new(request.subject, request.deltas, request.directive, now);
            insert_task(&mut *tx, &task).await?;
            ids.push(task.id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(ids)
    }

    pub async fn get_async(
        &self,
        task_id: TaskId,
    ) -> Result<Option<ProjectionTask>, TaskStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM projection_task WHERE id = $1"
        ))
        .bind(task_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_task", e))?;

        row.map(|r| parse_task_row(&r)).transpose()
    }

    /// Claim up to `limit` due tasks.
    ///
    /// The inner `SELECT … FOR UPDATE SKIP LOCKED` makes concurrent claimers
    /// skip each other's rows instead of blocking; the `UPDATE … RETURNING`
    /// stamps the lease before any other claimer can see the row again.
    #[instrument(skip(self), err)]
    pub async fn claim_batch_async(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError> {
        let lease_until = now + chrono::Duration::from_std(self.lease_duration).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            UPDATE projection_task AS t
            SET claimed_until = $2, updated_at = $1
            FROM (
                SELECT id
                FROM projection_task
                WHERE next_run_at <= $1
                  AND status IN ('pending', 'failed')
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY status, next_run_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ) AS due
            WHERE t.id = due.id
            RETURNING t.id, t.subject_kind, t.subject_id, t.delta_download, t.delta_like,
                      t.delta_comment, t.delta_view, t.deletion_directive, t.status,
                      t.retry_count, t.next_run_at, t.claimed_until, t.last_error,
                      t.created_at, t.updated_at
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(parse_task_row(&row)?);
        }
        Ok(tasks)
    }

    pub async fn mark_success_async(&self, task_id: TaskId) -> Result<(), TaskStoreError> {
        let result = sqlx::query("DELETE FROM projection_task WHERE id = $1")
            .bind(task_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_success", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(task_id = %task_id), err)]
    pub async fn mark_failure_async(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TaskStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM projection_task WHERE id = $1 FOR UPDATE"
        ))
        .bind(task_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_task", e))?;

        let task = match row {
            Some(row) => parse_task_row(&row)?,
            None => return Err(TaskStoreError::NotFound(task_id)),
        };

        let attempt = task.retry_count + 1;
        let outcome = if self.retry_policy.should_retry(attempt) {
            let delay = self.retry_policy.delay_for_attempt(attempt);
            let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE projection_task
                SET status = 'failed', retry_count = $2, next_run_at = $3,
                    claimed_until = NULL, last_error = $4, updated_at = $5
                WHERE id = $1
                "#,
            )
            .bind(task_id.as_uuid())
            .bind(attempt as i32)
            .bind(next_run_at)
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("schedule_retry", e))?;

            FailureOutcome::Retried {
                retry_count: attempt,
                next_run_at,
            }
        } else {
            let dead = DeadLetterTask::new(
                task.subject,
                task.deltas,
                task.directive,
                error,
                attempt,
                now,
            );
            insert_dead_letter(&mut tx, &dead).await?;
            delete_task(&mut tx, task_id).await?;
            FailureOutcome::DeadLettered
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self, error), fields(task_id = %task_id), err)]
    pub async fn dead_letter_async(
        &self,
        task_id: TaskId,
        error: &str,
    ) -> Result<(), TaskStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM projection_task WHERE id = $1 FOR UPDATE"
        ))
        .bind(task_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_task", e))?;

        let task = match row {
            Some(row) => parse_task_row(&row)?,
            None => return Err(TaskStoreError::NotFound(task_id)),
        };

        let dead = DeadLetterTask::new(
            task.subject,
            task.deltas,
            task.directive,
            error,
            task.retry_count,
            Utc::now(),
        );
        insert_dead_letter(&mut tx, &dead).await?;
        delete_task(&mut tx, task_id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    pub async fn list_dead_letters_async(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterTask>, TaskStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, subject_kind, subject_id, delta_download, delta_like, delta_comment,
                   delta_view, deletion_directive, error, retry_count, dead_lettered_at
            FROM dead_letter_task
            ORDER BY dead_lettered_at, id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        let mut dead_letters = Vec::with_capacity(rows.len());
        for row in rows {
            dead_letters.push(parse_dead_letter_row(&row)?);
        }
        Ok(dead_letters)
    }

    #[instrument(skip(self), fields(dead_letter_id = %dead_letter_id), err)]
    pub async fn replay_dead_letter_async(
        &self,
        dead_letter_id: DeadLetterId,
    ) -> Result<ProjectionTask, TaskStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            DELETE FROM dead_letter_task
            WHERE id = $1
            RETURNING id, subject_kind, subject_id, delta_download, delta_like, delta_comment,
                      delta_view, deletion_directive, error, retry_count, dead_lettered_at
            "#,
        )
        .bind(dead_letter_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("consume_dead_letter", e))?;

        let dead = match row {
            Some(row) => parse_dead_letter_row(&row)?,
            None => return Err(TaskStoreError::DeadLetterNotFound(dead_letter_id)),
        };

        let task = ProjectionTask::new(dead.subject, dead.deltas, dead.directive, Utc::now());
        insert_task(&mut *tx, &task).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(task)
    }

    pub async fn delete_dead_letter_async(
        &self,
        dead_letter_id: DeadLetterId,
    ) -> Result<(), TaskStoreError> {
        let result = sqlx::query("DELETE FROM dead_letter_task WHERE id = $1")
            .bind(dead_letter_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::DeadLetterNotFound(dead_letter_id));
        }
        Ok(())
    }

    pub async fn counts_async(&self) -> Result<TaskCounts, TaskStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE claimed_until IS NOT NULL AND claimed_until > $1) AS claimed
            FROM projection_task
            "#,
        )
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_tasks", e))?;

        let dead_row = sqlx::query("SELECT COUNT(*) AS dead_lettered FROM dead_letter_task")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_dead_letters", e))?;

        Ok(TaskCounts {
            pending: read_count(&row, "pending")?,
            failed: read_count(&row, "failed")?,
            claimed: read_count(&row, "claimed")?,
            dead_lettered: read_count(&dead_row, "dead_lettered")?,
        })
    }
}

impl TaskStore for PostgresTaskStore {
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, TaskStoreError> {
        self.runtime.block_on(self.enqueue_async(&request))
    }

    fn enqueue_batch(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<TaskId>, TaskStoreError> {
        self.runtime.block_on(self.enqueue_batch_async(&requests))
    }

    fn get(&self, task_id: TaskId) -> Result<Option<ProjectionTask>, TaskStoreError> {
        self.runtime.block_on(self.get_async(task_id))
    }

    fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError> {
        self.runtime.block_on(self.claim_batch_async(now, limit))
    }

    fn mark_success(&self, task_id: TaskId) -> Result<(), TaskStoreError> {
        self.runtime.block_on(self.mark_success_async(task_id))
    }

    fn mark_failure(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TaskStoreError> {
        self.runtime
            .block_on(self.mark_failure_async(task_id, error, now))
    }

    fn dead_letter(&self, task_id: TaskId, error: &str) -> Result<(), TaskStoreError> {
        self.runtime.block_on(self.dead_letter_async(task_id, error))
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterTask>, TaskStoreError> {
        self.runtime.block_on(self.list_dead_letters_async(limit))
    }

    fn replay_dead_letter(
        &self,
        dead_letter_id: DeadLetterId,
    ) -> Result<ProjectionTask, TaskStoreError> {
        self.runtime
            .block_on(self.replay_dead_letter_async(dead_letter_id))
    }

    fn delete_dead_letter(&self, dead_letter_id: DeadLetterId) -> Result<(), TaskStoreError> {
        self.runtime
            .block_on(self.delete_dead_letter_async(dead_letter_id))
    }

    fn counts(&self) -> Result<TaskCounts, TaskStoreError> {
        self.runtime.block_on(self.counts_async())
    }
}

async fn insert_task<'e, E>(executor: E, task: &ProjectionTask) -> Result<(), TaskStoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO projection_task (
            id, subject_kind, subject_id, delta_download, delta_like, delta_comment,
            delta_view, deletion_directive, status, retry_count, next_run_at,
            claimed_until, last_error, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(task.id.as_uuid())
    .bind(task.subject.kind.as_str())
    .bind(task.subject.id.value())
    .bind(task.deltas.download)
    .bind(task.deltas.like)
    .bind(task.deltas.comment)
    .bind(task.deltas.view)
    .bind(task.directive.as_db_str())
    .bind(task.status.as_str())
    .bind(task.retry_count as i32)
    .bind(task.next_run_at)
    .bind(task.claimed_until)
    .bind(task.last_error.as_deref())
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("insert_task", e))?;

    Ok(())
}

async fn insert_dead_letter(
    tx: &mut Transaction<'_, Postgres>,
    dead: &DeadLetterTask,
) -> Result<(), TaskStoreError> {
    sqlx::query(
        r#"
        INSERT INTO dead_letter_task (
            id, subject_kind, subject_id, delta_download, delta_like, delta_comment,
            delta_view, deletion_directive, error, retry_count, dead_lettered_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(dead.id.as_uuid())
    .bind(dead.subject.kind.as_str())
    .bind(dead.subject.id.value())
    .bind(dead.deltas.download)
    .bind(dead.deltas.like)
    .bind(dead.deltas.comment)
    .bind(dead.deltas.view)
    .bind(dead.directive.as_db_str())
    .bind(&dead.error)
    .bind(dead.retry_count as i32)
    .bind(dead.dead_lettered_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

    Ok(())
}

async fn delete_task(
    tx: &mut Transaction<'_, Postgres>,
    task_id: TaskId,
) -> Result<(), TaskStoreError> {
    sqlx::query("DELETE FROM projection_task WHERE id = $1")
        .bind(task_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_task", e))?;
    Ok(())
}

fn parse_task_row(row: &PgRow) -> Result<ProjectionTask, TaskStoreError> {
    let kind: String = try_get(row, "subject_kind")?;
    let directive: Option<String> = try_get(row, "deletion_directive")?;
    let status: String = try_get(row, "status")?;
    let retry_count: i32 = try_get(row, "retry_count")?;

    Ok(ProjectionTask {
        id: TaskId::from_uuid(try_get(row, "id")?),
        subject: SubjectRef::new(
            kind.parse::<SubjectKind>().map_err(corrupt_row)?,
            SubjectId::new(try_get(row, "subject_id")?),
        ),
        deltas: CounterDeltas {
            download: try_get(row, "delta_download")?,
            like: try_get(row, "delta_like")?,
            comment: try_get(row, "delta_comment")?,
            view: try_get(row, "delta_view")?,
        },
        directive: DeletionDirective::from_db_str(directive.as_deref()).map_err(corrupt_row)?,
        status: TaskStatus::from_db_str(&status).map_err(corrupt_row)?,
        retry_count: retry_count as u32,
        next_run_at: try_get(row, "next_run_at")?,
        claimed_until: try_get(row, "claimed_until")?,
        last_error: try_get(row, "last_error")?,
        created_at: try_get(row, "created_at")?,
        updated_at: try_get(row, "updated_at")?,
    })
}

fn parse_dead_letter_row(row: &PgRow) -> Result<DeadLetterTask, TaskStoreError> {
    let kind: String = try_get(row, "subject_kind")?;
    let directive: Option<String> = try_get(row, "deletion_directive")?;
    let retry_count: i32 = try_get(row, "retry_count")?;

    Ok(DeadLetterTask {
        id: DeadLetterId::from_uuid(try_get(row, "id")?),
        subject: SubjectRef::new(
            kind.parse::<SubjectKind>().map_err(corrupt_row)?,
            SubjectId::new(try_get(row, "subject_id")?),
        ),
        deltas: CounterDeltas {
            download: try_get(row, "delta_download")?,
            like: try_get(row, "delta_like")?,
            comment: try_get(row, "delta_comment")?,
            view: try_get(row, "delta_view")?,
        },
        directive: DeletionDirective::from_db_str(directive.as_deref()).map_err(corrupt_row)?,
        error: try_get(row, "error")?,
        retry_count: retry_count as u32,
        dead_lettered_at: try_get(row, "dead_lettered_at")?,
    })
}

fn try_get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, TaskStoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| TaskStoreError::Storage(format!("failed to read column {column}: {e}")))
}

fn read_count(row: &PgRow, column: &str) -> Result<usize, TaskStoreError> {
    let count: i64 = try_get(row, column)?;
    Ok(count.max(0) as usize)
}

fn corrupt_row(e: datahive_core::DomainError) -> TaskStoreError {
    TaskStoreError::Storage(format!("corrupt row: {e}"))
}

/// Map SQLx errors to TaskStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = match db_err.code().as_deref() {
                Some("23505") => format!("unique violation in {}: {}", operation, db_err.message()),
                Some("23514") => format!(
                    "check constraint violation in {}: {}",
                    operation,
                    db_err.message()
                ),
                _ => format!("database error in {}: {}", operation, db_err.message()),
            };
            TaskStoreError::Storage(msg)
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => TaskStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
