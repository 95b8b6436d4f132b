//! The projection task record and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datahive_core::{CounterDeltas, DeletionDirective, DomainError, SubjectRef, TaskId};

/// Queue status of a projection task.
///
/// Only queued states exist: a task is removed from the store on success and
/// converted to a [`DeadLetterTask`](crate::DeadLetterTask) on terminal
/// failure, so there is no `Succeeded`/`Dead` status to park rows in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Freshly enqueued, never attempted.
    Pending,
    /// At least one attempt failed; waiting for its backoff to elapse.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, DomainError> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending projection: a subject, the deltas to add, an optional
/// visibility directive, and the retry bookkeeping around them.
///
/// Invariants:
/// - `next_run_at` is set on creation and on every reschedule;
/// - `retry_count` is monotonically non-decreasing;
/// - a leased task (`claimed_until` in the future) is invisible to
///   `claim_batch` until the lease expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionTask {
    pub id: TaskId,
    pub subject: SubjectRef,
    pub deltas: CounterDeltas,
    pub directive: DeletionDirective,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Earliest instant the task may be claimed.
    pub next_run_at: DateTime<Utc>,
    /// Claim lease; `Some(t)` with `t` in the future means a worker holds it.
    pub claimed_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionTask {
    /// Create a freshly enqueued task, runnable immediately.
    pub fn new(
        subject: SubjectRef,
        deltas: CounterDeltas,
        directive: DeletionDirective,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            subject,
            deltas,
            directive,
            status: TaskStatus::Pending,
            retry_count: 0,
            next_run_at: now,
            claimed_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the task can be handed to a worker at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now && !self.is_leased(now)
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }

    /// Lease the task to a worker until `claimed_until`.
    pub fn begin_claim(&mut self, claimed_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.claimed_until = Some(claimed_until);
        self.updated_at = now;
    }

    /// Record a failed attempt and park the task until `next_run_at`.
    ///
    /// Increments `retry_count` and releases the claim lease so the retry is
    /// visible to any worker once the backoff elapses.
    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.retry_count += 1;
        self.next_run_at = next_run_at;
        self.claimed_until = None;
        self.last_error = Some(error);
        self.updated_at = now;
    }
}
