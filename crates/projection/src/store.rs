//! Task store port: durable queue + dead-letter sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datahive_core::{CounterDeltas, DeadLetterId, DeletionDirective, SubjectRef, TaskId};

use crate::dead_letter::DeadLetterTask;
use crate::task::ProjectionTask;

/// What the write path hands to [`TaskStore::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub subject: SubjectRef,
    pub deltas: CounterDeltas,
    pub directive: DeletionDirective,
}

impl EnqueueRequest {
    pub fn new(subject: SubjectRef, deltas: CounterDeltas, directive: DeletionDirective) -> Self {
        Self {
            subject,
            deltas,
            directive,
        }
    }

    /// A download-count increment for `subject`.
    pub fn download_delta(subject: SubjectRef, delta: i64) -> Self {
        Self::new(subject, CounterDeltas::download(delta), DeletionDirective::None)
    }

    /// A like-count increment for `subject`.
    pub fn like_delta(subject: SubjectRef, delta: i64) -> Self {
        Self::new(subject, CounterDeltas::like(delta), DeletionDirective::None)
    }

    /// A comment-count increment for `subject`.
    pub fn comment_delta(subject: SubjectRef, delta: i64) -> Self {
        Self::new(subject, CounterDeltas::comment(delta), DeletionDirective::None)
    }

    /// A view-count increment for `subject`.
    pub fn view_delta(subject: SubjectRef, delta: i64) -> Self {
        Self::new(subject, CounterDeltas::view(delta), DeletionDirective::None)
    }

    /// A soft-delete (or restore) of `subject`'s index document.
    pub fn set_deleted(subject: SubjectRef, deleted: bool) -> Self {
        let directive = if deleted {
            DeletionDirective::Delete
        } else {
            DeletionDirective::Restore
        };
        Self::new(subject, CounterDeltas::ZERO, directive)
    }
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(DeadLetterId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of [`TaskStore::mark_failure`], reported so the worker can log and
/// count each path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled with backoff.
    Retried {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; the task is now a dead letter.
    DeadLettered,
}

/// Queue depth by state, for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub failed: usize,
    /// Tasks currently leased to a worker (subset of pending + failed).
    pub claimed: usize,
    pub dead_lettered: usize,
}

/// Durable queue of projection tasks plus the dead-letter sink.
///
/// ## Enqueue is fail-closed
///
/// `enqueue` runs synchronously in the caller; if the store is unavailable
/// the error propagates and the caller's transaction fails. Silently dropping
/// a projection is the one thing this pipeline may never do — a failed write
/// is recoverable, a lost delta is not.
///
/// ## Claiming is atomic
///
/// `claim_batch` leases each returned task so that no concurrent caller —
/// same process or another worker replica — receives the same row. A lease
/// that is never resolved (worker crash mid-apply) expires after the store's
/// lease duration and the task becomes claimable again.
///
/// ## Tasks never linger
///
/// Success deletes the row. Terminal failure converts it into a
/// [`DeadLetterTask`]. The store only ever holds queued work.
pub trait TaskStore: Send + Sync {
    /// Enqueue a new task: status Pending, retry_count 0, runnable now.
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, TaskStoreError>;

    /// Enqueue many tasks at once (e.g. a flushed view-count accumulator).
    /// Tasks are not merged; each request becomes its own row.
    fn enqueue_batch(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<TaskId>, TaskStoreError>;

    /// Get a task by ID.
    fn get(&self, task_id: TaskId) -> Result<Option<ProjectionTask>, TaskStoreError>;

    /// Atomically claim up to `limit` due tasks (`next_run_at <= now`, not
    /// leased), ordered by `(status, next_run_at, id)`.
    fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError>;

    /// Remove a task after a successful apply.
    fn mark_success(&self, task_id: TaskId) -> Result<(), TaskStoreError>;

    /// Record a retryable failure: reschedule with backoff, or promote to the
    /// dead-letter store once the retry budget is spent.
    fn mark_failure(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TaskStoreError>;

    /// Route a task straight to the dead-letter store (non-retryable failure),
    /// without consuming retry budget.
    fn dead_letter(&self, task_id: TaskId, error: &str) -> Result<(), TaskStoreError>;

    /// List dead-lettered tasks, oldest first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterTask>, TaskStoreError>;

    /// Replay a dead letter: removes the record and enqueues a brand-new task
    /// with `retry_count = 0`.
    fn replay_dead_letter(
        &self,
        dead_letter_id: DeadLetterId,
    ) -> Result<ProjectionTask, TaskStoreError>;

    /// Discard a dead letter.
    fn delete_dead_letter(&self, dead_letter_id: DeadLetterId) -> Result<(), TaskStoreError>;

    /// Queue depth by state.
    fn counts(&self) -> Result<TaskCounts, TaskStoreError>;
}

impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, TaskStoreError> {
        (**self).enqueue(request)
    }

    fn enqueue_batch(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<TaskId>, TaskStoreError> {
        (**self).enqueue_batch(requests)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<ProjectionTask>, TaskStoreError> {
        (**self).get(task_id)
    }

    fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError> {
        (**self).claim_batch(now, limit)
    }

    fn mark_success(&self, task_id: TaskId) -> Result<(), TaskStoreError> {
        (**self).mark_success(task_id)
    }

    fn mark_failure(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TaskStoreError> {
        (**self).mark_failure(task_id, error, now)
    }

    fn dead_letter(&self, task_id: TaskId, error: &str) -> Result<(), TaskStoreError> {
        (**self).dead_letter(task_id, error)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterTask>, TaskStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn replay_dead_letter(
        &self,
        dead_letter_id: DeadLetterId,
    ) -> Result<ProjectionTask, TaskStoreError> {
        (**self).replay_dead_letter(dead_letter_id)
    }

    fn delete_dead_letter(&self, dead_letter_id: DeadLetterId) -> Result<(), TaskStoreError> {
        (**self).delete_dead_letter(dead_letter_id)
    }

    fn counts(&self) -> Result<TaskCounts, TaskStoreError> {
        (**self).counts()
    }
}

#[cfg(test)]
mod tests {
    use datahive_core::SubjectRef;

    use super::*;

    #[test]
    fn helper_constructors_set_only_their_metric() {
        let subject = SubjectRef::dataset(5);

        let req = EnqueueRequest::download_delta(subject, 3);
        assert_eq!(req.deltas.download, 3);
        assert_eq!(req.deltas.like, 0);
        assert!(req.directive.is_none());

        let req = EnqueueRequest::set_deleted(subject, true);
        assert!(req.deltas.is_zero());
        assert_eq!(req.directive, DeletionDirective::Delete);

        let req = EnqueueRequest::set_deleted(subject, false);
        assert_eq!(req.directive, DeletionDirective::Restore);
    }
}
