//! Dead-letter records for tasks that exhausted their retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datahive_core::{CounterDeltas, DeadLetterId, DeletionDirective, SubjectRef};

/// Immutable snapshot of a task at the moment it was given up on.
///
/// Dead letters are never consumed automatically. An operator inspects them
/// and either deletes the row or replays it, which creates a brand-new
/// [`ProjectionTask`](crate::ProjectionTask) with a fresh retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterTask {
    pub id: DeadLetterId,
    pub subject: SubjectRef,
    pub deltas: CounterDeltas,
    pub directive: DeletionDirective,
    /// Sanitized message of the failure that killed the task.
    pub error: String,
    /// Attempts consumed before the task died. Zero for tasks routed here by
    /// a non-retryable failure.
    pub retry_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterTask {
    pub fn new(
        subject: SubjectRef,
        deltas: CounterDeltas,
        directive: DeletionDirective,
        error: impl Into<String>,
        retry_count: u32,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            subject,
            deltas,
            directive,
            error: error.into(),
            retry_count,
            dead_lettered_at,
        }
    }
}
