//! Search index port: the single outbound call of the pipeline.

use std::sync::Arc;

use thiserror::Error;

use datahive_core::{CounterDeltas, DeletionDirective, SubjectRef};

/// Classification of an apply failure.
///
/// Classification is **explicit at the adapter boundary** — every index
/// adapter decides, per failure, which kind it is. The worker never infers it
/// from the error's shape, because the same underlying transport error can be
/// retryable in one adapter and fatal in another.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyErrorKind {
    /// Connectivity, timeout, 5xx: the index may recover, retry with backoff.
    Transient,
    /// Missing or malformed subject document: retrying cannot help, the task
    /// goes straight to the dead-letter store without consuming retry budget.
    Permanent,
}

/// Failure applying one task to the index.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApplyError {
    pub kind: ApplyErrorKind,
    pub message: String,
}

impl ApplyError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ApplyErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ApplyErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ApplyErrorKind::Transient
    }
}

/// The index collaborator the pipeline projects into.
///
/// One call applies one task: counters are incremented by the signed deltas,
/// and a non-`None` directive sets the document's visibility absolutely.
///
/// ## Delivery contract
///
/// The guarantee is **at-least-once, not exactly-once**. A task is removed
/// from the store on success and therefore never re-applied — but a task
/// re-claimed after a crash mid-apply may be applied twice. Adapters don't
/// need to defend against that: deltas commute and directives are idempotent,
/// so a duplicate apply is benign by construction.
///
/// ## Timeouts
///
/// Implementations must bound every call — one hung index request must not
/// stall a whole batch. The bound lives in the adapter (client timeout or an
/// explicit wrapper), not in the worker, which treats `apply` as an ordinary
/// blocking call.
pub trait SearchIndex: Send + Sync {
    fn apply(
        &self,
        subject: SubjectRef,
        deltas: &CounterDeltas,
        directive: DeletionDirective,
    ) -> Result<(), ApplyError>;
}

impl<I> SearchIndex for Arc<I>
where
    I: SearchIndex + ?Sized,
{
    fn apply(
        &self,
        subject: SubjectRef,
        deltas: &CounterDeltas,
        directive: DeletionDirective,
    ) -> Result<(), ApplyError> {
        (**self).apply(subject, deltas, directive)
    }
}
