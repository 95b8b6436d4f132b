//! Meilisearch-backed search index adapter.
//!
//! Counter updates are read-modify-write: fetch the subject's document,
//! add the signed deltas, upsert it back and wait for the index task to
//! settle. That is safe under this pipeline's contract — deltas commute, the
//! deletion flag is an absolute set, and a task is only removed from the
//! queue after the upsert has been acknowledged.
//!
//! ## Error Classification
//!
//! Classification is explicit per failure site, never inferred from the error
//! type alone:
//!
//! | Failure | Classification |
//! |---------|----------------|
//! | `document_not_found`, `index_not_found`, `invalid_document_id` | Permanent (straight to DLQ) |
//! | Any other Meilisearch API error | Transient |
//! | Transport/HTTP errors, timeouts | Transient |
//!
//! ## Timeouts
//!
//! Every `apply` call runs under a single `tokio::time::timeout`, so one hung
//! index request cannot stall the worker's whole batch. The timeout elapsing
//! is a transient failure: the upsert may or may not have landed, and a
//! retried apply only re-adds commutative deltas.

use std::time::Duration;

use meilisearch_sdk::client::Client;
use meilisearch_sdk::errors::{Error, ErrorCode, MeilisearchError};
use meilisearch_sdk::tasks::Task;
use serde::{Deserialize, Serialize};
use tracing::debug;

use datahive_core::{CounterDeltas, DeletionDirective, SubjectKind, SubjectRef};
use datahive_projection::{ApplyError, SearchIndex};

const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Meilisearch adapter for the [`SearchIndex`] port.
#[derive(Debug, Clone)]
pub struct MeilisearchIndex {
    client: Client,
    runtime: tokio::runtime::Handle,
    apply_timeout: Duration,
}

impl MeilisearchIndex {
    /// Connect to a Meilisearch instance.
    ///
    /// `runtime` is the handle the sync [`SearchIndex::apply`] blocks on;
    /// pass `tokio::runtime::Handle::current()` from the process entry point.
    pub fn new(
        url: impl Into<String>,
        api_key: Option<&str>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, ApplyError> {
        let client = Client::new(url, api_key).map_err(classify_sdk_error)?;
        Ok(Self {
            client,
            runtime,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        })
    }

    /// Bound for one whole apply call (fetch + upsert + settle).
    pub fn with_apply_timeout(mut self, apply_timeout: Duration) -> Self {
        self.apply_timeout = apply_timeout;
        self
    }

    fn index_name(kind: SubjectKind) -> &'static str {
        match kind {
            SubjectKind::Dataset => "datasets",
            SubjectKind::Project => "projects",
        }
    }

    async fn apply_async(
        &self,
        subject: SubjectRef,
        deltas: &CounterDeltas,
        directive: DeletionDirective,
    ) -> Result<(), ApplyError> {
        let index = self.client.index(Self::index_name(subject.kind));

        let mut doc: SubjectDocument = index
            .get_document(&subject.id.to_string())
            .await
            .map_err(classify_sdk_error)?;

        doc.apply(deltas, directive);

        let task_info = index
            .add_or_update(&[doc], Some("id"))
            .await
            .map_err(classify_sdk_error)?;

        let task = task_info
            .wait_for_completion(&self.client, None, None)
            .await
            .map_err(classify_sdk_error)?;

        match task {
            Task::Succeeded { .. } => {
                debug!(subject = %subject, "index document updated");
                Ok(())
            }
            Task::Failed { content } => Err(classify_api_error(content.error)),
            Task::Enqueued { .. } | Task::Processing { .. } => Err(ApplyError::transient(
                format!("index task for {subject} did not settle in time"),
            )),
        }
    }
}

impl SearchIndex for MeilisearchIndex {
    fn apply(
        &self,
        subject: SubjectRef,
        deltas: &CounterDeltas,
        directive: DeletionDirective,
    ) -> Result<(), ApplyError> {
        self.runtime.block_on(async {
            tokio::time::timeout(
                self.apply_timeout,
                self.apply_async(subject, deltas, directive),
            )
            .await
            .map_err(|_| {
                ApplyError::transient(format!(
                    "index apply for {subject} timed out after {:?}",
                    self.apply_timeout
                ))
            })?
        })
    }
}

/// The slice of an index document this pipeline owns.
///
/// Unknown fields (name, description, …) are dropped on read and therefore
/// must be re-put by the write path's own upserts, not by this adapter —
/// which is why the adapter never creates documents, only updates them.
#[derive(Debug, Serialize, Deserialize)]
struct SubjectDocument {
    id: i64,
    #[serde(default)]
    download_count: i64,
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    comment_count: i64,
    #[serde(default)]
    view_count: i64,
    #[serde(default)]
    deleted: bool,
}

impl SubjectDocument {
    fn apply(&mut self, deltas: &CounterDeltas, directive: DeletionDirective) {
        self.download_count = self.download_count.saturating_add(deltas.download);
        self.like_count = self.like_count.saturating_add(deltas.like);
        self.comment_count = self.comment_count.saturating_add(deltas.comment);
        self.view_count = self.view_count.saturating_add(deltas.view);

        match directive {
            DeletionDirective::None => {}
            DeletionDirective::Delete => self.deleted = true,
            DeletionDirective::Restore => self.deleted = false,
        }
    }
}

fn classify_sdk_error(err: Error) -> ApplyError {
    match err {
        Error::Meilisearch(api_err) => classify_api_error(api_err),
        // Everything below is transport-level: the request may never have
        // reached the index, so retrying is the right call.
        other => ApplyError::transient(other.to_string()),
    }
}

fn classify_api_error(err: MeilisearchError) -> ApplyError {
    match err.error_code {
        ErrorCode::DocumentNotFound | ErrorCode::IndexNotFound | ErrorCode::InvalidDocumentId => {
            ApplyError::permanent(err.error_message)
        }
        _ => ApplyError::transient(err.error_message),
    }
}
