//! In-memory search index for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use datahive_core::{CounterDeltas, DeletionDirective, SubjectRef};
use datahive_projection::{ApplyError, SearchIndex};

/// One index document's projected state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexDocument {
    pub download_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    pub view_count: i64,
    pub deleted: bool,
}

/// In-memory stand-in for the search index.
///
/// Intended for tests/dev. It mirrors the production adapter's contract:
/// applying deltas to a subject that was never indexed is a **permanent**
/// failure (the real index has no document to update either), and failures
/// can be scripted with [`fail_next_with`](InMemoryIndex::fail_next_with) to
/// exercise the retry and dead-letter paths.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    docs: RwLock<HashMap<SubjectRef, IndexDocument>>,
    scripted_failures: Mutex<VecDeque<ApplyError>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed an empty document, as the write path's create step would.
    pub fn seed(&self, subject: SubjectRef) {
        self.seed_with(subject, IndexDocument::default());
    }

    pub fn seed_with(&self, subject: SubjectRef, doc: IndexDocument) {
        self.docs.write().unwrap().insert(subject, doc);
    }

    pub fn get(&self, subject: SubjectRef) -> Option<IndexDocument> {
        self.docs.read().unwrap().get(&subject).copied()
    }

    /// Queue an error to be returned by the next `apply` call (FIFO).
    pub fn fail_next_with(&self, error: ApplyError) {
        self.scripted_failures.lock().unwrap().push_back(error);
    }

    pub fn clear_scripted_failures(&self) {
        self.scripted_failures.lock().unwrap().clear();
    }
}

impl SearchIndex for InMemoryIndex {
    fn apply(
        &self,
        subject: SubjectRef,
        deltas: &CounterDeltas,
        directive: DeletionDirective,
    ) -> Result<(), ApplyError> {
        if let Some(err) = self.scripted_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(&subject)
            .ok_or_else(|| ApplyError::permanent(format!("document not found: {subject}")))?;

        doc.download_count = doc.download_count.saturating_add(deltas.download);
        doc.like_count = doc.like_count.saturating_add(deltas.like);
        doc.comment_count = doc.comment_count.saturating_add(deltas.comment);
        doc.view_count = doc.view_count.saturating_add(deltas.view);

        match directive {
            DeletionDirective::None => {}
            DeletionDirective::Delete => doc.deleted = true,
            DeletionDirective::Restore => doc.deleted = false,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate_in_any_order() {
        let subject = SubjectRef::project(42);

        let a = CounterDeltas::download(1);
        let b = CounterDeltas {
            download: 1,
            like: 1,
            ..CounterDeltas::ZERO
        };

        for (first, second) in [(a, b), (b, a)] {
            let index = InMemoryIndex::new();
            index.seed(subject);

            index.apply(subject, &first, DeletionDirective::None).unwrap();
            index.apply(subject, &second, DeletionDirective::None).unwrap();

            let doc = index.get(subject).unwrap();
            assert_eq!(doc.download_count, 2);
            assert_eq!(doc.like_count, 1);
        }
    }

    #[test]
    fn delete_and_restore_are_idempotent() {
        let subject = SubjectRef::dataset(7);
        let index = InMemoryIndex::new();
        index.seed(subject);

        for _ in 0..2 {
            index
                .apply(subject, &CounterDeltas::ZERO, DeletionDirective::Delete)
                .unwrap();
            assert!(index.get(subject).unwrap().deleted);
        }

        for _ in 0..2 {
            index
                .apply(subject, &CounterDeltas::ZERO, DeletionDirective::Restore)
                .unwrap();
            assert!(!index.get(subject).unwrap().deleted);
        }
    }

    #[test]
    fn missing_document_is_permanent() {
        let index = InMemoryIndex::new();
        let err = index
            .apply(
                SubjectRef::dataset(404),
                &CounterDeltas::view(1),
                DeletionDirective::None,
            )
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn scripted_failures_fire_in_order() {
        let subject = SubjectRef::project(1);
        let index = InMemoryIndex::new();
        index.seed(subject);
        index.fail_next_with(ApplyError::transient("connection reset"));

        let err = index
            .apply(subject, &CounterDeltas::like(1), DeletionDirective::None)
            .unwrap_err();
        assert!(err.is_transient());

        // Second call goes through and the failed delta was not applied.
        index
            .apply(subject, &CounterDeltas::like(1), DeletionDirective::None)
            .unwrap();
        assert_eq!(index.get(subject).unwrap().like_count, 1);
    }
}
