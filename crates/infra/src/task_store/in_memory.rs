//! In-memory task store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use datahive_core::{DeadLetterId, TaskId};
use datahive_projection::{
    DeadLetterTask, EnqueueRequest, FailureOutcome, ProjectionTask, RetryPolicy, TaskCounts,
    TaskStore, TaskStoreError, TaskStatus,
};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// In-memory task store.
///
/// Intended for tests/dev. Claiming takes the same lease-based shape as the
/// Postgres adapter so worker behavior is identical against either store.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, ProjectionTask>>,
    dead_letters: RwLock<HashMap<DeadLetterId, DeadLetterTask>>,
    retry_policy: RetryPolicy,
    lease_duration: Duration,
}

impl InMemoryTaskStore {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            retry_policy,
            lease_duration: DEFAULT_LEASE,
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn arc(retry_policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(retry_policy))
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_duration).unwrap_or_default()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

fn poisoned<T>(_: T) -> TaskStoreError {
    TaskStoreError::Storage("lock poisoned".to_string())
}

impl TaskStore for InMemoryTaskStore {
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, TaskStoreError> {
        let task = ProjectionTask::new(
            request.subject,
            request.deltas,
            request.directive,
            Utc::now(),
        );
        let id = task.id;
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks.insert(id, task);
        Ok(id)
    }

    fn enqueue_batch(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<TaskId>, TaskStoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let task = ProjectionTask::new(request.subject, request.deltas, request.directive, now);
            ids.push(task.id);
            tasks.insert(task.id, task);
        }
        Ok(ids)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<ProjectionTask>, TaskStoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(&task_id).cloned())
    }

    fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;

        let mut due: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .map(|t| t.id)
            .collect();

        // Same ordering the Postgres adapter gets from its index.
        due.sort_by_key(|id| {
            let t = &tasks[id];
            (t.status.as_str(), t.next_run_at, t.id)
        });
        due.truncate(limit);

        let lease_until = self.lease_until(now);
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(task) = tasks.get_mut(&id) {
                task.begin_claim(lease_until, now);
                claimed.push(task.clone());
            }
        }

        Ok(claimed)
    }

    fn mark_success(&self, task_id: TaskId) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks
            .remove(&task_id)
            .map(|_| ())
            .ok_or(TaskStoreError::NotFound(task_id))
    }

    fn mark_failure(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;

        let task = tasks
            .get_mut(&task_id)
            .ok_or(TaskStoreError::NotFound(task_id))?;

        let attempt = task.retry_count + 1;
        if self.retry_policy.should_retry(attempt) {
            let delay = self.retry_policy.delay_for_attempt(attempt);
            let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            task.schedule_retry(next_run_at, error.to_string(), now);
            Ok(FailureOutcome::Retried {
                retry_count: attempt,
                next_run_at,
            })
        } else {
            let task = tasks
                .remove(&task_id)
                .ok_or(TaskStoreError::NotFound(task_id))?;
            let dead = DeadLetterTask::new(
                task.subject,
                task.deltas,
                task.directive,
                error,
                attempt,
                now,
            );
            drop(tasks);
            let mut dls = self.dead_letters.write().map_err(poisoned)?;
            dls.insert(dead.id, dead);
            Ok(FailureOutcome::DeadLettered)
        }
    }

    fn dead_letter(&self, task_id: TaskId, error: &str) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let task = tasks
            .remove(&task_id)
            .ok_or(TaskStoreError::NotFound(task_id))?;
        drop(tasks);

        let dead = DeadLetterTask::new(
            task.subject,
            task.deltas,
            task.directive,
            error,
            task.retry_count,
            Utc::now(),
        );
        let mut dls = self.dead_letters.write().map_err(poisoned)?;
        dls.insert(dead.id, dead);
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterTask>, TaskStoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|d| (d.dead_lettered_at, d.id));
        result.truncate(limit);
        Ok(result)
    }

    fn replay_dead_letter(
        &self,
        dead_letter_id: DeadLetterId,
    ) -> Result<ProjectionTask, TaskStoreError> {
        let mut dls = self.dead_letters.write().map_err(poisoned)?;
        let dead = dls
            .remove(&dead_letter_id)
            .ok_or(TaskStoreError::DeadLetterNotFound(dead_letter_id))?;
        drop(dls);

        let task = ProjectionTask::new(dead.subject, dead.deltas, dead.directive, Utc::now());
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn delete_dead_letter(&self, dead_letter_id: DeadLetterId) -> Result<(), TaskStoreError> {
        let mut dls = self.dead_letters.write().map_err(poisoned)?;
        dls.remove(&dead_letter_id)
            .map(|_| ())
            .ok_or(TaskStoreError::DeadLetterNotFound(dead_letter_id))
    }

    fn counts(&self) -> Result<TaskCounts, TaskStoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let now = Utc::now();

        let mut counts = TaskCounts {
            dead_lettered: dls.len(),
            ..TaskCounts::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
            if task.is_leased(now) {
                counts.claimed += 1;
            }
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use datahive_core::{CounterDeltas, DeletionDirective, SubjectRef};

    use super::*;

    fn store_with(policy: RetryPolicy) -> InMemoryTaskStore {
        InMemoryTaskStore::new(policy)
    }

    fn like_request(id: i64) -> EnqueueRequest {
        EnqueueRequest::like_delta(SubjectRef::project(id), 1)
    }

    #[test]
    fn enqueue_and_claim() {
        let store = store_with(RetryPolicy::default());
        let task_id = store.enqueue(like_request(1)).unwrap();

        let claimed = store.claim_batch(Utc::now(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, task_id);

        // Leased: a second claim comes back empty.
        assert!(store.claim_batch(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn claim_respects_next_run_at() {
        let store = store_with(RetryPolicy::exponential(
            5,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ));
        let task_id = store.enqueue(like_request(1)).unwrap();

        let now = Utc::now();
        let claimed = store.claim_batch(now, 10).unwrap();
        assert_eq!(claimed.len(), 1);

        store.mark_failure(task_id, "down", now).unwrap();

        // Backoff is a minute out; nothing is due yet.
        assert!(store.claim_batch(Utc::now(), 10).unwrap().is_empty());

        // Time-travel past the backoff.
        let later = now + chrono::Duration::seconds(90);
        let claimed = store.claim_batch(later, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retry_count, 1);
        assert_eq!(claimed[0].status, TaskStatus::Failed);
    }

    #[test]
    fn expired_lease_makes_task_reclaimable() {
        let store =
            store_with(RetryPolicy::default()).with_lease_duration(Duration::from_secs(30));
        let task_id = store.enqueue(like_request(1)).unwrap();

        let now = Utc::now();
        assert_eq!(store.claim_batch(now, 10).unwrap().len(), 1);
        assert!(store.claim_batch(now, 10).unwrap().is_empty());

        // Simulated crash: the claim is never resolved. After the lease
        // expires the task is claimable again.
        let after_lease = now + chrono::Duration::seconds(31);
        let reclaimed = store.claim_batch(after_lease, 10).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, task_id);
    }

    #[test]
    fn failure_schedules_strictly_increasing_retries_then_dead_letters() {
        let store = store_with(RetryPolicy::exponential(
            3,
            Duration::from_secs(1),
            Duration::from_secs(120),
        ));
        let task_id = store.enqueue(like_request(1)).unwrap();

        let mut now = Utc::now();
        let mut last_next_run = now;

        // Attempts 1 and 2 reschedule with strictly increasing next_run_at.
        for expected_retry in 1..=2u32 {
            let claimed = store.claim_batch(now, 10).unwrap();
            assert_eq!(claimed.len(), 1);

            let outcome = store.mark_failure(task_id, "es down", now).unwrap();
            match outcome {
                FailureOutcome::Retried {
                    retry_count,
                    next_run_at,
                } => {
                    assert_eq!(retry_count, expected_retry);
                    assert!(next_run_at > last_next_run);
                    last_next_run = next_run_at;
                    now = next_run_at;
                }
                FailureOutcome::DeadLettered => panic!("dead-lettered too early"),
            }
        }

        // Attempt 3 exhausts the budget.
        let claimed = store.claim_batch(now, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        let outcome = store.mark_failure(task_id, "es down", now).unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);

        // Gone from the queue, exactly once in the DLQ, with the attempt count.
        assert!(store.get(task_id).unwrap().is_none());
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].retry_count, 3);
        assert_eq!(dls[0].error, "es down");
        assert!(store.claim_batch(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn permanent_dead_letter_keeps_retry_budget() {
        let store = store_with(RetryPolicy::default());
        let task_id = store.enqueue(like_request(1)).unwrap();
        store.claim_batch(Utc::now(), 10).unwrap();

        store.dead_letter(task_id, "document missing").unwrap();

        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].retry_count, 0);
        assert!(store.get(task_id).unwrap().is_none());
    }

    #[test]
    fn replay_creates_fresh_task() {
        let store = store_with(RetryPolicy::fixed(1, Duration::ZERO));
        let subject = SubjectRef::dataset(9);
        let task_id = store
            .enqueue(EnqueueRequest::new(
                subject,
                CounterDeltas::download(2),
                DeletionDirective::None,
            ))
            .unwrap();

        let now = Utc::now();
        store.claim_batch(now, 10).unwrap();
        assert_eq!(
            store.mark_failure(task_id, "boom", now).unwrap(),
            FailureOutcome::DeadLettered
        );

        let dead = store.list_dead_letters(10).unwrap().remove(0);
        let replayed = store.replay_dead_letter(dead.id).unwrap();

        assert_eq!(replayed.retry_count, 0);
        assert_eq!(replayed.status, TaskStatus::Pending);
        assert_eq!(replayed.subject, subject);
        assert_eq!(replayed.deltas, CounterDeltas::download(2));
        assert_ne!(replayed.id, task_id);

        // The record was consumed.
        assert!(store.list_dead_letters(10).unwrap().is_empty());
        assert!(matches!(
            store.replay_dead_letter(dead.id),
            Err(TaskStoreError::DeadLetterNotFound(_))
        ));
    }

    #[test]
    fn counts_track_states() {
        let store = store_with(RetryPolicy::fixed(5, Duration::ZERO));
        for i in 0..4 {
            store.enqueue(like_request(i)).unwrap();
        }

        let now = Utc::now();
        let claimed = store.claim_batch(now, 2).unwrap();
        store.mark_failure(claimed[0].id, "e", now).unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.claimed, 1);
        assert_eq!(counts.dead_lettered, 0);
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let store = Arc::new(store_with(RetryPolicy::default()));
        for i in 0..100 {
            store.enqueue(like_request(i)).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(Utc::now(), 7).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|t| t.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0usize;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "task {id} claimed twice");
            }
        }
        assert_eq!(total, 100);
    }
}
