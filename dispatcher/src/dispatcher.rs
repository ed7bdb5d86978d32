//! The in-memory dispatcher state machine (§4.1): an index of `executor -> [jobs]` kept
//! consistent with the transactions the work store hands back on dequeue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dispatcher_common::{CancelHandle, Clock, ExecutionLogEntry, JobPayload};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::DispatcherError;
use crate::registry::QueueRegistry;

/// One outstanding job, as tracked by the dispatcher. Dropping a `Job` releases its
/// admission token; resolving it additionally requires explicitly cancelling its
/// transaction.
struct Job {
    queue_name: String,
    job_id: i64,
    cancel: CancelHandle,
    started: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct ExecutorMeta {
    last_update: DateTime<Utc>,
    jobs: Vec<Job>,
}

pub struct Dispatcher {
    registry: QueueRegistry,
    executors: Mutex<HashMap<String, ExecutorMeta>>,
    tokens: Arc<Semaphore>,
    token_capacity: usize,
    clock: Arc<dyn Clock>,
    requeue_delay: ChronoDuration,
    unreported_max_age: ChronoDuration,
}

pub struct HeartbeatResult {
    pub unknown_ids: Vec<i64>,
}

impl Dispatcher {
    pub fn new(
        registry: QueueRegistry,
        maximum_num_transactions: usize,
        clock: Arc<dyn Clock>,
        requeue_delay: ChronoDuration,
        unreported_max_age: ChronoDuration,
    ) -> Self {
        Dispatcher {
            registry,
            executors: Mutex::new(HashMap::new()),
            tokens: Arc::new(Semaphore::new(maximum_num_transactions)),
            token_capacity: maximum_num_transactions,
            clock,
            requeue_delay,
            unreported_max_age,
        }
    }

    /// Number of admission tokens currently checked out. Exposed for metrics and tests;
    /// see §9 "semaphore vs. map consistency" — this should equal `outstanding_jobs()`
    /// at every quiescent point.
    pub fn tokens_held(&self) -> usize {
        self.token_capacity - self.tokens.available_permits()
    }

    pub async fn outstanding_jobs(&self) -> usize {
        let executors = self.executors.lock().await;
        executors.values().map(|meta| meta.jobs.len()).sum()
    }

    /// `dequeue(ctx, queue, executorName, executorHostname) -> (job, ok)`.
    pub async fn dequeue(
        &self,
        queue_name: &str,
        executor_name: &str,
        executor_hostname: &str,
    ) -> Result<Option<JobPayload>, DispatcherError> {
        let store = self
            .registry
            .get(queue_name)
            .ok_or(DispatcherError::UnknownQueue)?;

        let permit = match self.tokens.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Ok(None),
        };

        let dequeued = match store.dequeue(executor_hostname).await {
            Ok(Some(dequeued)) => dequeued,
            Ok(None) => {
                drop(permit);
                dispatcher_common::metrics::record_dequeue(queue_name, false);
                return Ok(None);
            }
            Err(dispatcher_common::DequeueError::Store(error)) => {
                drop(permit);
                return Err(DispatcherError::Store(error));
            }
            Err(dispatcher_common::DequeueError::Transform(error)) => {
                drop(permit);
                return Err(DispatcherError::Transform(error));
            }
        };

        let now = self.clock.now();
        let job = Job {
            queue_name: queue_name.to_owned(),
            job_id: dequeued.record_id,
            cancel: dequeued.cancel,
            started: now,
            _permit: permit,
        };

        {
            let mut executors = self.executors.lock().await;
            let entry = executors.entry(executor_name.to_owned()).or_default();
            entry.jobs.push(job);
            entry.last_update = now;
        }

        dispatcher_common::metrics::record_dequeue(queue_name, true);
        dispatcher_common::metrics::set_tokens_held(self.tokens_held() as i64);
        Ok(Some(dequeued.payload))
    }

    /// `addExecutionLogEntry(ctx, queue, executorName, jobID, entry)`.
    pub async fn add_execution_log_entry(
        &self,
        queue_name: &str,
        executor_name: &str,
        job_id: i64,
        entry: ExecutionLogEntry,
    ) -> Result<(), DispatcherError> {
        let store = self
            .registry
            .get(queue_name)
            .ok_or(DispatcherError::UnknownQueue)?;
        let cancel = self
            .check_ownership(executor_name, queue_name, job_id)
            .await?;
        store
            .add_execution_log_entry(job_id, entry, &cancel)
            .await
            .map_err(DispatcherError::from)
    }

    /// `markComplete(ctx, queue, executorName, jobID)`.
    pub async fn mark_complete(
        &self,
        queue_name: &str,
        executor_name: &str,
        job_id: i64,
    ) -> Result<(), DispatcherError> {
        let store = self
            .registry
            .get(queue_name)
            .ok_or(DispatcherError::UnknownQueue)?;
        let cancel = self
            .check_ownership(executor_name, queue_name, job_id)
            .await?;
        store.mark_complete(job_id, &cancel).await?;
        self.resolve(executor_name, queue_name, job_id, "completed")
            .await;
        Ok(())
    }

    /// `markErrored(ctx, queue, executorName, jobID, message)`.
    pub async fn mark_errored(
        &self,
        queue_name: &str,
        executor_name: &str,
        job_id: i64,
        message: &str,
    ) -> Result<(), DispatcherError> {
        let store = self
            .registry
            .get(queue_name)
            .ok_or(DispatcherError::UnknownQueue)?;
        let cancel = self
            .check_ownership(executor_name, queue_name, job_id)
            .await?;
        store.mark_errored(job_id, message, &cancel).await?;
        self.resolve(executor_name, queue_name, job_id, "errored")
            .await;
        Ok(())
    }

    /// `markFailed(ctx, queue, executorName, jobID, message)`.
    pub async fn mark_failed(
        &self,
        queue_name: &str,
        executor_name: &str,
        job_id: i64,
        message: &str,
    ) -> Result<(), DispatcherError> {
        let store = self
            .registry
            .get(queue_name)
            .ok_or(DispatcherError::UnknownQueue)?;
        let cancel = self
            .check_ownership(executor_name, queue_name, job_id)
            .await?;
        store.mark_failed(job_id, message, &cancel).await?;
        self.resolve(executor_name, queue_name, job_id, "failed")
            .await;
        Ok(())
    }

    /// `heartbeat(ctx, executorName, claimedIDs[]) -> unknownIDs[]` (§4.2).
    pub async fn heartbeat(&self, executor_name: &str, claimed_ids: &[i64]) -> HeartbeatResult {
        let now = self.clock.now();
        let claimed: HashSet<i64> = claimed_ids.iter().copied().collect();

        let (surviving, dead, unknown_ids) = {
            let mut executors = self.executors.lock().await;
            let Some(meta) = executors.get_mut(executor_name) else {
                return HeartbeatResult {
                    unknown_ids: claimed_ids.to_vec(),
                };
            };

            let owned: HashSet<i64> = meta.jobs.iter().map(|job| job.job_id).collect();
            let unknown_ids: Vec<i64> = claimed.difference(&owned).copied().collect();

            let mut live = Vec::new();
            let mut dead = Vec::new();
            for job in meta.jobs.drain(..) {
                if claimed.contains(&job.job_id) || now - job.started < self.unreported_max_age {
                    live.push(job);
                } else {
                    dead.push(job);
                }
            }

            let surviving: Vec<(String, i64, CancelHandle)> = live
                .iter()
                .map(|job| (job.queue_name.clone(), job.job_id, job.cancel.clone()))
                .collect();
            meta.jobs = live;
            meta.last_update = now;

            (surviving, dead, unknown_ids)
        };

        for (queue_name, job_id, cancel) in &surviving {
            if let Some(store) = self.registry.get(queue_name) {
                if let Err(error) = store.heartbeat(*job_id, cancel).await {
                    tracing::warn!(%error, job_id, queue = %queue_name, "heartbeat stamp failed");
                }
            }
        }

        let mut requeue_errors = Vec::new();
        for job in dead {
            if let Some(store) = self.registry.get(&job.queue_name) {
                let at = now + self.requeue_delay;
                if let Err(error) = store.requeue(job.job_id, at, &job.cancel).await {
                    requeue_errors.push(error);
                }
                dispatcher_common::metrics::record_requeue(&job.queue_name, "heartbeat");
            }
            job.cancel.cancel().await;
            // job's permit is released when it is dropped here.
        }
        if !requeue_errors.is_empty() {
            tracing::warn!(
                count = requeue_errors.len(),
                executor = executor_name,
                "errors requeuing dead jobs during heartbeat"
            );
        }
        dispatcher_common::metrics::set_tokens_held(self.tokens_held() as i64);

        HeartbeatResult { unknown_ids }
    }

    /// Periodic reaper: evicts executors silent for longer than `death_threshold` and
    /// requeues everything they were holding.
    pub async fn cleanup(&self, death_threshold: ChronoDuration) {
        let now = self.clock.now();
        let evicted: Vec<(String, Vec<Job>)> = {
            let mut executors = self.executors.lock().await;
            let dead_names: Vec<String> = executors
                .iter()
                .filter(|(_, meta)| now - meta.last_update > death_threshold)
                .map(|(name, _)| name.clone())
                .collect();
            dead_names
                .into_iter()
                .filter_map(|name| executors.remove(&name).map(|meta| (name, meta.jobs)))
                .collect()
        };

        for (executor_name, jobs) in evicted {
            for job in jobs {
                if let Some(store) = self.registry.get(&job.queue_name) {
                    let at = now + self.requeue_delay;
                    if let Err(error) = store.requeue(job.job_id, at, &job.cancel).await {
                        tracing::warn!(
                            %error,
                            executor = %executor_name,
                            job_id = job.job_id,
                            "failed to requeue job during cleanup"
                        );
                    }
                    dispatcher_common::metrics::record_requeue(&job.queue_name, "cleanup");
                }
                job.cancel.cancel().await;
            }
            tracing::info!(executor = %executor_name, "evicted silent executor");
        }
        dispatcher_common::metrics::set_tokens_held(self.tokens_held() as i64);
    }

    /// Cancels every held transaction without marking records; recovery is left to the
    /// store's stalled-job sweeper on next startup.
    pub async fn shutdown(&self) {
        let drained: Vec<Job> = {
            let mut executors = self.executors.lock().await;
            executors.drain().flat_map(|(_, meta)| meta.jobs).collect()
        };
        for job in drained {
            job.cancel.cancel().await;
        }
    }

    /// Confirms `executor_name` holds `job_id` on `queue_name` and hands back its
    /// cancel handle, so the caller can resolve the job's held transaction directly
    /// instead of racing a separate pool connection against it.
    async fn check_ownership(
        &self,
        executor_name: &str,
        queue_name: &str,
        job_id: i64,
    ) -> Result<CancelHandle, DispatcherError> {
        let executors = self.executors.lock().await;
        executors
            .get(executor_name)
            .and_then(|meta| {
                meta.jobs
                    .iter()
                    .find(|job| job.queue_name == queue_name && job.job_id == job_id)
            })
            .map(|job| job.cancel.clone())
            .ok_or(DispatcherError::UnknownJob)
    }

    async fn resolve(&self, executor_name: &str, queue_name: &str, job_id: i64, outcome: &str) {
        let job = {
            let mut executors = self.executors.lock().await;
            let Some(meta) = executors.get_mut(executor_name) else {
                return;
            };
            let pos = meta
                .jobs
                .iter()
                .position(|job| job.queue_name == queue_name && job.job_id == job_id);
            pos.map(|pos| meta.jobs.swap_remove(pos))
        };
        if let Some(job) = job {
            job.cancel.cancel().await;
            dispatcher_common::metrics::record_resolution(queue_name, outcome);
            dispatcher_common::metrics::set_tokens_held(self.tokens_held() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use dispatcher_common::{ManualClock, QueueStore};

    use crate::test_support::FakeStore;

    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn build_dispatcher(
        store: Arc<FakeStore>,
        capacity: usize,
        clock: Arc<ManualClock>,
    ) -> Dispatcher {
        let mut registry = QueueRegistry::new();
        registry.register(store.queue_name().to_owned(), store);
        Dispatcher::new(
            registry,
            capacity,
            clock,
            ChronoDuration::minutes(1),
            ChronoDuration::seconds(30),
        )
    }

    #[tokio::test]
    async fn dequeue_then_mark_complete_round_trips_admission_token() {
        let store = FakeStore::new("q");
        store.push_job("github.com/acme/widgets");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 1, clock);

        let job = dispatcher
            .dequeue("q", "executor-1", "host-1")
            .await
            .expect("dequeue should not error")
            .expect("job should be available");
        assert_eq!(job.id, 1);
        assert_eq!(dispatcher.tokens_held(), 1);
        assert_eq!(dispatcher.outstanding_jobs().await, 1);

        dispatcher
            .mark_complete("q", "executor-1", job.id)
            .await
            .expect("mark_complete should succeed");

        assert_eq!(dispatcher.tokens_held(), 0);
        assert_eq!(dispatcher.outstanding_jobs().await, 0);
        assert_eq!(store.completed.lock().unwrap().as_slice(), &[1]);
        assert!(store.handle_for(1).is_cancelled());
    }

    #[tokio::test]
    async fn unreported_max_age_grace_window_protects_a_freshly_dequeued_job() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 1, clock.clone());

        let job = dispatcher.dequeue("q", "e1", "h1").await.unwrap().unwrap();
        // Within the grace window, a heartbeat that doesn't claim this job yet (the
        // executor hasn't had a chance to report it) must not requeue it.
        clock.advance(ChronoDuration::seconds(5));

        let result = dispatcher.heartbeat("e1", &[]).await;
        assert!(result.unknown_ids.is_empty());
        assert_eq!(dispatcher.outstanding_jobs().await, 1);
        assert!(store.requeues.lock().unwrap().is_empty());
        assert!(!store.handle_for(job.id).is_cancelled());
    }

    #[tokio::test]
    async fn dequeue_returns_not_ok_when_admission_pool_is_exhausted() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        store.push_job("repo-b");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 1, clock);

        let first = dispatcher.dequeue("q", "e1", "h1").await.unwrap();
        assert!(first.is_some());

        let second = dispatcher.dequeue("q", "e2", "h2").await.unwrap();
        assert!(
            second.is_none(),
            "admission pool is saturated even though a row is still queued"
        );
    }

    #[tokio::test]
    async fn dequeue_fails_for_unregistered_queue() {
        let store = FakeStore::new("q");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store, 1, clock);

        let result = dispatcher.dequeue("missing", "e1", "h1").await;
        assert!(matches!(result, Err(DispatcherError::UnknownQueue)));
    }

    #[tokio::test]
    async fn terminal_call_on_unowned_job_fails_unknown_job() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store, 1, clock);

        dispatcher.dequeue("q", "owner", "h1").await.unwrap();

        let result = dispatcher.mark_complete("q", "impostor", 1).await;
        assert!(matches!(result, Err(DispatcherError::UnknownJob)));
    }

    #[tokio::test]
    async fn heartbeat_on_unknown_executor_returns_all_ids_as_unknown() {
        let store = FakeStore::new("q");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store, 1, clock);

        let result = dispatcher.heartbeat("ghost", &[1, 2, 3]).await;
        assert_eq!(result.unknown_ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn heartbeat_reports_phantom_ids_but_keeps_known_job_assigned() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 1, clock);

        let job = dispatcher.dequeue("q", "e1", "h1").await.unwrap().unwrap();

        let result = dispatcher.heartbeat("e1", &[job.id, 999]).await;
        assert_eq!(result.unknown_ids, vec![999]);
        assert_eq!(dispatcher.outstanding_jobs().await, 1);
        assert_eq!(store.heartbeats.lock().unwrap().as_slice(), &[job.id]);
    }

    #[tokio::test]
    async fn heartbeat_requeues_jobs_the_executor_stopped_claiming() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 1, clock.clone());

        let job = dispatcher.dequeue("q", "e1", "h1").await.unwrap().unwrap();
        clock.advance(ChronoDuration::minutes(5));

        let result = dispatcher.heartbeat("e1", &[]).await;
        assert!(result.unknown_ids.is_empty());
        assert_eq!(dispatcher.outstanding_jobs().await, 0);
        assert_eq!(dispatcher.tokens_held(), 0);
        assert_eq!(store.requeues.lock().unwrap().as_slice(), &[job.id]);
        assert!(store.handle_for(job.id).is_cancelled());
    }

    #[tokio::test]
    async fn cleanup_evicts_silent_executors_and_requeues_their_jobs() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 1, clock.clone());

        let job = dispatcher.dequeue("q", "e1", "h1").await.unwrap().unwrap();
        clock.advance(ChronoDuration::minutes(10));

        dispatcher.cleanup(ChronoDuration::minutes(5)).await;

        assert_eq!(dispatcher.outstanding_jobs().await, 0);
        assert_eq!(dispatcher.tokens_held(), 0);
        assert_eq!(store.requeues.lock().unwrap().as_slice(), &[job.id]);
        assert!(store.handle_for(job.id).is_cancelled());
    }

    #[tokio::test]
    async fn mark_errored_and_mark_failed_pass_messages_verbatim() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        store.push_job("repo-b");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 2, clock);

        let first = dispatcher.dequeue("q", "e1", "h1").await.unwrap().unwrap();
        let second = dispatcher.dequeue("q", "e2", "h2").await.unwrap().unwrap();

        dispatcher
            .mark_errored("q", "e1", first.id, "transient network error")
            .await
            .unwrap();
        dispatcher
            .mark_failed("q", "e2", second.id, "unrecoverable: bad payload")
            .await
            .unwrap();

        assert_eq!(
            store.errored.lock().unwrap().as_slice(),
            &[(first.id, "transient network error".to_owned())]
        );
        assert_eq!(
            store.failed.lock().unwrap().as_slice(),
            &[(second.id, "unrecoverable: bad payload".to_owned())]
        );
        assert_eq!(dispatcher.outstanding_jobs().await, 0);
        assert_eq!(dispatcher.tokens_held(), 0);
    }

    #[tokio::test]
    async fn add_execution_log_entry_requires_ownership_and_keeps_job_assigned() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store, 1, clock);

        let job = dispatcher.dequeue("q", "e1", "h1").await.unwrap().unwrap();
        let entry = dispatcher_common::ExecutionLogEntry {
            key: "step.docker.0".to_owned(),
            command: vec!["docker".to_owned(), "build".to_owned()],
            out: "done".to_owned(),
            start_time: epoch(),
            exit_code: Some(0),
            duration_ms: Some(1200),
        };

        dispatcher
            .add_execution_log_entry("q", "e1", job.id, entry.clone())
            .await
            .expect("owner can append a log entry");
        assert_eq!(dispatcher.outstanding_jobs().await, 1);

        let result = dispatcher
            .add_execution_log_entry("q", "impostor", job.id, entry)
            .await;
        assert!(matches!(result, Err(DispatcherError::UnknownJob)));
    }

    #[tokio::test]
    async fn shutdown_cancels_every_outstanding_transaction() {
        let store = FakeStore::new("q");
        store.push_job("repo-a");
        store.push_job("repo-b");
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher = build_dispatcher(store.clone(), 2, clock);

        let first = dispatcher.dequeue("q", "e1", "h1").await.unwrap().unwrap();
        let second = dispatcher.dequeue("q", "e2", "h2").await.unwrap().unwrap();

        dispatcher.shutdown().await;

        assert_eq!(dispatcher.outstanding_jobs().await, 0);
        assert!(store.handle_for(first.id).is_cancelled());
        assert!(store.handle_for(second.id).is_cancelled());
        // shutdown does not mark records; requeue/reset is the sweeper's job.
        assert!(store.requeues.lock().unwrap().is_empty());
        assert!(store.completed.lock().unwrap().is_empty());
    }
}
