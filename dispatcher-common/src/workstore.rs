//! The durable, transactional work-queue backing store.
//!
//! All queues share one physical table, discriminated by a `queue` column, mirroring
//! how a single job table backs every queue in a `PgQueue`. Each queue registers its own
//! [`PgWorkStore`] with an `ORDER BY` expression and a retry budget, and gets handed back
//! a type-erased [`QueueStore`] the dispatcher can hold without knowing the queue's
//! payload type.
//!
//! At-most-one-worker semantics are enforced with `FOR UPDATE SKIP LOCKED` at dequeue
//! time. Rather than keeping the dequeue transaction itself open for the lifetime of the
//! job (which would make `state = 'processing'` invisible to every other connection,
//! including the stalled-job sweeper), `Dequeue` commits the `processing` transition and
//! then opens a second, dedicated transaction that does nothing but hold a row lock on
//! the same id. That second transaction is the one wrapped in the returned
//! [`CancelHandle`]: as long as it is alive, `ResetStalled`'s own `FOR UPDATE SKIP
//! LOCKED` scan will skip the row; once it is cancelled (explicitly, or implicitly by
//! the process crashing and the connection dropping), the row becomes visible to the
//! sweeper again.
//!
//! Every later call against that same id — `Heartbeat`, `AddExecutionLogEntry`, the
//! three `Mark*` calls, `Requeue` — therefore has to run *through* the held transaction
//! rather than against a fresh pool connection: a second connection's `UPDATE` would
//! block behind the row lock the first connection is still holding on itself, and never
//! return. `Heartbeat`/`AddExecutionLogEntry` borrow the transaction for one query and
//! hand it back; the terminal/requeue calls take it and commit, which both persists the
//! state change and releases the row lock in the same step (mirroring `PgTransactionJob`
//! committing a batch only after every job in it has been resolved).

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;
use tokio::sync::Mutex;

use crate::error::{DequeueError, StoreError, TransformError};
use crate::job::{ExecutionLogEntry, JobPayload, Record};

enum CancelState {
    Transaction(Mutex<Option<Transaction<'static, Postgres>>>),
    /// Backs handles built by [`CancelHandle::inert`], for `QueueStore` test doubles
    /// that have no real transaction to roll back.
    Flag(std::sync::atomic::AtomicBool),
}

/// A handle that aborts the database transaction locking a specific record.
///
/// Cancel is idempotent: calling it twice, or calling it after the handle has already
/// been consumed, is a no-op rather than an error.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    fn new(txn: Transaction<'static, Postgres>) -> Self {
        CancelHandle {
            state: Arc::new(CancelState::Transaction(Mutex::new(Some(txn)))),
        }
    }

    /// Builds a handle with no backing transaction, for `QueueStore` test doubles that
    /// never open a real connection. [`CancelHandle::is_cancelled`] reports whether
    /// `cancel` has been called on it.
    pub fn inert() -> Self {
        CancelHandle {
            state: Arc::new(CancelState::Flag(std::sync::atomic::AtomicBool::new(
                false,
            ))),
        }
    }

    /// Abort the held transaction, releasing its row lock. Safe to call more than once.
    pub async fn cancel(&self) {
        match &*self.state {
            CancelState::Transaction(lock) => {
                let mut guard = lock.lock().await;
                if let Some(txn) = guard.take() {
                    if let Err(error) = txn.rollback().await {
                        tracing::warn!(%error, "rollback of cancelled lock transaction failed");
                    }
                }
            }
            CancelState::Flag(flag) => flag.store(true, std::sync::atomic::Ordering::SeqCst),
        }
    }

    /// Whether `cancel` has been called on an [`inert`](Self::inert) handle. Real,
    /// transaction-backed handles always report `false` here; callers that need to
    /// observe resolution track it themselves (e.g. via the dispatcher's in-memory
    /// job map).
    pub fn is_cancelled(&self) -> bool {
        match &*self.state {
            CancelState::Transaction(_) => false,
            CancelState::Flag(flag) => flag.load(std::sync::atomic::Ordering::SeqCst),
        }
    }

    /// Takes the held transaction out of the handle, leaving it empty. Used by the
    /// terminal/requeue calls, which commit it, and by the non-terminal ones, which put
    /// it back with [`CancelHandle::restore_transaction`] once their query has run.
    /// Fails if the transaction has already been taken (and not restored) or this is an
    /// inert test-double handle.
    async fn take_transaction(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        match &*self.state {
            CancelState::Transaction(lock) => lock
                .lock()
                .await
                .take()
                .ok_or(StoreError::TransactionAlreadyClosed),
            CancelState::Flag(_) => Err(StoreError::TransactionAlreadyClosed),
        }
    }

    /// Puts a transaction previously removed by [`CancelHandle::take_transaction`] back,
    /// so the row stays locked for the rest of the job's lifetime.
    async fn restore_transaction(&self, txn: Transaction<'static, Postgres>) {
        if let CancelState::Transaction(lock) = &*self.state {
            *lock.lock().await = Some(txn);
        }
    }
}

/// The result of a successful dequeue: the transformed job payload ready to hand to an
/// executor, the record's id, and the cancel handle bound to its lock transaction.
pub struct DequeuedJob {
    pub record_id: i64,
    pub payload: JobPayload,
    pub cancel: CancelHandle,
}

/// Type-erased work store contract used by the dispatcher and the stalled-job sweeper.
/// One implementation, [`PgWorkStore`], backs every queue; it is generic over the
/// queue's payload type, which this trait hides behind the already-transformed
/// [`JobPayload`].
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn dequeue(&self, hostname: &str) -> Result<Option<DequeuedJob>, DequeueError>;

    /// Stamps the row's heartbeat through its own held transaction — see the module
    /// docs for why this can't run against a separate pool connection.
    async fn heartbeat(&self, id: i64, cancel: &CancelHandle) -> Result<(), StoreError>;

    async fn add_execution_log_entry(
        &self,
        id: i64,
        entry: ExecutionLogEntry,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError>;

    /// Marks the row `completed` and commits its held transaction, releasing the row
    /// lock in the same step as the state change.
    async fn mark_complete(&self, id: i64, cancel: &CancelHandle) -> Result<(), StoreError>;

    async fn mark_errored(
        &self,
        id: i64,
        message: &str,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        id: i64,
        message: &str,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError>;

    async fn requeue(
        &self,
        id: i64,
        at: DateTime<Utc>,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError>;

    /// Returns rows stuck in `processing` whose lock transaction is gone and whose
    /// heartbeat is older than this queue's configured `stalled_max_age`, evaluated as
    /// of `now`. Ids that were reset to `queued` and ids that were promoted to
    /// `errored` are both returned; the caller does not need to distinguish them.
    async fn reset_stalled(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError>;

    /// The name this store is registered under, for logging and metrics.
    fn queue_name(&self) -> &str;
}

type Transformer<P> = Arc<dyn Fn(&Record<P>) -> Result<JobPayload, TransformError> + Send + Sync>;

/// A work store for one queue, backed by the shared `queue_jobs` table.
pub struct PgWorkStore<P> {
    pool: PgPool,
    queue_name: String,
    order_by: &'static str,
    stalled_max_age: ChronoDuration,
    max_num_resets: i32,
    transform: Transformer<P>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> PgWorkStore<P>
where
    P: DeserializeOwned + Serialize + Send + Sync + Unpin + 'static,
{
    /// Build a work store for `queue_name`.
    ///
    /// * `order_by` must be a trusted, queue-owned expression (e.g. `"queued_at, id"`) —
    ///   it is interpolated directly into the dequeue query, never taken from a caller.
    /// * `transform` converts a fetched `Record<P>` into the queue-neutral job payload
    ///   handed to executors; it must be a pure function of its input.
    pub fn new(
        pool: PgPool,
        queue_name: impl Into<String>,
        order_by: &'static str,
        stalled_max_age: ChronoDuration,
        max_num_resets: i32,
        transform: impl Fn(&Record<P>) -> Result<JobPayload, TransformError> + Send + Sync + 'static,
    ) -> Self {
        PgWorkStore {
            pool,
            queue_name: queue_name.into(),
            order_by,
            stalled_max_age,
            max_num_resets,
            transform: Arc::new(transform),
            _payload: PhantomData,
        }
    }

    async fn fetch_and_lock(&self, hostname: &str) -> Result<Option<Record<P>>, StoreError> {
        let query = format!(
            r#"
WITH candidate AS (
    SELECT id FROM queue_jobs
    WHERE queue = $1 AND state = 'queued'::record_state
    ORDER BY {order_by}
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE queue_jobs
SET state = 'processing'::record_state,
    started_at = now(),
    worker_hostname = $2,
    last_heartbeat_at = now()
FROM candidate
WHERE queue_jobs.id = candidate.id
RETURNING queue_jobs.*
"#,
            order_by = self.order_by,
        );

        sqlx::query_as(&query)
            .bind(&self.queue_name)
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::query("UPDATE", error))
    }

    async fn open_lock_transaction(&self, id: i64) -> Result<CancelHandle, StoreError> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::Connection { error })?;

        sqlx::query("SELECT 1 FROM queue_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .execute(&mut *txn)
            .await
            .map_err(|error| StoreError::query("SELECT FOR UPDATE", error))?;

        Ok(CancelHandle::new(txn))
    }
}

#[async_trait]
impl<P> QueueStore for PgWorkStore<P>
where
    P: DeserializeOwned + Serialize + Send + Sync + Unpin + 'static,
{
    async fn dequeue(&self, hostname: &str) -> Result<Option<DequeuedJob>, DequeueError> {
        let Some(record) = self.fetch_and_lock(hostname).await? else {
            return Ok(None);
        };

        let cancel = self.open_lock_transaction(record.id).await?;

        match (self.transform)(&record) {
            Ok(payload) => Ok(Some(DequeuedJob {
                record_id: record.id,
                payload,
                cancel,
            })),
            Err(transform_error) => {
                let message = format!("failed to transform record: {}", transform_error.message);
                self.mark_failed(record.id, &message, &cancel).await?;
                Err(DequeueError::Transform(transform_error))
            }
        }
    }

    async fn heartbeat(&self, id: i64, cancel: &CancelHandle) -> Result<(), StoreError> {
        let mut txn = cancel.take_transaction().await?;
        let result = sqlx::query(
            "UPDATE queue_jobs SET last_heartbeat_at = now() \
             WHERE id = $1 AND state = 'processing'::record_state",
        )
        .bind(id)
        .execute(&mut *txn)
        .await
        .map_err(|error| StoreError::query("UPDATE", error));
        cancel.restore_transaction(txn).await;
        result.map(|_| ())
    }

    async fn add_execution_log_entry(
        &self,
        id: i64,
        entry: ExecutionLogEntry,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        let appended = sqlx::types::Json(vec![entry]);
        let mut txn = cancel.take_transaction().await?;
        let result = sqlx::query(
            "UPDATE queue_jobs SET execution_logs = execution_logs || $2::jsonb WHERE id = $1",
        )
        .bind(id)
        .bind(appended)
        .execute(&mut *txn)
        .await
        .map_err(|error| StoreError::query("UPDATE", error));
        cancel.restore_transaction(txn).await;
        result.map(|_| ())
    }

    async fn mark_complete(&self, id: i64, cancel: &CancelHandle) -> Result<(), StoreError> {
        let mut txn = cancel.take_transaction().await?;
        sqlx::query(
            "UPDATE queue_jobs SET state = 'completed'::record_state, finished_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *txn)
        .await
        .map_err(|error| StoreError::query("UPDATE", error))?;
        txn.commit()
            .await
            .map_err(|error| StoreError::Connection { error })
    }

    async fn mark_errored(
        &self,
        id: i64,
        message: &str,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        let mut txn = cancel.take_transaction().await?;
        sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'errored'::record_state, finished_at = now(), \
                 failure_message = $2, num_failures = num_failures + 1 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(message)
        .execute(&mut *txn)
        .await
        .map_err(|error| StoreError::query("UPDATE", error))?;
        txn.commit()
            .await
            .map_err(|error| StoreError::Connection { error })
    }

    async fn mark_failed(
        &self,
        id: i64,
        message: &str,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        let mut txn = cancel.take_transaction().await?;
        sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'failed'::record_state, finished_at = now(), \
                 failure_message = $2, num_failures = num_failures + 1 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(message)
        .execute(&mut *txn)
        .await
        .map_err(|error| StoreError::query("UPDATE", error))?;
        txn.commit()
            .await
            .map_err(|error| StoreError::Connection { error })
    }

    async fn requeue(
        &self,
        id: i64,
        at: DateTime<Utc>,
        cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        let mut txn = cancel.take_transaction().await?;
        sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'queued'::record_state, queued_at = $2, \
                 started_at = NULL, worker_hostname = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&mut *txn)
        .await
        .map_err(|error| StoreError::query("UPDATE", error))?;
        txn.commit()
            .await
            .map_err(|error| StoreError::Connection { error })
    }

    async fn reset_stalled(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let cutoff = now - self.stalled_max_age;

        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
WITH stalled AS (
    SELECT id, num_resets FROM queue_jobs
    WHERE queue = $1
      AND state = 'processing'::record_state
      AND last_heartbeat_at < $2
    FOR UPDATE SKIP LOCKED
)
UPDATE queue_jobs
SET state = CASE WHEN stalled.num_resets < $3 THEN 'queued'::record_state ELSE 'errored'::record_state END,
    num_resets = stalled.num_resets + 1,
    queued_at = CASE WHEN stalled.num_resets < $3 THEN now() ELSE queue_jobs.queued_at END,
    started_at = NULL,
    worker_hostname = NULL,
    finished_at = CASE WHEN stalled.num_resets < $3 THEN NULL ELSE now() END,
    failure_message = CASE WHEN stalled.num_resets < $3 THEN NULL ELSE 'exceeded maximum reset attempts' END
FROM stalled
WHERE queue_jobs.id = stalled.id
RETURNING queue_jobs.id
"#,
        )
        .bind(&self.queue_name)
        .bind(cutoff)
        .bind(self.max_num_resets)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::query("UPDATE", error))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CliStep, DockerStep};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestPayload {
        repository_name: String,
        commit: String,
    }

    fn test_transform(record: &Record<TestPayload>) -> Result<JobPayload, TransformError> {
        if record.payload.commit.is_empty() {
            return Err(TransformError::new("commit is empty"));
        }
        Ok(JobPayload {
            id: record.id,
            repository_name: record.payload.repository_name.clone(),
            commit: record.payload.commit.clone(),
            fetch_tar: None,
            docker_steps: Vec::<DockerStep>::new(),
            cli_steps: Vec::<CliStep>::new(),
            redacted_values: Default::default(),
        })
    }

    #[test]
    fn transform_rejects_empty_commit() {
        let record = Record {
            id: 1,
            queue: "test".to_owned(),
            state: crate::job::RecordState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            num_resets: 0,
            num_failures: 0,
            worker_hostname: None,
            failure_message: None,
            execution_logs: sqlx::types::Json(Vec::new()),
            payload: sqlx::types::Json(TestPayload {
                repository_name: "repo".to_owned(),
                commit: String::new(),
            }),
        };
        assert!(test_transform(&record).is_err());
    }
}
