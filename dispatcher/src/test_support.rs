//! Shared test doubles used by unit tests across this crate. Not compiled into the
//! release binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatcher_common::{
    CancelHandle, DequeueError, DequeuedJob, ExecutionLogEntry, JobPayload, QueueStore, StoreError,
};

/// An in-memory `QueueStore` double: a FIFO of ready-to-dequeue payloads plus a log of
/// every call made to it, so dispatcher and handler tests can assert on requeues,
/// heartbeat stamps, and terminal resolutions without a real database.
#[derive(Default)]
pub(crate) struct FakeStore {
    name: String,
    queued: StdMutex<Vec<(i64, JobPayload)>>,
    next_id: AtomicI64,
    pub(crate) heartbeats: StdMutex<Vec<i64>>,
    pub(crate) requeues: StdMutex<Vec<i64>>,
    pub(crate) completed: StdMutex<Vec<i64>>,
    pub(crate) errored: StdMutex<Vec<(i64, String)>>,
    pub(crate) failed: StdMutex<Vec<(i64, String)>>,
    handles: StdMutex<HashMap<i64, CancelHandle>>,
}

impl FakeStore {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(FakeStore {
            name: name.to_owned(),
            ..Default::default()
        })
    }

    pub(crate) fn push_job(self: &Arc<Self>, repository_name: &str) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = JobPayload {
            id,
            repository_name: repository_name.to_owned(),
            commit: "deadbeef".to_owned(),
            fetch_tar: None,
            docker_steps: Vec::new(),
            cli_steps: Vec::new(),
            redacted_values: Default::default(),
        };
        self.queued.lock().unwrap().push((id, payload));
        id
    }

    pub(crate) fn handle_for(&self, id: i64) -> CancelHandle {
        self.handles.lock().unwrap().get(&id).unwrap().clone()
    }
}

#[async_trait]
impl QueueStore for FakeStore {
    async fn dequeue(&self, _hostname: &str) -> Result<Option<DequeuedJob>, DequeueError> {
        let mut queued = self.queued.lock().unwrap();
        if queued.is_empty() {
            return Ok(None);
        }
        let (id, payload) = queued.remove(0);
        let cancel = CancelHandle::inert();
        self.handles.lock().unwrap().insert(id, cancel.clone());
        Ok(Some(DequeuedJob {
            record_id: id,
            payload,
            cancel,
        }))
    }

    async fn heartbeat(&self, id: i64, _cancel: &CancelHandle) -> Result<(), StoreError> {
        self.heartbeats.lock().unwrap().push(id);
        Ok(())
    }

    async fn add_execution_log_entry(
        &self,
        _id: i64,
        _entry: ExecutionLogEntry,
        _cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn mark_complete(&self, id: i64, _cancel: &CancelHandle) -> Result<(), StoreError> {
        self.completed.lock().unwrap().push(id);
        Ok(())
    }

    async fn mark_errored(
        &self,
        id: i64,
        message: &str,
        _cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        self.errored.lock().unwrap().push((id, message.to_owned()));
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        message: &str,
        _cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        self.failed.lock().unwrap().push((id, message.to_owned()));
        Ok(())
    }

    async fn requeue(
        &self,
        id: i64,
        _at: DateTime<Utc>,
        _cancel: &CancelHandle,
    ) -> Result<(), StoreError> {
        self.requeues.lock().unwrap().push(id);
        Ok(())
    }

    async fn reset_stalled(&self, _now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        Ok(Vec::new())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
