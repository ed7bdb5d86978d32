//! Queue-neutral data shapes shared between the work store and the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent lifecycle state of a record. Stored as the Postgres enum `record_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "record_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Queued,
    Processing,
    Completed,
    Errored,
    Failed,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Completed | RecordState::Errored | RecordState::Failed
        )
    }
}

/// One structured entry in a record's execution log, appended to as the executor makes
/// progress on a job (e.g. one entry per docker/cli step).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    pub key: String,
    pub command: Vec<String>,
    pub out: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// A row in a queue table, generic over the queue-specific payload `P`.
///
/// `P` is whatever JSON-serializable shape a given queue stores in its `payload`
/// column; the shared columns around it (state, timestamps, heartbeats, retry
/// bookkeeping, execution log) are identical across every queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Record<P> {
    pub id: i64,
    pub queue: String,
    pub state: RecordState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub num_resets: i32,
    pub num_failures: i32,
    pub worker_hostname: Option<String>,
    pub failure_message: Option<String>,
    pub execution_logs: sqlx::types::Json<Vec<ExecutionLogEntry>>,
    pub payload: sqlx::types::Json<P>,
}

/// The queue-neutral payload handed to an executor after a successful dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub id: i64,
    pub repository_name: String,
    pub commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_tar: Option<bool>,
    pub docker_steps: Vec<DockerStep>,
    pub cli_steps: Vec<CliStep>,
    #[serde(default)]
    pub redacted_values: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerStep {
    pub image: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliStep {
    pub command: Vec<String>,
    #[serde(default)]
    pub dir: String,
}
