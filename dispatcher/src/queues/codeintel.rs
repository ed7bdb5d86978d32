//! The `codeintel` queue (§4.6): a fixture queue grounded in the original
//! `enterprise/cmd/executor-queue/internal/queues/codeintel` package, kept around to
//! exercise the registry/transformer seam end-to-end. Its record shape is not part of
//! the hard engineering this repository generalizes (§1) — only the transformer call
//! signature matters.

use dispatcher_common::{CliStep, DockerStep, JobPayload, PgWorkStore, Record, TransformError};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::Config;

pub const QUEUE_NAME: &str = "codeintel";

/// The queue-specific payload column family for `codeintel` records: enough to
/// reconstruct a fetch + docker/cli step sequence for one repository at one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeIntelPayload {
    pub repository_name: String,
    pub commit: String,
    #[serde(default)]
    pub fetch_tar: Option<bool>,
    #[serde(default)]
    pub docker_steps: Vec<DockerStep>,
    #[serde(default)]
    pub cli_steps: Vec<CliStep>,
    #[serde(default)]
    pub redacted_values: std::collections::HashMap<String, String>,
}

/// Maps a `codeintel` record 1:1 onto the queue-neutral job payload handed to
/// executors. Pure function of its input, per the registry's contract (§4.4).
pub fn transform(record: &Record<CodeIntelPayload>) -> Result<JobPayload, TransformError> {
    let payload = &record.payload.0;
    if payload.repository_name.is_empty() {
        return Err(TransformError::new("repository name is empty"));
    }
    if payload.commit.is_empty() {
        return Err(TransformError::new("commit is empty"));
    }
    Ok(JobPayload {
        id: record.id,
        repository_name: payload.repository_name.clone(),
        commit: payload.commit.clone(),
        fetch_tar: payload.fetch_tar,
        docker_steps: payload.docker_steps.clone(),
        cli_steps: payload.cli_steps.clone(),
        redacted_values: payload.redacted_values.clone(),
    })
}

pub fn store(pool: PgPool, config: &Config) -> PgWorkStore<CodeIntelPayload> {
    PgWorkStore::new(
        pool,
        QUEUE_NAME,
        "queued_at, id",
        config.death_threshold(),
        config.max_num_resets,
        transform,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(repository_name: &str, commit: &str) -> Record<CodeIntelPayload> {
        Record {
            id: 1,
            queue: QUEUE_NAME.to_owned(),
            state: dispatcher_common::RecordState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            num_resets: 0,
            num_failures: 0,
            worker_hostname: None,
            failure_message: None,
            execution_logs: sqlx::types::Json(Vec::new()),
            payload: sqlx::types::Json(CodeIntelPayload {
                repository_name: repository_name.to_owned(),
                commit: commit.to_owned(),
                fetch_tar: Some(true),
                docker_steps: Vec::new(),
                cli_steps: Vec::new(),
                redacted_values: Default::default(),
            }),
        }
    }

    #[test]
    fn transforms_populated_record() {
        let record = record("github.com/acme/widgets", "deadbeef");
        let job = transform(&record).expect("transform should succeed");
        assert_eq!(job.id, 1);
        assert_eq!(job.repository_name, "github.com/acme/widgets");
        assert_eq!(job.commit, "deadbeef");
        assert_eq!(job.fetch_tar, Some(true));
    }

    #[test]
    fn rejects_missing_repository_name() {
        let record = record("", "deadbeef");
        assert!(transform(&record).is_err());
    }

    #[test]
    fn rejects_missing_commit() {
        let record = record("github.com/acme/widgets", "");
        assert!(transform(&record).is_err());
    }
}
