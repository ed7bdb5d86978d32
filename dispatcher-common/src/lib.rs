pub mod clock;
pub mod error;
pub mod health;
pub mod job;
pub mod metrics;
pub mod workstore;

pub use clock::{Clock, ManualClock, RealClock};
pub use error::{DequeueError, StoreError, TransformError};
pub use job::{CliStep, DockerStep, ExecutionLogEntry, JobPayload, Record, RecordState};
pub use workstore::{CancelHandle, DequeuedJob, PgWorkStore, QueueStore};
