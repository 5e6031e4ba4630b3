//! Durable job queue and lease lifecycle for the ingestion pipeline.
//!
//! Producers enqueue deduplicated work; stateless workers lease, heartbeat,
//! and settle it. Postgres row locks and partial unique indexes carry the
//! correctness invariants, so any number of workers can participate without
//! application-level locking.

pub mod config;
pub mod job;
pub mod lease;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod runtime;

pub use config::{IngestConfig, LeaseConfig, QueueConfig, RetryConfig, WatchConfig};
pub use job::{
    DependencyKey, EnqueueRequest, FolderScanJob, ImageFetchJob, ImageVariant, IndexUpsertJob,
    JobHandle, JobId, JobKind, JobPayload, JobPriority, JobRecord, JobState, MediaAnalyzeJob,
    MetadataEnrichJob, ScanReason,
};
pub use lease::{JobLease, LeaseId, LeaseRenewal, LeaseRequest};
pub use persistence::PostgresJobQueue;
pub use queue::{
    JobQueue, LeaseExpiryScanner, QueueInstrumentation, QueueSnapshot, QueueSnapshotEntry,
};
pub use retry::RetryPolicy;
pub use runtime::Housekeeper;
