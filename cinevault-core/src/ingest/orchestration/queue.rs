use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::LibraryId;

use super::{
    job::{DependencyKey, EnqueueRequest, JobHandle, JobId, JobKind},
    lease::{JobLease, LeaseId, LeaseRenewal, LeaseRequest},
};

/// Abstracts the durable queue backend consumed by workers and producers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle>;

    /// Claim up to `request.limit` ready jobs. Never double-assigns a job:
    /// claiming is a single atomic statement against the store.
    async fn lease(&self, request: LeaseRequest) -> Result<Vec<JobLease>>;

    /// Extend a held lease. Fails with `LeaseNotFound` when the lease is
    /// no longer held (completed, reaped, or expired).
    async fn heartbeat(&self, renewal: LeaseRenewal) -> Result<JobLease>;

    /// Transition `leased -> completed`. Idempotent: completing an already
    /// released lease is a no-op.
    async fn complete(&self, lease_id: LeaseId) -> Result<()>;

    /// Record a failed attempt. Retryable failures return the job to the
    /// queue with backoff until the retry budget is exhausted, then
    /// dead-letter it; non-retryable failures are terminal immediately.
    async fn fail(&self, lease_id: LeaseId, retryable: bool, error: Option<String>)
    -> Result<()>;

    /// Delete a job that has not been leased yet.
    async fn cancel(&self, job_id: JobId) -> Result<()>;

    async fn queue_depth(&self, kind: JobKind) -> Result<usize>;

    /// Flip `deferred` jobs gated on `dependency_key` back to `ready`.
    /// Returns the number of released jobs.
    async fn release_dependency(
        &self,
        library_id: LibraryId,
        dependency_key: &DependencyKey,
    ) -> Result<u64>;

    /// Enqueue multiple jobs. Default implementation issues jobs one-by-one.
    /// Implementations backed by a transactional store should override this
    /// to insert all jobs atomically.
    async fn enqueue_many(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<JobHandle>> {
        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            out.push(self.enqueue(req).await?);
        }
        Ok(out)
    }
}

/// Housekeeping capability: find leases that expired before `now` and
/// return their jobs to the queue as a failed attempt. Must be driven
/// periodically by a supervisor; the store has no server-side timeout.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Returns number of jobs transitioned back to ready.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Delete terminal jobs whose last transition happened before the
    /// retention horizon. Returns the number of purged rows.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Optional instrumentation hook for queue implementations that can surface
/// observability data.
#[async_trait]
pub trait QueueInstrumentation: Send + Sync {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot>;
}

/// Aggregated metrics for all queue kinds at a specific instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: HashMap<JobKind, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: HashMap::new(),
        }
    }

    pub fn entry_mut(&mut self, kind: JobKind) -> &mut QueueSnapshotEntry {
        self.queues.entry(kind).or_default()
    }
}

/// Per-queue state counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    pub ready: usize,
    pub deferred: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
}
