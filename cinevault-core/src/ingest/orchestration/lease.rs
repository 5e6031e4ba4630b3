use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{JobKind, JobRecord};
use crate::types::LibraryId;

/// Identifier of one time-bounded claim on one job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lease metadata returned when a worker claims a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub job: JobRecord,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Request to claim ready work from the queue.
///
/// Leases are advisory claims, not exclusive locks on external resources:
/// a crashed worker's lease is eventually reaped and the job re-leased, so
/// handlers must be idempotent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Worker identity recorded as the lease owner.
    pub worker_id: String,
    /// How long the claim stays valid without a heartbeat.
    pub lease_ttl: chrono::Duration,
    /// Maximum number of jobs to claim in one call.
    pub limit: usize,
    /// Restrict the claim to one queue kind.
    #[serde(default)]
    pub kind: Option<JobKind>,
    /// Restrict the claim to one library.
    #[serde(default)]
    pub library_id: Option<LibraryId>,
}

impl LeaseRequest {
    pub fn one(worker_id: impl Into<String>, kind: JobKind, lease_ttl: chrono::Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease_ttl,
            limit: 1,
            kind: Some(kind),
            library_id: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn for_library(mut self, library_id: LibraryId) -> Self {
        self.library_id = Some(library_id);
        self
    }
}

/// Payload provided when heartbeating a lease.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRenewal {
    pub lease_id: LeaseId,
    pub worker_id: String,
    pub extend_by: chrono::Duration,
}
