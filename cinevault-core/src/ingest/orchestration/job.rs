use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, result::Result as StdResult, str::FromStr};
use uuid::Uuid;

use crate::{
    error::{IngestError, Result},
    types::{EntryId, FileId, LibraryId},
};

/// Unique identifier for ingestion jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority bands. Lower value wins; FIFO within a band.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobPriority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl JobPriority {
    pub fn code(self) -> i16 {
        self as u8 as i16
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(JobPriority::P0),
            1 => Ok(JobPriority::P1),
            2 => Ok(JobPriority::P2),
            3 => Ok(JobPriority::P3),
            other => Err(IngestError::Internal(format!(
                "queue returned unknown priority value {other}"
            ))),
        }
    }

    /// Keep the more urgent of the two bands.
    pub fn elevate(self, target: JobPriority) -> JobPriority {
        if target as u8 <= self as u8 { target } else { self }
    }
}

/// Scheduler-visible job states. Ready/Leased map directly to queue presence.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Ready,
    Deferred,
    Leased,
    Completed,
    Failed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Deferred => "deferred",
            JobState::Leased => "leased",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLetter => "dead_letter",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Ready | JobState::Deferred | JobState::Leased)
    }
}

impl FromStr for JobState {
    type Err = IngestError;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "ready" => Ok(JobState::Ready),
            "deferred" => Ok(JobState::Deferred),
            "leased" => Ok(JobState::Leased),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead_letter" => Ok(JobState::DeadLetter),
            other => Err(IngestError::Internal(format!(
                "queue returned unknown job state {other:?}"
            ))),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five ingestion work queues. Stored as a smallint code; the string
/// form exists only at display/serde boundaries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobKind {
    FolderScan = 0,
    MediaAnalyze = 1,
    MetadataEnrich = 2,
    IndexUpsert = 3,
    ImageFetch = 4,
}

impl JobKind {
    pub fn code(self) -> i16 {
        self as u8 as i16
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(JobKind::FolderScan),
            1 => Ok(JobKind::MediaAnalyze),
            2 => Ok(JobKind::MetadataEnrich),
            3 => Ok(JobKind::IndexUpsert),
            4 => Ok(JobKind::ImageFetch),
            other => Err(IngestError::Internal(format!(
                "queue returned unknown job kind {other}"
            ))),
        }
    }

    pub fn all_kinds() -> &'static [Self] {
        &[
            JobKind::FolderScan,
            JobKind::MediaAnalyze,
            JobKind::MetadataEnrich,
            JobKind::IndexUpsert,
            JobKind::ImageFetch,
        ]
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::FolderScan => write!(f, "scan"),
            JobKind::MediaAnalyze => write!(f, "analyze"),
            JobKind::MetadataEnrich => write!(f, "metadata"),
            JobKind::IndexUpsert => write!(f, "index"),
            JobKind::ImageFetch => write!(f, "image"),
        }
    }
}

/// Why a scan was requested. Producers map this onto a priority band.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanReason {
    HotChange,
    UserRequested,
    BulkSeed,
    MaintenanceSweep,
    WatcherOverflow,
}

impl ScanReason {
    pub fn default_priority(self) -> JobPriority {
        match self {
            ScanReason::HotChange | ScanReason::WatcherOverflow => JobPriority::P0,
            ScanReason::UserRequested | ScanReason::BulkSeed => JobPriority::P1,
            ScanReason::MaintenanceSweep => JobPriority::P2,
        }
    }
}

/// Structured payload per job kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum JobPayload {
    FolderScan(FolderScanJob),
    MediaAnalyze(MediaAnalyzeJob),
    MetadataEnrich(MetadataEnrichJob),
    IndexUpsert(IndexUpsertJob),
    ImageFetch(ImageFetchJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::FolderScan(_) => JobKind::FolderScan,
            JobPayload::MediaAnalyze(_) => JobKind::MediaAnalyze,
            JobPayload::MetadataEnrich(_) => JobKind::MetadataEnrich,
            JobPayload::IndexUpsert(_) => JobKind::IndexUpsert,
            JobPayload::ImageFetch(_) => JobKind::ImageFetch,
        }
    }

    pub fn library_id(&self) -> LibraryId {
        match self {
            JobPayload::FolderScan(job) => job.library_id,
            JobPayload::MediaAnalyze(job) => job.library_id,
            JobPayload::MetadataEnrich(job) => job.library_id,
            JobPayload::IndexUpsert(job) => job.library_id,
            JobPayload::ImageFetch(job) => job.library_id,
        }
    }

    /// A structural dedupe key extracted from payload content. This is the
    /// logical unit of work the job represents; two payloads with the same
    /// key coalesce in the queue.
    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::FolderScan(job) => {
                format!("scan:{}:{}", job.library_id, job.folder_path_norm)
            }
            JobPayload::MediaAnalyze(job) => {
                format!("analyze:{}:{}", job.library_id, job.path_norm)
            }
            JobPayload::MetadataEnrich(job) => {
                format!("metadata:{}:{}", job.library_id, job.entry_id)
            }
            JobPayload::IndexUpsert(job) => {
                format!("index:{}:{}", job.library_id, job.entry_id)
            }
            JobPayload::ImageFetch(job) => {
                format!("image:{}:{}:{}", job.library_id, job.image_id, job.variant)
            }
        }
    }
}

/// Gating key for jobs that must wait on an upstream resolution before
/// becoming leasable.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DependencyKey(String);

impl DependencyKey {
    pub fn entry(library_id: LibraryId, entry_id: EntryId) -> Self {
        Self(format!("entry:{library_id}:{entry_id}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DependencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DependencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Folder discovery payload produced by the watcher or a manual rescan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderScanJob {
    pub library_id: LibraryId,
    pub folder_path_norm: String,
    pub scan_reason: ScanReason,
    pub enqueue_time: DateTime<Utc>,
    pub device_id: Option<String>,
}

/// Technical analysis payload (container probe, stream inventory).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaAnalyzeJob {
    pub library_id: LibraryId,
    pub file_id: FileId,
    pub path_norm: String,
    pub discovered_at: DateTime<Utc>,
}

/// Metadata enrichment payload (provider match and fetch).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataEnrichJob {
    pub library_id: LibraryId,
    pub entry_id: EntryId,
    pub tmdb_id: i64,
}

/// Index upsert payload (search/browse index writes).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexUpsertJob {
    pub library_id: LibraryId,
    pub entry_id: EntryId,
    pub path_norm: String,
}

/// Background image fetch for catalog artwork.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageFetchJob {
    pub library_id: LibraryId,
    pub image_id: Uuid,
    pub variant: ImageVariant,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum ImageVariant {
    Poster,
    Backdrop,
    Profile,
}

impl ImageVariant {
    pub fn default_priority(self) -> JobPriority {
        match self {
            ImageVariant::Poster => JobPriority::P0,
            ImageVariant::Backdrop => JobPriority::P1,
            ImageVariant::Profile => JobPriority::P2,
        }
    }
}

impl fmt::Display for ImageVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageVariant::Poster => write!(f, "poster"),
            ImageVariant::Backdrop => write!(f, "backdrop"),
            ImageVariant::Profile => write!(f, "profile"),
        }
    }
}

/// Envelope stored in persistence for each job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts: u16,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub dedupe_key: String,
    pub dependency_key: Option<DependencyKey>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight summary returned to callers after enqueue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub kind: JobKind,
    pub dedupe_key: String,
    pub library_id: LibraryId,
    pub priority: JobPriority,
    pub accepted: bool,
    pub merged_into: Option<JobId>,
}

impl JobHandle {
    pub fn accepted(job_id: JobId, request: &EnqueueRequest) -> Self {
        Self {
            job_id,
            kind: request.payload.kind(),
            dedupe_key: request.dedupe_key(),
            library_id: request.payload.library_id(),
            priority: request.priority,
            accepted: true,
            merged_into: None,
        }
    }

    pub fn merged(existing: JobId, request: &EnqueueRequest) -> Self {
        Self {
            job_id: existing,
            kind: request.payload.kind(),
            dedupe_key: request.dedupe_key(),
            library_id: request.payload.library_id(),
            priority: request.priority,
            accepted: false,
            merged_into: Some(existing),
        }
    }
}

/// High-level enqueue request used by upstream producers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub priority: JobPriority,
    pub payload: JobPayload,
    /// When false, an active job with the same dedupe key turns enqueue
    /// into a `DuplicateActiveJob` error instead of a merge.
    pub allow_merge: bool,
    pub requested_at: DateTime<Utc>,
    /// Overrides the structural dedupe key extracted from the payload.
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub dependency_key: Option<DependencyKey>,
    /// Earliest time the job becomes leasable; defaults to now.
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(priority: JobPriority, payload: JobPayload) -> Self {
        Self {
            priority,
            payload,
            allow_merge: true,
            requested_at: Utc::now(),
            dedupe_key: None,
            dependency_key: None,
            available_at: None,
        }
    }

    pub fn dedupe_key(&self) -> String {
        self.dedupe_key
            .clone()
            .unwrap_or_else(|| self.payload.dedupe_key())
    }

    pub fn with_dependency(mut self, dependency_key: DependencyKey) -> Self {
        self.dependency_key = Some(dependency_key);
        self
    }

    pub fn with_available_at(mut self, available_at: DateTime<Utc>) -> Self {
        self.available_at = Some(available_at);
        self
    }

    pub fn strict(mut self) -> Self {
        self.allow_merge = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match &self.payload {
            JobPayload::FolderScan(job) => {
                if job.folder_path_norm.trim().is_empty() {
                    return Err(IngestError::InvalidInput(
                        "folder scan requires a folder path".into(),
                    ));
                }
            }
            JobPayload::MediaAnalyze(job) => {
                if job.path_norm.trim().is_empty() {
                    return Err(IngestError::InvalidInput(
                        "media analyze requires a file path".into(),
                    ));
                }
            }
            JobPayload::MetadataEnrich(job) => {
                if job.tmdb_id <= 0 {
                    return Err(IngestError::InvalidInput(
                        "metadata enrich requires a provider id".into(),
                    ));
                }
            }
            JobPayload::IndexUpsert(_) | JobPayload::ImageFetch(_) => {}
        }

        Ok(())
    }
}
