//! At-least-once delivery of file-change events to independent consumer
//! groups.
//!
//! The event log is append-only; each (group, library) pair owns a durable
//! cursor it advances only after processing. Re-reading after a crash
//! re-delivers from the last acknowledged position, never skipping events.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{EventId, LibraryId};

pub mod postgres;
pub use postgres::PostgresFileChangeEventBus;

/// Stream of file change events for a subscriber group.
pub type FileChangeEventStream = Pin<Box<dyn Stream<Item = FileChangeEvent> + Send>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FileChangeEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl FileChangeEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileChangeEventKind::Created => "created",
            FileChangeEventKind::Modified => "modified",
            FileChangeEventKind::Deleted => "deleted",
            FileChangeEventKind::Moved => "moved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(FileChangeEventKind::Created),
            "modified" => Some(FileChangeEventKind::Modified),
            "deleted" => Some(FileChangeEventKind::Deleted),
            "moved" => Some(FileChangeEventKind::Moved),
            _ => None,
        }
    }
}

impl fmt::Display for FileChangeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended file-change event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub id: EventId,
    pub library_id: LibraryId,
    pub kind: FileChangeEventKind,
    pub file_path: String,
    pub old_path: Option<String>,
    pub file_size: Option<i64>,
    pub detected_at: DateTime<Utc>,
}

impl FileChangeEvent {
    pub fn new(
        library_id: LibraryId,
        kind: FileChangeEventKind,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            library_id,
            kind,
            file_path: file_path.into(),
            old_path: None,
            file_size: None,
            detected_at: Utc::now(),
        }
    }
}

/// Durable cursor for one (group, library) pair. Events at or before the
/// cursor are acknowledged; everything after is still owed to the group.
#[derive(Debug, Clone)]
pub struct FileChangeCursor {
    pub group: String,
    pub library_id: LibraryId,
    pub last_event_id: Option<EventId>,
    pub last_detected_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait FileChangeEventBus: Send + Sync {
    /// Append an event to the log (producer side).
    async fn publish(&self, event: FileChangeEvent) -> Result<()>;

    /// Events strictly after the group's cursor, ordered by
    /// (detected_at, id) ascending, up to `limit`.
    async fn read_since(
        &self,
        group: &str,
        library_id: LibraryId,
        limit: i64,
    ) -> Result<Vec<FileChangeEvent>>;

    /// Move the cursor to (detected_at, event_id). Call only after every
    /// event up to and including `event_id` has been durably processed.
    /// Re-advancing to the same event is a no-op, and the cursor never
    /// moves backwards.
    async fn advance(
        &self,
        group: &str,
        library_id: LibraryId,
        event_id: EventId,
        detected_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Look up an event and advance the cursor to it in one call.
    async fn ack(&self, group: &str, event_id: EventId) -> Result<()>;

    async fn cursor(
        &self,
        group: &str,
        library_id: LibraryId,
    ) -> Result<Option<FileChangeCursor>>;

    /// Poll-driven stream resuming from the group's durable cursor. The
    /// stream tracks its position in memory only; consumers still call
    /// `advance` after processing to make progress durable.
    async fn subscribe(
        &self,
        group: &str,
        library_id: LibraryId,
    ) -> Result<FileChangeEventStream>;

    /// Delete events older than the retention window. Returns the number
    /// of rows removed.
    async fn cleanup_retention(&self, days_to_keep: i32) -> Result<u32>;
}
