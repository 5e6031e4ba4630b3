use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Row};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::{
    FileChangeCursor, FileChangeEvent, FileChangeEventBus, FileChangeEventKind,
    FileChangeEventStream,
};
use crate::error::{IngestError, Result};
use crate::ingest::orchestration::config::WatchConfig;
use crate::types::{EventId, LibraryId};

#[derive(Clone)]
pub struct PostgresFileChangeEventBus {
    pool: PgPool,
    config: WatchConfig,
}

impl PostgresFileChangeEventBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            config: WatchConfig::default(),
        }
    }

    pub fn with_config(pool: PgPool, config: WatchConfig) -> Self {
        Self { pool, config }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }
}

impl fmt::Debug for PostgresFileChangeEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresFileChangeEventBus")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, FromRow)]
struct FileChangeEventRow {
    id: Uuid,
    library_id: Uuid,
    event_type: String,
    file_path: String,
    old_path: Option<String>,
    file_size: Option<i64>,
    detected_at: DateTime<Utc>,
}

impl FileChangeEventRow {
    fn into_event(self) -> Option<FileChangeEvent> {
        let kind = FileChangeEventKind::parse(&self.event_type)?;
        Some(FileChangeEvent {
            id: EventId(self.id),
            library_id: LibraryId(self.library_id),
            kind,
            file_path: self.file_path,
            old_path: self.old_path,
            file_size: self.file_size,
            detected_at: self.detected_at,
        })
    }
}

async fn fetch_events_after(
    pool: &PgPool,
    library_id: LibraryId,
    last_detected_at: Option<DateTime<Utc>>,
    last_event_id: Option<Uuid>,
    limit: i64,
) -> Result<Vec<FileChangeEvent>> {
    let rows = sqlx::query_as::<_, FileChangeEventRow>(
        r#"
        SELECT id, library_id, event_type, file_path, old_path, file_size, detected_at
        FROM file_change_events
        WHERE library_id = $1
          AND (
                $2::timestamptz IS NULL
                OR detected_at > $2
                OR (detected_at = $2 AND id > $3)
          )
        ORDER BY detected_at ASC, id ASC
        LIMIT $4
        "#,
    )
    .bind(library_id.to_uuid())
    .bind(last_detected_at)
    .bind(last_event_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(event) = row.into_event() {
            events.push(event);
        } else {
            warn!("skipping file change event with unknown type");
        }
    }

    Ok(events)
}

async fn load_cursor(
    pool: &PgPool,
    group: &str,
    library_id: LibraryId,
) -> Result<Option<FileChangeCursor>> {
    let row = sqlx::query(
        r#"
        SELECT group_name, library_id, last_event_id, last_detected_at
        FROM file_change_consumer_offsets
        WHERE group_name = $1 AND library_id = $2
        "#,
    )
    .bind(group)
    .bind(library_id.to_uuid())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| FileChangeCursor {
        group: row.get("group_name"),
        library_id: LibraryId(row.get("library_id")),
        last_event_id: row.get::<Option<Uuid>, _>("last_event_id").map(EventId),
        last_detected_at: row.get("last_detected_at"),
    }))
}

#[async_trait]
impl FileChangeEventBus for PostgresFileChangeEventBus {
    async fn publish(&self, event: FileChangeEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_change_events (
                id, library_id, event_type, file_path, old_path, file_size, detected_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id.to_uuid())
        .bind(event.library_id.to_uuid())
        .bind(event.kind.as_str())
        .bind(&event.file_path)
        .bind(&event.old_path)
        .bind(event.file_size)
        .bind(event.detected_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn read_since(
        &self,
        group: &str,
        library_id: LibraryId,
        limit: i64,
    ) -> Result<Vec<FileChangeEvent>> {
        let cursor = load_cursor(self.pool(), group, library_id).await?;
        let last_detected_at = cursor.as_ref().and_then(|c| c.last_detected_at);
        let last_event_id = cursor
            .as_ref()
            .and_then(|c| c.last_event_id)
            .map(|id| id.to_uuid());

        fetch_events_after(self.pool(), library_id, last_detected_at, last_event_id, limit).await
    }

    async fn advance(
        &self,
        group: &str,
        library_id: LibraryId,
        event_id: EventId,
        detected_at: DateTime<Utc>,
    ) -> Result<()> {
        // The conflict guard keeps the cursor monotone: equal positions
        // no-op, and a stale position never overwrites a newer one.
        let res = sqlx::query(
            r#"
            INSERT INTO file_change_consumer_offsets (
                group_name, library_id, last_event_id, last_detected_at, updated_at
            ) VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (group_name, library_id)
            DO UPDATE SET
                last_event_id = EXCLUDED.last_event_id,
                last_detected_at = EXCLUDED.last_detected_at,
                updated_at = NOW()
            WHERE file_change_consumer_offsets.last_detected_at IS NULL
               OR (file_change_consumer_offsets.last_detected_at,
                   file_change_consumer_offsets.last_event_id)
                  < (EXCLUDED.last_detected_at, EXCLUDED.last_event_id)
            "#,
        )
        .bind(group)
        .bind(library_id.to_uuid())
        .bind(event_id.to_uuid())
        .bind(detected_at)
        .execute(self.pool())
        .await?;

        if res.rows_affected() == 0 {
            trace!(group, library = %library_id, event = %event_id, "cursor advance was a no-op");
        }
        Ok(())
    }

    async fn ack(&self, group: &str, event_id: EventId) -> Result<()> {
        let row = sqlx::query(
            "SELECT library_id, detected_at FROM file_change_events WHERE id = $1",
        )
        .bind(event_id.to_uuid())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Err(IngestError::NotFound("file change event not found".into()));
        };

        let library_id = LibraryId(row.get("library_id"));
        let detected_at: DateTime<Utc> = row.get("detected_at");
        self.advance(group, library_id, event_id, detected_at).await
    }

    async fn cursor(
        &self,
        group: &str,
        library_id: LibraryId,
    ) -> Result<Option<FileChangeCursor>> {
        load_cursor(self.pool(), group, library_id).await
    }

    async fn subscribe(
        &self,
        group: &str,
        library_id: LibraryId,
    ) -> Result<FileChangeEventStream> {
        let cursor = load_cursor(self.pool(), group, library_id).await?;
        let initial_detected_at = cursor.as_ref().and_then(|c| c.last_detected_at);
        let initial_event_id = cursor
            .as_ref()
            .and_then(|c| c.last_event_id)
            .map(|id| id.to_uuid());

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let pool = self.pool.clone();
        let group = group.to_owned();
        let poll_interval = self.poll_interval();
        let fetch_limit = self.config.fetch_limit;

        tokio::spawn(async move {
            let sender = tx;
            let mut last_detected_at = initial_detected_at;
            let mut last_event_id = initial_event_id;

            loop {
                if sender.is_closed() {
                    trace!(group = %group, library = %library_id, "file change stream dropped; stopping poll loop");
                    break;
                }

                match fetch_events_after(&pool, library_id, last_detected_at, last_event_id, fetch_limit)
                    .await
                {
                    Ok(batch) if batch.is_empty() => {
                        sleep(poll_interval).await;
                    }
                    Ok(batch) => {
                        debug!(count = batch.len(), group = %group, library = %library_id, "delivering file change events");
                        for event in batch {
                            last_detected_at = Some(event.detected_at);
                            last_event_id = Some(event.id.to_uuid());
                            if sender.send(event).await.is_err() {
                                trace!(group = %group, library = %library_id, "receiver dropped while streaming file change events");
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        error!(group = %group, library = %library_id, error = %err, "file change polling failed");
                        sleep(poll_interval).await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn cleanup_retention(&self, days_to_keep: i32) -> Result<u32> {
        let affected = sqlx::query(
            r#"
            DELETE FROM file_change_events
            WHERE detected_at < NOW() - ($1 || ' days')::interval
            "#,
        )
        .bind(days_to_keep.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(affected as u32)
    }
}
