//! Catalog entries and the batch-annotated write path.
//!
//! `create_entry` is the hook the original schema implemented as an
//! insert trigger: the entry insert and its batch allocation run in one
//! transaction, so the composite (id, library, batch) key is never
//! visible half-assigned.

pub mod batching;
pub mod sort_positions;

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::types::{BatchId, EntryId, LibraryId};

use batching::{Allocation, PostgresBatchAllocator};

/// One catalog entry (a movie reference in a movie library).
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub id: EntryId,
    pub library_id: LibraryId,
    pub tmdb_id: i64,
    pub batch_id: BatchId,
    pub title: String,
    pub added_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Payload for creating an entry; id and batch are assigned at write time.
#[derive(Clone, Debug)]
pub struct NewCatalogEntry {
    pub library_id: LibraryId,
    pub tmdb_id: i64,
    pub title: String,
}

/// Result of the entry-create hook.
#[derive(Clone, Debug)]
pub struct EntryWrite {
    pub entry: CatalogEntry,
    /// False when the natural key already existed and the stored entry was
    /// returned unchanged.
    pub created: bool,
}

/// Postgres-backed catalog store annotated by the batch allocator.
#[derive(Clone)]
pub struct PostgresCatalogRepository {
    pool: PgPool,
    allocator: PostgresBatchAllocator,
}

impl fmt::Debug for PostgresCatalogRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCatalogRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            allocator: PostgresBatchAllocator::new(),
        }
    }

    pub fn with_allocator(pool: PgPool, allocator: PostgresBatchAllocator) -> Self {
        Self { pool, allocator }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn allocator(&self) -> &PostgresBatchAllocator {
        &self.allocator
    }

    pub async fn create_library(&self, name: &str) -> Result<LibraryId> {
        let library_id = LibraryId::new();
        sqlx::query(
            r#"
            INSERT INTO libraries (id, name, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(library_id)
    }

    /// Create an entry, assigning its batch id, or return the stored entry
    /// when the (library, natural key) pair already exists. Re-inserting
    /// the same logical entity never advances the allocator.
    pub async fn create_entry(&self, new: NewCatalogEntry) -> Result<EntryWrite> {
        let mut tx = self.pool.begin().await?;

        let allocation = self
            .allocator
            .allocate_or_reuse(&mut tx, new.library_id, new.tmdb_id)
            .await?;

        let write = match allocation {
            Allocation::Reused(_) => {
                let entry = fetch_by_natural_key(&mut tx, new.library_id, new.tmdb_id)
                    .await?
                    .ok_or_else(|| {
                        IngestError::ConsistencyViolation(format!(
                            "entry for library {} tmdb {} reused but missing",
                            new.library_id, new.tmdb_id
                        ))
                    })?;
                EntryWrite {
                    entry,
                    created: false,
                }
            }
            Allocation::Assigned(reservation) => {
                let entry_id = EntryId::new();
                let row = sqlx::query(
                    r#"
                    INSERT INTO catalog_entries (id, library_id, tmdb_id, batch_id, title, added_at, created_at)
                    VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
                    RETURNING id, library_id, tmdb_id, batch_id, title, added_at, created_at
                    "#,
                )
                .bind(entry_id.to_uuid())
                .bind(new.library_id.to_uuid())
                .bind(new.tmdb_id)
                .bind(reservation.batch_id.as_i64())
                .bind(&new.title)
                .fetch_one(&mut *tx)
                .await?;

                self.allocator.commit_slot(&mut tx, reservation).await?;

                debug!(
                    library = %new.library_id,
                    entry = %entry_id,
                    batch = %reservation.batch_id,
                    "catalog entry created"
                );
                EntryWrite {
                    entry: entry_from_row(&row)?,
                    created: true,
                }
            }
        };

        tx.commit().await?;
        Ok(write)
    }

    pub async fn get_entry(&self, entry_id: EntryId) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, library_id, tmdb_id, batch_id, title, added_at, created_at
            FROM catalog_entries
            WHERE id = $1
            "#,
        )
        .bind(entry_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| entry_from_row(&row)).transpose()
    }

    pub async fn remove_entry(&self, entry_id: EntryId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM catalog_entries WHERE id = $1")
            .bind(entry_id.to_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    /// Batch-scoped loader: all entries of one (library, batch) range.
    pub async fn list_batch_entries(
        &self,
        library_id: LibraryId,
        batch_id: BatchId,
    ) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, library_id, tmdb_id, batch_id, title, added_at, created_at
            FROM catalog_entries
            WHERE library_id = $1
              AND batch_id = $2
            ORDER BY id
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(batch_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}

async fn fetch_by_natural_key(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    library_id: LibraryId,
    tmdb_id: i64,
) -> Result<Option<CatalogEntry>> {
    let row = sqlx::query(
        r#"
        SELECT id, library_id, tmdb_id, batch_id, title, added_at, created_at
        FROM catalog_entries
        WHERE library_id = $1 AND tmdb_id = $2
        "#,
    )
    .bind(library_id.to_uuid())
    .bind(tmdb_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(|row| entry_from_row(&row)).transpose()
}

fn entry_from_row(row: &PgRow) -> Result<CatalogEntry> {
    let library_id = LibraryId(row.get("library_id"));
    let raw_batch: i64 = row.get("batch_id");
    let raw_batch = u32::try_from(raw_batch).map_err(|_| {
        IngestError::ConsistencyViolation(format!(
            "entry stores out-of-range batch id {raw_batch}"
        ))
    })?;
    let batch_id = BatchId::new(raw_batch).map_err(|e| {
        IngestError::ConsistencyViolation(format!("entry stores invalid batch id: {e}"))
    })?;

    Ok(CatalogEntry {
        id: EntryId(row.get("id")),
        library_id,
        tmdb_id: row.get("tmdb_id"),
        batch_id,
        title: row.get("title"),
        added_at: row.get("added_at"),
        created_at: row.get("created_at"),
    })
}
