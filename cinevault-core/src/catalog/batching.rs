//! Per-library batch allocation for catalog entries.
//!
//! Every new entry receives a dense, monotonically increasing batch id.
//! Batches fill to a fixed per-library size and are immutable once
//! finalized; satellite tables key off (library, batch) for cheap range
//! scans. The library's cursor row is the critical section: allocation
//! takes `SELECT ... FOR UPDATE` on it, so two libraries never contend
//! with each other.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::types::{BatchId, BatchSize, LibraryId};

/// Batch capacity used when a library's cursor is created lazily without
/// an explicit `set_batch_size` call.
pub const DEFAULT_BATCH_SIZE: u32 = 500;

/// One batch row as stored per library.
#[derive(Clone, Debug)]
pub struct BatchRecord {
    pub library_id: LibraryId,
    pub batch_id: BatchId,
    pub batch_size: BatchSize,
    pub version: i32,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }
}

/// Cursor state loaded under the row lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CursorState {
    pub batch_id: i64,
    pub count: i64,
    pub size: i64,
}

/// The slot computed for one new entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotPlan {
    /// Batch finalized defensively because the cursor was already full.
    pub rollover_of: Option<i64>,
    /// Batch the new entry joins.
    pub assigned: i64,
    /// Member count of the assigned batch once the entry is written.
    pub next_count: i64,
    /// True when the entry fills the batch, finalizing it.
    pub fills_batch: bool,
}

impl CursorState {
    /// Plan the assignment of one entry. Never mutates; persistence applies
    /// the plan after the entry row is written.
    pub(crate) fn assign(self) -> SlotPlan {
        // Defensive: a full cursor should have been advanced when the last
        // slot was taken. Repair by rolling to a fresh batch.
        let (rollover_of, assigned, count_before) = if self.count >= self.size {
            (Some(self.batch_id), self.batch_id + 1, 0)
        } else {
            (None, self.batch_id, self.count)
        };

        let next_count = count_before + 1;
        SlotPlan {
            rollover_of,
            assigned,
            next_count,
            fills_batch: next_count >= self.size,
        }
    }
}

/// Outcome of `allocate_or_reuse`.
#[derive(Clone, Debug)]
pub enum Allocation {
    /// The natural key already exists; its batch id is returned unchanged
    /// and the cursor does not advance.
    Reused(BatchId),
    /// A slot was reserved for a new entry. The caller writes the entry
    /// row with `reservation.batch_id`, then settles via `commit_slot`.
    Assigned(SlotReservation),
}

/// A reserved slot, valid only inside the transaction that took it.
#[derive(Clone, Copy, Debug)]
pub struct SlotReservation {
    pub library_id: LibraryId,
    pub batch_id: BatchId,
    batch_size: i64,
    next_count: i64,
    fills_batch: bool,
}

/// Postgres-backed batch allocator.
#[derive(Clone, Debug)]
pub struct PostgresBatchAllocator {
    default_batch_size: u32,
}

impl Default for PostgresBatchAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresBatchAllocator {
    pub fn new() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_default_batch_size(default_batch_size: BatchSize) -> Self {
        Self {
            default_batch_size: default_batch_size.value(),
        }
    }

    /// Fix a library's batch size before its first entry is created.
    /// Fails with `ImmutableBatchSize` once any entry exists: every
    /// satellite row downstream embeds batch_id in its key, so the
    /// partitioning can never be re-derived.
    pub async fn set_batch_size(
        &self,
        pool: &PgPool,
        library_id: LibraryId,
        size: BatchSize,
    ) -> Result<()> {
        let mut tx = pool.begin().await?;

        // Upsert-and-lock the cursor row first: allocation locks the same
        // row before touching entries, so once we hold it the entries
        // check below cannot race with a concurrent first allocation.
        let current_batch: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO library_batch_cursors (library_id, current_batch_id, current_count, batch_size, updated_at)
            VALUES ($1, 1, 0, $2, NOW())
            ON CONFLICT (library_id)
            DO UPDATE SET batch_size = EXCLUDED.batch_size, current_count = 0, updated_at = NOW()
            RETURNING current_batch_id
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(size.as_i64())
        .fetch_one(&mut *tx)
        .await?;

        let has_entries: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM catalog_entries WHERE library_id = $1)",
        )
        .bind(library_id.to_uuid())
        .fetch_one(&mut *tx)
        .await?;

        if has_entries {
            return Err(IngestError::ImmutableBatchSize { library_id });
        }

        sqlx::query(
            r#"
            INSERT INTO catalog_batches (library_id, batch_id, batch_size)
            VALUES ($1, $2, $3)
            ON CONFLICT (library_id, batch_id)
            DO UPDATE SET batch_size = EXCLUDED.batch_size
            WHERE catalog_batches.finalized_at IS NULL
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(current_batch)
        .bind(size.as_i64())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(library = %library_id, batch_size = size.value(), "batch size fixed");
        Ok(())
    }

    /// Resolve a batch id for (library, natural key) inside the caller's
    /// transaction. Locks the library cursor first so concurrent inserts
    /// of the same key serialize and the reuse check stays race-free.
    pub async fn allocate_or_reuse(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        library_id: LibraryId,
        tmdb_id: i64,
    ) -> Result<Allocation> {
        let cursor = self.lock_cursor(tx, library_id).await?;

        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT batch_id
            FROM catalog_entries
            WHERE library_id = $1 AND tmdb_id = $2
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(tmdb_id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(batch_id) = existing {
            let batch_id = batch_id_from_row(library_id, batch_id)?;
            debug!(library = %library_id, tmdb_id, batch = %batch_id, "allocation reused existing entry");
            return Ok(Allocation::Reused(batch_id));
        }

        let plan = cursor.assign();

        if let Some(full_batch) = plan.rollover_of {
            // Should not normally occur: repair the cursor by closing the
            // overfull batch and opening the next one.
            self.finalize_batch(tx, library_id, full_batch).await?;
            self.open_next_batch(tx, library_id, plan.assigned, cursor.size)
                .await?;
            sqlx::query(
                r#"
                UPDATE library_batch_cursors
                SET current_batch_id = $2, current_count = 0, updated_at = NOW()
                WHERE library_id = $1
                "#,
            )
            .bind(library_id.to_uuid())
            .bind(plan.assigned)
            .execute(&mut **tx)
            .await?;
        }

        Ok(Allocation::Assigned(SlotReservation {
            library_id,
            batch_id: batch_id_from_row(library_id, plan.assigned)?,
            batch_size: cursor.size,
            next_count: plan.next_count,
            fills_batch: plan.fills_batch,
        }))
    }

    /// Persist the cursor advance for a reservation whose entry row has
    /// been written. Finalizes the batch and opens the next one when the
    /// reservation filled it.
    pub async fn commit_slot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        reservation: SlotReservation,
    ) -> Result<()> {
        let library_id = reservation.library_id;

        if reservation.fills_batch {
            self.finalize_batch(tx, library_id, reservation.batch_id.as_i64())
                .await?;
            let next = reservation.batch_id.as_i64() + 1;
            self.open_next_batch(tx, library_id, next, reservation.batch_size)
                .await?;
            sqlx::query(
                r#"
                UPDATE library_batch_cursors
                SET current_batch_id = $2, current_count = 0, updated_at = NOW()
                WHERE library_id = $1
                "#,
            )
            .bind(library_id.to_uuid())
            .bind(next)
            .execute(&mut **tx)
            .await?;
            info!(
                library = %library_id,
                batch = %reservation.batch_id,
                "batch finalized"
            );
        } else {
            sqlx::query(
                r#"
                UPDATE library_batch_cursors
                SET current_count = $2, updated_at = NOW()
                WHERE library_id = $1
                "#,
            )
            .bind(library_id.to_uuid())
            .bind(reservation.next_count)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Batches that have been closed for a library, in batch order.
    pub async fn list_finalized(
        &self,
        pool: &PgPool,
        library_id: LibraryId,
    ) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT library_id, batch_id, batch_size, version, content_hash, created_at, finalized_at
            FROM catalog_batches
            WHERE library_id = $1
              AND finalized_at IS NOT NULL
            ORDER BY batch_id
            "#,
        )
        .bind(library_id.to_uuid())
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|row| batch_record_from_row(library_id, &row))
            .collect()
    }

    /// The currently open batch, if the library has allocated anything.
    pub async fn open_batch(
        &self,
        pool: &PgPool,
        library_id: LibraryId,
    ) -> Result<Option<BatchRecord>> {
        let row = sqlx::query(
            r#"
            SELECT library_id, batch_id, batch_size, version, content_hash, created_at, finalized_at
            FROM catalog_batches
            WHERE library_id = $1
              AND finalized_at IS NULL
            ORDER BY batch_id
            LIMIT 1
            "#,
        )
        .bind(library_id.to_uuid())
        .fetch_optional(pool)
        .await?;

        row.map(|row| batch_record_from_row(library_id, &row))
            .transpose()
    }

    /// Lock the library's cursor row, creating it lazily for a library
    /// that has never allocated. A missing cursor with existing entries is
    /// an initialization bug, not a recoverable condition.
    async fn lock_cursor(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        library_id: LibraryId,
    ) -> Result<CursorState> {
        if let Some(cursor) = self.try_lock_cursor(tx, library_id).await? {
            return Ok(cursor);
        }

        let has_entries: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM catalog_entries WHERE library_id = $1)",
        )
        .bind(library_id.to_uuid())
        .fetch_one(&mut **tx)
        .await?;

        if has_entries {
            return Err(IngestError::ConsistencyViolation(format!(
                "library {library_id} has catalog entries but no batch cursor"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO library_batch_cursors (library_id, current_batch_id, current_count, batch_size, updated_at)
            VALUES ($1, 1, 0, $2, NOW())
            ON CONFLICT (library_id) DO NOTHING
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(i64::from(self.default_batch_size))
        .execute(&mut **tx)
        .await?;

        let cursor = self
            .try_lock_cursor(tx, library_id)
            .await?
            .ok_or_else(|| {
                IngestError::ConsistencyViolation(format!(
                    "batch cursor for library {library_id} vanished after creation"
                ))
            })?;

        self.open_next_batch(tx, library_id, cursor.batch_id, cursor.size)
            .await?;

        Ok(cursor)
    }

    async fn try_lock_cursor(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        library_id: LibraryId,
    ) -> Result<Option<CursorState>> {
        let row = sqlx::query(
            r#"
            SELECT current_batch_id, current_count, batch_size
            FROM library_batch_cursors
            WHERE library_id = $1
            FOR UPDATE
            "#,
        )
        .bind(library_id.to_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|row| CursorState {
            batch_id: row.get("current_batch_id"),
            count: row.get("current_count"),
            size: row.get("batch_size"),
        }))
    }

    async fn open_next_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        library_id: LibraryId,
        batch_id: i64,
        batch_size: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO catalog_batches (library_id, batch_id, batch_size)
            VALUES ($1, $2, $3)
            ON CONFLICT (library_id, batch_id) DO NOTHING
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(batch_id)
        .bind(batch_size)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Stamp `finalized_at` and the content hash over the batch's member
    /// natural keys in id order. Finalized batches are immutable.
    async fn finalize_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        library_id: LibraryId,
        batch_id: i64,
    ) -> Result<()> {
        let members: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT tmdb_id
            FROM catalog_entries
            WHERE library_id = $1 AND batch_id = $2
            ORDER BY id
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(batch_id)
        .fetch_all(&mut **tx)
        .await?;

        let content_hash = batch_content_hash(&members);

        sqlx::query(
            r#"
            UPDATE catalog_batches
            SET finalized_at = NOW(), content_hash = $3
            WHERE library_id = $1 AND batch_id = $2
              AND finalized_at IS NULL
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(batch_id)
        .bind(content_hash)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn batch_content_hash(member_keys: &[i64]) -> String {
    let mut hasher = Sha256::new();
    for key in member_keys {
        hasher.update(key.to_be_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn batch_id_from_row(library_id: LibraryId, raw: i64) -> Result<BatchId> {
    let raw = u32::try_from(raw).map_err(|_| {
        IngestError::ConsistencyViolation(format!(
            "library {library_id} stores out-of-range batch id {raw}"
        ))
    })?;
    BatchId::new(raw).map_err(|e| {
        IngestError::ConsistencyViolation(format!(
            "library {library_id} stores invalid batch id: {e}"
        ))
    })
}

fn batch_record_from_row(library_id: LibraryId, row: &sqlx::postgres::PgRow) -> Result<BatchRecord> {
    let raw_batch: i64 = row.get("batch_id");
    let raw_size: i64 = row.get("batch_size");
    Ok(BatchRecord {
        library_id,
        batch_id: batch_id_from_row(library_id, raw_batch)?,
        batch_size: BatchSize::new(raw_size.max(1) as u32).map_err(|e| {
            IngestError::ConsistencyViolation(format!(
                "library {library_id} stores invalid batch size: {e}"
            ))
        })?,
        version: row.get("version"),
        content_hash: row.get("content_hash"),
        created_at: row.get("created_at"),
        finalized_at: row.get("finalized_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(size: i64) -> CursorState {
        CursorState {
            batch_id: 1,
            count: 0,
            size,
        }
    }

    fn apply(cursor: CursorState, plan: SlotPlan) -> CursorState {
        if plan.fills_batch {
            CursorState {
                batch_id: plan.assigned + 1,
                count: 0,
                size: cursor.size,
            }
        } else {
            CursorState {
                batch_id: plan.assigned,
                count: plan.next_count,
                size: cursor.size,
            }
        }
    }

    #[test]
    fn five_sequential_allocations_with_size_three() {
        let mut cursor = fresh(3);
        let mut assigned = Vec::new();
        for _ in 0..5 {
            let plan = cursor.assign();
            assert!(plan.rollover_of.is_none());
            assigned.push(plan.assigned);
            cursor = apply(cursor, plan);
        }
        assert_eq!(assigned, vec![1, 1, 1, 2, 2]);
        assert_eq!(cursor.batch_id, 2);
        assert_eq!(cursor.count, 2);
    }

    #[test]
    fn filling_slot_finalizes_and_advances() {
        let cursor = CursorState {
            batch_id: 4,
            count: 2,
            size: 3,
        };
        let plan = cursor.assign();
        assert_eq!(plan.assigned, 4);
        assert!(plan.fills_batch);
        assert_eq!(apply(cursor, plan).batch_id, 5);
    }

    #[test]
    fn overfull_cursor_rolls_over_before_assignment() {
        let cursor = CursorState {
            batch_id: 2,
            count: 3,
            size: 3,
        };
        let plan = cursor.assign();
        assert_eq!(plan.rollover_of, Some(2));
        assert_eq!(plan.assigned, 3);
        assert_eq!(plan.next_count, 1);
        assert!(!plan.fills_batch);
    }

    #[test]
    fn content_hash_is_order_sensitive_and_stable() {
        let a = batch_content_hash(&[1, 2, 3]);
        let b = batch_content_hash(&[1, 2, 3]);
        let c = batch_content_hash(&[3, 2, 1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
