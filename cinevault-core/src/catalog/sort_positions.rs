//! Precomputed sort positions for paged catalog browsing.
//!
//! Every entry in a library carries a 1-based dense rank per sortable
//! dimension, ascending and descending, so a sorted page is an index walk
//! on one position column instead of a sort at request time. The rebuild
//! is a snapshot recomputation replaced in a single transaction: readers
//! only ever observe complete snapshots, and a failed rebuild leaves the
//! previous one intact.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use ordered_float::OrderedFloat;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::error::Result;
use crate::types::{EntryId, LibraryId};

/// Sortable dimensions. Each maps to one ascending/descending pair of
/// position columns.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SortBy {
    Title,
    DateAdded,
    CreatedAt,
    ReleaseDate,
    Rating,
    Runtime,
    Popularity,
    Bitrate,
    FileSize,
    ContentRating,
    Resolution,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Snapshot of one entry's sortable attributes, joined from the entry,
/// its primary file, and its metadata row.
#[derive(Clone, Debug)]
pub struct EntrySortKeys {
    pub entry_id: EntryId,
    pub title: String,
    pub added_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub release_date: Option<NaiveDate>,
    pub rating: Option<f64>,
    pub runtime_minutes: Option<i32>,
    pub popularity: Option<f64>,
    pub bitrate: Option<i64>,
    pub file_size: Option<i64>,
    pub content_rating: Option<String>,
    pub resolution: Option<i64>,
}

/// One computed rank row, mirroring the position columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortPositionRow {
    pub entry_id: EntryId,
    pub title_pos: i32,
    pub title_pos_desc: i32,
    pub date_added_pos: i32,
    pub date_added_pos_desc: i32,
    pub created_at_pos: i32,
    pub created_at_pos_desc: i32,
    pub release_date_pos: i32,
    pub release_date_pos_desc: i32,
    pub rating_pos: i32,
    pub rating_pos_desc: i32,
    pub runtime_pos: i32,
    pub runtime_pos_desc: i32,
    pub popularity_pos: i32,
    pub popularity_pos_desc: i32,
    pub bitrate_pos: i32,
    pub bitrate_pos_desc: i32,
    pub file_size_pos: i32,
    pub file_size_pos_desc: i32,
    pub content_rating_pos: i32,
    pub content_rating_pos_desc: i32,
    pub resolution_pos: i32,
    pub resolution_pos_desc: i32,
}

/// Compute dense 1-based ranks for every dimension.
///
/// NULL keys sort last in both directions. Ties break by entry id
/// ascending; the paired descending rank breaks ties by reverse entry id,
/// so the two directions stay exact mirrors of each other on fully
/// populated dimensions.
pub fn compute_positions(entries: &[EntrySortKeys]) -> Vec<SortPositionRow> {
    let title = ranks(entries, |e| Some(e.title.to_lowercase()));
    let date_added = ranks(entries, |e| Some(e.added_at));
    let created_at = ranks(entries, |e| Some(e.created_at));
    let release_date = ranks(entries, |e| e.release_date);
    let rating = ranks(entries, |e| e.rating.map(OrderedFloat));
    let runtime = ranks(entries, |e| e.runtime_minutes);
    let popularity = ranks(entries, |e| e.popularity.map(OrderedFloat));
    let bitrate = ranks(entries, |e| e.bitrate);
    let file_size = ranks(entries, |e| e.file_size);
    let content_rating = ranks(entries, |e| e.content_rating.clone());
    let resolution = ranks(entries, |e| e.resolution);

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| SortPositionRow {
            entry_id: entry.entry_id,
            title_pos: title[i].0,
            title_pos_desc: title[i].1,
            date_added_pos: date_added[i].0,
            date_added_pos_desc: date_added[i].1,
            created_at_pos: created_at[i].0,
            created_at_pos_desc: created_at[i].1,
            release_date_pos: release_date[i].0,
            release_date_pos_desc: release_date[i].1,
            rating_pos: rating[i].0,
            rating_pos_desc: rating[i].1,
            runtime_pos: runtime[i].0,
            runtime_pos_desc: runtime[i].1,
            popularity_pos: popularity[i].0,
            popularity_pos_desc: popularity[i].1,
            bitrate_pos: bitrate[i].0,
            bitrate_pos_desc: bitrate[i].1,
            file_size_pos: file_size[i].0,
            file_size_pos_desc: file_size[i].1,
            content_rating_pos: content_rating[i].0,
            content_rating_pos_desc: content_rating[i].1,
            resolution_pos: resolution[i].0,
            resolution_pos_desc: resolution[i].1,
        })
        .collect()
}

/// (ascending, descending) rank per entry, aligned with `entries` order.
fn ranks<K: Ord>(
    entries: &[EntrySortKeys],
    key: impl Fn(&EntrySortKeys) -> Option<K>,
) -> Vec<(i32, i32)> {
    let keys: Vec<Option<K>> = entries.iter().map(&key).collect();

    let mut ascending: Vec<usize> = (0..entries.len()).collect();
    ascending.sort_by(|&a, &b| {
        compare_keys(&keys[a], &keys[b])
            .then_with(|| entries[a].entry_id.cmp(&entries[b].entry_id))
    });

    let mut descending: Vec<usize> = (0..entries.len()).collect();
    descending.sort_by(|&a, &b| {
        // Key descending, NULLs still last, ties by reverse entry id.
        let by_key = match (&keys[a], &keys[b]) {
            (Some(x), Some(y)) => y.cmp(x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_key.then_with(|| entries[b].entry_id.cmp(&entries[a].entry_id))
    });

    let mut out = vec![(0, 0); entries.len()];
    for (pos, &idx) in ascending.iter().enumerate() {
        out[idx].0 = (pos + 1) as i32;
    }
    for (pos, &idx) in descending.iter().enumerate() {
        out[idx].1 = (pos + 1) as i32;
    }
    out
}

/// Ascending comparison with NULLs last.
fn compare_keys<K: Ord>(a: &Option<K>, b: &Option<K>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Postgres-backed sort position store.
#[derive(Clone)]
pub struct PostgresSortPositions {
    pool: PgPool,
}

impl fmt::Debug for PostgresSortPositions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSortPositions")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

const INSERT_CHUNK: usize = 1_000;

impl PostgresSortPositions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recompute and atomically replace the library's rank rows. Safe to
    /// run concurrently with ingestion and with itself; the last writer's
    /// complete snapshot wins.
    pub async fn rebuild(&self, library_id: LibraryId) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT
                e.id,
                e.title,
                e.added_at,
                e.created_at,
                md.release_date,
                md.rating,
                md.runtime_minutes,
                md.popularity,
                md.content_rating,
                mf.bitrate,
                mf.file_size,
                (mf.width::bigint * mf.height::bigint) AS resolution
            FROM catalog_entries e
            LEFT JOIN LATERAL (
                SELECT bitrate, file_size, width, height
                FROM media_files
                WHERE entry_id = e.id
                ORDER BY created_at, id
                LIMIT 1
            ) mf ON TRUE
            LEFT JOIN entry_metadata md ON md.entry_id = e.id
            WHERE e.library_id = $1
            "#,
        )
        .bind(library_id.to_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let entries: Vec<EntrySortKeys> = rows.iter().map(sort_keys_from_row).collect();
        let positions = compute_positions(&entries);
        let built_at = Utc::now();

        // Single-transaction replace: rows for removed entries disappear
        // with the delete, and a failure rolls the whole snapshot back.
        sqlx::query("DELETE FROM entry_sort_positions WHERE library_id = $1")
            .bind(library_id.to_uuid())
            .execute(&mut *tx)
            .await?;

        for chunk in positions.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO entry_sort_positions (\
                 library_id, entry_id, \
                 title_pos, title_pos_desc, \
                 date_added_pos, date_added_pos_desc, \
                 created_at_pos, created_at_pos_desc, \
                 release_date_pos, release_date_pos_desc, \
                 rating_pos, rating_pos_desc, \
                 runtime_pos, runtime_pos_desc, \
                 popularity_pos, popularity_pos_desc, \
                 bitrate_pos, bitrate_pos_desc, \
                 file_size_pos, file_size_pos_desc, \
                 content_rating_pos, content_rating_pos_desc, \
                 resolution_pos, resolution_pos_desc, \
                 built_at) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(library_id.to_uuid())
                    .push_bind(row.entry_id.to_uuid())
                    .push_bind(row.title_pos)
                    .push_bind(row.title_pos_desc)
                    .push_bind(row.date_added_pos)
                    .push_bind(row.date_added_pos_desc)
                    .push_bind(row.created_at_pos)
                    .push_bind(row.created_at_pos_desc)
                    .push_bind(row.release_date_pos)
                    .push_bind(row.release_date_pos_desc)
                    .push_bind(row.rating_pos)
                    .push_bind(row.rating_pos_desc)
                    .push_bind(row.runtime_pos)
                    .push_bind(row.runtime_pos_desc)
                    .push_bind(row.popularity_pos)
                    .push_bind(row.popularity_pos_desc)
                    .push_bind(row.bitrate_pos)
                    .push_bind(row.bitrate_pos_desc)
                    .push_bind(row.file_size_pos)
                    .push_bind(row.file_size_pos_desc)
                    .push_bind(row.content_rating_pos)
                    .push_bind(row.content_rating_pos_desc)
                    .push_bind(row.resolution_pos)
                    .push_bind(row.resolution_pos_desc)
                    .push_bind(built_at);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        info!(library = %library_id, entries = positions.len(), "rebuilt sort positions");
        Ok(positions.len())
    }

    /// Fetch one sorted page of entry ids using the precomputed position
    /// columns.
    pub async fn fetch_page(
        &self,
        library_id: LibraryId,
        sort: SortBy,
        order: SortOrder,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<EntryId>> {
        let order_column = position_column(sort, order);

        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT entry_id FROM entry_sort_positions WHERE library_id = ");
        qb.push_bind(library_id.to_uuid());
        qb.push(" ORDER BY ");
        qb.push(order_column);
        qb.push(" ASC");

        if let Some(offset) = offset {
            qb.push(" OFFSET ");
            qb.push_bind(offset as i64);
        }
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        debug!(library = %library_id, count = rows.len(), "fetched sorted page");

        Ok(rows
            .into_iter()
            .map(|row| EntryId(row.get("entry_id")))
            .collect())
    }
}

fn position_column(sort: SortBy, order: SortOrder) -> &'static str {
    match (sort, order) {
        (SortBy::Title, SortOrder::Ascending) => "title_pos",
        (SortBy::Title, SortOrder::Descending) => "title_pos_desc",
        (SortBy::DateAdded, SortOrder::Ascending) => "date_added_pos",
        (SortBy::DateAdded, SortOrder::Descending) => "date_added_pos_desc",
        (SortBy::CreatedAt, SortOrder::Ascending) => "created_at_pos",
        (SortBy::CreatedAt, SortOrder::Descending) => "created_at_pos_desc",
        (SortBy::ReleaseDate, SortOrder::Ascending) => "release_date_pos",
        (SortBy::ReleaseDate, SortOrder::Descending) => "release_date_pos_desc",
        (SortBy::Rating, SortOrder::Ascending) => "rating_pos",
        (SortBy::Rating, SortOrder::Descending) => "rating_pos_desc",
        (SortBy::Runtime, SortOrder::Ascending) => "runtime_pos",
        (SortBy::Runtime, SortOrder::Descending) => "runtime_pos_desc",
        (SortBy::Popularity, SortOrder::Ascending) => "popularity_pos",
        (SortBy::Popularity, SortOrder::Descending) => "popularity_pos_desc",
        (SortBy::Bitrate, SortOrder::Ascending) => "bitrate_pos",
        (SortBy::Bitrate, SortOrder::Descending) => "bitrate_pos_desc",
        (SortBy::FileSize, SortOrder::Ascending) => "file_size_pos",
        (SortBy::FileSize, SortOrder::Descending) => "file_size_pos_desc",
        (SortBy::ContentRating, SortOrder::Ascending) => "content_rating_pos",
        (SortBy::ContentRating, SortOrder::Descending) => "content_rating_pos_desc",
        (SortBy::Resolution, SortOrder::Ascending) => "resolution_pos",
        (SortBy::Resolution, SortOrder::Descending) => "resolution_pos_desc",
    }
}

fn sort_keys_from_row(row: &PgRow) -> EntrySortKeys {
    EntrySortKeys {
        entry_id: EntryId(row.get("id")),
        title: row.get("title"),
        added_at: row.get("added_at"),
        created_at: row.get("created_at"),
        release_date: row.get("release_date"),
        rating: row.get("rating"),
        runtime_minutes: row.get("runtime_minutes"),
        popularity: row.get("popularity"),
        content_rating: row.get("content_rating"),
        bitrate: row.get("bitrate"),
        file_size: row.get("file_size"),
        resolution: row.get("resolution"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(id: u128, title: &str, rating: Option<f64>) -> EntrySortKeys {
        let now = Utc::now();
        EntrySortKeys {
            entry_id: EntryId(Uuid::from_u128(id)),
            title: title.to_string(),
            added_at: now,
            created_at: now,
            release_date: None,
            rating,
            runtime_minutes: None,
            popularity: None,
            bitrate: None,
            file_size: None,
            content_rating: None,
            resolution: None,
        }
    }

    #[test]
    fn rank_duality_holds_on_fully_populated_dimensions() {
        let entries = vec![
            entry(1, "Alpha", Some(7.2)),
            entry(2, "Charlie", Some(5.0)),
            entry(3, "Bravo", Some(9.1)),
            entry(4, "Delta", Some(6.3)),
        ];
        let rows = compute_positions(&entries);
        let n = entries.len() as i32;

        for row in &rows {
            assert_eq!(row.title_pos + row.title_pos_desc, n + 1);
            assert_eq!(row.rating_pos + row.rating_pos_desc, n + 1);
            assert_eq!(row.date_added_pos + row.date_added_pos_desc, n + 1);
        }
    }

    #[test]
    fn null_keys_rank_last_in_both_directions() {
        let entries = vec![
            entry(1, "A", Some(5.0)),
            entry(2, "B", None),
            entry(3, "C", Some(8.0)),
        ];
        let rows = compute_positions(&entries);

        let by_id = |id: u128| {
            rows.iter()
                .find(|r| r.entry_id.to_uuid() == Uuid::from_u128(id))
                .unwrap()
        };

        // Populated keys rank ahead of the missing one both ways.
        assert_eq!(by_id(1).rating_pos, 1);
        assert_eq!(by_id(3).rating_pos, 2);
        assert_eq!(by_id(2).rating_pos, 3);

        assert_eq!(by_id(3).rating_pos_desc, 1);
        assert_eq!(by_id(1).rating_pos_desc, 2);
        assert_eq!(by_id(2).rating_pos_desc, 3);
    }

    #[test]
    fn ties_break_by_entry_id_and_mirror_in_descending() {
        let entries = vec![
            entry(1, "Same", Some(5.0)),
            entry(2, "Same", Some(5.0)),
            entry(3, "Same", Some(5.0)),
        ];
        let rows = compute_positions(&entries);

        let by_id = |id: u128| {
            rows.iter()
                .find(|r| r.entry_id.to_uuid() == Uuid::from_u128(id))
                .unwrap()
        };

        assert_eq!(by_id(1).title_pos, 1);
        assert_eq!(by_id(2).title_pos, 2);
        assert_eq!(by_id(3).title_pos, 3);

        // Reverse-id tie-break keeps asc + desc == N + 1 even on ties.
        assert_eq!(by_id(1).title_pos_desc, 3);
        assert_eq!(by_id(2).title_pos_desc, 2);
        assert_eq!(by_id(3).title_pos_desc, 1);
    }

    #[test]
    fn recomputation_is_idempotent() {
        let entries = vec![
            entry(10, "Zeta", Some(3.3)),
            entry(11, "Eta", None),
            entry(12, "Iota", Some(8.8)),
        ];
        assert_eq!(compute_positions(&entries), compute_positions(&entries));
    }

    #[test]
    fn ranks_are_dense_and_one_based() {
        let entries = vec![
            entry(1, "B", None),
            entry(2, "A", None),
            entry(3, "C", None),
        ];
        let rows = compute_positions(&entries);
        let mut positions: Vec<i32> = rows.iter().map(|r| r.title_pos).collect();
        positions.sort_unstable();
        assert_eq!(positions, vec![1, 2, 3]);
    }
}
