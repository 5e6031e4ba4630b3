//! Exercises the sort-position rebuild: dual ranks, NULL ordering,
//! idempotence, snapshot replacement, and paged fetches.

use chrono::NaiveDate;
use cinevault_core::catalog::sort_positions::{PostgresSortPositions, SortBy, SortOrder};
use cinevault_core::catalog::{CatalogEntry, NewCatalogEntry, PostgresCatalogRepository};
use cinevault_core::types::LibraryId;
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_library(pool: &PgPool) -> LibraryId {
    PostgresCatalogRepository::new(pool.clone())
        .create_library("Test Library - Movies")
        .await
        .expect("seed library")
}

async fn seed_entry(pool: &PgPool, library_id: LibraryId, tmdb_id: i64, title: &str) -> CatalogEntry {
    PostgresCatalogRepository::new(pool.clone())
        .create_entry(NewCatalogEntry {
            library_id,
            tmdb_id,
            title: title.to_string(),
        })
        .await
        .expect("create entry")
        .entry
}

async fn seed_file(
    pool: &PgPool,
    entry: &CatalogEntry,
    file_size: i64,
    bitrate: i64,
    width: i32,
    height: i32,
) {
    sqlx::query(
        r#"
        INSERT INTO media_files (id, entry_id, library_id, batch_id, file_path, file_size, bitrate, width, height)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(entry.id.to_uuid())
    .bind(entry.library_id.to_uuid())
    .bind(entry.batch_id.as_i64())
    .bind(format!("/movies/{}.mkv", entry.tmdb_id))
    .bind(file_size)
    .bind(bitrate)
    .bind(width)
    .bind(height)
    .execute(pool)
    .await
    .expect("seed media file");
}

async fn seed_metadata(
    pool: &PgPool,
    entry: &CatalogEntry,
    release_date: Option<NaiveDate>,
    rating: Option<f64>,
    runtime_minutes: Option<i32>,
    popularity: Option<f64>,
    content_rating: Option<&str>,
) {
    sqlx::query(
        r#"
        INSERT INTO entry_metadata (entry_id, library_id, batch_id, release_date, rating, runtime_minutes, popularity, content_rating)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id.to_uuid())
    .bind(entry.library_id.to_uuid())
    .bind(entry.batch_id.as_i64())
    .bind(release_date)
    .bind(rating)
    .bind(runtime_minutes)
    .bind(popularity)
    .bind(content_rating)
    .execute(pool)
    .await
    .expect("seed metadata");
}

async fn rank_rows(pool: &PgPool, library_id: LibraryId) -> Vec<(Uuid, i32, i32, i32, i32)> {
    sqlx::query_as::<_, (Uuid, i32, i32, i32, i32)>(
        r#"
        SELECT entry_id, title_pos, title_pos_desc, rating_pos, rating_pos_desc
        FROM entry_sort_positions
        WHERE library_id = $1
        ORDER BY entry_id
        "#,
    )
    .bind(library_id.to_uuid())
    .fetch_all(pool)
    .await
    .expect("rank rows")
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn rebuild_computes_dual_ranks_per_dimension(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let store = PostgresSortPositions::new(pool.clone());

    let titles = ["Brazil", "Alien", "Dune", "Contact"];
    let ratings = [7.8, 8.5, 8.0, 7.4];
    for (idx, title) in titles.iter().enumerate() {
        let entry = seed_entry(&pool, library_id, idx as i64 + 1, title).await;
        seed_file(&pool, &entry, 1_000 + idx as i64, 8_000, 1920, 1080).await;
        seed_metadata(
            &pool,
            &entry,
            NaiveDate::from_ymd_opt(1980 + idx as i32, 1, 1),
            Some(ratings[idx]),
            Some(120),
            Some(10.0 + idx as f64),
            Some("PG-13"),
        )
        .await;
    }

    let count = store.rebuild(library_id).await.expect("rebuild");
    assert_eq!(count, 4);

    let rows = rank_rows(&pool, library_id).await;
    let n = rows.len() as i32;
    for (_, title_pos, title_pos_desc, rating_pos, rating_pos_desc) in &rows {
        assert_eq!(title_pos + title_pos_desc, n + 1);
        assert_eq!(rating_pos + rating_pos_desc, n + 1);
        assert!((1..=n).contains(title_pos));
    }

    // Ascending title page: Alien, Brazil, Contact, Dune.
    let page = store
        .fetch_page(library_id, SortBy::Title, SortOrder::Ascending, None, None)
        .await
        .expect("page");
    let page_titles: Vec<String> = {
        let mut out = Vec::new();
        for entry_id in &page {
            let title: String =
                sqlx::query_scalar("SELECT title FROM catalog_entries WHERE id = $1")
                    .bind(entry_id.to_uuid())
                    .fetch_one(&pool)
                    .await
                    .expect("title");
            out.push(title);
        }
        out
    };
    assert_eq!(page_titles, vec!["Alien", "Brazil", "Contact", "Dune"]);

    // Descending is the exact mirror.
    let reversed = store
        .fetch_page(library_id, SortBy::Title, SortOrder::Descending, None, None)
        .await
        .expect("desc page");
    let mut mirrored = page.clone();
    mirrored.reverse();
    assert_eq!(reversed, mirrored);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn null_metadata_ranks_last(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let store = PostgresSortPositions::new(pool.clone());

    let rated = seed_entry(&pool, library_id, 1, "Rated").await;
    seed_metadata(&pool, &rated, None, Some(6.0), None, None, None).await;
    let unrated = seed_entry(&pool, library_id, 2, "Unrated").await;
    // No metadata row at all: every metadata key is NULL.

    store.rebuild(library_id).await.expect("rebuild");

    let rows = rank_rows(&pool, library_id).await;
    let rating_pos_of = |id: Uuid| {
        rows.iter()
            .find(|(entry_id, ..)| *entry_id == id)
            .map(|(_, _, _, rating_pos, rating_pos_desc)| (*rating_pos, *rating_pos_desc))
            .expect("row")
    };

    assert_eq!(rating_pos_of(rated.id.to_uuid()), (1, 1));
    // The NULL key sorts last in both directions.
    assert_eq!(rating_pos_of(unrated.id.to_uuid()), (2, 2));
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn rebuild_is_idempotent(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let store = PostgresSortPositions::new(pool.clone());

    for (tmdb_id, title) in [(1, "Gamma"), (2, "Alpha"), (3, "Beta")] {
        let entry = seed_entry(&pool, library_id, tmdb_id, title).await;
        seed_file(&pool, &entry, 100 * tmdb_id, 5_000, 1280, 720).await;
    }

    store.rebuild(library_id).await.expect("first rebuild");
    let first = rank_rows(&pool, library_id).await;

    store.rebuild(library_id).await.expect("second rebuild");
    let second = rank_rows(&pool, library_id).await;

    assert_eq!(first, second);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn rebuild_drops_rows_for_removed_entries(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let repo = PostgresCatalogRepository::new(pool.clone());
    let store = PostgresSortPositions::new(pool.clone());

    let keep = seed_entry(&pool, library_id, 1, "Keep").await;
    let drop = seed_entry(&pool, library_id, 2, "Drop").await;

    store.rebuild(library_id).await.expect("rebuild");
    assert_eq!(rank_rows(&pool, library_id).await.len(), 2);

    assert!(repo.remove_entry(drop.id).await.expect("remove"));
    store.rebuild(library_id).await.expect("rebuild after removal");

    let rows = rank_rows(&pool, library_id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, keep.id.to_uuid());
    // A library of one: both directions rank the survivor first.
    assert_eq!((rows[0].1, rows[0].2), (1, 1));
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn fetch_page_applies_offset_and_limit(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let store = PostgresSortPositions::new(pool.clone());

    for (tmdb_id, title) in [(1, "A"), (2, "B"), (3, "C"), (4, "D"), (5, "E")] {
        seed_entry(&pool, library_id, tmdb_id, title).await;
    }
    store.rebuild(library_id).await.expect("rebuild");

    let page = store
        .fetch_page(library_id, SortBy::Title, SortOrder::Ascending, Some(1), Some(2))
        .await
        .expect("page");
    assert_eq!(page.len(), 2);

    let titles: Vec<String> = {
        let mut out = Vec::new();
        for entry_id in &page {
            out.push(
                sqlx::query_scalar("SELECT title FROM catalog_entries WHERE id = $1")
                    .bind(entry_id.to_uuid())
                    .fetch_one(&pool)
                    .await
                    .expect("title"),
            );
        }
        out
    };
    assert_eq!(titles, vec!["B", "C"]);
}
