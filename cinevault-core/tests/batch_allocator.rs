//! Exercises per-library batch allocation: dense ids, fixed capacity,
//! reuse on the natural key, and cursor immutability.

use std::collections::HashMap;
use std::sync::Arc;

use cinevault_core::catalog::{NewCatalogEntry, PostgresCatalogRepository};
use cinevault_core::error::IngestError;
use cinevault_core::types::{BatchSize, LibraryId};
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_library(pool: &PgPool) -> LibraryId {
    let repo = PostgresCatalogRepository::new(pool.clone());
    repo.create_library("Test Library - Movies")
        .await
        .expect("seed library")
}

fn movie(library_id: LibraryId, tmdb_id: i64) -> NewCatalogEntry {
    NewCatalogEntry {
        library_id,
        tmdb_id,
        title: format!("Movie {tmdb_id}"),
    }
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn five_sequential_allocations_with_batch_size_three(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let repo = PostgresCatalogRepository::new(pool.clone());
    let allocator = repo.allocator().clone();

    allocator
        .set_batch_size(&pool, library_id, BatchSize::new(3).unwrap())
        .await
        .expect("set batch size");

    let mut batch_ids = Vec::new();
    for tmdb_id in 1..=5 {
        let write = repo
            .create_entry(movie(library_id, tmdb_id))
            .await
            .expect("create entry");
        assert!(write.created);
        batch_ids.push(write.entry.batch_id.value());
    }
    assert_eq!(batch_ids, vec![1, 1, 1, 2, 2]);

    let finalized = allocator
        .list_finalized(&pool, library_id)
        .await
        .expect("list finalized");
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].batch_id.value(), 1);
    assert!(finalized[0].is_finalized());
    assert!(
        finalized[0].content_hash.as_deref().is_some_and(|h| h.len() == 64),
        "finalized batch carries a content hash"
    );

    let open = allocator
        .open_batch(&pool, library_id)
        .await
        .expect("open batch")
        .expect("an open batch exists");
    assert_eq!(open.batch_id.value(), 2);
    assert!(open.finalized_at.is_none());
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn reinserting_the_same_natural_key_never_advances_the_cursor(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let repo = PostgresCatalogRepository::new(pool.clone());
    repo.allocator()
        .set_batch_size(&pool, library_id, BatchSize::new(3).unwrap())
        .await
        .expect("set batch size");

    let first = repo
        .create_entry(movie(library_id, 42))
        .await
        .expect("create");
    assert!(first.created);

    let replay = repo
        .create_entry(movie(library_id, 42))
        .await
        .expect("replay create");
    assert!(!replay.created);
    assert_eq!(replay.entry.id, first.entry.id);
    assert_eq!(replay.entry.batch_id, first.entry.batch_id);

    let stored = repo
        .get_entry(first.entry.id)
        .await
        .expect("get entry")
        .expect("entry exists");
    assert_eq!(stored, first.entry);

    let (count, batch): (i64, i64) = sqlx::query_as(
        "SELECT current_count, current_batch_id FROM library_batch_cursors WHERE library_id = $1",
    )
    .bind(library_id.to_uuid())
    .fetch_one(&pool)
    .await
    .expect("cursor row");
    assert_eq!(count, 1, "replayed insert must not advance the cursor");
    assert_eq!(batch, 1);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn batch_size_is_immutable_once_entries_exist(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let repo = PostgresCatalogRepository::new(pool.clone());
    let allocator = repo.allocator().clone();

    allocator
        .set_batch_size(&pool, library_id, BatchSize::new(100).unwrap())
        .await
        .expect("initial size");
    // Still no entries: re-fixing is allowed.
    allocator
        .set_batch_size(&pool, library_id, BatchSize::new(250).unwrap())
        .await
        .expect("size change before first entry");

    repo.create_entry(movie(library_id, 1)).await.expect("create");

    let err = allocator
        .set_batch_size(&pool, library_id, BatchSize::new(500).unwrap())
        .await
        .expect_err("size change after first entry must fail");
    assert!(matches!(err, IngestError::ImmutableBatchSize { .. }));
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn concurrent_allocations_respect_batch_capacity(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let repo = Arc::new(PostgresCatalogRepository::new(pool.clone()));
    repo.allocator()
        .set_batch_size(&pool, library_id, BatchSize::new(4).unwrap())
        .await
        .expect("set batch size");

    let mut handles = Vec::new();
    for tmdb_id in 1..=10 {
        let repo = Arc::clone(&repo);
        handles.push(tokio::spawn(async move {
            repo.create_entry(movie(library_id, tmdb_id))
                .await
                .expect("create entry")
        }));
    }

    let mut per_batch: HashMap<u32, usize> = HashMap::new();
    for handle in handles {
        let write = handle.await.expect("join");
        assert!(write.created);
        *per_batch.entry(write.entry.batch_id.value()).or_insert(0) += 1;
    }

    // Dense monotonic ids, no batch over capacity.
    let mut batches: Vec<u32> = per_batch.keys().copied().collect();
    batches.sort_unstable();
    assert_eq!(batches, vec![1, 2, 3]);
    assert_eq!(per_batch[&1], 4);
    assert_eq!(per_batch[&2], 4);
    assert_eq!(per_batch[&3], 2);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn two_libraries_allocate_independently(pool: PgPool) {
    let lib_a = seed_library(&pool).await;
    let lib_b = seed_library(&pool).await;
    let repo = PostgresCatalogRepository::new(pool.clone());
    repo.allocator()
        .set_batch_size(&pool, lib_a, BatchSize::new(2).unwrap())
        .await
        .expect("size a");
    repo.allocator()
        .set_batch_size(&pool, lib_b, BatchSize::new(2).unwrap())
        .await
        .expect("size b");

    for tmdb_id in 1..=3 {
        repo.create_entry(movie(lib_a, tmdb_id)).await.expect("a");
    }
    let write = repo.create_entry(movie(lib_b, 1)).await.expect("b");

    // Library B starts at batch 1 regardless of A's progress.
    assert_eq!(write.entry.batch_id.value(), 1);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn missing_cursor_with_entries_is_a_consistency_violation(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let repo = PostgresCatalogRepository::new(pool.clone());

    // Simulate a corrupted installation: an entry exists but the cursor
    // row was never created.
    sqlx::query("INSERT INTO catalog_batches (library_id, batch_id, batch_size) VALUES ($1, 1, 500)")
        .bind(library_id.to_uuid())
        .execute(&pool)
        .await
        .expect("seed batch row");
    sqlx::query(
        "INSERT INTO catalog_entries (id, library_id, tmdb_id, batch_id, title) \
         VALUES ($1, $2, 7, 1, 'Orphan')",
    )
    .bind(Uuid::now_v7())
    .bind(library_id.to_uuid())
    .execute(&pool)
    .await
    .expect("seed entry row");

    let err = repo
        .create_entry(movie(library_id, 8))
        .await
        .expect_err("allocation against a missing cursor must abort");
    assert!(matches!(err, IngestError::ConsistencyViolation(_)));
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn batch_scoped_loader_returns_members_in_id_order(pool: PgPool) {
    let library_id = seed_library(&pool).await;
    let repo = PostgresCatalogRepository::new(pool.clone());
    repo.allocator()
        .set_batch_size(&pool, library_id, BatchSize::new(3).unwrap())
        .await
        .expect("set batch size");

    let mut created = Vec::new();
    for tmdb_id in 1..=4 {
        created.push(
            repo.create_entry(movie(library_id, tmdb_id))
                .await
                .expect("create")
                .entry,
        );
    }

    let batch_one = repo
        .list_batch_entries(library_id, created[0].batch_id)
        .await
        .expect("list batch 1");
    assert_eq!(batch_one.len(), 3);
    let ids: Vec<_> = batch_one.iter().map(|entry| entry.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}
