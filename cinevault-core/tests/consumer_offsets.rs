//! Exercises the durable consumer offsets over the file-change log:
//! at-least-once delivery, idempotent advancement, and group isolation.

use chrono::{Duration, DurationRound, Utc};
use cinevault_core::error::IngestError;
use cinevault_core::ingest::fs_watch::{
    FileChangeEvent, FileChangeEventBus, FileChangeEventKind, PostgresFileChangeEventBus,
};
use cinevault_core::types::{EventId, LibraryId};
use futures::StreamExt;
use sqlx::PgPool;

async fn publish_sequence(
    bus: &PostgresFileChangeEventBus,
    library_id: LibraryId,
    count: usize,
) -> Vec<FileChangeEvent> {
    let mut events = Vec::with_capacity(count);
    // Millisecond-truncated base so timestamps survive the round trip
    // through timestamptz unchanged.
    let base = Utc::now()
        .duration_trunc(Duration::milliseconds(1))
        .expect("truncate");
    for idx in 0..count {
        let mut event = FileChangeEvent::new(
            library_id,
            FileChangeEventKind::Created,
            format!("/movies/file-{idx}.mkv"),
        );
        // Spread detected_at so cursor ordering is unambiguous.
        event.detected_at = base + Duration::milliseconds(idx as i64);
        bus.publish(event.clone()).await.expect("publish");
        events.push(event);
    }
    events
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn read_since_resumes_after_the_cursor(pool: PgPool) {
    let bus = PostgresFileChangeEventBus::new(pool.clone());
    let library_id = LibraryId::new();
    let events = publish_sequence(&bus, library_id, 3).await;

    let all = bus
        .read_since("search-indexer", library_id, 10)
        .await
        .expect("initial read");
    assert_eq!(all.len(), 3);

    bus.advance(
        "search-indexer",
        library_id,
        events[1].id,
        events[1].detected_at,
    )
    .await
    .expect("advance");

    let rest = bus
        .read_since("search-indexer", library_id, 10)
        .await
        .expect("read after advance");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, events[2].id);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn processing_without_advancing_redelivers(pool: PgPool) {
    let bus = PostgresFileChangeEventBus::new(pool.clone());
    let library_id = LibraryId::new();
    publish_sequence(&bus, library_id, 2).await;

    // A consumer that crashes before advancing sees the same events again.
    let first_read = bus
        .read_since("cache-invalidator", library_id, 10)
        .await
        .expect("first read");
    let second_read = bus
        .read_since("cache-invalidator", library_id, 10)
        .await
        .expect("second read");

    let first_ids: Vec<EventId> = first_read.iter().map(|e| e.id).collect();
    let second_ids: Vec<EventId> = second_read.iter().map(|e| e.id).collect();
    assert_eq!(first_ids, second_ids);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn advance_is_idempotent_and_never_regresses(pool: PgPool) {
    let bus = PostgresFileChangeEventBus::new(pool.clone());
    let library_id = LibraryId::new();
    let events = publish_sequence(&bus, library_id, 3).await;

    bus.advance("group", library_id, events[2].id, events[2].detected_at)
        .await
        .expect("advance to head");

    // Re-advancing with the same event id is a no-op.
    bus.advance("group", library_id, events[2].id, events[2].detected_at)
        .await
        .expect("re-advance");
    // A stale position never overwrites a newer one.
    bus.advance("group", library_id, events[0].id, events[0].detected_at)
        .await
        .expect("stale advance");

    let cursor = bus
        .cursor("group", library_id)
        .await
        .expect("cursor")
        .expect("cursor exists");
    assert_eq!(cursor.last_event_id, Some(events[2].id));
    assert_eq!(cursor.last_detected_at, Some(events[2].detected_at));

    let remaining = bus
        .read_since("group", library_id, 10)
        .await
        .expect("read");
    assert!(remaining.is_empty(), "nothing at or before the cursor is redelivered");
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn consumer_groups_track_independent_cursors(pool: PgPool) {
    let bus = PostgresFileChangeEventBus::new(pool.clone());
    let library_id = LibraryId::new();
    let events = publish_sequence(&bus, library_id, 2).await;

    bus.advance("search-indexer", library_id, events[1].id, events[1].detected_at)
        .await
        .expect("advance indexer");

    let indexer = bus
        .read_since("search-indexer", library_id, 10)
        .await
        .expect("indexer read");
    let invalidator = bus
        .read_since("cache-invalidator", library_id, 10)
        .await
        .expect("invalidator read");

    assert!(indexer.is_empty());
    assert_eq!(invalidator.len(), 2);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn ack_resolves_the_event_position(pool: PgPool) {
    let bus = PostgresFileChangeEventBus::new(pool.clone());
    let library_id = LibraryId::new();
    let events = publish_sequence(&bus, library_id, 2).await;

    bus.ack("group", events[0].id).await.expect("ack");

    let cursor = bus
        .cursor("group", library_id)
        .await
        .expect("cursor")
        .expect("cursor exists");
    assert_eq!(cursor.last_event_id, Some(events[0].id));

    let err = bus
        .ack("group", EventId::new())
        .await
        .expect_err("acking an unknown event must fail");
    assert!(matches!(err, IngestError::NotFound(_)));
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn subscribe_streams_from_the_durable_cursor(pool: PgPool) {
    let bus = PostgresFileChangeEventBus::new(pool.clone());
    let library_id = LibraryId::new();
    let events = publish_sequence(&bus, library_id, 3).await;

    bus.advance("streamer", library_id, events[0].id, events[0].detected_at)
        .await
        .expect("advance past first");

    let mut stream = bus
        .subscribe("streamer", library_id)
        .await
        .expect("subscribe");

    let first = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
        .await
        .expect("stream produced within timeout")
        .expect("stream open");
    let second = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
        .await
        .expect("stream produced within timeout")
        .expect("stream open");

    assert_eq!(first.id, events[1].id);
    assert_eq!(second.id, events[2].id);
}

#[sqlx::test(migrator = "cinevault_core::MIGRATOR")]
async fn retention_cleanup_drops_old_events(pool: PgPool) {
    let bus = PostgresFileChangeEventBus::new(pool.clone());
    let library_id = LibraryId::new();

    let mut old_event = FileChangeEvent::new(
        library_id,
        FileChangeEventKind::Deleted,
        "/movies/ancient.mkv",
    );
    old_event.detected_at = Utc::now() - Duration::days(40);
    bus.publish(old_event).await.expect("publish old");

    bus.publish(FileChangeEvent::new(
        library_id,
        FileChangeEventKind::Created,
        "/movies/fresh.mkv",
    ))
    .await
    .expect("publish fresh");

    let removed = bus.cleanup_retention(30).await.expect("cleanup");
    assert_eq!(removed, 1);

    let remaining = bus
        .read_since("group", library_id, 10)
        .await
        .expect("read");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].file_path, "/movies/fresh.mkv");
}
