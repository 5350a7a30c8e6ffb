use std::path::Path;

use tempfile::TempDir;
use vidq_core::{DownloadQueueStore, QueueError, QueueItem, QueueStatus};

fn temp_store(dir: &Path) -> DownloadQueueStore {
    DownloadQueueStore::builder()
        .path(dir.join("queue.json"))
        .build()
        .expect("create store")
}

#[test]
fn missing_file_is_an_empty_queue() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn duplicate_url_is_rejected_with_existing_item() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());

    let first = store
        .insert(QueueItem::new("https://example.test/v1"))
        .unwrap();
    let err = store
        .insert(QueueItem::new("https://example.test/v1"))
        .unwrap_err();
    match err {
        QueueError::DuplicateUrl { existing } => assert_eq!(existing.id, first.id),
        other => panic!("expected DuplicateUrl, got {other:?}"),
    }

    // Exact string match only; a differently-cased url is a new item.
    store
        .insert(QueueItem::new("https://example.test/V1"))
        .unwrap();
    assert_eq!(store.list().unwrap().len(), 2);
}

#[test]
fn recovery_resets_orphaned_items() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());

    let downloading = store
        .insert(QueueItem::new("https://example.test/a"))
        .unwrap();
    store.mark_started(&downloading.id, Some(4321)).unwrap();
    store.update_progress(&downloading.id, 55).unwrap();

    let paused = store
        .insert(QueueItem::new("https://example.test/b"))
        .unwrap();
    store
        .update_status(&paused.id, QueueStatus::Paused, None)
        .unwrap();

    let completed = store
        .insert(QueueItem::new("https://example.test/c"))
        .unwrap();
    store
        .mark_completed(&completed.id, "media/c.mp4", "c")
        .unwrap();

    let recovered = store.recover_on_startup().unwrap();
    assert_eq!(recovered, 2);

    let items = store.list().unwrap();
    assert!(items
        .iter()
        .all(|item| !matches!(item.status, QueueStatus::Downloading | QueueStatus::Paused)));
    let reset = items.iter().find(|item| item.id == downloading.id).unwrap();
    assert_eq!(reset.status, QueueStatus::Pending);
    assert_eq!(reset.pid, None);
    assert_eq!(reset.progress, 0);
    let untouched = items.iter().find(|item| item.id == completed.id).unwrap();
    assert_eq!(untouched.status, QueueStatus::Completed);
    assert_eq!(untouched.file_path.as_deref(), Some("media/c.mp4"));
}

#[test]
fn items_survive_reopening_the_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.json");

    let store = DownloadQueueStore::new(&path).unwrap();
    let item = store
        .insert(QueueItem::new("https://example.test/persist").with_title("Persisted"))
        .unwrap();
    store.mark_started(&item.id, Some(17)).unwrap();
    drop(store);

    let reopened = DownloadQueueStore::new(&path).unwrap();
    let items = reopened.list().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, item.id);
    assert_eq!(items[0].title.as_deref(), Some("Persisted"));
    assert_eq!(items[0].status, QueueStatus::Downloading);
    assert_eq!(items[0].pid, Some(17));
}

#[test]
fn terminal_updates_record_error_and_timestamps() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());

    let item = store
        .insert(QueueItem::new("https://example.test/fail"))
        .unwrap();
    store
        .update_status(&item.id, QueueStatus::Failed, Some("exit code 1"))
        .unwrap();

    let stored = store.get(&item.id).unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("exit code 1"));
    assert!(stored.completed_at.is_some());
}

#[test]
fn clear_all_reports_removed_count() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());

    store.insert(QueueItem::new("https://example.test/1")).unwrap();
    store.insert(QueueItem::new("https://example.test/2")).unwrap();
    assert_eq!(store.clear_all().unwrap(), 2);
    assert!(store.list().unwrap().is_empty());
    assert_eq!(store.clear_all().unwrap(), 0);
}

#[test]
fn summary_counts_by_status() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());

    store.insert(QueueItem::new("https://example.test/p1")).unwrap();
    store.insert(QueueItem::new("https://example.test/p2")).unwrap();
    let failed = store.insert(QueueItem::new("https://example.test/f")).unwrap();
    store
        .update_status(&failed.id, QueueStatus::Failed, Some("boom"))
        .unwrap();

    let summary = store.summary().unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.counts.get(&QueueStatus::Pending), Some(&2));
    assert_eq!(summary.counts.get(&QueueStatus::Failed), Some(&1));
}
