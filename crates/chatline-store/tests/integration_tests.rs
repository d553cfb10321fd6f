//! Durable store behavior the pipeline relies on: batch atomicity,
//! idempotent replay and error classification.

use chatline_core::{IdGenerator, MessageRecord};
use chatline_store::{MessageStore, SqliteMessageStore};

fn batch(ids: &IdGenerator, n: usize) -> Vec<MessageRecord> {
    (0..n)
        .map(|i| MessageRecord::new(ids.next_id(), 42, 1000 + i as i64, format!("body {}", i), None))
        .collect()
}

#[tokio::test]
async fn test_batch_with_poison_record_commits_nothing() {
    let store = SqliteMessageStore::new_in_memory().await.unwrap();
    let ids = IdGenerator::new(2).unwrap();

    let mut records = batch(&ids, 5);
    // Violates the non-empty body check
    records[3].body = String::new();

    let err = store.insert_batch(&records).await.unwrap_err();
    assert!(err.is_integrity_violation(), "unexpected error: {}", err);
    assert!(!err.is_transient());
    assert_eq!(store.count_messages().await.unwrap(), 0);

    // The healthy records still go through on their own
    records.remove(3);
    assert_eq!(store.insert_batch(&records).await.unwrap(), 4);
    assert_eq!(store.count_messages().await.unwrap(), 4);
}

#[tokio::test]
async fn test_replayed_batch_is_idempotent() {
    let store = SqliteMessageStore::new_in_memory().await.unwrap();
    let ids = IdGenerator::new(2).unwrap();
    let records = batch(&ids, 10);

    assert_eq!(store.insert_batch(&records).await.unwrap(), 10);
    assert_eq!(store.insert_batch(&records).await.unwrap(), 0);

    let mut overlapping = records[5..].to_vec();
    overlapping.extend(batch(&ids, 2));
    assert_eq!(store.insert_batch(&overlapping).await.unwrap(), 2);

    assert_eq!(store.count_messages().await.unwrap(), 12);
}

#[tokio::test]
async fn test_file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    let ids = IdGenerator::new(2).unwrap();
    let records = batch(&ids, 3);

    {
        let store = SqliteMessageStore::new(&path).await.unwrap();
        store.insert_batch(&records).await.unwrap();
        store.pool().close().await;
    }

    let store = SqliteMessageStore::new(&path).await.unwrap();
    assert_eq!(store.recent_messages(42, 50).await.unwrap(), records);
}

#[tokio::test]
async fn test_closed_pool_is_transient() {
    let store = SqliteMessageStore::new_in_memory().await.unwrap();
    let ids = IdGenerator::new(2).unwrap();
    store.pool().close().await;

    let err = store.insert_batch(&batch(&ids, 1)).await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {}", err);
    assert!(!err.is_integrity_violation());
}
