//! Database tests

use super::*;
use chrono::{Duration, Utc};
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
}

#[tokio::test]
async fn test_upsert_follower_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;

    db.upsert_follower("alice", "https://remote/actor", "https://remote/actor/inbox")
        .await
        .unwrap();
    db.upsert_follower("alice", "https://remote/actor", "https://remote/actor/inbox")
        .await
        .unwrap();

    let followers = db.list_followers("alice").await.unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(
        followers.get("https://remote/actor").map(String::as_str),
        Some("https://remote/actor/inbox")
    );
}

#[tokio::test]
async fn test_upsert_follower_replaces_inbox() {
    let (db, _temp_dir) = create_test_db().await;

    db.upsert_follower("alice", "https://remote/actor", "https://remote/actor/inbox")
        .await
        .unwrap();
    db.upsert_follower("alice", "https://remote/actor", "https://remote/shared-inbox")
        .await
        .unwrap();

    let follower = db
        .get_follower("alice", "https://remote/actor")
        .await
        .unwrap()
        .expect("follower stored");
    assert_eq!(follower.inbox, "https://remote/shared-inbox");
    assert!(follower.updated_at >= follower.created_at);
}

#[tokio::test]
async fn test_followers_are_scoped_per_account() {
    let (db, _temp_dir) = create_test_db().await;

    db.upsert_follower("alice", "https://remote/actor", "https://remote/inbox")
        .await
        .unwrap();
    db.upsert_follower("bob", "https://other/actor", "https://other/inbox")
        .await
        .unwrap();

    let alice = db.list_followers("alice").await.unwrap();
    assert_eq!(alice.keys().collect::<Vec<_>>(), vec!["https://remote/actor"]);
    assert!(db.list_followers("carol").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_follower() {
    let (db, _temp_dir) = create_test_db().await;

    db.upsert_follower("alice", "https://remote/actor", "https://remote/inbox")
        .await
        .unwrap();

    assert!(!db.remove_follower("bob", "https://remote/actor").await.unwrap());
    assert!(db.remove_follower("alice", "https://remote/actor").await.unwrap());
    assert!(db.list_followers("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_inbox_evicts_every_matching_follower() {
    let (db, _temp_dir) = create_test_db().await;

    db.upsert_follower("alice", "https://remote/a", "https://remote/inbox")
        .await
        .unwrap();
    db.upsert_follower("bob", "https://remote/b", "https://remote/inbox")
        .await
        .unwrap();
    db.upsert_follower("alice", "https://other/c", "https://other/inbox")
        .await
        .unwrap();

    let removed = db.remove_inbox("https://remote/inbox").await.unwrap();
    assert_eq!(removed.len(), 2);

    let alice = db.list_followers("alice").await.unwrap();
    assert_eq!(alice.keys().collect::<Vec<_>>(), vec!["https://other/c"]);
    assert!(db.list_followers("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_follower_writes_do_not_lose_updates() {
    let (db, _temp_dir) = create_test_db().await;
    let db = std::sync::Arc::new(db);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            db.upsert_follower(
                "alice",
                &format!("https://remote/actor/{i}"),
                &format!("https://remote/actor/{i}/inbox"),
            )
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(db.list_followers("alice").await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_queue_due_items_respect_schedule() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    let due = db.enqueue("ap", b"due", now - Duration::seconds(1)).await.unwrap();
    let _later = db.enqueue("ap", b"later", now + Duration::minutes(10)).await.unwrap();
    let _other = db.enqueue("other", b"other", now).await.unwrap();

    let items = db.due_queue_items("ap", now, 100).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, due);
    assert_eq!(items[0].content, b"due".to_vec());
    assert_eq!(items[0].attempts, 0);
    assert_eq!(db.queue_len("ap").await.unwrap(), 2);
}

#[tokio::test]
async fn test_queue_due_items_are_paged_oldest_first() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    for i in 0..5i64 {
        db.enqueue("ap", &[i as u8], now - Duration::seconds(10 - i))
            .await
            .unwrap();
    }

    let page = db.due_queue_items("ap", now, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].content, vec![0]);
    assert_eq!(page[1].content, vec![1]);

    assert_eq!(db.due_queue_items("ap", now, 100).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_queue_reschedule_counts_attempts() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    let id = db.enqueue("ap", b"v1", now).await.unwrap();
    let next = now + Duration::minutes(10);
    db.reschedule_queue_item(&id, b"v2", next).await.unwrap();

    assert!(db.due_queue_items("ap", now, 100).await.unwrap().is_empty());

    let items = db.queue_items("ap").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].content, b"v2".to_vec());
    assert_eq!(items[0].attempts, 1);
    assert_eq!(items[0].schedule_ms, next.timestamp_millis());
    assert_eq!(items[0].run_at().timestamp_millis(), next.timestamp_millis());
}

#[tokio::test]
async fn test_dequeue_removes_item() {
    let (db, _temp_dir) = create_test_db().await;

    let id = db.enqueue("ap", b"payload", Utc::now()).await.unwrap();
    db.dequeue(&id).await.unwrap();

    assert_eq!(db.queue_len("ap").await.unwrap(), 0);
}

#[tokio::test]
async fn test_queue_survives_reconnect() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("persist.db");

    {
        let db = Database::connect(&db_path).await.unwrap();
        db.enqueue("ap", b"persisted", Utc::now()).await.unwrap();
    }

    let db = Database::connect(&db_path).await.unwrap();
    let items = db.queue_items("ap").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].content, b"persisted".to_vec());
}
