//! Round trips through the worker thread

use object_loader::config::{CacheConfig, WorkerConfig};
use object_loader::{Base, Error, Item, MemoryDatabase, WorkerManager};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn item(id: &str) -> Item {
    let base: Base = serde_json::from_value(serde_json::json!({ "id": id, "speckle_type": "Base" })).unwrap();
    Item::new(base)
}

fn config() -> WorkerConfig {
    WorkerConfig {
        queue_capacity_bytes: 4096,
        poll_batch_size: 10,
        poll_timeout_ms: 20,
        enqueue_timeout_ms: 1000,
    }
}

/// Poll until `count` results arrived or five seconds passed
fn collect(manager: &WorkerManager, count: usize) -> Vec<Item> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut items = Vec::new();
    while items.len() < count && Instant::now() < deadline {
        items.extend(manager.poll_results().unwrap());
    }
    items
}

/// Test a round trip returning cached items and placeholders in request order
#[tokio::test]
async fn test_worker_resolves_cached_and_missing_ids() {
    let database = Arc::new(MemoryDatabase::with_items(vec![item("a"), item("b")]));
    let mut manager = WorkerManager::start(database, &CacheConfig::default(), config()).unwrap();
    manager.wait_ready().await.unwrap();
    assert!(manager.is_ready(), "Manager should be ready after Ready event");

    let ids: Vec<String> = ["a", "missing", "b"].iter().map(|s| s.to_string()).collect();
    assert!(manager.send(&ids).unwrap());

    let items = collect(&manager, 3);
    assert_eq!(items.len(), 3, "Every requested id should be answered");
    assert_eq!(items[0], item("a"));
    assert_eq!(items[1], Item::placeholder("missing"), "Unknown id should become a placeholder");
    assert_eq!(items[2], item("b"));

    assert!(manager.poll_events().unwrap().is_empty(), "No processing errors expected");
    manager.dispose();
}

/// Test many requests through queues far smaller than the total traffic
#[tokio::test]
async fn test_many_requests_in_small_queues() {
    let seeded: Vec<Item> = (0..200).map(|i| item(&format!("obj{i}"))).collect();
    let database = Arc::new(MemoryDatabase::with_items(seeded));
    let mut small = config();
    small.queue_capacity_bytes = 512;
    let mut manager = WorkerManager::start(database, &CacheConfig::default(), small).unwrap();
    manager.wait_ready().await.unwrap();

    let mut received = Vec::new();
    for chunk in (0..200).collect::<Vec<_>>().chunks(20) {
        let ids: Vec<String> = chunk.iter().map(|i| format!("obj{i}")).collect();
        assert!(manager.send(&ids).unwrap());
        received.extend(collect(&manager, 20));
    }

    assert_eq!(received.len(), 200, "Every id should be answered");
    assert!(received.iter().all(|item| !item.is_placeholder()), "Every id was seeded");
    assert_eq!(received[199].base_id, "obj199");
}

/// Test that the queues are unusable until the worker is ready
#[tokio::test]
async fn test_send_before_ready_is_rejected() {
    let manager = WorkerManager::start(Arc::new(MemoryDatabase::new()), &CacheConfig::default(), config()).unwrap();
    assert!(matches!(manager.send(&["a".to_string()]), Err(Error::Init(_))));
    assert!(matches!(manager.poll_results(), Err(Error::Init(_))));
}

/// Test that an item too large for the result queue comes back as a placeholder
#[tokio::test]
async fn test_oversized_item_returned_as_placeholder() {
    let big: Base = serde_json::from_value(serde_json::json!({
        "id": "big",
        "speckle_type": "Base",
        "blob": "x".repeat(2048),
    }))
    .unwrap();
    let database = Arc::new(MemoryDatabase::with_items(vec![Item::new(big), item("small")]));
    let mut small = config();
    small.queue_capacity_bytes = 512;
    let mut manager = WorkerManager::start(database, &CacheConfig::default(), small).unwrap();
    manager.wait_ready().await.unwrap();

    let ids: Vec<String> = ["big", "small"].iter().map(|s| s.to_string()).collect();
    assert!(manager.send(&ids).unwrap());

    let items = collect(&manager, 2);
    assert_eq!(items.len(), 2, "Both ids should be answered");
    assert_eq!(items[0], Item::placeholder("big"), "Oversized item should become a placeholder");
    assert_eq!(items[1], item("small"), "Items after the oversized one should still arrive");
    manager.dispose();
}
