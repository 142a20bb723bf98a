//! Persistence tests for the file database

use object_loader::cache::disk::FILE_HEADER_SIZE;
use object_loader::{BatchingOptions, Base, Cache, Database, Error, FileDatabase, Item};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct TestContext {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("objects.db");

        Self {
            _temp_dir: temp_dir,
            path,
        }
    }
}

fn item(id: &str, name: &str) -> Item {
    let base: Base = serde_json::from_value(serde_json::json!({ "id": id, "name": name })).unwrap();
    Item::new(base)
}

/// Test that stored items, latest write first, survive reopening the file
#[tokio::test]
async fn test_items_survive_reopen() {
    let context = TestContext::new();

    {
        let db = FileDatabase::open(&context.path).unwrap();
        db.put_all(vec![item("a", "first"), item("b", "second")]).await.unwrap();
        db.put_all(vec![item("a", "updated")]).await.unwrap();
        db.dispose().await.unwrap();
    }

    let db = FileDatabase::open(&context.path).unwrap();
    assert_eq!(db.len(), 2, "Index should hold two distinct ids");

    let keys = vec!["a".to_string(), "c".to_string(), "b".to_string()];
    let found = db.get_all(&keys).await.unwrap();
    assert_eq!(
        found,
        vec![Some(item("a", "updated")), None, Some(item("b", "second"))],
        "Latest write should win and order should be preserved"
    );
}

/// Test that a partially written record is cut off on open
#[tokio::test]
async fn test_torn_tail_is_truncated() {
    let context = TestContext::new();

    let intact_len = {
        let db = FileDatabase::open(&context.path).unwrap();
        db.put_all(vec![item("a", "kept")]).await.unwrap();
        db.dispose().await.unwrap();
        std::fs::metadata(&context.path).unwrap().len()
    };

    // A record header promising more bytes than were written
    {
        let mut file = OpenOptions::new().append(true).open(&context.path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.write_all(b"{\"baseId\":").unwrap();
    }

    let db = FileDatabase::open(&context.path).unwrap();
    assert_eq!(
        std::fs::metadata(&context.path).unwrap().len(),
        intact_len,
        "Torn record should be truncated"
    );
    assert_eq!(db.get("a").await.unwrap(), Some(item("a", "kept")));

    // Appends continue from the truncated end
    db.put_all(vec![item("b", "after")]).await.unwrap();
    db.dispose().await.unwrap();

    let db = FileDatabase::open(&context.path).unwrap();
    assert_eq!(db.len(), 2, "Append after truncation should be readable");
    assert_eq!(db.get("b").await.unwrap(), Some(item("b", "after")));
}

/// Test that an empty store holds only the file header
#[tokio::test]
async fn test_empty_store_is_just_a_header() {
    let context = TestContext::new();
    let db = FileDatabase::open(&context.path).unwrap();
    db.put_all(Vec::new()).await.unwrap();

    assert!(db.is_empty(), "Empty batch should store nothing");
    assert_eq!(
        std::fs::metadata(&context.path).unwrap().len(),
        FILE_HEADER_SIZE as u64,
        "File should hold only the header"
    );
}

/// Test that disposing the cache persists pending writes
#[tokio::test]
async fn test_cache_over_file_database_flushes_on_dispose() {
    let context = TestContext::new();
    let options = BatchingOptions::new(100, Duration::from_secs(60));

    {
        let db: Arc<dyn Database> = Arc::new(FileDatabase::open(&context.path).unwrap());
        let cache = Cache::with_options(db, options).unwrap();
        for i in 0..10 {
            assert!(cache.add(item(&format!("id{i}"), "cached")));
        }
        assert_eq!(cache.pending_writes(), 10, "Nothing should be flushed before dispose");
        cache.dispose().await.unwrap();
        assert!(matches!(cache.get_item("id0").await, Err(Error::Disposed(_))));
    }

    let cache = Cache::new(Arc::new(FileDatabase::open(&context.path).unwrap())).unwrap();
    assert_eq!(
        cache.get_item("id7").await.unwrap(),
        Some(item("id7", "cached")),
        "Flushed item should be readable after reopen"
    );
}
