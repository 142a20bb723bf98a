//! Resolve ids through the worker thread against a file-backed cache
//!
//! Run with `cargo run --example worker_roundtrip`. Set `RUST_LOG=debug` to
//! see queue and batch activity.

use object_loader::{Base, Cache, Database, FileDatabase, Item, LoaderConfig, WorkerManager};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
[worker]
queue_capacity_bytes = 8192
poll_batch_size = 16

[cache]
write_batch_max_size = 50
write_batch_max_wait_ms = 100
"#;

#[tokio::main]
async fn main() -> object_loader::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = LoaderConfig::from_toml_str(CONFIG)?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("objects.db");

    // Seed the store the way a downloader would: through the cache
    {
        let database: Arc<dyn Database> = Arc::new(FileDatabase::open(&path)?);
        let cache = Cache::with_options(database, config.cache.batching_options())?;
        for i in 0..100 {
            let base: Base = serde_json::from_value(serde_json::json!({
                "id": format!("object-{i}"),
                "speckle_type": "Base",
                "index": i,
            }))?;
            cache.add(Item::new(base));
        }
        cache.dispose().await?;
    }

    let database: Arc<dyn Database> = Arc::new(FileDatabase::open(&path)?);
    let mut manager = WorkerManager::start(database, &config.cache, config.worker.clone())?;
    manager.wait_ready().await?;

    let ids: Vec<String> = (95..105).map(|i| format!("object-{i}")).collect();
    manager.send(&ids)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = Vec::new();
    while received.len() < ids.len() && Instant::now() < deadline {
        received.extend(manager.poll_results()?);
    }

    for item in &received {
        let status = if item.is_placeholder() { "missing" } else { "cached" };
        println!("{:<12} {}", item.base_id, status);
    }

    manager.dispose();
    Ok(())
}
