//! In-memory database

use crate::cache::Database;
use crate::error::{Error, Result};
use crate::item::Item;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hash map backed [`Database`], mostly for tests and short-lived sessions
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    items: RwLock<HashMap<String, Item>>,
    disposed: AtomicBool,
}

impl MemoryDatabase {
    /// Empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Database seeded with `items`
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let items = items
            .into_iter()
            .map(|item| (item.base_id.clone(), item))
            .collect();
        Self {
            items: RwLock::new(items),
            disposed: AtomicBool::new(false),
        }
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("memory database"));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_all(&self, keys: &[String]) -> Result<Vec<Option<Item>>> {
        self.ensure_open()?;
        let items = self.items.read();
        Ok(keys.iter().map(|key| items.get(key).cloned()).collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Item>> {
        self.ensure_open()?;
        Ok(self.items.read().get(key).cloned())
    }

    async fn put_all(&self, items: Vec<Item>) -> Result<()> {
        self.ensure_open()?;
        let mut stored = self.items.write();
        for item in items {
            stored.insert(item.base_id.clone(), item);
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let db = MemoryDatabase::new();
        db.put_all(vec![Item::placeholder("a"), Item::placeholder("b")])
            .await
            .unwrap();

        assert_eq!(db.len(), 2);
        assert_eq!(db.get("a").await.unwrap(), Some(Item::placeholder("a")));

        let keys = vec!["b".to_string(), "zzz".to_string()];
        assert_eq!(
            db.get_all(&keys).await.unwrap(),
            vec![Some(Item::placeholder("b")), None]
        );
    }

    #[tokio::test]
    async fn test_disposed_rejects_access() {
        let db = MemoryDatabase::with_items(vec![Item::placeholder("a")]);
        db.dispose().await.unwrap();
        assert!(matches!(db.get("a").await, Err(Error::Disposed(_))));
    }
}
