//! Append-only file database
//!
//! Layout of the store file:
//!
//! ```text
//! +-----------------------------+
//! | magic "OBJC" | version u32  |   16 byte file header
//! | reserved (8 bytes)          |
//! +-----------------------------+
//! | len u32 | crc32 u32 | json  |   one record per stored item
//! | len u32 | crc32 u32 | json  |
//! | ...                         |
//! +-----------------------------+
//! ```
//!
//! Records are never rewritten; storing an id again appends a new record and
//! the newest one wins. On open the file is memory-mapped and scanned to
//! rebuild the id index. A torn or corrupt tail, as left by a crash mid
//! write, is truncated away.

use crate::cache::Database;
use crate::error::{Error, Result};
use crate::item::Item;
use async_trait::async_trait;
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// File header size in bytes
pub const FILE_HEADER_SIZE: usize = 16;

/// Record header size in bytes (length + checksum)
pub const RECORD_HEADER_SIZE: usize = 8;

/// Magic bytes at the start of every store file
pub const MAGIC: [u8; 4] = *b"OBJC";

/// Current file format version
pub const VERSION: u32 = 1;

/// Location of a record's JSON payload in the file
#[derive(Debug, Clone, Copy)]
struct Span {
    offset: usize,
    len: usize,
}

/// Only the id is needed to rebuild the index
#[derive(Deserialize)]
struct RecordKey {
    #[serde(rename = "baseId")]
    base_id: String,
}

struct Store {
    file: File,
    /// Read view of the file, remapped after every append
    map: Option<Mmap>,
    index: HashMap<String, Span>,
    end: u64,
    disposed: bool,
}

impl Store {
    fn ensure_open(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed("file database"));
        }
        Ok(())
    }

    fn remap(&mut self) -> Result<()> {
        // SAFETY: the file is only modified through this store, under its lock
        self.map = Some(unsafe { MmapOptions::new().map(&self.file)? });
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Item>> {
        let (Some(span), Some(map)) = (self.index.get(key), self.map.as_ref()) else {
            return Ok(None);
        };

        let header = &map[span.offset - RECORD_HEADER_SIZE..span.offset];
        let payload = &map[span.offset..span.offset + span.len];
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if crc32fast::hash(payload) != crc {
            return Err(Error::Storage(format!("checksum mismatch for record {key}")));
        }
        Ok(Some(serde_json::from_slice(payload)?))
    }

    fn append(&mut self, items: &[Item]) -> Result<()> {
        let mut buf = Vec::new();
        let mut spans = Vec::with_capacity(items.len());

        for item in items {
            let json = serde_json::to_vec(item)?;
            let len = u32::try_from(json.len())
                .map_err(|_| Error::Storage(format!("record {} too large", item.base_id)))?;

            let offset = self.end as usize + buf.len() + RECORD_HEADER_SIZE;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&crc32fast::hash(&json).to_le_bytes());
            buf.extend_from_slice(&json);
            spans.push((item.base_id.clone(), Span { offset, len: json.len() }));
        }

        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.end += buf.len() as u64;

        self.index.extend(spans);
        self.remap()
    }
}

/// Durable [`Database`] storing items in a single append-only file
pub struct FileDatabase {
    path: PathBuf,
    store: Arc<Mutex<Store>>,
}

impl std::fmt::Debug for FileDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDatabase").field("path", &self.path).finish()
    }
}

impl FileDatabase {
    /// Open the store at `path`, creating it if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE];
            header[..4].copy_from_slice(&MAGIC);
            header[4..8].copy_from_slice(&VERSION.to_le_bytes());
            file.write_all(&header)?;
            file.sync_data()?;
        }

        // SAFETY: nothing else writes the file while it is being scanned
        let map = unsafe { MmapOptions::new().map(&file)? };
        if map.len() < FILE_HEADER_SIZE || map[..4] != MAGIC {
            return Err(Error::Storage(format!("{} is not an object store", path.display())));
        }
        let version = u32::from_le_bytes([map[4], map[5], map[6], map[7]]);
        if version != VERSION {
            return Err(Error::Storage(format!("unsupported store version {version}")));
        }

        let (index, valid_end) = scan(&map);
        let map_len = map.len();
        drop(map);

        if valid_end < map_len {
            warn!(
                path = %path.display(),
                dropped = map_len - valid_end,
                "truncating torn tail of object store"
            );
            file.set_len(valid_end as u64)?;
            file.sync_data()?;
        }
        debug!(path = %path.display(), records = index.len(), "opened object store");

        let mut store = Store {
            file,
            map: None,
            index,
            end: valid_end as u64,
            disposed: false,
        };
        store.remap()?;

        Ok(Self {
            path,
            store: Arc::new(Mutex::new(store)),
        })
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct ids stored
    pub fn len(&self) -> usize {
        self.store.lock().index.len()
    }

    /// Whether the store holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn blocking<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&mut Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut store = store.lock();
            store.ensure_open()?;
            op(&mut store)
        })
        .await?
    }
}

/// Walk the records after the file header
///
/// Returns the id index and the offset just past the last intact record.
fn scan(map: &[u8]) -> (HashMap<String, Span>, usize) {
    let mut index = HashMap::new();
    let mut pos = FILE_HEADER_SIZE;

    while pos + RECORD_HEADER_SIZE <= map.len() {
        let len = u32::from_le_bytes([map[pos], map[pos + 1], map[pos + 2], map[pos + 3]]) as usize;
        let crc = u32::from_le_bytes([map[pos + 4], map[pos + 5], map[pos + 6], map[pos + 7]]);
        let offset = pos + RECORD_HEADER_SIZE;

        if offset + len > map.len() {
            break;
        }
        let payload = &map[offset..offset + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        let Ok(key) = serde_json::from_slice::<RecordKey>(payload) else {
            break;
        };

        index.insert(key.base_id, Span { offset, len });
        pos = offset + len;
    }

    (index, pos)
}

#[async_trait]
impl Database for FileDatabase {
    async fn get_all(&self, keys: &[String]) -> Result<Vec<Option<Item>>> {
        let keys = keys.to_vec();
        self.blocking(move |store| keys.iter().map(|key| store.read(key)).collect())
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Item>> {
        let key = key.to_string();
        self.blocking(move |store| store.read(&key)).await
    }

    async fn put_all(&self, items: Vec<Item>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.blocking(move |store| store.append(&items)).await
    }

    async fn dispose(&self) -> Result<()> {
        let mut store = self.store.lock();
        if !store.disposed {
            store.disposed = true;
            store.map = None;
            store.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item(id: &str, value: u64) -> Item {
        let base = serde_json::from_value(serde_json::json!({ "id": id, "value": value })).unwrap();
        Item::new(base)
    }

    #[test]
    fn test_create_writes_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("objects.db");

        let db = FileDatabase::open(&path).unwrap();
        assert!(db.is_empty());

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), FILE_HEADER_SIZE);
        assert_eq!(&bytes[..4], b"OBJC");
    }

    #[tokio::test]
    async fn test_latest_record_wins() {
        let dir = tempdir().unwrap();
        let db = FileDatabase::open(dir.path().join("objects.db")).unwrap();

        db.put_all(vec![item("a", 1), item("b", 1)]).await.unwrap();
        db.put_all(vec![item("a", 2)]).await.unwrap();

        assert_eq!(db.len(), 2);
        assert_eq!(db.get("a").await.unwrap(), Some(item("a", 2)));
        assert_eq!(db.get("missing").await.unwrap(), None);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign.db");
        std::fs::write(&path, b"definitely not an object store").unwrap();

        assert!(matches!(FileDatabase::open(&path), Err(Error::Storage(_))));
    }

    #[test]
    fn test_scan_stops_at_bad_checksum() {
        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        bytes[..4].copy_from_slice(&MAGIC);

        let json = br#"{"baseId":"a"}"#;
        bytes.extend_from_slice(&(json.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(json).to_le_bytes());
        bytes.extend_from_slice(json);
        let intact = bytes.len();

        bytes.extend_from_slice(&(json.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(json);

        let (index, end) = scan(&bytes);
        assert_eq!(index.len(), 1);
        assert_eq!(end, intact);
    }

    #[tokio::test]
    async fn test_disposed_rejects_access() {
        let dir = tempdir().unwrap();
        let db = FileDatabase::open(dir.path().join("objects.db")).unwrap();
        db.dispose().await.unwrap();

        assert!(matches!(db.get("a").await, Err(Error::Disposed(_))));
    }
}
