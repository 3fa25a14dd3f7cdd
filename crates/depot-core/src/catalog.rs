//! The local catalog: what the device currently holds, as reported to the server.
//!
//! Records are replaced wholesale, never edited in place. Insertion order
//! is kept so that ties on `timestamp` still break oldest-first.

use crate::protocol::Outbound;
use crate::storage::{Storage, StorageError};
use crate::transfer::checksum::md5_reader;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of records the catalog holds.
pub const DEFAULT_CATALOG_CAP: usize = 5;

/// One resident file, as announced in `file_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    /// Lowercase hex MD5 of the stored bytes
    pub md5: String,
    /// Seconds since epoch when the file landed
    pub timestamp: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Catalog is full ({cap} records)")]
    Full { cap: usize },
}

#[derive(Debug, Clone)]
pub struct Catalog {
    records: Vec<FileRecord>,
    cap: usize,
    revision: u64,
}

impl Catalog {
    pub fn new(cap: usize) -> Self {
        Self {
            records: Vec::new(),
            cap: cap.max(1),
            revision: 0,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.cap
    }

    /// Bumped on every change. Lets callers tell whether a re-announce is due.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn get(&self, filename: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.filename == filename)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.get(filename).is_some()
    }

    /// Whether admitting `filename` needs an existing record evicted first.
    pub fn needs_eviction(&self, filename: &str) -> bool {
        !self.contains(filename) && self.is_full()
    }

    /// Add a record, replacing any record with the same name.
    ///
    /// Returns the replaced record. A new name on a full catalog is refused.
    pub fn insert(&mut self, record: FileRecord) -> Result<Option<FileRecord>, CatalogError> {
        let previous = match self.records.iter().position(|r| r.filename == record.filename) {
            Some(idx) => Some(self.records.remove(idx)),
            None if self.is_full() => return Err(CatalogError::Full { cap: self.cap }),
            None => None,
        };
        self.records.push(record);
        self.revision += 1;
        Ok(previous)
    }

    pub fn remove(&mut self, filename: &str) -> Option<FileRecord> {
        let idx = self.records.iter().position(|r| r.filename == filename)?;
        self.revision += 1;
        Some(self.records.remove(idx))
    }

    /// The record with the smallest timestamp, earliest inserted on ties.
    pub fn oldest(&self) -> Option<&FileRecord> {
        self.records
            .iter()
            .enumerate()
            .min_by_key(|(idx, r)| (r.timestamp, *idx))
            .map(|(_, r)| r)
    }

    pub fn snapshot(&self) -> Vec<FileRecord> {
        self.records.clone()
    }

    /// The `file_list` message describing the current contents.
    pub fn announcement(&self) -> Outbound {
        Outbound::file_list(self.snapshot())
    }

    /// Rebuild from what is already on disk.
    ///
    /// Keeps the newest `cap` files by modification time and hashes each one.
    /// Files that can't be read are skipped.
    pub async fn rebuild<S: Storage + ?Sized>(
        storage: &S,
        cap: usize,
        chunk_size: usize,
    ) -> Result<Self, StorageError> {
        let mut entries = storage.list().await?;
        entries.sort_by(|a, b| b.mtime_millis.cmp(&a.mtime_millis));
        entries.truncate(cap.max(1));

        let mut catalog = Catalog::new(cap);
        // Oldest first so insertion order matches age
        for entry in entries.into_iter().rev() {
            let reader = match storage.open_read(&entry.name).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping {} during scan: {}", entry.name, e);
                    continue;
                }
            };
            let (md5, size) = match md5_reader(reader, chunk_size).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Skipping {} during scan: {}", entry.name, e);
                    continue;
                }
            };
            debug!("Scanned {} ({} bytes, md5 {})", entry.name, size, md5);
            let timestamp = if entry.mtime_millis > 0 {
                entry.mtime_millis / 1000
            } else {
                unix_now()
            };
            // Can't overflow: entries were truncated to cap
            let _ = catalog.insert(FileRecord {
                filename: entry.name,
                size,
                md5,
                timestamp,
            });
        }
        Ok(catalog)
    }
}

/// Seconds since the Unix epoch, 0 if the clock is before it.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn record(name: &str, timestamp: u64) -> FileRecord {
        FileRecord {
            filename: name.to_string(),
            size: 10,
            md5: "0".repeat(32),
            timestamp,
        }
    }

    #[test]
    fn test_insert_replaces_same_name() {
        let mut catalog = Catalog::new(2);
        assert_eq!(catalog.insert(record("a", 1)), Ok(None));
        let replaced = catalog.insert(record("a", 5)).unwrap();
        assert_eq!(replaced.map(|r| r.timestamp), Some(1));
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("a").unwrap().timestamp, 5);
    }

    #[test]
    fn test_full_catalog_refuses_new_names() {
        let mut catalog = Catalog::new(2);
        catalog.insert(record("a", 1)).unwrap();
        catalog.insert(record("b", 2)).unwrap();
        assert!(catalog.is_full());
        assert!(catalog.needs_eviction("c"));
        assert!(!catalog.needs_eviction("a"));
        assert_eq!(catalog.insert(record("c", 3)), Err(CatalogError::Full { cap: 2 }));
        // Replacement still works when full
        assert!(catalog.insert(record("b", 4)).is_ok());
    }

    #[test]
    fn test_oldest_breaks_ties_by_insertion() {
        let mut catalog = Catalog::new(5);
        catalog.insert(record("b", 7)).unwrap();
        catalog.insert(record("a", 7)).unwrap();
        catalog.insert(record("c", 9)).unwrap();
        assert_eq!(catalog.oldest().unwrap().filename, "b");

        catalog.remove("b");
        assert_eq!(catalog.oldest().unwrap().filename, "a");
    }

    #[test]
    fn test_revision_tracks_changes() {
        let mut catalog = Catalog::new(5);
        let r0 = catalog.revision();
        catalog.insert(record("a", 1)).unwrap();
        assert_ne!(catalog.revision(), r0);

        let r1 = catalog.revision();
        assert!(catalog.remove("missing").is_none());
        assert_eq!(catalog.revision(), r1);
    }

    #[test]
    fn test_announcement_lists_records() {
        let mut catalog = Catalog::new(5);
        catalog.insert(record("a", 1)).unwrap();
        let Outbound::FileList { data } = catalog.announcement() else {
            panic!("expected file_list");
        };
        assert_eq!(data.files, vec![record("a", 1)]);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_newest_files() {
        let storage = InMemoryStorage::new(1024);
        storage.insert("old.bin", b"a");
        storage.insert("mid.bin", b"bb");
        storage.insert("new.bin", b"ccc");
        storage.set_mtime("old.bin", 1_000);
        storage.set_mtime("mid.bin", 2_000);
        storage.set_mtime("new.bin", 3_000);

        let catalog = Catalog::rebuild(&storage, 2, 4096).await.unwrap();
        let names: Vec<_> = catalog.records().iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["mid.bin", "new.bin"]);

        let new = catalog.get("new.bin").unwrap();
        assert_eq!(new.size, 3);
        assert_eq!(new.md5, format!("{:x}", md5::compute(b"ccc")));
        assert_eq!(new.timestamp, 3);
    }
}
