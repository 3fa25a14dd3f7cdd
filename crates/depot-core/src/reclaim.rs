//! Storage reclamation.
//!
//! Before a download starts we make sure it fits: first in the catalog,
//! evicting the oldest record if the catalog is full, then on disk,
//! deleting resident files oldest-first until there is room.

use crate::catalog::Catalog;
use crate::storage::{Storage, StorageError};
use tracing::{info, warn};

/// What a reclamation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub deleted: Vec<String>,
    pub freed: u64,
    pub required: u64,
    pub available: u64,
}

impl ReclaimReport {
    pub fn satisfied(&self) -> bool {
        self.available >= self.required
    }
}

/// Delete resident files, oldest first, until `required` bytes are free.
///
/// `keep` is never deleted (it's the file about to be overwritten).
/// Files that fail to delete are skipped. The report says whether enough
/// space was found; running out of candidates is not an error.
pub async fn ensure_capacity<S: Storage + ?Sized>(
    storage: &S,
    catalog: &mut Catalog,
    required: u64,
    keep: &str,
) -> Result<ReclaimReport, StorageError> {
    let mut report = ReclaimReport {
        required,
        available: storage.available().await?,
        ..Default::default()
    };
    if report.satisfied() {
        return Ok(report);
    }

    let mut candidates = storage.list().await?;
    candidates.retain(|entry| entry.name != keep);
    // Stable, so files with unknown mtime keep listing order
    candidates.sort_by_key(|entry| entry.mtime_millis);

    for entry in candidates {
        if report.satisfied() {
            break;
        }
        if let Err(e) = storage.delete(&entry.name).await {
            warn!("Could not reclaim {}: {}", entry.name, e);
            continue;
        }
        catalog.remove(&entry.name);
        info!("Reclaimed {} ({} bytes)", entry.name, entry.size);
        report.freed += entry.size;
        report.deleted.push(entry.name);
        report.available = storage.available().await?;
    }

    if !report.satisfied() {
        warn!(
            "Still short on space: need {} bytes, {} available",
            report.required, report.available
        );
    }
    Ok(report)
}

/// Evict the oldest catalog record (and its file) if `incoming` wouldn't fit.
///
/// Returns the evicted name.
pub async fn make_catalog_room<S: Storage + ?Sized>(
    storage: &S,
    catalog: &mut Catalog,
    incoming: &str,
) -> Result<Option<String>, StorageError> {
    if !catalog.needs_eviction(incoming) {
        return Ok(None);
    }
    let Some(oldest) = catalog.oldest().map(|r| r.filename.clone()) else {
        return Ok(None);
    };
    match storage.delete(&oldest).await {
        Ok(()) | Err(StorageError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    catalog.remove(&oldest);
    info!("Catalog full, evicted {}", oldest);
    Ok(Some(oldest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FileRecord;
    use crate::storage::InMemoryStorage;

    fn record(name: &str, size: u64, timestamp: u64) -> FileRecord {
        FileRecord {
            filename: name.to_string(),
            size,
            md5: "0".repeat(32),
            timestamp,
        }
    }

    fn seeded(capacity: u64) -> (InMemoryStorage, Catalog) {
        let storage = InMemoryStorage::new(capacity);
        let mut catalog = Catalog::new(5);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            storage.insert(name, &[0u8; 30]);
            storage.set_mtime(name, (i as u64 + 1) * 1000);
            catalog.insert(record(name, 30, i as u64 + 1)).unwrap();
        }
        (storage, catalog)
    }

    #[tokio::test]
    async fn test_nothing_deleted_when_space_suffices() {
        let (storage, mut catalog) = seeded(100);
        let report = ensure_capacity(&storage, &mut catalog, 10, "new").await.unwrap();
        assert!(report.satisfied());
        assert!(report.deleted.is_empty());
        assert_eq!(catalog.len(), 3);
    }

    #[tokio::test]
    async fn test_deletes_oldest_first_until_room() {
        let (storage, mut catalog) = seeded(100);
        // 10 free, need 50: "a" and "b" have to go
        let report = ensure_capacity(&storage, &mut catalog, 50, "new").await.unwrap();
        assert!(report.satisfied());
        assert_eq!(report.deleted, vec!["a", "b"]);
        assert_eq!(report.freed, 60);
        assert!(storage.contents("c").is_some());
        assert!(!catalog.contains("a"));
        assert!(!catalog.contains("b"));
        assert!(catalog.contains("c"));
    }

    #[tokio::test]
    async fn test_target_name_is_spared() {
        let (storage, mut catalog) = seeded(100);
        let report = ensure_capacity(&storage, &mut catalog, 40, "a").await.unwrap();
        assert_eq!(report.deleted, vec!["b"]);
        assert!(storage.contents("a").is_some());
    }

    #[tokio::test]
    async fn test_reports_unsatisfied_when_out_of_candidates() {
        let (storage, mut catalog) = seeded(100);
        let report = ensure_capacity(&storage, &mut catalog, 500, "new").await.unwrap();
        assert!(!report.satisfied());
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.available, 100);
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_room_evicts_oldest() {
        let storage = InMemoryStorage::new(1000);
        let mut catalog = Catalog::new(2);
        storage.insert("a", b"1");
        storage.insert("b", b"2");
        catalog.insert(record("a", 1, 10)).unwrap();
        catalog.insert(record("b", 1, 20)).unwrap();

        // Re-downloading a known name needs no room
        assert_eq!(make_catalog_room(&storage, &mut catalog, "b").await.unwrap(), None);

        let evicted = make_catalog_room(&storage, &mut catalog, "c").await.unwrap();
        assert_eq!(evicted.as_deref(), Some("a"));
        assert!(storage.contents("a").is_none());
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn test_catalog_room_tolerates_missing_file() {
        let storage = InMemoryStorage::new(1000);
        let mut catalog = Catalog::new(1);
        catalog.insert(record("ghost", 1, 1)).unwrap();

        let evicted = make_catalog_room(&storage, &mut catalog, "c").await.unwrap();
        assert_eq!(evicted.as_deref(), Some("ghost"));
        assert!(catalog.is_empty());
    }
}
