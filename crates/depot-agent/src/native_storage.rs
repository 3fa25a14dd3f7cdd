//! Storage backed by a directory on disk, using tokio::fs.

use async_trait::async_trait;
use depot_core::storage::{is_valid_name, FileEntry, ReadHandle, Result, Storage, StorageError, WriteHandle};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use sysinfo::Disks;
use tokio::fs;
use tracing::{debug, info};

/// Flat storage directory for transferred files.
pub struct NativeStorage {
    root: PathBuf,
    /// Cap on bytes held in `root`, on top of real free space
    quota: Option<u64>,
}

impl NativeStorage {
    /// Open (creating if needed) the storage directory.
    pub async fn open(root: impl Into<PathBuf>, quota: Option<u64>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        info!("Storage directory: {}", root.display());
        Ok(Self { root, quota })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    async fn used(&self) -> Result<u64> {
        Ok(self.list().await?.iter().map(|e| e.size).sum())
    }
}

fn map_err(name: &str, e: io::Error) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(e.to_string())
    }
}

fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .map(|t| {
            t.duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Free space on the disk holding `path`: the mount point with the longest
/// matching prefix wins. None if no mount matches.
fn disk_free_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[async_trait]
impl Storage for NativeStorage {
    async fn open_read(&self, name: &str) -> Result<ReadHandle> {
        let path = self.full_path(name)?;
        let file = fs::File::open(&path).await.map_err(|e| map_err(name, e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, name: &str) -> Result<WriteHandle> {
        let path = self.full_path(name)?;
        let file = fs::File::create(&path).await.map_err(|e| map_err(name, e))?;
        Ok(Box::new(file))
    }

    async fn list(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_valid_name(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Deleted between read_dir and metadata
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            entries.push(FileEntry {
                name,
                size: metadata.len(),
                mtime_millis: mtime_millis(&metadata),
            });
        }

        Ok(entries)
    }

    async fn stat(&self, name: &str) -> Result<FileEntry> {
        let path = self.full_path(name)?;
        let metadata = fs::metadata(&path).await.map_err(|e| map_err(name, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(FileEntry {
            name: name.to_string(),
            size: metadata.len(),
            mtime_millis: mtime_millis(&metadata),
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.full_path(name)?;
        fs::remove_file(&path).await.map_err(|e| map_err(name, e))?;
        debug!("Deleted {}", name);
        Ok(())
    }

    async fn available(&self) -> Result<u64> {
        let root = self.root.clone();
        let disk = tokio::task::spawn_blocking(move || disk_free_space(&root))
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let quota = match self.quota {
            Some(quota) => Some(quota.saturating_sub(self.used().await?)),
            None => None,
        };

        Ok(match (disk, quota) {
            (Some(disk), Some(quota)) => disk.min(quota),
            (Some(space), None) | (None, Some(space)) => space,
            (None, None) => u64::MAX,
        })
    }
}
