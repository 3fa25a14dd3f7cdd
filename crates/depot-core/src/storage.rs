//! Storage trait abstraction for the device's resident files.
//!
//! Storage is flat: one directory of plainly named files, no subdirectories.
//!
//! Implementations:
//! - `InMemoryStorage` - For testing, with a fixed byte capacity
//! - `NativeStorage` (in depot-agent) - Uses tokio::fs and real disk free space

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Streaming read handle.
pub type ReadHandle = Box<dyn AsyncRead + Send + Unpin>;

/// Streaming write handle. Bytes are durable once `shutdown` completes.
pub type WriteHandle = Box<dyn AsyncWrite + Send + Unpin>;

/// A resident file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time in milliseconds since epoch (0 if unknown)
    pub mtime_millis: u64,
}

/// Check that a name is a plain file name we are willing to store.
///
/// Rejects empty names, path separators, `.`/`..` and hidden files.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
}

/// Flat file storage for transferred files.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a file for streaming reads
    async fn open_read(&self, name: &str) -> Result<ReadHandle>;

    /// Create (or truncate) a file for streaming writes
    async fn create(&self, name: &str) -> Result<WriteHandle>;

    /// List resident files
    async fn list(&self) -> Result<Vec<FileEntry>>;

    /// Get metadata for one file
    async fn stat(&self, name: &str) -> Result<FileEntry>;

    /// Delete a file
    async fn delete(&self, name: &str) -> Result<()>;

    /// Bytes that can still be written
    async fn available(&self) -> Result<u64>;

    /// Check if a file exists
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.stat(name).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// Allows sharing one storage between the engine and the processing loop
#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    async fn open_read(&self, name: &str) -> Result<ReadHandle> {
        (**self).open_read(name).await
    }

    async fn create(&self, name: &str) -> Result<WriteHandle> {
        (**self).create(name).await
    }

    async fn list(&self) -> Result<Vec<FileEntry>> {
        (**self).list().await
    }

    async fn stat(&self, name: &str) -> Result<FileEntry> {
        (**self).stat(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name).await
    }

    async fn available(&self) -> Result<u64> {
        (**self).available().await
    }
}

#[derive(Debug, Clone, Default)]
struct MemFile {
    data: Vec<u8>,
    mtime_millis: u64,
}

#[derive(Debug, Default)]
struct MemInner {
    files: HashMap<String, MemFile>,
    capacity: u64,
    /// Monotonic clock so "oldest" is deterministic in tests
    clock: u64,
}

impl MemInner {
    fn used(&self) -> u64 {
        self.files.values().map(|f| f.data.len() as u64).sum()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// In-memory storage for testing.
///
/// Has a fixed byte capacity; writes past it fail like a full disk.
#[derive(Clone)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<MemInner>>,
}

impl InMemoryStorage {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemInner {
                capacity,
                ..Default::default()
            })),
        }
    }

    /// Put a file directly, bypassing capacity checks.
    pub fn insert(&self, name: &str, data: &[u8]) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mtime_millis = inner.tick();
        inner.files.insert(
            name.to_string(),
            MemFile {
                data: data.to_vec(),
                mtime_millis,
            },
        );
    }

    /// Set a specific mtime for testing oldest-first ordering
    pub fn set_mtime(&self, name: &str, mtime_millis: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = inner.files.get_mut(name) {
            file.mtime_millis = mtime_millis;
        }
    }

    /// Full contents of a file, if present.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.files.get(name).map(|f| f.data.clone())
    }

    pub fn used(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).used()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn open_read(&self, name: &str) -> Result<ReadHandle> {
        let data = self
            .contents(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn create(&self, name: &str) -> Result<WriteHandle> {
        if !is_valid_name(name) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mtime_millis = inner.tick();
        inner.files.insert(
            name.to_string(),
            MemFile {
                data: Vec::new(),
                mtime_millis,
            },
        );
        Ok(Box::new(MemWriter {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        }))
    }

    async fn list(&self) -> Result<Vec<FileEntry>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<FileEntry> = inner
            .files
            .iter()
            .map(|(name, file)| FileEntry {
                name: name.clone(),
                size: file.data.len() as u64,
                mtime_millis: file.mtime_millis,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, name: &str) -> Result<FileEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .files
            .get(name)
            .map(|file| FileEntry {
                name: name.to_string(),
                size: file.data.len() as u64,
                mtime_millis: file.mtime_millis,
            })
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn available(&self) -> Result<u64> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.capacity.saturating_sub(inner.used()))
    }
}

/// Appends straight into the shared map.
struct MemWriter {
    inner: Arc<RwLock<MemInner>>,
    name: String,
}

impl AsyncWrite for MemWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.used() + buf.len() as u64 > inner.capacity {
            return Poll::Ready(Err(io::Error::other("storage full")));
        }
        let mtime_millis = inner.tick();
        match inner.files.get_mut(&self.name) {
            Some(file) => {
                file.data.extend_from_slice(buf);
                file.mtime_millis = mtime_millis;
                Poll::Ready(Ok(buf.len()))
            }
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} was deleted while open", self.name),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
