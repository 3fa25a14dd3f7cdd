//! File transfers between local storage and the bulk channel.
//!
//! Only one transfer runs at a time. Each job streams through a single
//! pooled buffer, hashing as it goes, and posts throttled progress to the
//! outbox.

pub mod buffer;
pub mod checksum;
pub mod engine;
pub mod progress;

use crate::bulk::BulkError;
use crate::catalog::CatalogError;
use crate::protocol::{ErrorCode, Outbound, ProgressData};
use crate::storage::StorageError;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use buffer::{AllocationError, BufferPool, PooledBuffer};
pub use checksum::Md5Accumulator;
pub use engine::{DownloadOutcome, TransferEngine, UploadOutcome};
pub use progress::ProgressThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per read/write
    pub chunk_size: usize,
    /// Largest file we accept
    pub max_file_size: u64,
    /// Percentage points between progress reports
    pub progress_step: u8,
    /// Longest gap between progress reports
    pub progress_interval: Duration,
    /// Longest wait on the bulk channel without progress, either direction
    pub read_timeout: Duration,
    /// Delete files whose MD5 doesn't match instead of keeping them
    pub strict_checksum: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            max_file_size: 16 * 1024 * 1024,
            progress_step: 10,
            progress_interval: Duration::from_millis(1000),
            read_timeout: Duration::from_secs(30),
            strict_checksum: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Invalid declared size: {0}")]
    InvalidSize(u64),

    #[error("File too large: {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("Insufficient storage: need {required} bytes, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Another transfer is active: {0}")]
    Busy(String),

    #[error("Stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("Stream exceeded declared size of {expected} bytes")]
    Overrun { expected: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("No data for {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Bulk(#[from] BulkError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl TransferError {
    /// Code reported to the server in the `error` envelope.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransferError::InvalidSize(_) => ErrorCode::BadParameters,
            TransferError::Storage(StorageError::InvalidName(_)) => ErrorCode::BadParameters,
            TransferError::Storage(StorageError::NotFound(_)) => ErrorCode::NotFound,
            TransferError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            TransferError::TooLarge { .. } | TransferError::InsufficientStorage { .. } => {
                ErrorCode::InsufficientStorage
            }
            _ => ErrorCode::Generic,
        }
    }
}

/// The transfer currently holding the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTransfer {
    pub direction: Direction,
    pub filename: String,
}

/// At most one transfer at a time.
#[derive(Debug, Clone, Default)]
pub struct ActiveSlot {
    inner: Arc<Mutex<Option<ActiveTransfer>>>,
}

impl ActiveSlot {
    pub fn current(&self) -> Option<ActiveTransfer> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Take the slot. It is released when the guard drops.
    pub fn claim(&self, direction: Direction, filename: &str) -> Result<SlotGuard, TransferError> {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = slot.as_ref() {
            return Err(TransferError::Busy(format!("{} of {}", active.direction, active.filename)));
        }
        *slot = Some(ActiveTransfer {
            direction,
            filename: filename.to_string(),
        });
        Ok(SlotGuard {
            inner: Arc::clone(&self.inner),
        })
    }
}

#[must_use]
pub struct SlotGuard {
    inner: Arc<Mutex<Option<ActiveTransfer>>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Bookkeeping for one transfer in flight.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub direction: Direction,
    pub filename: String,
    pub url: String,
    /// Declared size for downloads, size on disk at start for uploads
    pub total_size: u64,
    pub transferred: u64,
    progress: ProgressThrottle,
}

impl TransferJob {
    pub fn new(direction: Direction, filename: &str, url: &str, total_size: u64, config: &TransferConfig) -> Self {
        Self {
            direction,
            filename: filename.to_string(),
            url: url.to_string(),
            total_size,
            transferred: 0,
            progress: ProgressThrottle::new(config.progress_step, config.progress_interval, Instant::now()),
        }
    }

    /// Count `n` more bytes. Returns a progress report if one is due.
    pub fn advance(&mut self, n: usize, now: Instant) -> Option<Outbound> {
        self.transferred += n as u64;
        let percent = self.progress.observe(self.transferred, self.total_size, now)?;
        Some(Outbound::progress(
            self.direction,
            ProgressData {
                filename: self.filename.clone(),
                percent,
                transferred: self.transferred,
                total_size: self.total_size,
            },
        ))
    }
}
