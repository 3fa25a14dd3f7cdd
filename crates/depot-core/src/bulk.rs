//! Bulk data channel used for file bytes.
//!
//! Control messages go over the WebSocket; file contents move over a
//! separate request/response channel addressed by the URL the server hands
//! out. This module defines the seam; depot-agent provides the HTTP one.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BulkError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Send failed: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, BulkError>;

/// One piece of an upload body. An `Err` aborts the request.
pub type UploadChunk = std::io::Result<Vec<u8>>;

/// A response body being streamed in.
#[async_trait]
pub trait DownloadBody: Send {
    /// Length announced by the server, if any.
    fn content_length(&self) -> Option<u64>;

    /// Fill `buf` with the next bytes. Ok(0) means the body is finished.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

#[async_trait]
pub trait BulkTransport: Send + Sync {
    /// Start a GET for `url`.
    async fn fetch(&self, url: &str) -> Result<Box<dyn DownloadBody>>;

    /// POST the chunks received on `body` to `url`. Returns once the server
    /// has accepted the whole body.
    async fn push(&self, url: &str, filename: &str, body: mpsc::Receiver<UploadChunk>) -> Result<()>;
}

#[async_trait]
impl<T: BulkTransport + ?Sized> BulkTransport for Arc<T> {
    async fn fetch(&self, url: &str) -> Result<Box<dyn DownloadBody>> {
        (**self).fetch(url).await
    }

    async fn push(&self, url: &str, filename: &str, body: mpsc::Receiver<UploadChunk>) -> Result<()> {
        (**self).push(url, filename, body).await
    }
}

#[derive(Debug, Default)]
struct MemState {
    files: HashMap<String, Vec<u8>>,
    /// url -> (filename, body)
    pushed: HashMap<String, (String, Vec<u8>)>,
    /// url -> byte offset after which reads fail
    fail_after: HashMap<String, usize>,
    /// Lie about the length on the next fetch
    claimed_length: HashMap<String, u64>,
    /// Urls whose server never answers
    stalled: HashSet<String>,
}

/// In-memory bulk transport for tests.
///
/// Pushed bodies become fetchable at the same URL.
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<Mutex<MemState>>,
    chunk: usize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            chunk: 1024,
        }
    }

    /// Deliver bodies in pieces of at most `chunk` bytes.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub fn serve(&self, url: &str, data: &[u8]) {
        self.lock().files.insert(url.to_string(), data.to_vec());
    }

    /// Fail reads for `url` once `offset` bytes have been delivered.
    pub fn fail_after(&self, url: &str, offset: usize) {
        self.lock().fail_after.insert(url.to_string(), offset);
    }

    /// Announce `len` as the content length for `url`.
    pub fn claim_length(&self, url: &str, len: u64) {
        self.lock().claimed_length.insert(url.to_string(), len);
    }

    /// Never answer requests for `url`. A push still reads the whole body.
    pub fn stall(&self, url: &str) {
        self.lock().stalled.insert(url.to_string());
    }

    /// What was pushed to `url`, as `(filename, body)`.
    pub fn pushed(&self, url: &str) -> Option<(String, Vec<u8>)> {
        self.lock().pushed.get(url).cloned()
    }

    fn is_stalled(&self, url: &str) -> bool {
        self.lock().stalled.contains(url)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BulkTransport for InMemoryTransport {
    async fn fetch(&self, url: &str) -> Result<Box<dyn DownloadBody>> {
        if self.is_stalled(url) {
            std::future::pending::<()>().await;
        }
        let state = self.lock();
        let data = state.files.get(url).cloned().ok_or(BulkError::Status(404))?;
        let length = state
            .claimed_length
            .get(url)
            .copied()
            .unwrap_or(data.len() as u64);
        Ok(Box::new(MemBody {
            data,
            pos: 0,
            chunk: self.chunk,
            fail_after: state.fail_after.get(url).copied(),
            length,
        }))
    }

    async fn push(&self, url: &str, filename: &str, mut body: mpsc::Receiver<UploadChunk>) -> Result<()> {
        let mut received = Vec::new();
        while let Some(chunk) = body.recv().await {
            let chunk = chunk.map_err(|e| BulkError::Send(e.to_string()))?;
            received.extend_from_slice(&chunk);
        }
        if self.is_stalled(url) {
            std::future::pending::<()>().await;
        }
        let mut state = self.lock();
        state.files.insert(url.to_string(), received.clone());
        state
            .pushed
            .insert(url.to_string(), (filename.to_string(), received));
        Ok(())
    }
}

struct MemBody {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    fail_after: Option<usize>,
    length: u64,
}

#[async_trait]
impl DownloadBody for MemBody {
    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.fail_after.is_some_and(|limit| self.pos >= limit) {
            return Err(BulkError::Read("connection reset".to_string()));
        }
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len()).min(self.chunk);
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
