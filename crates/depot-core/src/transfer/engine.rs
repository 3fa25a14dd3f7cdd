//! Streams files between storage and the bulk channel.

use super::{ActiveSlot, BufferPool, Direction, Md5Accumulator, PooledBuffer, TransferConfig, TransferError, TransferJob};
use crate::bulk::{BulkTransport, DownloadBody, UploadChunk};
use crate::catalog::{unix_now, Catalog, FileRecord};
use crate::outbox::Outbox;
use crate::protocol::{DownloadSpec, UploadSpec};
use crate::reclaim;
use crate::storage::{ReadHandle, Storage, StorageError, WriteHandle};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Chunks buffered between the file reader and the upload request.
const UPLOAD_PIPELINE_DEPTH: usize = 2;

/// Buffers one engine may have on loan at once.
const MAX_BUFFERS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub record: FileRecord,
    /// False if the file was kept despite an MD5 mismatch
    pub checksum_matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub filename: String,
    pub md5: String,
    pub size: u64,
}

pub struct TransferEngine<S, T> {
    storage: S,
    transport: T,
    config: TransferConfig,
    pool: BufferPool,
    slot: ActiveSlot,
}

impl<S: Storage, T: BulkTransport> TransferEngine<S, T> {
    pub fn new(storage: S, transport: T, config: TransferConfig) -> Self {
        let pool = BufferPool::new(config.chunk_size, MAX_BUFFERS);
        Self {
            storage,
            transport,
            config,
            pool,
            slot: ActiveSlot::default(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Shared view of the active-transfer slot.
    pub fn slot(&self) -> ActiveSlot {
        self.slot.clone()
    }

    /// Fetch a file into storage and record it in the catalog.
    ///
    /// Makes room first (catalog eviction, then oldest-first deletion).
    /// On a failed stream the partial file is left where it is and no record
    /// is committed. The catalog may still have changed through
    /// reclamation; check its revision.
    pub async fn download(
        &self,
        spec: &DownloadSpec,
        catalog: &mut Catalog,
        outbox: &Outbox,
    ) -> Result<DownloadOutcome, TransferError> {
        let _guard = self.slot.claim(Direction::Download, &spec.filename)?;

        if spec.size == 0 {
            return Err(TransferError::InvalidSize(spec.size));
        }
        if spec.size > self.config.max_file_size {
            return Err(TransferError::TooLarge {
                size: spec.size,
                max: self.config.max_file_size,
            });
        }

        if let Some(evicted) = reclaim::make_catalog_room(&self.storage, catalog, &spec.filename).await? {
            debug!("Evicted {} to admit {}", evicted, spec.filename);
        }

        let existing = match self.storage.stat(&spec.filename).await {
            Ok(entry) => entry.size,
            Err(StorageError::NotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        let required = spec.size.saturating_sub(existing);
        let report = reclaim::ensure_capacity(&self.storage, catalog, required, &spec.filename).await?;
        if !report.satisfied() {
            return Err(TransferError::InsufficientStorage {
                required,
                available: report.available,
            });
        }

        let mut buf = self.pool.acquire()?;
        let mut body = timed(self.config.read_timeout, self.transport.fetch(&spec.url)).await?;
        if let Some(len) = body.content_length() {
            if len > spec.size {
                return Err(TransferError::Overrun { expected: spec.size });
            }
        }

        let writer = self.storage.create(&spec.filename).await?;
        let mut job = TransferJob::new(Direction::Download, &spec.filename, &spec.url, spec.size, &self.config);
        info!("Downloading {} ({} bytes) from {}", spec.filename, spec.size, spec.url);

        let md5 = match self.stream_download(&mut *body, writer, &mut buf, &mut job, outbox).await {
            Ok(md5) => md5,
            Err(e) => {
                // The partial file stays on disk but any old record for it is stale now
                if catalog.remove(&spec.filename).is_some() {
                    debug!("Dropped stale record for {}", spec.filename);
                }
                warn!(
                    "Download of {} failed after {} of {} bytes",
                    spec.filename, job.transferred, spec.size
                );
                return Err(e);
            }
        };

        let checksum_matched = md5 == spec.md5;
        if !checksum_matched {
            if self.config.strict_checksum {
                self.discard(&spec.filename, catalog).await;
                return Err(TransferError::ChecksumMismatch {
                    expected: spec.md5.clone(),
                    actual: md5,
                });
            }
            warn!(
                "Checksum mismatch for {}: expected {}, got {} (keeping file)",
                spec.filename, spec.md5, md5
            );
        }

        let record = FileRecord {
            filename: spec.filename.clone(),
            size: job.transferred,
            md5,
            timestamp: unix_now(),
        };
        catalog.insert(record.clone())?;
        info!("Downloaded {} ({} bytes)", record.filename, record.size);
        Ok(DownloadOutcome {
            record,
            checksum_matched,
        })
    }

    async fn stream_download(
        &self,
        body: &mut dyn DownloadBody,
        mut writer: WriteHandle,
        buf: &mut PooledBuffer,
        job: &mut TransferJob,
        outbox: &Outbox,
    ) -> Result<String, TransferError> {
        let mut acc = Md5Accumulator::new();
        loop {
            let n = timed(self.config.read_timeout, body.read_chunk(buf)).await?;
            if n == 0 {
                break;
            }
            if job.transferred + n as u64 > job.total_size {
                return Err(TransferError::Overrun {
                    expected: job.total_size,
                });
            }
            writer.write_all(&buf[..n]).await.map_err(StorageError::from)?;
            acc.update(&buf[..n]);
            if let Some(msg) = job.advance(n, Instant::now()) {
                outbox.post(msg);
            }
        }
        writer.shutdown().await.map_err(StorageError::from)?;

        if job.transferred < job.total_size {
            return Err(TransferError::Truncated {
                expected: job.total_size,
                received: job.transferred,
            });
        }
        Ok(acc.finalize())
    }

    /// Remove a file that failed strict verification.
    async fn discard(&self, filename: &str, catalog: &mut Catalog) {
        match self.storage.delete(filename).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => warn!("Could not remove {}: {}", filename, e),
        }
        catalog.remove(filename);
    }

    /// Send a resident file to the server.
    pub async fn upload(&self, spec: &UploadSpec, outbox: &Outbox) -> Result<UploadOutcome, TransferError> {
        let _guard = self.slot.claim(Direction::Upload, &spec.filename)?;

        let entry = self.storage.stat(&spec.filename).await?;
        let reader = self.storage.open_read(&spec.filename).await?;
        let buf = self.pool.acquire()?;
        let job = TransferJob::new(Direction::Upload, &spec.filename, &spec.url, entry.size, &self.config);
        info!("Uploading {} ({} bytes) to {}", spec.filename, entry.size, spec.url);

        let (tx, rx) = mpsc::channel(UPLOAD_PIPELINE_DEPTH);
        let (sent_tx, mut sent) = watch::channel(());
        let limit = self.config.read_timeout;
        let work = async {
            tokio::join!(
                self.produce_upload(reader, buf, tx, sent_tx, job, outbox),
                self.transport.push(&spec.url, &spec.filename, rx),
            )
        };
        tokio::pin!(work);

        // The deadline restarts with every chunk handed to the request
        let (produced, pushed) = loop {
            tokio::select! {
                done = &mut work => break done,
                progress = tokio::time::timeout(limit, sent.changed()) => match progress {
                    Ok(Ok(())) => {}
                    // Whole body handed over, one more deadline for the response
                    Ok(Err(_)) => match tokio::time::timeout(limit, &mut work).await {
                        Ok(done) => break done,
                        Err(_) => return Err(self.stalled_upload(spec, limit)),
                    },
                    Err(_) => return Err(self.stalled_upload(spec, limit)),
                },
            }
        };

        let (md5, size) = match (produced, pushed) {
            (Ok(v), Ok(())) => v,
            // A local read failure explains the aborted request
            (Err(e @ TransferError::Storage(_)), _) => return Err(e),
            (_, Err(e)) => return Err(e.into()),
            (Err(e), Ok(())) => return Err(e),
        };
        info!("Uploaded {} ({} bytes)", spec.filename, size);
        Ok(UploadOutcome {
            filename: spec.filename.clone(),
            md5,
            size,
        })
    }

    fn stalled_upload(&self, spec: &UploadSpec, limit: Duration) -> TransferError {
        warn!("Upload of {} to {} stalled for {:?}", spec.filename, spec.url, limit);
        TransferError::Timeout(limit)
    }

    async fn produce_upload(
        &self,
        mut reader: ReadHandle,
        mut buf: PooledBuffer,
        tx: mpsc::Sender<UploadChunk>,
        sent: watch::Sender<()>,
        mut job: TransferJob,
        outbox: &Outbox,
    ) -> Result<(String, u64), TransferError> {
        let mut acc = Md5Accumulator::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let reason = e.to_string();
                    let _ = tx.send(Err(e)).await;
                    return Err(StorageError::Io(reason).into());
                }
            };
            if n == 0 {
                break;
            }
            acc.update(&buf[..n]);
            if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                return Err(crate::bulk::BulkError::Send("upload request ended early".to_string()).into());
            }
            sent.send_replace(());
            if let Some(msg) = job.advance(n, Instant::now()) {
                outbox.post(msg);
            }
        }
        let size = acc.bytes();
        Ok((acc.finalize(), size))
    }
}

/// Run a bulk-channel step with a deadline.
async fn timed<F, V, E>(limit: Duration, fut: F) -> Result<V, TransferError>
where
    F: Future<Output = Result<V, E>>,
    TransferError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(TransferError::from),
        Err(_) => Err(TransferError::Timeout(limit)),
    }
}
