//! The processing loop.
//!
//! Consumes frames from the relay queue one at a time, in arrival order.
//! Owns the catalog and runs every transfer. The read loop only sees the
//! catalog through the snapshot published on the watch channel.

use crate::relay::Frame;
use depot_core::catalog::FileRecord;
use depot_core::protocol::{DownloadNotifyData, ErrorCode, UploadRequestData};
use depot_core::storage::StorageError;
use depot_core::{BulkTransport, Catalog, Direction, Inbound, Outbound, Outbox, Storage, TransferEngine};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct Dispatcher<S, T> {
    engine: TransferEngine<S, T>,
    catalog: Catalog,
    outbox: Outbox,
    catalog_tx: watch::Sender<Vec<FileRecord>>,
}

impl<S: Storage, T: BulkTransport> Dispatcher<S, T> {
    /// Returns the dispatcher and a receiver for catalog snapshots.
    pub fn new(
        engine: TransferEngine<S, T>,
        catalog: Catalog,
        outbox: Outbox,
    ) -> (Self, watch::Receiver<Vec<FileRecord>>) {
        let (catalog_tx, catalog_rx) = watch::channel(catalog.snapshot());
        (
            Self {
                engine,
                catalog,
                outbox,
                catalog_tx,
            },
            catalog_rx,
        )
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn run(mut self, mut frames: mpsc::Receiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            self.handle(frame).await;
        }
        debug!("Processing loop stopped");
    }

    pub async fn handle(&mut self, frame: Frame) {
        let msg = match Inbound::parse(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping {:?} frame: {}", frame.kind, e);
                return;
            }
        };

        match msg {
            Inbound::DownloadNotify { data } => self.on_download_notify(data).await,
            Inbound::UploadRequest { data } => self.on_upload_request(data).await,
            Inbound::DownloadCompleteAck { message } | Inbound::UploadCompleteAck { message } => {
                debug!("Completion acknowledged: {}", message.unwrap_or_default());
            }
            Inbound::Error { code, message } => {
                let known = code.and_then(ErrorCode::from_code);
                warn!(
                    "Server reported error {:?} ({:?}): {}",
                    code,
                    known,
                    message.unwrap_or_default()
                );
            }
            other => debug!("Ignoring {:?} on the processing queue", other.kind()),
        }
    }

    async fn on_download_notify(&mut self, data: DownloadNotifyData) {
        let spec = match data.validate() {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Ignoring download_notify: {}", e);
                return;
            }
        };

        self.outbox.send(Outbound::ack(Direction::Download, &spec.filename)).await;

        let revision = self.catalog.revision();
        match self.engine.download(&spec, &mut self.catalog, &self.outbox).await {
            Ok(outcome) => {
                self.announce().await;
                self.outbox
                    .send(Outbound::complete(
                        Direction::Download,
                        &outcome.record.filename,
                        &outcome.record.md5,
                    ))
                    .await;
            }
            Err(e) => {
                error!("Download of {} failed: {}", spec.filename, e);
                if self.catalog.revision() != revision {
                    self.announce().await;
                }
                self.outbox.send(Outbound::error(e.error_code(), e.to_string())).await;
            }
        }
    }

    async fn on_upload_request(&mut self, data: UploadRequestData) {
        let spec = match data.validate() {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Ignoring upload_request: {}", e);
                return;
            }
        };

        match self.engine.storage().exists(&spec.filename).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Upload requested for missing file {}", spec.filename);
                let e = StorageError::NotFound(spec.filename.clone());
                self.outbox.send(Outbound::error(ErrorCode::NotFound, e.to_string())).await;
                return;
            }
            Err(e) => {
                error!("Could not check {}: {}", spec.filename, e);
                self.outbox.send(Outbound::error(ErrorCode::Generic, e.to_string())).await;
                return;
            }
        }

        self.outbox.send(Outbound::ack(Direction::Upload, &spec.filename)).await;

        match self.engine.upload(&spec, &self.outbox).await {
            Ok(outcome) => {
                self.outbox
                    .send(Outbound::complete(Direction::Upload, &outcome.filename, &outcome.md5))
                    .await;
            }
            Err(e) => {
                error!("Upload of {} failed: {}", spec.filename, e);
                self.outbox.send(Outbound::error(e.error_code(), e.to_string())).await;
            }
        }
    }

    /// Publish the catalog to the read loop and announce it to the server.
    async fn announce(&mut self) {
        self.catalog_tx.send_replace(self.catalog.snapshot());
        info!("Catalog now holds {} file(s)", self.catalog.len());
        self.outbox.send(self.catalog.announcement()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::outbox;
    use depot_core::protocol::MessageKind;
    use depot_core::{InMemoryStorage, InMemoryTransport, OutboxReceiver, TransferConfig};

    const URL: &str = "http://server/files/a.bin";

    struct Harness {
        dispatcher: Dispatcher<InMemoryStorage, InMemoryTransport>,
        snapshots: watch::Receiver<Vec<FileRecord>>,
        storage: InMemoryStorage,
        transport: InMemoryTransport,
        rx: OutboxReceiver,
    }

    fn harness(capacity: u64) -> Harness {
        let storage = InMemoryStorage::new(capacity);
        let transport = InMemoryTransport::new().with_chunk(50);
        let engine = TransferEngine::new(storage.clone(), transport.clone(), TransferConfig::default());
        let (outbox, rx) = outbox::channel(64);
        let (dispatcher, snapshots) = Dispatcher::new(engine, Catalog::new(5), outbox);
        Harness {
            dispatcher,
            snapshots,
            storage,
            transport,
            rx,
        }
    }

    fn frame(kind: MessageKind, json: String) -> Frame {
        Frame {
            kind,
            payload: json.into_bytes(),
        }
    }

    fn notify(name: &str, data: &[u8]) -> Frame {
        notify_at(name, data, URL)
    }

    fn notify_at(name: &str, data: &[u8], url: &str) -> Frame {
        frame(
            MessageKind::DownloadNotify,
            format!(
                r#"{{"type":"download_notify","data":{{"filename":"{}","size":{},"md5":"{:x}","url":"{}"}}}}"#,
                name,
                data.len(),
                md5::compute(data),
                url
            ),
        )
    }

    fn upload_request(name: &str) -> Frame {
        frame(
            MessageKind::UploadRequest,
            format!(
                r#"{{"type":"upload_request","data":{{"filename":"{}","url":"http://server/upload"}}}}"#,
                name
            ),
        )
    }

    /// Drain everything queued, skipping progress reports.
    fn sent(rx: &mut OutboxReceiver) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if !matches!(msg, Outbound::DownloadProgress { .. } | Outbound::UploadProgress { .. }) {
                out.push(msg);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_download_ack_announce_complete() {
        let mut h = harness(10_000);
        let data = vec![7u8; 100];
        h.transport.serve(URL, &data);
        let hash = format!("{:x}", md5::compute(&data));

        h.dispatcher.handle(notify("a.bin", &data)).await;

        let sent = sent(&mut h.rx);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Outbound::ack(Direction::Download, "a.bin"));
        let Outbound::FileList { data: list } = &sent[1] else {
            panic!("expected file_list, got {:?}", sent[1]);
        };
        assert_eq!(list.files.len(), 1);
        assert_eq!(list.files[0].md5, hash);
        assert_eq!(sent[2], Outbound::complete(Direction::Download, "a.bin", &hash));

        assert_eq!(h.storage.contents("a.bin"), Some(data));
        assert_eq!(h.snapshots.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_notify_is_dropped_silently() {
        let mut h = harness(10_000);
        let bad = frame(
            MessageKind::DownloadNotify,
            r#"{"type":"download_notify","data":{"filename":"a.bin","size":0,"md5":"x","url":"http://x"}}"#
                .to_string(),
        );
        h.dispatcher.handle(bad).await;
        h.dispatcher
            .handle(frame(MessageKind::DownloadNotify, "{not json".to_string()))
            .await;

        assert!(sent(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_download_failure_reports_code() {
        let mut h = harness(50);
        let data = vec![1u8; 100];
        h.transport.serve(URL, &data);

        h.dispatcher.handle(notify("a.bin", &data)).await;

        let sent = sent(&mut h.rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Outbound::ack(Direction::Download, "a.bin"));
        let Outbound::Error { code, .. } = &sent[1] else {
            panic!("expected error, got {:?}", sent[1]);
        };
        assert_eq!(*code, ErrorCode::InsufficientStorage.code());
        assert!(h.dispatcher.catalog().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_on_failure_is_announced() {
        let mut h = harness(150);
        let old = vec![9u8; 100];
        h.transport.serve("http://server/files/old.bin", &old);
        h.dispatcher
            .handle(notify_at("old.bin", &old, "http://server/files/old.bin"))
            .await;
        assert!(h.dispatcher.catalog().contains("old.bin"));
        sent(&mut h.rx);

        // Room is made for a.bin, then its stream dies
        let data = vec![3u8; 100];
        h.transport.serve(URL, &data);
        h.transport.fail_after(URL, 50);
        h.dispatcher.handle(notify("a.bin", &data)).await;

        assert!(h.storage.contents("old.bin").is_none());
        assert!(h.dispatcher.catalog().is_empty());

        let sent = sent(&mut h.rx);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Outbound::ack(Direction::Download, "a.bin"));
        assert_eq!(sent[1], Outbound::file_list(Vec::new()));
        assert!(matches!(sent[2], Outbound::Error { code: 1001, .. }));
        assert!(h.snapshots.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_upload_of_resident_file() {
        let mut h = harness(10_000);
        let data = b"log line\n".repeat(20);
        h.storage.insert("log.txt", &data);
        let hash = format!("{:x}", md5::compute(&data));

        h.dispatcher.handle(upload_request("log.txt")).await;

        let sent = sent(&mut h.rx);
        assert_eq!(
            sent,
            vec![
                Outbound::ack(Direction::Upload, "log.txt"),
                Outbound::complete(Direction::Upload, "log.txt", &hash),
            ]
        );
        assert_eq!(
            h.transport.pushed("http://server/upload"),
            Some(("log.txt".to_string(), data))
        );
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_is_not_acked() {
        let mut h = harness(10_000);

        h.dispatcher.handle(upload_request("nope.txt")).await;

        let sent = sent(&mut h.rx);
        assert_eq!(sent.len(), 1);
        let Outbound::Error { code, .. } = &sent[0] else {
            panic!("expected error, got {:?}", sent[0]);
        };
        assert_eq!(*code, 1003);
    }

    #[tokio::test]
    async fn test_acks_and_server_errors_send_nothing() {
        let mut h = harness(10_000);
        h.dispatcher
            .handle(frame(
                MessageKind::DownloadCompleteAck,
                r#"{"type":"download_complete_ack","message":"ok"}"#.to_string(),
            ))
            .await;
        h.dispatcher
            .handle(frame(
                MessageKind::Error,
                r#"{"type":"error","code":1001,"message":"boom"}"#.to_string(),
            ))
            .await;
        assert!(sent(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_run_processes_in_order() {
        let h = harness(10_000);
        let first = vec![1u8; 60];
        h.transport.serve(URL, &first);
        let (tx, rx) = mpsc::channel(4);
        tx.send(notify("one.bin", &first)).await.unwrap();
        tx.send(upload_request("one.bin")).await.unwrap();
        drop(tx);

        let Harness {
            dispatcher,
            storage,
            rx: mut out,
            ..
        } = h;
        dispatcher.run(rx).await;

        let kinds: Vec<&str> = sent(&mut out).iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec!["download_ack", "file_list", "download_complete", "upload_ack", "upload_complete"]
        );
        assert_eq!(storage.contents("one.bin"), Some(first));
    }
}
