//! HTTP bulk channel: GET to download, POST to upload.

use async_trait::async_trait;
use depot_core::bulk::{BulkError, BulkTransport, DownloadBody, UploadChunk};
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, BulkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| BulkError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

/// A streaming response body, handed out in caller-sized pieces.
struct HttpBody<St, B> {
    stream: Pin<Box<St>>,
    length: Option<u64>,
    leftover: Option<B>,
    pos: usize,
}

#[async_trait]
impl<St, B> DownloadBody for HttpBody<St, B>
where
    St: Stream<Item = reqwest::Result<B>> + Send,
    B: AsRef<[u8]> + Send,
{
    fn content_length(&self) -> Option<u64> {
        self.length
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, BulkError> {
        loop {
            if let Some(chunk) = &self.leftover {
                let rest = &chunk.as_ref()[self.pos..];
                if !rest.is_empty() {
                    let n = rest.len().min(buf.len());
                    buf[..n].copy_from_slice(&rest[..n]);
                    self.pos += n;
                    return Ok(n);
                }
                self.leftover = None;
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.leftover = Some(chunk);
                    self.pos = 0;
                }
                Some(Err(e)) => return Err(BulkError::Read(e.to_string())),
                None => return Ok(0),
            }
        }
    }
}

#[async_trait]
impl BulkTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Box<dyn DownloadBody>, BulkError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BulkError::Connect(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BulkError::Status(status.as_u16()));
        }
        let length = response.content_length();
        debug!("GET {} -> {} ({:?} bytes)", url, status, length);

        Ok(Box::new(HttpBody {
            stream: Box::pin(response.bytes_stream()),
            length,
            leftover: None,
            pos: 0,
        }))
    }

    async fn push(&self, url: &str, filename: &str, body: mpsc::Receiver<UploadChunk>) -> Result<(), BulkError> {
        let chunks = futures::stream::unfold(body, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });
        let response = self
            .client
            .post(url)
            .header("X-Filename", filename)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(chunks))
            .send()
            .await
            .map_err(|e| BulkError::Send(e.to_string()))?;
        let status = response.status();
        debug!("POST {} -> {}", url, status);
        if !status.is_success() {
            return Err(BulkError::Status(status.as_u16()));
        }
        Ok(())
    }
}
