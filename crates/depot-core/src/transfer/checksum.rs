//! Streaming MD5.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Running MD5 over a byte stream, fed one chunk at a time.
pub struct Md5Accumulator {
    context: md5::Context,
    bytes: u64,
}

impl Md5Accumulator {
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.context.consume(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes consumed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest.
    pub fn finalize(self) -> String {
        format!("{:x}", self.context.compute())
    }
}

impl Default for Md5Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything a reader yields. Returns `(md5, byte_count)`.
pub async fn md5_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    chunk_size: usize,
) -> std::io::Result<(String, u64)> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut acc = Md5Accumulator::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        acc.update(&buf[..n]);
    }
    let bytes = acc.bytes();
    Ok((acc.finalize(), bytes))
}
