//! The plaintext source an upload reads from.
//!
//! Convergent key derivation needs to hash the whole plaintext before it can
//! encrypt a single byte of it, so the coordinator must be able to read the
//! same bytes twice: once to compute the convergent key, once to encrypt.
//! [Uploadable::restart] reports whether that is possible for a given
//! source; when it isn't, the coordinator falls back to a random key.

use async_trait::async_trait;
use bytes::Bytes;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error reading uploadable: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of plaintext bytes that can be read sequentially and, for
/// seekable sources, rewound to the beginning.
#[async_trait]
pub trait Uploadable: Send + Sync {
    /// Total size in bytes. Must be stable across reads of the same
    /// instance.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes, advancing the internal cursor.
    /// Returns the number of bytes read; `0` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Attempt to rewind to the beginning. Returns `true` if the next
    /// `read` call will start delivering bytes from position 0 again.
    /// Sources that are not seekable (a live pipe, a network stream
    /// consumed once) return `false` and must not be read twice.
    async fn restart(&mut self) -> Result<bool, Error>;
}

/// An in-memory [Uploadable] backed by an owned byte buffer. Always
/// restartable.
pub struct BytesUploadable {
    data: Bytes,
    pos: usize,
}

impl BytesUploadable {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

#[async_trait]
impl Uploadable for BytesUploadable {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    async fn restart(&mut self) -> Result<bool, Error> {
        self.pos = 0;
        Ok(true)
    }
}

/// An [Uploadable] backed by a local file, read through tokio's async I/O.
/// Restarting seeks back to offset 0.
pub struct FileUploadable {
    file: tokio::fs::File,
    size: u64,
}

impl FileUploadable {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self { file, size })
    }
}

#[async_trait]
impl Uploadable for FileUploadable {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        use tokio::io::AsyncReadExt;
        Ok(self.file.read(buf).await?)
    }

    async fn restart(&mut self) -> Result<bool, Error> {
        use tokio::io::AsyncSeekExt;
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_uploadable_reads_then_restarts() {
        let mut u = BytesUploadable::new(Bytes::from_static(b"hello world"));
        let mut buf = [0u8; 5];
        let n = u.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        assert!(u.restart().await.unwrap());
        let n = u.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn bytes_uploadable_reports_size() {
        let u = BytesUploadable::new(Bytes::from_static(b"0123456789"));
        assert_eq!(u.size(), 10);
    }
}
