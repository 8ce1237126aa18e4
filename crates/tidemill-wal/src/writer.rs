//! Log file writer
//!
//! Appends length-prefixed payloads to a single log file. Each accepted write
//! produces exactly one [`FileSegment`] locating the payload, so callers can
//! fetch it back later with a random read.

use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tidemill_core::FileSegment;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::error::{Error, Result};

/// Writes `[u32 length][payload]` frames to one open log file.
///
/// Not thread-safe; the manager serializes access.
pub struct LogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    position: u64,
    valid: bool,
}

impl LogWriter {
    /// Create (or open for append) the log file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let position = file.metadata().await?.len();

        debug!(path = %path.display(), position, "log writer opened");

        Ok(Self {
            path,
            file: BufWriter::new(file),
            position,
            valid: true,
        })
    }

    /// Append one payload and return the segment locating it.
    ///
    /// The write is flushed before returning; a flush failure invalidates the
    /// writer and every later call fails.
    pub async fn write(&mut self, payload: &[u8]) -> Result<FileSegment> {
        if !self.valid {
            return Err(Error::WriterInvalid);
        }

        let segment = FileSegment::new(self.path.clone(), self.position, payload.len() as u64);

        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);

        if let Err(e) = self.write_and_flush(&frame).await {
            self.valid = false;
            return Err(e);
        }

        self.position += frame.len() as u64;
        Ok(segment)
    }

    async fn write_and_flush(&mut self, frame: &[u8]) -> Result<()> {
        self.file.write_all(frame).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Byte position the next write would start at.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and fsync, then drop the file handle.
    pub async fn close(mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;
        debug!(path = %self.path.display(), bytes = self.position, "log writer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_returns_segments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-0-1");
        let mut writer = LogWriter::open(&path).await.unwrap();

        let first = writer.write(b"hello").await.unwrap();
        let second = writer.write(b"streaming").await.unwrap();

        assert_eq!(first.path, path);
        assert_eq!(first.offset, 0);
        assert_eq!(first.length, 5);
        // Second record starts after the first frame: 4-byte prefix + 5 bytes.
        assert_eq!(second.offset, 9);
        assert_eq!(second.length, 9);

        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_are_length_prefixed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-0-1");
        let mut writer = LogWriter::open(&path).await.unwrap();
        writer.write(b"abc").await.unwrap();
        writer.close().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], &3u32.to_be_bytes());
        assert_eq!(&bytes[4..], b"abc");
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-0-1");

        let mut writer = LogWriter::open(&path).await.unwrap();
        writer.write(b"one").await.unwrap();
        writer.close().await.unwrap();

        let mut writer = LogWriter::open(&path).await.unwrap();
        let segment = writer.write(b"two").await.unwrap();
        assert_eq!(segment.offset, 7);
        writer.close().await.unwrap();
    }
}
