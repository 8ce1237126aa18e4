//! Log file readers
//!
//! [`LogReader`] walks one log file forward, one frame at a time. A partial
//! frame at the end of the file is treated as a clean end of log, not an
//! error: on an append-only file system the tail may simply not have been
//! flushed before a crash, and everything before it is still good.
//!
//! [`read_segment`] is the random-access path: it fetches exactly one
//! payload given the [`FileSegment`] the writer handed out.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tidemill_core::FileSegment;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::warn;

use crate::error::{Error, Result};

/// Forward iterator over the frames of one log file.
pub struct LogReader {
    path: PathBuf,
    reader: Option<BufReader<File>>,
}

impl LogReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            reader: Some(BufReader::new(file)),
        })
    }

    /// Return the next payload, or `None` at end of log.
    ///
    /// A truncated trailing frame stops iteration without an error. Any other
    /// I/O failure closes the reader and propagates.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        // Length prefix, read byte-wise so a clean EOF (zero bytes) is
        // distinguishable from a torn prefix.
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            match reader.read(&mut len_buf[filled..]).await {
                Ok(0) => {
                    if filled > 0 {
                        warn!(path = %self.path.display(), "partial length prefix at end of log, stopping");
                    }
                    self.reader = None;
                    return Ok(None);
                }
                Ok(n) => filled += n,
                Err(e) => {
                    self.reader = None;
                    return Err(e.into());
                }
            }
        }
        let length = u32::from_be_bytes(len_buf) as usize;

        let mut payload = vec![0u8; length];
        match reader.read_exact(&mut payload).await {
            Ok(_) => Ok(Some(Bytes::from(payload))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(
                    path = %self.path.display(),
                    declared = length,
                    "record length overruns the log file, treating as end of log"
                );
                self.reader = None;
                Ok(None)
            }
            Err(e) => {
                self.reader = None;
                Err(e.into())
            }
        }
    }

    /// Drain the remaining frames into a vector.
    pub async fn read_all(&mut self) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        while let Some(payload) = self.next().await? {
            out.push(payload);
        }
        Ok(out)
    }
}

/// Fetch the single payload a [`FileSegment`] points at.
///
/// Fails if the length prefix on disk disagrees with the segment, which means
/// the segment is stale or points into the wrong file.
pub async fn read_segment(segment: &FileSegment) -> Result<Bytes> {
    let mut file = File::open(&segment.path).await?;
    file.seek(SeekFrom::Start(segment.offset)).await?;

    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf).await?;
    let found = u32::from_be_bytes(len_buf) as u64;
    if found != segment.length {
        return Err(Error::SegmentLengthMismatch {
            expected: segment.length,
            found,
        });
    }

    let mut payload = vec![0u8; segment.length as usize];
    file.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}
