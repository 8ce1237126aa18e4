//! Metadata for receiver-reported blocks
//!
//! Receivers hand incoming records to the block store in units called blocks
//! and report a [`ReceivedBlockInfo`] per block to the driver. When the
//! write-ahead log is enabled the info carries the [`FileSegment`] locating
//! the block's durable copy, so a restarted driver can rebuild the block even
//! if the in-memory copy is gone.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifies one block of received records, unique within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// The input stream this block belongs to.
    pub stream_id: u32,
    /// Unique id within the stream, assigned by the receiver.
    pub unique_id: u64,
}

impl BlockId {
    pub fn new(stream_id: u32, unique_id: u64) -> Self {
        Self {
            stream_id,
            unique_id,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input-{}-{}", self.stream_id, self.unique_id)
    }
}

/// Locates one record inside a write-ahead log file.
///
/// Valid only while the file at `path` has not been truncated past
/// `offset + length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSegment {
    /// Path of the log file.
    pub path: PathBuf,
    /// Byte position of the record's length prefix.
    pub offset: u64,
    /// Payload length in bytes (the length prefix itself excluded).
    pub length: u64,
}

impl FileSegment {
    pub fn new(path: PathBuf, offset: u64, length: u64) -> Self {
        Self {
            path,
            offset,
            length,
        }
    }
}

/// Everything the driver keeps about one received block.
///
/// Created by a receiver supervisor, persisted to the write-ahead log before
/// it becomes visible to any batch, consumed exactly once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedBlockInfo {
    /// The input stream that produced the block.
    pub stream_id: u32,
    /// The block's id in the block store.
    pub block_id: BlockId,
    /// Record count, when the receiver knows it.
    pub num_records: Option<u64>,
    /// Opaque metadata attached by the receiver.
    pub metadata: Option<String>,
    /// Durable copy of the block, when the write-ahead log is enabled.
    pub wal_segment: Option<FileSegment>,
}

impl ReceivedBlockInfo {
    pub fn new(stream_id: u32, block_id: BlockId) -> Self {
        Self {
            stream_id,
            block_id,
            num_records: None,
            metadata: None,
            wal_segment: None,
        }
    }

    pub fn with_num_records(mut self, n: u64) -> Self {
        self.num_records = Some(n);
        self
    }

    pub fn with_wal_segment(mut self, segment: FileSegment) -> Self {
        self.wal_segment = Some(segment);
        self
    }
}
