//! Block store access and the block-backed dataset
//!
//! Receiver-reported blocks live in the block store, a remote tier this
//! crate only ever touches through the [`BlockStore`] trait. A
//! [`BlockBackedDataset`] is the batch input built from those blocks: one
//! partition per block, read through the store and rehydrated from the
//! write-ahead log on a miss.

use std::sync::Arc;

use async_trait::async_trait;
use tidemill_core::{BlockId, FileSegment, Record};
use tidemill_wal::read_segment;
use tracing::debug;

use crate::error::{Error, Result};

/// How a rehydrated block should be kept by the block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLevel {
    MemoryOnly,
    MemoryAndDisk,
}

/// The block store operations the core is allowed to use.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Fetch a block's records, if the store still holds them.
    async fn get(&self, id: &BlockId) -> Option<Vec<Record>>;

    /// Insert (or re-insert) a block under the given storage level.
    async fn put(&self, id: BlockId, records: Vec<Record>, level: StorageLevel) -> Result<()>;

    /// Ids of all held blocks matching a predicate.
    async fn get_matching_ids<'a, 'b>(
        &'a self,
        filter: &'b (dyn for<'r> Fn(&'r BlockId) -> bool + Sync),
    ) -> Vec<BlockId>
    where
        'a: 'b;

    /// Executors currently holding a block; empty when unknown.
    async fn locations(&self, id: &BlockId) -> Vec<String>;
}

/// Serialize records for write-ahead log storage.
pub fn encode_records(records: &[Record]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(records)?)
}

/// Inverse of [`encode_records`].
pub fn decode_records(bytes: &[u8]) -> Result<Vec<Record>> {
    Ok(bincode::deserialize(bytes)?)
}

/// A partitioned dataset whose partitions are receiver-reported blocks.
///
/// Each partition is read from the block store if present, otherwise
/// rehydrated from its write-ahead log segment and put back into the store.
/// A partition present in neither place is fatal.
pub struct BlockBackedDataset {
    partitions: Vec<(BlockId, Option<FileSegment>)>,
    block_store: Arc<dyn BlockStore>,
    level: StorageLevel,
}

impl BlockBackedDataset {
    pub fn new(
        partitions: Vec<(BlockId, Option<FileSegment>)>,
        block_store: Arc<dyn BlockStore>,
        level: StorageLevel,
    ) -> Self {
        Self {
            partitions,
            block_store,
            level,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// The executors that last held this partition's block. Empty when the
    /// store no longer knows, in which case the scheduler places freely.
    pub async fn preferred_locations(&self, partition: usize) -> Vec<String> {
        match self.partitions.get(partition) {
            Some((id, _)) => self.block_store.locations(id).await,
            None => Vec::new(),
        }
    }

    /// Read one partition's records.
    pub async fn read_partition(&self, partition: usize) -> Result<Vec<Record>> {
        let (id, segment) = self
            .partitions
            .get(partition)
            .ok_or(Error::PartitionOutOfRange(partition))?;

        if let Some(records) = self.block_store.get(id).await {
            return Ok(records);
        }

        let Some(segment) = segment else {
            return Err(Error::BlockUnavailable(*id));
        };

        let payload = match read_segment(segment).await {
            Ok(payload) => payload,
            // The log file is gone too: the block is unrecoverable.
            Err(tidemill_wal::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BlockUnavailable(*id));
            }
            Err(e) => return Err(e.into()),
        };
        let records = decode_records(&payload)?;
        debug!(block = %id, records = records.len(), "block rehydrated from write-ahead log");

        self.block_store
            .put(*id, records.clone(), self.level)
            .await?;
        Ok(records)
    }

    /// All partitions, concatenated in partition order.
    pub async fn collect(&self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        for i in 0..self.partitions.len() {
            out.extend(self.read_partition(i).await?);
        }
        Ok(out)
    }
}
