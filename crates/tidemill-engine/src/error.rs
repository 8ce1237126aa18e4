//! Engine error types

use thiserror::Error;
use tidemill_core::BlockId;

use crate::execution::QueryError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] tidemill_core::Error),

    #[error("write-ahead log error: {0}")]
    Wal(#[from] tidemill_wal::Error),

    #[error("state store error: {0}")]
    State(#[from] tidemill_state::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unknown stream id: {0}")]
    UnknownStream(u32),

    #[error("source index {0} out of range")]
    UnknownSource(usize),

    #[error("partition index {0} out of range")]
    PartitionOutOfRange(usize),

    #[error("block {0} found in neither the block store nor the write-ahead log")]
    BlockUnavailable(BlockId),

    #[error(
        "non-monotone offset update for source {source_index}: {attempted} does not advance past {current}"
    )]
    NonMonotonicUpdate {
        source_index: usize,
        current: String,
        attempted: String,
    },

    #[error("sink reported an offset this query cannot resume from: {0}")]
    InvalidSinkOffset(String),

    #[error("await timeout must be positive")]
    InvalidTimeout,

    #[error("execution ended before reaching the requested offset")]
    ExecutionEnded,

    #[error("state version must be at least 1, got {0}")]
    InvalidStateVersion(u64),

    #[error(
        "state store for operator {operator_id} partition {partition_id} \
         was not committed to version {expected} (got {actual})"
    )]
    StoreNotCommitted {
        operator_id: u64,
        partition_id: u32,
        expected: u64,
        actual: u64,
    },

    #[error("source error: {0}")]
    Source(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

pub type Result<T> = std::result::Result<T, Error>;
