//! tidemill streaming execution core
//!
//! A micro-batch streaming engine: it repeatedly pulls newly arrived data
//! from its sources, assembles a bounded batch identified by an immutable
//! composite offset, executes a query plan over the batch, and commits the
//! result transactionally to a sink. After a restart, everything between
//! the sink's last committed offset and the source tips is processed
//! exactly once, up to the sink's own idempotency.
//!
//! ## Main components
//!
//! - [`Source`] / [`Sink`]: the external contracts a query runs between.
//! - [`StreamExecution`]: the per-query worker loop with await/termination
//!   semantics.
//! - [`StreamProgress`]: the monotone per-source offset map.
//! - [`ReceiverTracker`]: driver-side coordination of remote receivers,
//!   with durable block metadata via `tidemill-wal`.
//! - [`BlockBackedDataset`]: batch input over receiver-reported blocks,
//!   rehydrated from the write-ahead log when the block store forgot them.
//! - [`map_partitions_with_state`]: stateful operators over the versioned
//!   store in `tidemill-state`.

pub mod blocks;
pub mod error;
pub mod execution;
pub mod progress;
pub mod receiver;
pub mod sink;
pub mod source;
pub mod stateful;

pub use blocks::{decode_records, encode_records, BlockBackedDataset, BlockStore, StorageLevel};
pub use error::{Error, Result};
pub use execution::{BatchInfo, BatchInput, BatchQuery, QueryError, StreamExecution};
pub use progress::StreamProgress;
pub use receiver::{
    launch_receivers, Receiver, ReceiverHandle, ReceiverInfo, ReceiverSet, ReceiverTracker,
    ReceiverTrackerMessage, TrackerResponse,
};
pub use sink::Sink;
pub use source::{Source, SourceBatch};
pub use stateful::map_partitions_with_state;

pub use tidemill_core::{
    BlockId, CompositeOffset, FileSegment, Offset, ReceivedBlockInfo, Record, Schema, StreamConfig,
};
