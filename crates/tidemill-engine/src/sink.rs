//! Sink contract
//!
//! A sink is the transactional end of a query. `add_batch` must be atomic
//! with respect to `current_offset`: on successful return the offset equals
//! the batch's end offset and the data is durable; on failure both are
//! unchanged. The execution loop relies on that contract for exactly-once
//! delivery and never calls `add_batch` twice for the same batch.

use async_trait::async_trait;
use tidemill_core::{CompositeOffset, Record};

use crate::error::Result;

/// A transactional output.
#[async_trait]
pub trait Sink: Send + Sync {
    /// The offset of the last committed batch, or `None` for a fresh sink.
    async fn current_offset(&self) -> Result<Option<CompositeOffset>>;

    /// Commit one batch. After a successful return `current_offset()` equals
    /// `end_offset`.
    async fn add_batch(&self, end_offset: CompositeOffset, data: Vec<Record>) -> Result<()>;
}
