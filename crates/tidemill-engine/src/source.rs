//! Source contract
//!
//! A source exposes newly arrived data as bounded batches, each tagged with
//! the strictly increasing [`Offset`] it ends at. Sources own their replay
//! semantics: given the last committed offset they must be able to re-emit
//! everything after it, and nothing at or before it.

use async_trait::async_trait;
use tidemill_core::{Offset, Record, Schema};

use crate::error::{Error, Result};

/// A bounded chunk of newly arrived data from one source.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    /// The offset this batch ends at; strictly greater than the offset the
    /// batch was requested against.
    pub end_offset: Offset,
    /// The batch's records.
    pub records: Vec<Record>,
}

/// A streaming input.
#[async_trait]
pub trait Source: Send + Sync {
    /// Return everything that arrived after `last_committed`, or `None` when
    /// there is nothing new. A returned batch's `end_offset` must be
    /// strictly greater than `last_committed`.
    async fn get_next_batch(&self, last_committed: Option<&Offset>) -> Result<Option<SourceBatch>>;

    /// The shape of this source's records.
    fn schema(&self) -> Schema;

    /// Stable identity of this source, used in logs and progress displays.
    fn name(&self) -> &str;

    /// Re-read an arbitrary offset range. Optional; test sources offer it,
    /// most production sources do not.
    async fn get_slice(&self, _start: Option<&Offset>, _end: &Offset) -> Result<Vec<Record>> {
        Err(Error::Source(format!(
            "source {} does not support slicing",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptySource;

    #[async_trait]
    impl Source for EmptySource {
        async fn get_next_batch(
            &self,
            _last_committed: Option<&Offset>,
        ) -> Result<Option<SourceBatch>> {
            Ok(None)
        }

        fn schema(&self) -> Schema {
            Schema::new(["value"])
        }

        fn name(&self) -> &str {
            "empty"
        }
    }

    #[tokio::test]
    async fn test_object_safety_and_defaults() {
        let source: &dyn Source = &EmptySource;
        assert!(source.get_next_batch(None).await.unwrap().is_none());

        let result = source.get_slice(None, &Offset::Long(5)).await;
        assert!(matches!(result, Err(Error::Source(_))));
    }
}
