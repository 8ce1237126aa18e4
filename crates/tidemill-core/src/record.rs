//! Record and schema types shared by sources, sinks, and the block store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single streamed record: an opaque payload with an optional key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Optional record key.
    pub key: Option<Bytes>,
    /// Record value (payload).
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Option<Bytes>, value: Bytes) -> Self {
        Self { key, value }
    }

    /// A keyless record.
    pub fn from_value(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }
}

/// The shape a source declares for its records.
///
/// The query engine is a black box to this crate, so a schema is just the
/// ordered field names the planner binds against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<String>,
}

impl Schema {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}
