//! Shared fixtures for the engine integration tests: an in-memory source
//! with pushable batches, a transactional in-memory sink, and a
//! pass-through plan.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tidemill_engine::{
    BatchInput, BatchQuery, CompositeOffset, Error, Offset, Record, Result, Schema, Sink, Source,
    SourceBatch, StreamConfig,
};

/// A source fed by the test: each pushed entry is a bounded chunk ending at
/// an explicit offset.
pub struct MemorySource {
    name: String,
    entries: Mutex<Vec<(i64, Vec<Record>)>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, end_offset: i64, records: Vec<Record>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((end_offset, records));
    }

    /// Push one whitespace-separated text payload as a single record.
    pub fn push_text(&self, end_offset: i64, text: &str) {
        self.push(end_offset, vec![Record::from_value(text.to_string())]);
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn get_next_batch(&self, last_committed: Option<&Offset>) -> Result<Option<SourceBatch>> {
        let floor = match last_committed {
            None => i64::MIN,
            Some(Offset::Long(v)) => *v,
            Some(other) => {
                return Err(Error::Source(format!(
                    "memory source cannot resume from {other}"
                )))
            }
        };

        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut end_offset = None;
        let mut records = Vec::new();
        for (offset, chunk) in entries.iter() {
            if *offset > floor {
                records.extend(chunk.iter().cloned());
                end_offset = Some(end_offset.map_or(*offset, |cur: i64| cur.max(*offset)));
            }
        }
        Ok(end_offset.map(|end| SourceBatch {
            end_offset: Offset::Long(end),
            records,
        }))
    }

    fn schema(&self) -> Schema {
        Schema::new(["key", "value"])
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get_slice(&self, start: Option<&Offset>, end: &Offset) -> Result<Vec<Record>> {
        let lo = match start {
            None => i64::MIN,
            Some(Offset::Long(v)) => *v,
            Some(other) => return Err(Error::Source(format!("bad slice start {other}"))),
        };
        let Offset::Long(hi) = end else {
            return Err(Error::Source(format!("bad slice end {end}")));
        };
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|(offset, _)| *offset > lo && *offset <= *hi)
            .flat_map(|(_, chunk)| chunk.iter().cloned())
            .collect())
    }
}

struct SinkInner {
    committed: Option<CompositeOffset>,
    data: Vec<Record>,
    add_batch_calls: u64,
}

/// Transactional in-memory sink: commit and data move together, and a
/// re-commit of the current offset is ignored.
pub struct MemorySink {
    inner: Mutex<SinkInner>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SinkInner {
                committed: None,
                data: Vec::new(),
                add_batch_calls: 0,
            }),
        })
    }

    /// A sink that already committed up to `offset` in a previous run.
    pub fn resumed_at(offset: CompositeOffset) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SinkInner {
                committed: Some(offset),
                data: Vec::new(),
                add_batch_calls: 0,
            }),
        })
    }

    pub fn all_data(&self) -> Vec<Record> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .clone()
    }

    pub fn add_batch_calls(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_batch_calls
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn current_offset(&self) -> Result<Option<CompositeOffset>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .committed
            .clone())
    }

    async fn add_batch(&self, end_offset: CompositeOffset, data: Vec<Record>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.add_batch_calls += 1;
        if let Some(current) = &inner.committed {
            match end_offset.compare(current) {
                Ok(std::cmp::Ordering::Equal) => return Ok(()), // already committed
                Ok(std::cmp::Ordering::Greater) => {}
                _ => {
                    return Err(Error::Sink(format!(
                        "batch offset {end_offset} does not advance past {current}"
                    )))
                }
            }
        }
        inner.data.extend(data);
        inner.committed = Some(end_offset);
        Ok(())
    }
}

/// A plan that passes every input record straight through.
pub struct PassthroughQuery;

#[async_trait]
impl BatchQuery for PassthroughQuery {
    async fn execute(&self, _batch_id: u64, inputs: Vec<BatchInput>) -> Result<Vec<Record>> {
        Ok(inputs.into_iter().flat_map(|b| b.records).collect())
    }
}

/// A config tuned for fast test loops.
pub fn quick_config() -> StreamConfig {
    StreamConfig {
        batch_interval: Duration::from_millis(5),
        min_batch_gap: Duration::from_millis(1),
        ..Default::default()
    }
}

/// `n` keyless records `prefix-1 .. prefix-n`.
pub fn numbered_records(prefix: &str, n: usize) -> Vec<Record> {
    (1..=n)
        .map(|i| Record::from_value(format!("{prefix}-{i}")))
        .collect()
}
