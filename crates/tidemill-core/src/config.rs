//! Engine configuration
//!
//! [`StreamConfig`] carries everything the execution loop, receiver tracker,
//! and state store need. Construct it directly, or parse it from a flat
//! property map with [`StreamConfig::from_properties`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration recognized by the streaming core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Root directory for durable state. Enables the receiver-block
    /// write-ahead log and state checkpointing; when absent both are
    /// in-memory only.
    pub checkpoint_dir: Option<PathBuf>,

    /// Wall-clock cadence target between batches.
    pub batch_interval: Duration,

    /// Floor between batches; the loop always sleeps at least this long.
    pub min_batch_gap: Duration,

    /// Gates durable logging of received-block metadata.
    pub receiver_wal_enabled: bool,

    /// Bound on retained per-batch progress entries.
    pub max_retained_batches: usize,

    /// Time-based rollover interval for write-ahead log files.
    pub wal_rotation_interval: Duration,

    /// Size threshold that forces a write-ahead log rollover.
    pub wal_max_file_size: u64,

    /// How many state-store delta files may accumulate before maintenance
    /// coalesces a snapshot.
    pub snapshot_every_deltas: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            batch_interval: Duration::from_millis(100),
            min_batch_gap: Duration::from_millis(10),
            receiver_wal_enabled: false,
            max_retained_batches: 1000,
            wal_rotation_interval: Duration::from_secs(60),
            wal_max_file_size: 16 * 1024 * 1024,
            snapshot_every_deltas: 10,
        }
    }
}

impl StreamConfig {
    /// Parse a flat key/value property map.
    ///
    /// Recognized keys: `checkpointDir`, `batchIntervalMs`, `minBatchGapMs`,
    /// `receiver.writeAheadLog.enable`, `ui.maxBatches`,
    /// `wal.rotationIntervalMs`, `wal.maxFileSize`,
    /// `state.snapshotEveryDeltas`. Unknown keys are ignored.
    ///
    /// `steaming.ui.maxBatches` is accepted as a compatibility alias for
    /// `ui.maxBatches` (historical deployments shipped the misspelling);
    /// the correctly spelled key wins when both are present.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = props.get("checkpointDir") {
            config.checkpoint_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = props.get("batchIntervalMs") {
            config.batch_interval = Duration::from_millis(parse_u64("batchIntervalMs", ms)?);
        }
        if let Some(ms) = props.get("minBatchGapMs") {
            config.min_batch_gap = Duration::from_millis(parse_u64("minBatchGapMs", ms)?);
        }
        if let Some(v) = props.get("receiver.writeAheadLog.enable") {
            config.receiver_wal_enabled = parse_bool("receiver.writeAheadLog.enable", v)?;
        }
        if let Some(v) = props
            .get("ui.maxBatches")
            .or_else(|| props.get("steaming.ui.maxBatches"))
        {
            config.max_retained_batches = parse_u64("ui.maxBatches", v)? as usize;
        }
        if let Some(ms) = props.get("wal.rotationIntervalMs") {
            config.wal_rotation_interval =
                Duration::from_millis(parse_u64("wal.rotationIntervalMs", ms)?);
        }
        if let Some(v) = props.get("wal.maxFileSize") {
            config.wal_max_file_size = parse_u64("wal.maxFileSize", v)?;
        }
        if let Some(v) = props.get("state.snapshotEveryDeltas") {
            config.snapshot_every_deltas = parse_u64("state.snapshotEveryDeltas", v)? as u32;
        }

        Ok(config)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::InvalidProperty {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value.parse().map_err(|_| Error::InvalidProperty {
        key: key.to_string(),
        value: value.to_string(),
    })
}
