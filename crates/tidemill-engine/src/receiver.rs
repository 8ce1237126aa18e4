//! Receiver tracking
//!
//! The driver-side [`ReceiverTracker`] coordinates the remote receivers of a
//! query: it accepts their registrations, buffers the block metadata they
//! report, records their errors, and hands each reported block to exactly
//! one batch. When a write-ahead log is configured, every accepted block is
//! durably appended *before* it becomes visible to any batch, and a fresh
//! tracker replays that log on construction so a driver restart loses
//! nothing.
//!
//! The protocol is a tagged message enum handled by one exhaustive match; a
//! transport layer (RPC or in-process) owns delivery and carries the replies
//! back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tidemill_core::{ReceivedBlockInfo, StreamConfig};
use tidemill_wal::{LogManager, LogManagerConfig};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// How long `stop` waits for supervisors to wind down before giving up.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Messages the tracker accepts from receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReceiverTrackerMessage {
    RegisterReceiver {
        stream_id: u32,
        type_name: String,
        host: String,
    },
    AddBlock(ReceivedBlockInfo),
    ReportError {
        stream_id: u32,
        message: String,
        error: String,
    },
    DeregisterReceiver {
        stream_id: u32,
        message: String,
        error: Option<String>,
    },
}

/// Replies, one variant per message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerResponse {
    Registered(bool),
    BlockAccepted(bool),
    Deregistered(bool),
    NoReply,
}

/// Driver-held state for one receiver.
#[derive(Debug, Clone)]
pub struct ReceiverInfo {
    pub stream_id: u32,
    pub type_name: String,
    pub host: String,
    pub active: bool,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// ReceiverTracker
// ---------------------------------------------------------------------------

/// Driver-side singleton coordinating the receivers of one query.
pub struct ReceiverTracker {
    known_streams: HashSet<u32>,
    receivers: Mutex<HashMap<u32, ReceiverInfo>>,
    queues: Mutex<HashMap<u32, VecDeque<ReceivedBlockInfo>>>,
    wal: Option<LogManager>,
    stopped: AtomicBool,
}

impl ReceiverTracker {
    /// Build a tracker for the given input streams. With a log config the
    /// tracker replays previously logged block metadata into its queues
    /// before the first batch can be assembled.
    pub async fn new(
        stream_ids: impl IntoIterator<Item = u32>,
        wal_config: Option<LogManagerConfig>,
    ) -> Result<Self> {
        let known_streams: HashSet<u32> = stream_ids.into_iter().collect();
        let mut queues: HashMap<u32, VecDeque<ReceivedBlockInfo>> = known_streams
            .iter()
            .map(|id| (*id, VecDeque::new()))
            .collect();

        let wal = match wal_config {
            Some(config) => Some(LogManager::open(config).await?),
            None => None,
        };

        if let Some(wal) = &wal {
            let mut recovered = 0usize;
            for payload in wal.read_all().await? {
                let info: ReceivedBlockInfo = bincode::deserialize(&payload)?;
                match queues.get_mut(&info.stream_id) {
                    Some(queue) => {
                        queue.push_back(info);
                        recovered += 1;
                    }
                    None => warn!(
                        stream_id = info.stream_id,
                        "dropping logged block for unknown stream"
                    ),
                }
            }
            if recovered > 0 {
                info!(blocks = recovered, "recovered block metadata from write-ahead log");
            }
        }

        Ok(Self {
            known_streams,
            receivers: Mutex::new(HashMap::new()),
            queues: Mutex::new(queues),
            wal,
            stopped: AtomicBool::new(false),
        })
    }

    /// Build a tracker from the engine config. With a checkpoint directory
    /// and durable block logging enabled, the log lives under
    /// `<checkpointDir>/receivedBlockMetadata`; otherwise blocks are
    /// in-memory only.
    pub async fn from_config(
        stream_ids: impl IntoIterator<Item = u32>,
        config: &StreamConfig,
    ) -> Result<Self> {
        let wal_config = match (&config.checkpoint_dir, config.receiver_wal_enabled) {
            (Some(dir), true) => Some(LogManagerConfig {
                directory: dir.join("receivedBlockMetadata"),
                rotation_interval: config.wal_rotation_interval,
                max_file_size: config.wal_max_file_size,
            }),
            _ => None,
        };
        Self::new(stream_ids, wal_config).await
    }

    /// Handle one protocol message.
    pub async fn handle(&self, message: ReceiverTrackerMessage) -> TrackerResponse {
        match message {
            ReceiverTrackerMessage::RegisterReceiver {
                stream_id,
                type_name,
                host,
            } => TrackerResponse::Registered(self.register(stream_id, type_name, host).await),
            ReceiverTrackerMessage::AddBlock(info) => {
                TrackerResponse::BlockAccepted(self.add_block(info).await)
            }
            ReceiverTrackerMessage::ReportError {
                stream_id,
                message,
                error,
            } => {
                self.report_error(stream_id, &message, &error).await;
                TrackerResponse::NoReply
            }
            ReceiverTrackerMessage::DeregisterReceiver {
                stream_id,
                message,
                error,
            } => TrackerResponse::Deregistered(self.deregister(stream_id, &message, error).await),
        }
    }

    async fn register(&self, stream_id: u32, type_name: String, host: String) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if !self.known_streams.contains(&stream_id) {
            warn!(stream_id, "rejecting registration for unknown stream");
            return false;
        }
        let mut receivers = self.receivers.lock().await;
        if receivers.get(&stream_id).map(|r| r.active) == Some(true) {
            warn!(stream_id, "rejecting double registration");
            return false;
        }
        info!(stream_id, r#type = %type_name, host = %host, "receiver registered");
        receivers.insert(
            stream_id,
            ReceiverInfo {
                stream_id,
                type_name,
                host,
                active: true,
                last_error: None,
            },
        );
        true
    }

    async fn add_block(&self, info: ReceivedBlockInfo) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if !self.known_streams.contains(&info.stream_id) {
            warn!(stream_id = info.stream_id, "rejecting block for unknown stream");
            return false;
        }

        // Durable before visible: a block only reaches a queue after its
        // metadata hit the log.
        if let Some(wal) = &self.wal {
            let payload = match bincode::serialize(&info) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(block = %info.block_id, error = %e, "failed to encode block metadata");
                    return false;
                }
            };
            if let Err(e) = wal.write(&payload).await {
                warn!(block = %info.block_id, error = %e, "failed to log block metadata");
                return false;
            }
        }

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(info.stream_id).or_default();
        debug!(stream_id = info.stream_id, block = %info.block_id, "block reported");
        queue.push_back(info);
        true
    }

    async fn report_error(&self, stream_id: u32, message: &str, error: &str) {
        warn!(stream_id, message, error, "receiver reported error");
        let mut receivers = self.receivers.lock().await;
        if let Some(receiver) = receivers.get_mut(&stream_id) {
            receiver.last_error = Some(error.to_string());
        }
    }

    async fn deregister(&self, stream_id: u32, message: &str, error: Option<String>) -> bool {
        if !self.known_streams.contains(&stream_id) {
            warn!(stream_id, "rejecting deregistration for unknown stream");
            return false;
        }
        let mut receivers = self.receivers.lock().await;
        match receivers.get_mut(&stream_id) {
            Some(receiver) if receiver.active => {
                info!(stream_id, message, "receiver deregistered");
                receiver.active = false;
                if error.is_some() {
                    receiver.last_error = error;
                }
            }
            // Already terminated (or never registered): tolerated no-op.
            _ => debug!(stream_id, "deregistration of inactive receiver ignored"),
        }
        true
    }

    /// Atomically drain everything reported so far for one stream. Each
    /// block is delivered exactly once across all calls.
    pub async fn get_received_blocks(&self, stream_id: u32) -> Vec<ReceivedBlockInfo> {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(&stream_id) {
            Some(queue) => std::mem::take(queue).into(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the driver-held receiver states.
    pub async fn receiver_info(&self) -> Vec<ReceiverInfo> {
        let mut infos: Vec<ReceiverInfo> = self.receivers.lock().await.values().cloned().collect();
        infos.sort_by_key(|r| r.stream_id);
        infos
    }

    /// Drop log files whose rollover window ended before `threshold_nanos`.
    /// Safe once every offset at or before the threshold is committed.
    pub async fn clean_old_block_metadata(&self, threshold_nanos: u128) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.clear_old_logs(threshold_nanos).await?;
        }
        Ok(())
    }

    /// Stop accepting blocks and close the write-ahead log. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(wal) = &self.wal {
            wal.close().await?;
        }
        info!("receiver tracker stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Receiver launching
// ---------------------------------------------------------------------------

/// A receiver body: pulls from an external system and reports blocks through
/// its [`ReceiverHandle`] until asked to stop.
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    fn stream_id(&self) -> u32;

    fn type_name(&self) -> &str;

    /// Host this receiver would like to run on, when it cares.
    fn preferred_host(&self) -> Option<String> {
        None
    }

    /// The receiver loop. Implementations should return promptly once
    /// `handle.should_stop()` turns true; an `Err` is reported to the driver
    /// as a crash.
    async fn run(&self, handle: ReceiverHandle) -> Result<()>;
}

/// The receiver-side view of the tracker protocol.
pub struct ReceiverHandle {
    stream_id: u32,
    tracker: Arc<ReceiverTracker>,
    stop_rx: watch::Receiver<bool>,
}

impl ReceiverHandle {
    /// Report one block; `false` means the driver rejected it (for example a
    /// log failure) and the receiver decides whether to retry or drop.
    pub async fn report_block(&self, info: ReceivedBlockInfo) -> bool {
        matches!(
            self.tracker
                .handle(ReceiverTrackerMessage::AddBlock(info))
                .await,
            TrackerResponse::BlockAccepted(true)
        )
    }

    pub async fn report_error(&self, message: impl Into<String>, error: impl Into<String>) {
        self.tracker
            .handle(ReceiverTrackerMessage::ReportError {
                stream_id: self.stream_id,
                message: message.into(),
                error: error.into(),
            })
            .await;
    }

    pub fn should_stop(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Wait until the driver broadcasts stop.
    pub async fn stopped(&mut self) {
        let _ = self.stop_rx.wait_for(|stop| *stop).await;
    }
}

/// The supervisors of a launched receiver set.
///
/// Each receiver runs under its own dedicated supervisor task, which
/// registers it, drives its loop, and deregisters it with the outcome.
pub struct ReceiverSet {
    tracker: Arc<ReceiverTracker>,
    stop_tx: watch::Sender<bool>,
    supervisors: Vec<JoinHandle<()>>,
}

/// Spawn one supervisor task per receiver.
pub fn launch_receivers(
    tracker: Arc<ReceiverTracker>,
    receivers: Vec<Arc<dyn Receiver>>,
) -> ReceiverSet {
    let (stop_tx, stop_rx) = watch::channel(false);

    let supervisors = receivers
        .into_iter()
        .map(|receiver| {
            let tracker = Arc::clone(&tracker);
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                supervise(tracker, receiver, stop_rx).await;
            })
        })
        .collect();

    ReceiverSet {
        tracker,
        stop_tx,
        supervisors,
    }
}

async fn supervise(
    tracker: Arc<ReceiverTracker>,
    receiver: Arc<dyn Receiver>,
    stop_rx: watch::Receiver<bool>,
) {
    let stream_id = receiver.stream_id();
    let host = receiver
        .preferred_host()
        .unwrap_or_else(|| "localhost".to_string());

    let registered = tracker
        .handle(ReceiverTrackerMessage::RegisterReceiver {
            stream_id,
            type_name: receiver.type_name().to_string(),
            host,
        })
        .await;
    if registered != TrackerResponse::Registered(true) {
        warn!(stream_id, "receiver registration rejected, not starting");
        return;
    }

    let handle = ReceiverHandle {
        stream_id,
        tracker: Arc::clone(&tracker),
        stop_rx,
    };
    let outcome = receiver.run(handle).await;

    let (message, error) = match outcome {
        Ok(()) => ("receiver stopped".to_string(), None),
        Err(e) => ("receiver crashed".to_string(), Some(e.to_string())),
    };
    tracker
        .handle(ReceiverTrackerMessage::DeregisterReceiver {
            stream_id,
            message,
            error,
        })
        .await;
}

impl ReceiverSet {
    /// Broadcast stop, wait up to ten seconds for the supervisors, log any
    /// receivers still active, then stop the tracker. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.stop_tx.send(true);

        let joins = join_all(self.supervisors.drain(..));
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, joins).await.is_err() {
            for info in self.tracker.receiver_info().await {
                if info.active {
                    warn!(stream_id = info.stream_id, "receiver still active after stop timeout");
                }
            }
        }

        self.tracker.stop().await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tidemill_core::BlockId;

    fn block(stream_id: u32, unique_id: u64) -> ReceivedBlockInfo {
        ReceivedBlockInfo::new(stream_id, BlockId::new(stream_id, unique_id))
    }

    async fn tracker(streams: &[u32]) -> ReceiverTracker {
        ReceiverTracker::new(streams.iter().copied(), None)
            .await
            .unwrap()
    }

    fn register(stream_id: u32) -> ReceiverTrackerMessage {
        ReceiverTrackerMessage::RegisterReceiver {
            stream_id,
            type_name: "test".to_string(),
            host: "localhost".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_known_stream() {
        let tracker = tracker(&[1]).await;
        assert_eq!(
            tracker.handle(register(1)).await,
            TrackerResponse::Registered(true)
        );

        let infos = tracker.receiver_info().await;
        assert_eq!(infos.len(), 1);
        assert!(infos[0].active);
    }

    #[tokio::test]
    async fn test_register_unknown_stream_rejected() {
        let tracker = tracker(&[1]).await;
        assert_eq!(
            tracker.handle(register(9)).await,
            TrackerResponse::Registered(false)
        );
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let tracker = tracker(&[1]).await;
        tracker.handle(register(1)).await;
        assert_eq!(
            tracker.handle(register(1)).await,
            TrackerResponse::Registered(false)
        );
    }

    #[tokio::test]
    async fn test_reregistration_after_terminate_allowed() {
        let tracker = tracker(&[1]).await;
        tracker.handle(register(1)).await;
        tracker
            .handle(ReceiverTrackerMessage::DeregisterReceiver {
                stream_id: 1,
                message: "restarting".to_string(),
                error: None,
            })
            .await;
        assert_eq!(
            tracker.handle(register(1)).await,
            TrackerResponse::Registered(true)
        );
    }

    #[tokio::test]
    async fn test_report_error_keeps_receiver_active() {
        let tracker = tracker(&[1]).await;
        tracker.handle(register(1)).await;
        let response = tracker
            .handle(ReceiverTrackerMessage::ReportError {
                stream_id: 1,
                message: "transient".to_string(),
                error: "connection reset".to_string(),
            })
            .await;
        assert_eq!(response, TrackerResponse::NoReply);

        let infos = tracker.receiver_info().await;
        assert!(infos[0].active);
        assert_eq!(infos[0].last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_deregister_records_final_error() {
        let tracker = tracker(&[1]).await;
        tracker.handle(register(1)).await;
        let response = tracker
            .handle(ReceiverTrackerMessage::DeregisterReceiver {
                stream_id: 1,
                message: "crashed".to_string(),
                error: Some("out of memory".to_string()),
            })
            .await;
        assert_eq!(response, TrackerResponse::Deregistered(true));

        let infos = tracker.receiver_info().await;
        assert!(!infos[0].active);
        assert_eq!(infos[0].last_error.as_deref(), Some("out of memory"));
    }

    #[tokio::test]
    async fn test_deregister_twice_is_tolerated() {
        let tracker = tracker(&[1]).await;
        tracker.handle(register(1)).await;
        let dereg = ReceiverTrackerMessage::DeregisterReceiver {
            stream_id: 1,
            message: "bye".to_string(),
            error: None,
        };
        tracker.handle(dereg.clone()).await;
        assert_eq!(
            tracker.handle(dereg).await,
            TrackerResponse::Deregistered(true)
        );
    }

    #[tokio::test]
    async fn test_add_block_and_drain_once() {
        let tracker = tracker(&[1, 2]).await;
        for i in 0..3 {
            assert_eq!(
                tracker
                    .handle(ReceiverTrackerMessage::AddBlock(block(1, i)))
                    .await,
                TrackerResponse::BlockAccepted(true)
            );
        }
        tracker
            .handle(ReceiverTrackerMessage::AddBlock(block(2, 0)))
            .await;

        let drained = tracker.get_received_blocks(1).await;
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].block_id, BlockId::new(1, 0));

        // A second drain delivers nothing: exactly once.
        assert!(tracker.get_received_blocks(1).await.is_empty());
        // The other stream's queue is untouched.
        assert_eq!(tracker.get_received_blocks(2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_block_unknown_stream_rejected() {
        let tracker = tracker(&[1]).await;
        assert_eq!(
            tracker
                .handle(ReceiverTrackerMessage::AddBlock(block(5, 0)))
                .await,
            TrackerResponse::BlockAccepted(false)
        );
    }

    #[tokio::test]
    async fn test_stopped_tracker_rejects_blocks() {
        let tracker = tracker(&[1]).await;
        tracker.stop().await.unwrap();
        assert_eq!(
            tracker
                .handle(ReceiverTrackerMessage::AddBlock(block(1, 0)))
                .await,
            TrackerResponse::BlockAccepted(false)
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let tracker = tracker(&[1]).await;
        tracker.stop().await.unwrap();
        tracker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config_places_log_under_checkpoint_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StreamConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            receiver_wal_enabled: true,
            ..Default::default()
        };

        let tracker = ReceiverTracker::from_config([1], &config).await.unwrap();
        tracker
            .handle(ReceiverTrackerMessage::AddBlock(block(1, 0)))
            .await;
        tracker.stop().await.unwrap();

        let metadata_dir = dir.path().join("receivedBlockMetadata");
        assert!(metadata_dir.is_dir());
        assert!(std::fs::read_dir(&metadata_dir).unwrap().count() > 0);
    }

    #[tokio::test]
    async fn test_from_config_without_checkpoint_dir_is_in_memory() {
        let config = StreamConfig {
            receiver_wal_enabled: true,
            ..Default::default()
        };
        let tracker = ReceiverTracker::from_config([1], &config).await.unwrap();
        assert_eq!(
            tracker
                .handle(ReceiverTrackerMessage::AddBlock(block(1, 0)))
                .await,
            TrackerResponse::BlockAccepted(true)
        );
        assert_eq!(tracker.get_received_blocks(1).await.len(), 1);
    }
}
