//! Streaming query execution
//!
//! [`StreamExecution`] drives one query: a dedicated worker task repeatedly
//! polls every source for new data, hands the new data to the black-box
//! [`BatchQuery`] plan, and commits the result to the sink together with the
//! batch's [`CompositeOffset`]. Progress update and sink commit happen
//! under the same lock, and `add_batch` is called exactly once per batch.
//!
//! On construction the sink's last committed offset seeds the progress map,
//! so a restarted query asks each source only for data after what the sink
//! already holds. Any failure in polling, planning, or committing is
//! captured as a [`QueryError`], terminates the loop, and is re-raised to
//! whoever awaits termination. The core never retries; recovery is a
//! restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tidemill_core::{CompositeOffset, Offset, Record, StreamConfig};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Error as EngineError, Result};
use crate::progress::StreamProgress;
use crate::sink::Sink;
use crate::source::Source;

/// How often blocked waiters re-check progress and termination.
const WAIT_RECHECK: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Plan contract
// ---------------------------------------------------------------------------

/// One source's contribution to a batch.
#[derive(Debug, Clone)]
pub struct BatchInput {
    /// Index of the source in the query's canonical order.
    pub source: usize,
    /// The source's new records for this batch.
    pub records: Vec<Record>,
}

/// The query plan, opaque to the execution loop.
///
/// The loop binds each streaming relation to its new data and asks the plan
/// for the batch's output; planning and optimization live elsewhere.
#[async_trait]
pub trait BatchQuery: Send + Sync {
    /// Execute over one batch. `batch_id` is the 1-based batch sequence
    /// number within this run.
    async fn execute(&self, batch_id: u64, inputs: Vec<BatchInput>) -> Result<Vec<Record>>;
}

// ---------------------------------------------------------------------------
// Failure capture
// ---------------------------------------------------------------------------

/// A captured execution-loop failure.
#[derive(Debug, Clone, Error)]
#[error("{message} (at {start_offset})")]
pub struct QueryError {
    pub message: String,
    pub cause: Option<String>,
    /// The query's committed progress when the failure happened.
    pub start_offset: CompositeOffset,
    /// The offset of the failed batch, when it got far enough to have one.
    pub end_offset: Option<CompositeOffset>,
}

// ---------------------------------------------------------------------------
// Batch bookkeeping
// ---------------------------------------------------------------------------

/// Progress entry for one committed batch.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    /// 1-based batch sequence number within this run.
    pub id: u64,
    pub end_offset: CompositeOffset,
    pub num_input_records: u64,
    pub num_output_records: u64,
    pub processing_ms: u64,
    /// Wall-clock commit time, milliseconds since epoch.
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// StreamExecution
// ---------------------------------------------------------------------------

struct Shared {
    name: String,
    active: AtomicBool,
    /// Committed per-source progress; also guards the sink commit.
    progress: Mutex<StreamProgress>,
    /// Woken after every committed batch and on termination.
    progress_notify: Notify,
    /// Woken once, when the loop exits.
    termination: Notify,
    /// Interrupts the worker's inter-batch sleep.
    wakeup: Notify,
    death_cause: std::sync::Mutex<Option<QueryError>>,
    recent_batches: std::sync::Mutex<VecDeque<BatchInfo>>,
    batch_count: AtomicU64,
}

impl Shared {
    fn set_death_cause(&self, cause: QueryError) {
        self.death_cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert(cause);
    }
}

/// A running streaming query.
pub struct StreamExecution {
    id: Uuid,
    sources: Vec<Arc<dyn Source>>,
    shared: Arc<Shared>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamExecution {
    /// Seed progress from the sink and start the worker.
    ///
    /// A sink that reports a composite offset of the wrong arity cannot
    /// belong to this query; that is a programming error and fails fast.
    pub async fn start(
        name: impl Into<String>,
        sources: Vec<Arc<dyn Source>>,
        sink: Arc<dyn Sink>,
        plan: Arc<dyn BatchQuery>,
        config: StreamConfig,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let mut progress = StreamProgress::new(sources.len());
        match sink.current_offset().await? {
            Some(committed) => {
                progress.seed(&committed)?;
                info!(query = %name, offset = %committed, "resuming from sink offset");
            }
            None => info!(query = %name, "starting fresh, sink has no committed offset"),
        }

        let shared = Arc::new(Shared {
            name,
            active: AtomicBool::new(true),
            progress: Mutex::new(progress),
            progress_notify: Notify::new(),
            termination: Notify::new(),
            wakeup: Notify::new(),
            death_cause: std::sync::Mutex::new(None),
            recent_batches: std::sync::Mutex::new(VecDeque::new()),
            batch_count: AtomicU64::new(0),
        });

        let execution = Arc::new(Self {
            id: Uuid::new_v4(),
            sources: sources.clone(),
            shared: shared.clone(),
            worker: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(run_loop(shared, sources, sink, plan, config));
        *execution
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(execution)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// The captured failure, if the loop died with one.
    pub fn exception(&self) -> Option<QueryError> {
        self.shared
            .death_cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of batches committed in this run.
    pub fn batches_committed(&self) -> u64 {
        self.shared.batch_count.load(Ordering::SeqCst)
    }

    /// The most recent batches, oldest first, bounded by
    /// `max_retained_batches`.
    pub fn recent_batches(&self) -> Vec<BatchInfo> {
        self.shared
            .recent_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// The query's committed progress as a composite offset.
    pub async fn committed_offset(&self) -> CompositeOffset {
        self.shared.progress.lock().await.to_composite()
    }

    /// Block until `source`'s committed offset reaches `target`.
    ///
    /// Re-checks at least every 100 ms; a loop failure interrupts the wait.
    pub async fn await_offset(&self, source: usize, target: &Offset) -> Result<()> {
        if source >= self.sources.len() {
            return Err(EngineError::UnknownSource(source));
        }
        loop {
            if let Some(cause) = self.exception() {
                return Err(cause.into());
            }
            {
                let progress = self.shared.progress.lock().await;
                if let Some(current) = progress.get(source) {
                    if current.compare(target)? != std::cmp::Ordering::Less {
                        return Ok(());
                    }
                }
            }
            if !self.is_active() {
                // Re-check the failure cause: it is stored before the active
                // flag drops, but this waiter may have read them in between.
                return match self.exception() {
                    Some(cause) => Err(cause.into()),
                    None => Err(EngineError::ExecutionEnded),
                };
            }
            let _ = tokio::time::timeout(WAIT_RECHECK, self.shared.progress_notify.notified())
                .await;
        }
    }

    /// Block until the loop exits; re-raise its failure if it died with one.
    pub async fn await_termination(&self) -> Result<()> {
        while self.is_active() {
            let _ =
                tokio::time::timeout(WAIT_RECHECK, self.shared.termination.notified()).await;
        }
        match self.exception() {
            Some(cause) => Err(cause.into()),
            None => Ok(()),
        }
    }

    /// Like [`Self::await_termination`] but bounded: returns `!is_active()`
    /// once `timeout` elapses. The timeout must be positive.
    pub async fn await_termination_timeout(&self, timeout: Duration) -> Result<bool> {
        if timeout.is_zero() {
            return Err(EngineError::InvalidTimeout);
        }
        let deadline = Instant::now() + timeout;
        while self.is_active() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(WAIT_RECHECK);
            let _ = tokio::time::timeout(wait, self.shared.termination.notified()).await;
        }
        match self.exception() {
            Some(cause) => Err(cause.into()),
            None => Ok(!self.is_active()),
        }
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.wakeup.notify_waiters();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn run_loop(
    shared: Arc<Shared>,
    sources: Vec<Arc<dyn Source>>,
    sink: Arc<dyn Sink>,
    plan: Arc<dyn BatchQuery>,
    config: StreamConfig,
) {
    info!(query = %shared.name, "streaming execution started");
    let mut last_batch_start: Option<Instant> = None;

    loop {
        // Pace to the batch interval, but never sleep less than the floor.
        let gap = match last_batch_start {
            Some(started) => config
                .batch_interval
                .saturating_sub(started.elapsed())
                .max(config.min_batch_gap),
            None => config.min_batch_gap,
        };
        tokio::select! {
            _ = tokio::time::sleep(gap) => {}
            _ = shared.wakeup.notified() => {}
        }
        if !shared.active.load(Ordering::SeqCst) {
            break;
        }

        let batch_start = Instant::now();
        match run_one_batch(&shared, &sources, &sink, &plan, &config).await {
            Ok(committed) => {
                if committed {
                    last_batch_start = Some(batch_start);
                }
            }
            Err(e) => {
                let start_offset = shared.progress.lock().await.to_composite();
                error!(query = %shared.name, error = %e, "streaming execution failed");
                shared.set_death_cause(QueryError {
                    message: format!("streaming query '{}' failed", shared.name),
                    cause: Some(e.to_string()),
                    start_offset,
                    end_offset: None,
                });
                break;
            }
        }
    }

    shared.active.store(false, Ordering::SeqCst);
    shared.termination.notify_waiters();
    shared.progress_notify.notify_waiters();
    info!(
        query = %shared.name,
        batches = shared.batch_count.load(Ordering::SeqCst),
        "streaming execution terminated"
    );
}

/// Poll, execute, and commit one batch. `Ok(false)` means no source had
/// anything new.
async fn run_one_batch(
    shared: &Shared,
    sources: &[Arc<dyn Source>],
    sink: &Arc<dyn Sink>,
    plan: &Arc<dyn BatchQuery>,
    config: &StreamConfig,
) -> Result<bool> {
    let mut polled = Vec::with_capacity(sources.len());
    for (i, source) in sources.iter().enumerate() {
        let last = { shared.progress.lock().await.get(i).cloned() };
        polled.push(source.get_next_batch(last.as_ref()).await?);
    }
    if polled.iter().all(Option::is_none) {
        return Ok(false);
    }

    let mut end_offsets: Vec<Option<Offset>> = vec![None; sources.len()];
    let mut inputs = Vec::new();
    for (i, batch) in polled.into_iter().enumerate() {
        if let Some(batch) = batch {
            end_offsets[i] = Some(batch.end_offset);
            inputs.push(BatchInput {
                source: i,
                records: batch.records,
            });
        }
    }

    let batch_id = shared.batch_count.load(Ordering::SeqCst) + 1;
    let num_input_records = inputs.iter().map(|b| b.records.len() as u64).sum();
    let started = Instant::now();

    let output = plan.execute(batch_id, inputs).await?;
    let num_output_records = output.len() as u64;

    // Progress advance and sink commit are atomic with respect to readers of
    // the progress map. The sink commit is the one suspending call allowed
    // under this lock; the sink contract keeps it transactional and short.
    let batch_offset = {
        let mut progress = shared.progress.lock().await;
        for (i, end_offset) in end_offsets.into_iter().enumerate() {
            if let Some(end_offset) = end_offset {
                progress.update(i, end_offset)?;
            }
        }
        let batch_offset = progress.to_composite();
        sink.add_batch(batch_offset.clone(), output).await?;
        batch_offset
    };

    shared.batch_count.store(batch_id, Ordering::SeqCst);
    {
        let mut recent = shared
            .recent_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        recent.push_back(BatchInfo {
            id: batch_id,
            end_offset: batch_offset.clone(),
            num_input_records,
            num_output_records,
            processing_ms: started.elapsed().as_millis() as u64,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
        while recent.len() > config.max_retained_batches {
            recent.pop_front();
        }
    }
    shared.progress_notify.notify_waiters();

    debug!(
        query = %shared.name,
        batch = batch_id,
        offset = %batch_offset,
        records_in = num_input_records,
        records_out = num_output_records,
        "batch committed"
    );
    Ok(true)
}
