//! Log directory manager
//!
//! Owns a directory of append-only log files named
//! `log-<startNanos>-<endNanos>`, where the two timestamps delimit the
//! rollover window the file was written in. The manager keeps at most one
//! active writer, rolls to a fresh file when the current one gets too big or
//! its window has passed, reads files back in ascending time order, and
//! deletes files whose window ended before a cleanup threshold.
//!
//! Writes are serialized by a mutex. Reads take a snapshot of the file list
//! and then run lock-free, tolerating concurrent deletion of already-closed
//! files.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tidemill_core::FileSegment;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reader::LogReader;
use crate::writer::LogWriter;

/// Configuration for a [`LogManager`].
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Directory the manager exclusively owns.
    pub directory: PathBuf,

    /// Time-based rollover: a new file is started for the first write after
    /// the current window ends.
    pub rotation_interval: Duration,

    /// Size-based rollover threshold in bytes.
    pub max_file_size: u64,
}

impl LogManagerConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            rotation_interval: Duration::from_secs(60),
            max_file_size: 16 * 1024 * 1024,
        }
    }
}

struct ActiveLog {
    writer: LogWriter,
    end_nanos: u128,
}

/// Write-ahead log over a directory of rotated files.
pub struct LogManager {
    config: LogManagerConfig,
    active: Mutex<Option<ActiveLog>>,
}

impl LogManager {
    /// Open a manager over `config.directory`, creating it if needed.
    pub async fn open(config: LogManagerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory).await?;
        info!(directory = %config.directory.display(), "log manager opened");
        Ok(Self {
            config,
            active: Mutex::new(None),
        })
    }

    /// Append one payload, rolling to a new file first when due.
    pub async fn write(&self, payload: &[u8]) -> Result<FileSegment> {
        let mut active = self.active.lock().await;

        let now = now_nanos();
        let log = match active.take() {
            Some(log)
                if now < log.end_nanos
                    && log.writer.position() < self.config.max_file_size =>
            {
                active.insert(log)
            }
            previous => {
                if let Some(log) = previous {
                    log.writer.close().await?;
                }
                let end = now + self.config.rotation_interval.as_nanos();
                let path = self.config.directory.join(format!("log-{now}-{end}"));
                debug!(path = %path.display(), "rolling to new log file");
                active.insert(ActiveLog {
                    writer: LogWriter::open(&path).await?,
                    end_nanos: end,
                })
            }
        };
        log.writer.write(payload).await
    }

    /// Lazily read every record in the directory, ascending by file start
    /// time. The file list is a snapshot taken now.
    pub async fn read_from_log(&self) -> Result<LogDirectoryReader> {
        let files = self.log_files().await?;
        Ok(LogDirectoryReader {
            files: files.into_iter().map(|(_, _, p)| p).collect(),
            current: None,
        })
    }

    /// Convenience wrapper collecting [`Self::read_from_log`] into a vector.
    pub async fn read_all(&self) -> Result<Vec<Bytes>> {
        let mut reader = self.read_from_log().await?;
        let mut out = Vec::new();
        while let Some(payload) = reader.next().await? {
            out.push(payload);
        }
        Ok(out)
    }

    /// Delete every closed file whose window ended before `threshold_nanos`.
    ///
    /// Idempotent; a file deleted by somebody else is not an error.
    pub async fn clear_old_logs(&self, threshold_nanos: u128) -> Result<()> {
        let active_path = {
            let active = self.active.lock().await;
            active.as_ref().map(|log| log.writer.path().to_path_buf())
        };

        for (_, end, path) in self.log_files().await? {
            if end >= threshold_nanos || Some(&path) == active_path.as_ref() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "old log file deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Flush and close the active writer. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(log) = active.take() {
            log.writer.close().await?;
        }
        Ok(())
    }

    /// Snapshot of the directory's log files as `(start, end, path)`,
    /// ascending by start time.
    async fn log_files(&self) -> Result<Vec<(u128, u128, PathBuf)>> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.directory).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            match parse_log_name(&name) {
                Some((start, end)) => files.push((start, end, entry.path())),
                None => warn!(file = %name, "ignoring non-log file in log directory"),
            }
        }
        files.sort_by_key(|(start, _, _)| *start);
        Ok(files)
    }
}

/// Concatenated forward reader over a snapshot of log files.
pub struct LogDirectoryReader {
    files: VecDeque<PathBuf>,
    current: Option<LogReader>,
}

impl LogDirectoryReader {
    /// Next record across all files, or `None` when the snapshot is drained.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(payload) = reader.next().await? {
                    return Ok(Some(payload));
                }
                self.current = None;
            }

            let Some(path) = self.files.pop_front() else {
                return Ok(None);
            };
            match LogReader::open(&path).await {
                Ok(reader) => self.current = Some(reader),
                Err(crate::error::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound =>
                {
                    // Deleted since the snapshot; skip it.
                    debug!(path = %path.display(), "log file vanished during read, skipping");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn parse_log_name(name: &str) -> Option<(u128, u128)> {
    let rest = name.strip_prefix("log-")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
