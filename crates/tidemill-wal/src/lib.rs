//! Write-ahead log for the tidemill streaming engine
//!
//! A directory of append-only files, each a plain sequence of
//! `[u32 length][payload]` frames with no header, footer, or checksum:
//! integrity comes from the underlying append-only file system, and a torn
//! tail is read as a clean end of log.
//!
//! Three layers:
//! - [`LogWriter`] / [`LogReader`]: one file, sequential.
//! - [`read_segment`]: random access to one record via its [`FileSegment`].
//! - [`LogManager`]: rotation, ordered directory reads, cleanup.

pub mod error;
pub mod manager;
pub mod reader;
pub mod writer;

pub use error::{Error, Result};
pub use manager::{LogDirectoryReader, LogManager, LogManagerConfig};
pub use reader::{read_segment, LogReader};
pub use writer::LogWriter;

pub use tidemill_core::FileSegment;
