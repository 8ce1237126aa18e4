//! Write-ahead log error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log writer is invalid after a failed write")]
    WriterInvalid,

    #[error("segment length mismatch: segment says {expected} bytes, log file says {found}")]
    SegmentLengthMismatch { expected: u64, found: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
