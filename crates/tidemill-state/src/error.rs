//! State store error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("missing delta file for version {version}: {path}")]
    MissingDelta { version: u64, path: PathBuf },
}

pub type Result<T> = std::result::Result<T, Error>;
