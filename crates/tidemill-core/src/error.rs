//! Core error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot compare offsets of different kinds: {0} vs {1}")]
    IncomparableOffsets(String, String),

    #[error("cannot compare composite offsets of different arity: {0} vs {1}")]
    ArityMismatch(usize, usize),

    #[error("composite offsets {0} and {1} are not ordered")]
    UnorderedOffsets(String, String),

    #[error("invalid value for property {key}: {value}")]
    InvalidProperty { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomparable_display() {
        let err = Error::IncomparableOffsets("5".to_string(), "[1, 2]".to_string());
        assert_eq!(
            err.to_string(),
            "cannot compare offsets of different kinds: 5 vs [1, 2]"
        );
    }

    #[test]
    fn test_invalid_property_display() {
        let err = Error::InvalidProperty {
            key: "batchIntervalMs".to_string(),
            value: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for property batchIntervalMs: abc"
        );
    }
}
