//! Crate-wide error type.
//!
//! One variant per error kind from the design's error-handling section.
//! Typed accessors (`evaluate_bool`, `evaluate_string`) never propagate these:
//! they apply the configured fallback policy instead. `evaluate` propagates.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlagrError {
    #[error("flag not found: {0}")]
    NotFound(String),

    #[error("invalid flag definition for {flag_key}: {reason}")]
    Validation { flag_key: String, reason: String },

    #[error("circuit breaker open, rejecting call")]
    CircuitOpen,

    #[error("upstream returned non-2xx status {status} for {path}")]
    UpstreamHttp { status: u16, path: String },

    #[error("network error talking to upstream: {0}")]
    Network(#[from] reqwest::Error),

    #[error("internal evaluation error: {0}")]
    Evaluation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("disk snapshot I/O error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("disk snapshot could not be parsed: {0}")]
    SnapshotFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlagrError>;
