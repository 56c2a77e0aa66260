//! Custom error types for the application.
//!
//! This module defines the primary error type, `SweepError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur
//! while preparing and executing a run.
//!
//! ## Error Hierarchy
//!
//! `SweepError` consolidates the error sources of the run pipeline:
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`Configuration`**: Semantic configuration errors caught before a run
//!   starts, such as a VNA readout set that does not match the active trace
//!   format, or a duration estimate requested for an unconfigured mode. These
//!   are reported to the operator and the run does not start.
//! - **`Io`**: Wraps standard `std::io::Error` for file and path handling.
//! - **`Instrument`**: General failures originating from instrument adapters.
//! - **`ChecksumMismatch` / `ShortResponse` / `MalformedResponse`**: Transient
//!   instrument defects from serial framing. Surfaced to the caller, never
//!   retried automatically.
//! - **`ResourceExhausted`**: Fatal allocation failures in acquisition
//!   hardware. No retry.
//! - **`Storage`**: Failures while opening, appending to, or closing a run
//!   record.
//!
//! User interruption is deliberately *not* an error variant: it is recovered
//! locally by the acquisition loop, which finalizes the run and reports a
//! `RunState::Interrupted` outcome instead.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Checksum mismatch in response from {device}")]
    ChecksumMismatch { device: String },

    #[error("Short response from {device}: expected {expected} bytes, got {got}")]
    ShortResponse {
        device: String,
        expected: usize,
        got: usize,
    },

    #[error("Malformed response from {device}: {detail}")]
    MalformedResponse { device: String, detail: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}
