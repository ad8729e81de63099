//! Error types for registry streaming and logging.
//!
//! All errors implement the `std::error::Error` trait. The taxonomy follows the
//! lifecycle of a connection:
//!
//! - **Handshake-time errors** (`Schema`, `ProtocolVersion`, `CorruptHandshake`)
//!   are connection-fatal and reject the peer before any data flows.
//! - **Setup errors** (`Configuration`) surface before streaming starts, never
//!   mid-stream.
//! - **Per-frame errors** (`Decode`, `ClockOrder`) are recoverable: the affected
//!   frame or sample is dropped and streaming continues.
//! - **Transport errors** (`Connection`, `Timeout`) close the connection and
//!   raise a disconnect notification; reconnection is an explicit caller action.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for streaming operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for registry streaming operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Invalid registry schema: {reason}")]
    Schema { reason: String },

    #[error("Protocol version mismatch: expected {expected}, found {found}")]
    ProtocolVersion { expected: u32, found: u32 },

    #[error("Corrupt handshake: {details}")]
    CorruptHandshake { details: String },

    #[error("Configuration error: {details}")]
    Configuration { details: String },

    #[error("Failed to decode segment: {details}")]
    Decode { details: String },

    #[error("Out-of-order timestamp sample: {sample} is before {previous}")]
    ClockOrder { previous: i64, sample: i64 },

    #[error("Connection failed: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Log file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    /// Returns whether this error terminates the connection.
    ///
    /// Per-frame errors (`Decode`) and per-sample errors (`ClockOrder`) are
    /// recoverable: the offending data is dropped and streaming continues.
    /// Everything else either rejects the connection before data flows or
    /// closes it.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            StreamError::Schema { .. } => true,
            StreamError::ProtocolVersion { .. } => true,
            StreamError::CorruptHandshake { .. } => true,
            StreamError::Configuration { .. } => true,
            StreamError::Connection { .. } => true,
            StreamError::Timeout { .. } => true,
            StreamError::File { .. } => true,
            StreamError::Decode { .. } => false,
            StreamError::ClockOrder { .. } => false,
        }
    }

    /// Helper constructor for schema validation errors.
    pub fn schema(reason: impl Into<String>) -> Self {
        StreamError::Schema { reason: reason.into() }
    }

    /// Helper constructor for corrupt handshake blobs.
    pub fn corrupt_handshake(details: impl Into<String>) -> Self {
        StreamError::CorruptHandshake { details: details.into() }
    }

    /// Helper constructor for setup-time configuration faults.
    pub fn configuration(details: impl Into<String>) -> Self {
        StreamError::Configuration { details: details.into() }
    }

    /// Helper constructor for segment decode failures.
    pub fn decode(details: impl Into<String>) -> Self {
        StreamError::Decode { details: details.into() }
    }

    /// Helper constructor for connection failures.
    pub fn connection(reason: impl Into<String>) -> Self {
        StreamError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection failures with an underlying cause.
    pub fn connection_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        StreamError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for log file errors with path context.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StreamError::File { path: path.into(), source }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Connection { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}
