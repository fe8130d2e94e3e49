//! Error types and result handling for audit-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into the classes the logger reacts to:
//!
//! | Class | Check | Reaction |
//! |-------|-------|----------|
//! | Connection lost | [`Error::is_connection_lost`] | restart the pipeline after a backoff |
//! | Foreign key failure | [`Error::is_foreign_key_violation`] | skip the log row, keep the batch |
//! | Schema | `Error::Schema` | abort startup |
//! | Anything else | | roll back, stop the process |
//!
//! # Example
//!
//! ```rust
//! use audit_capture::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_connection_lost() => eprintln!("Will restart: {}", e),
//!     Err(e) => eprintln!("Fatal: {}", e),
//! }
//! ```

use std::io::ErrorKind;

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// The main error type for audit-capture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file or environment variables.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding instances or stream messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from the stream socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection to the audit store or the stream was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Tracked table metadata could not be resolved (missing or ambiguous
    /// primary key or relation).
    #[error("Schema error: {0}")]
    Schema(String),

    /// The stream source reported an error it did not classify further.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Invalid or malformed stream message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// The audit store rejected an operation.
    #[error("Audit store error: {0}")]
    Store(String),

    /// A log row referenced an origin that no longer exists.
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

impl Error {
    /// Whether the error means a connection went away and the whole pipeline
    /// should be restarted.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout { .. } => true,
            Error::Io(e) => io_connection_lost(e),
            Error::Postgres(e) => {
                if e.is_closed() {
                    return true;
                }
                if let Some(code) = e.code() {
                    return code.code().starts_with("08") || *code == SqlState::ADMIN_SHUTDOWN;
                }
                std::error::Error::source(e)
                    .and_then(|source| source.downcast_ref::<std::io::Error>())
                    .map(io_connection_lost)
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Whether the error is a foreign key failure raised while inserting a
    /// log row.
    pub fn is_foreign_key_violation(&self) -> bool {
        match self {
            Error::ForeignKeyViolation(_) => true,
            Error::Postgres(e) => e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION),
            _ => false,
        }
    }
}

fn io_connection_lost(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

/// A convenient Result type alias for audit-capture operations.
///
/// This is equivalent to `std::result::Result<T, audit_capture::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
