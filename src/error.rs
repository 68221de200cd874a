//! # Error Types
//!
//! Comprehensive error handling for the messaging layer.
//!
//! This module defines all error variants that can occur during session
//! operations, from low-level I/O failures to per-message format violations.
//!
//! ## Error Categories
//! - **Config Errors**: topology/box-count mismatches, invalid settings — fatal at `start()`
//! - **Security Errors**: key derivation and TLS handshake failures — fatal per connection
//! - **Format Errors**: malformed frames, length mismatches — the message is dropped, the loop continues
//! - **Transient I/O**: read timeouts, single dropped datagrams — logged, the loop continues
//! - **Fatal I/O**: socket resets, unrecoverable connects — the owning loop stops
//!
//! All errors implement `std::error::Error` for interoperability.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Queue errors
    pub const ERR_BOX_FULL: &str = "Message box is full";
    pub const ERR_MESSAGE_TOO_LARGE: &str = "Message exceeds per-box byte limit";

    /// Frame validation errors
    pub const ERR_INVALID_FRAME: &str = "Invalid frame structure";
    pub const ERR_LENGTH_MISMATCH: &str = "Declared frame length does not match bytes consumed";
    pub const ERR_OVERSIZED_FRAME: &str = "Frame exceeds maximum size";
    pub const ERR_UNKNOWN_TYPE_TAG: &str = "Unknown message type tag";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TIMEOUT: &str = "Operation timed out";
    pub const ERR_ACK_TIMEOUT: &str = "No acknowledgement received before deadline";

    /// Security errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_PEER_NAME_MISMATCH: &str = "Peer certificate name does not match expected name";

    /// Handshake errors
    pub const ERR_PROBE_TOKEN_MISMATCH: &str = "Probe reply token does not match";
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
}

// CommError is the primary error type for all session operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum CommError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Serialization(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Fatal I/O error: {0}")]
    FatalIo(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("No acknowledgement received before deadline")]
    AckTimeout,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl CommError {
    /// Whether a background loop should keep running after this error.
    ///
    /// Per-message problems (malformed frames, timeouts with no data) are
    /// recoverable; everything touching the socket itself is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CommError::Format(_) | CommError::TransientIo(_) | CommError::Timeout
        )
    }
}

/// Type alias for Results using CommError
pub type Result<T> = std::result::Result<T, CommError>;
