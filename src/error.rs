//! # Error Types
//!
//! One error enum covers the session protocol, the stored-record layer and
//! the transport underneath them.

use thiserror::Error;

/// Main error type for vault operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Malformed or out-of-sequence message
    #[error("Protocol error: {0}")]
    Malformed(String),

    /// Message arrived in a state that does not accept it
    #[error("Unexpected message in state {state}: {detail}")]
    UnexpectedMessage {
        state: String,
        detail: String,
    },

    /// Challenge token or echo did not verify
    #[error("Challenge failure on {label}")]
    ChallengeFailure {
        label: String,
    },

    /// Explicit rejection from the server, reason kept verbatim
    #[error("{0}")]
    AuthenticationRejected(String),

    /// Stored record failed its integrity check
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Index outside a block's declared capacity
    #[error("Index {index} out of range for capacity {capacity}")]
    OutOfRangeAccess {
        index: usize,
        capacity: usize,
    },

    /// Invalid or unsupported configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid protocol magic bytes
    #[error("Invalid protocol magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        expected: [u8; 4],
        actual: [u8; 4],
    },

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Message too large
    #[error("Message exceeds maximum size: {size} > {max}")]
    MessageTooLarge {
        size: usize,
        max: usize,
    },

    /// CRC mismatch
    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        expected: u32,
        actual: u32,
    },

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Key exchange failed
    #[error("Key exchange failed: {0}")]
    KeyExchangeError(String),

    /// Intent issued in a state that cannot serve it
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: String,
        to: String,
    },

    /// Blocking worker panicked or was cancelled
    #[error("Worker task failed: {0}")]
    WorkerFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for vault operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::SerializationError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ProtocolError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProtocolError::WorkerFailed(e.to_string())
    }
}

impl ProtocolError {
    /// Malformed, out-of-sequence or unauthenticated protocol traffic.
    ///
    /// A challenge failure is a protocol violation like any other.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_)
                | ProtocolError::UnexpectedMessage { .. }
                | ProtocolError::ChallengeFailure { .. }
        )
    }

    /// Whether the connection must be torn down after this error.
    ///
    /// Rejections leave the connection usable so credentials can be retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::AuthenticationRejected(_)
                | ProtocolError::OutOfRangeAccess { .. }
                | ProtocolError::InvalidStateTransition { .. }
        )
    }
}
