//! Error types for StageKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using StageError
pub type Result<T> = std::result::Result<T, StageError>;

/// Unified error type for StageKV operations
#[derive(Debug, Error)]
pub enum StageError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Peer disconnected: {0}")]
    Disconnected(String),

    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Record of {len} bytes does not fit in {capacity} bytes")]
    RecordTooLarge { len: usize, capacity: usize },

    #[error("Server rejected request: {0}")]
    Rejected(String),

    // -------------------------------------------------------------------------
    // Staging Region Errors
    // -------------------------------------------------------------------------
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Store error: {0}")]
    Store(String),

    #[error("Log write of {len} bytes exceeds log capacity {capacity}")]
    LogCapacity { len: u64, capacity: u64 },

    // -------------------------------------------------------------------------
    // Flush Pipeline Errors
    // -------------------------------------------------------------------------
    #[error("Flush pipeline is closed")]
    PipelineClosed,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
