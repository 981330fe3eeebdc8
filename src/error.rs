//! Error types for MelShare

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for named map operations
pub type Result<T> = std::result::Result<T, MapError>;

/// Errors that can occur in named map operations
///
/// `Clone` so a degraded handle can report the failure that degraded it on
/// every later call.
#[derive(Debug, Clone, Error)]
pub enum MapError {
    /// Failed to create, open, size or map a shared memory object
    #[error("Failed to open or create shared memory '{name}': {source}")]
    Segment {
        name: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Name cannot be used as a shared memory identity
    #[error("Invalid map name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Name too long for the OS namespace
    #[error("Map name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Capacity cannot hold even the length prefix
    #[error("Invalid capacity: need at least {min} bytes, got {got}")]
    InvalidCapacity { min: usize, got: usize },

    /// The OS refused a lock operation
    #[error("Lock '{name}' {op} failed: {source}")]
    Lock {
        name: String,
        op: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    /// Lock was not acquired before the timeout elapsed
    #[error("Timed out after {timeout_ms} ms waiting for lock '{name}'")]
    LockTimeout { name: String, timeout_ms: u128 },

    /// A previous holder died while holding the lock
    #[error("Lock '{name}' was abandoned by a terminated holder; contents may be inconsistent")]
    LockAbandoned { name: String },

    /// Frame does not fit in the segment
    #[error("Payload too large: max {max} bytes, got {got} bytes")]
    PayloadTooLarge { max: usize, got: usize },

    /// Frame in the segment does not match the requested interpretation
    #[error("Corrupt frame: {reason}")]
    CorruptFrame { reason: String },

    /// Segment access outside its capacity
    #[error("Out of range: offset {offset} + len {len} exceeds capacity {capacity}")]
    OutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// Payload cannot be encoded into a frame
    #[error("Cannot encode payload: {reason}")]
    Encode { reason: &'static str },

    /// Handle was closed
    #[error("Map handle is closed")]
    HandleClosed,

    /// Name was never opened in the registry
    #[error("Map '{0}' is not open")]
    NotOpen(String),
}

impl MapError {
    pub(crate) fn segment(name: &str, source: impl Into<io::Error>) -> Self {
        Self::Segment {
            name: name.to_string(),
            source: Arc::new(source.into()),
        }
    }

    pub(crate) fn lock(name: &str, op: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Lock {
            name: name.to_string(),
            op,
            source: Arc::new(source.into()),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptFrame {
            reason: reason.into(),
        }
    }
}

/// Errors from the point-to-point datagram link
#[derive(Debug, Error)]
pub enum NetError {
    /// Failed to bind the local socket
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Socket I/O failure
    #[error("UDP I/O error: {0}")]
    Io(#[from] io::Error),

    /// Send or receive timed out
    #[error("UDP operation timed out")]
    Timeout,

    /// Non-blocking socket had nothing to deliver
    #[error("No datagram ready")]
    NotReady,

    /// Datagram does not match the expected frame
    #[error("Malformed datagram: {reason}")]
    Malformed { reason: String },

    /// Datagram exceeds the UDP payload limit
    #[error("Datagram too large: max {max} bytes, got {got} bytes")]
    TooLarge { max: usize, got: usize },
}
