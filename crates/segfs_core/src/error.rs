//! Error types for segfs core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in segfs core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] segfs_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No clean segment was available to continue the log.
    #[error("out of space: {message}")]
    OutOfSpace {
        /// What ran out.
        message: String,
    },

    /// A checksum did not match the bytes it covers.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Checksum of the bytes read.
        actual: u32,
    },

    /// No valid super root could be located.
    #[error("corrupt super root: {message}")]
    CorruptSuperRoot {
        /// Description of what was tried.
        message: String,
    },

    /// An internal ordering rule of the constructor was broken.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Which rule.
        message: String,
    },

    /// Invalid on-disk format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The filesystem is mounted read-only or was degraded by a write failure.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// A file does not exist.
    #[error("inode {ino} not found")]
    NotFound {
        /// The missing inode number.
        ino: u64,
    },

    /// A block offset is beyond what the block map can address.
    #[error("block offset {blkoff} exceeds the maximum file size")]
    FileTooLarge {
        /// The offending block offset.
        blkoff: u64,
    },

    /// A wait gave up before the construction finished.
    #[error("interrupted while waiting for construction")]
    Interrupted,

    /// The segment constructor has stopped.
    #[error("segment constructor has shut down")]
    Shutdown,
}

impl CoreError {
    /// Creates an out-of-space error.
    pub fn out_of_space(message: impl Into<String>) -> Self {
        Self::OutOfSpace {
            message: message.into(),
        }
    }

    /// Creates a corrupt super root error.
    pub fn corrupt_super_root(message: impl Into<String>) -> Self {
        Self::CorruptSuperRoot {
            message: message.into(),
        }
    }

    /// Creates a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by the device rather than by the caller.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}

/// Why a construction failed, in a form every waiter can get a copy of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No clean segment was available.
    OutOfSpace,
    /// The device rejected a read or write.
    Io,
    /// The constructor broke one of its own ordering rules.
    ProtocolViolation,
    /// The filesystem is read-only.
    ReadOnly,
    /// The constructor stopped before serving the request.
    Shutdown,
    /// Anything else.
    Other,
}

/// A construction failure fanned out to the tickets it covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructionFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable cause.
    pub message: String,
}

impl From<&CoreError> for ConstructionFailure {
    fn from(err: &CoreError) -> Self {
        let kind = match err {
            CoreError::OutOfSpace { .. } => FailureKind::OutOfSpace,
            CoreError::Storage(_) | CoreError::Io(_) => FailureKind::Io,
            CoreError::ProtocolViolation { .. } => FailureKind::ProtocolViolation,
            CoreError::ReadOnly => FailureKind::ReadOnly,
            CoreError::Shutdown => FailureKind::Shutdown,
            _ => FailureKind::Other,
        };
        let message = match err {
            CoreError::OutOfSpace { message }
            | CoreError::ProtocolViolation { message }
            | CoreError::InvalidOperation { message } => message.clone(),
            CoreError::Io(inner) => inner.to_string(),
            other => other.to_string(),
        };
        Self { kind, message }
    }
}

impl From<ConstructionFailure> for CoreError {
    fn from(failure: ConstructionFailure) -> Self {
        match failure.kind {
            FailureKind::OutOfSpace => CoreError::OutOfSpace {
                message: failure.message,
            },
            FailureKind::Io => CoreError::Io(io::Error::new(io::ErrorKind::Other, failure.message)),
            FailureKind::ProtocolViolation => CoreError::ProtocolViolation {
                message: failure.message,
            },
            FailureKind::ReadOnly => CoreError::ReadOnly,
            FailureKind::Shutdown => CoreError::Shutdown,
            FailureKind::Other => CoreError::InvalidOperation {
                message: failure.message,
            },
        }
    }
}
