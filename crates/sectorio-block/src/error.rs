//! Block layer error types

use std::io;
use thiserror::Error;

/// Block layer error
#[derive(Error, Debug)]
pub enum BlockError {
    /// The handle has been disconnected; no further operations are possible
    #[error("device is disconnected")]
    Disconnected,

    /// Write or discard attempted on a handle opened read-only
    #[error("device is read-only")]
    ReadOnly,

    /// Capability unavailable on this backend
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Offset out of bounds
    #[error("offset {offset} + length {length} exceeds device size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// OS-level failure, carrying the full syscall context. This is the only
    /// wrapper between physical I/O and the caller; retry policy belongs to
    /// the caller.
    #[error("{op} failed on {path} at offset {offset} (length {length}): {source}")]
    Unknown {
        op: &'static str,
        path: String,
        offset: u64,
        length: u64,
        #[source]
        source: io::Error,
    },
}

impl BlockError {
    /// Wrap an OS error with its syscall context
    pub fn unknown(
        op: &'static str,
        path: impl Into<String>,
        offset: u64,
        length: u64,
        source: io::Error,
    ) -> Self {
        Self::Unknown {
            op,
            path: path.into(),
            offset,
            length,
            source,
        }
    }

    /// Create an unsupported-capability error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_display_carries_context() {
        let err = BlockError::unknown(
            "read",
            "/dev/vdb",
            4096,
            512,
            io::Error::new(io::ErrorKind::UnexpectedEof, "end of file"),
        );
        let msg = err.to_string();
        assert!(msg.contains("read"));
        assert!(msg.contains("/dev/vdb"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("512"));
        assert!(msg.contains("end of file"));
    }
}
