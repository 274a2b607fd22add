//! Error types for the minibatch engine.

use thiserror::Error;

/// Result type alias for reader and assembler operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Main error type for minibatch construction.
///
/// Every reader-level failure propagates synchronously to the
/// `next_minibatch` caller; there is no internal retry. Retry/restart
/// policy is a caller concern.
#[derive(Error, Debug)]
pub enum DataError {
    /// Bad static configuration. Non-retryable, fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed source record. Fails the current epoch; the caller may
    /// recover by restarting the epoch.
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Schema/data mismatch. The declared stream dimension is never
    /// silently truncated or padded to fit the data. Epoch-fatal.
    #[error("Dimension mismatch for stream '{stream}': declared {expected}, got {actual}")]
    DimensionMismatch {
        stream: String,
        expected: usize,
        actual: usize,
    },

    /// Lookup of a stream name that was never registered. Caller
    /// programming error.
    #[error("Unknown stream: '{0}'")]
    UnknownStream(String),

    /// Access to a reader after its underlying source was closed.
    #[error("Source is closed")]
    SourceClosed,

    /// I/O errors from the underlying file or stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decode failures from the image deserializer.
    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),
}

impl DataError {
    /// Convenience constructor for parse failures carrying a line number.
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
