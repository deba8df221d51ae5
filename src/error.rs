//! # Error Types
//!
//! Custom error types for the GNSS-R logger using `thiserror`.

use std::path::PathBuf;
use thiserror::Error;

/// Frame codec failures
///
/// Any of these leaves the current frame unusable. The stream that owns the
/// context has to be abandoned.
#[derive(Debug, Error)]
pub enum CodecError {
    /// `update` or `end` called before `begin`
    #[error("frame not started")]
    NotStarted,

    /// Input chunk is larger than the codec accepts per call
    #[error("chunk of {len} bytes exceeds maximum {max}")]
    ChunkTooLarge { len: usize, max: usize },

    /// Destination buffer cannot hold the worst-case output
    #[error("destination buffer of {capacity} bytes is smaller than required {required}")]
    DestinationTooSmall { capacity: usize, required: usize },

    /// Block compression failed
    #[error("block compression failed: {0}")]
    Compress(String),

    /// Malformed frame while decoding
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Main error type for the GNSS-R logger
#[derive(Debug, Error)]
pub enum LoggerError {
    /// Frame codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// `open` called while another stream is still open
    #[error("Stream already open: {}", .0.display())]
    AlreadyOpen(PathBuf),

    /// `write` or `close` called without an open stream
    #[error("No stream is open")]
    NotOpen,

    /// A partial block could not be removed from the temporary file
    #[error("Partial block left in {}", .0.display())]
    Corrupted(PathBuf),

    /// No free file name left for a new log file
    #[error("File name already taken: {}", .0.display())]
    NameCollision(PathBuf),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Default configuration could not be serialized
    #[error("Configuration write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// GNSS receiver errors
    #[error("GNSS error: {0}")]
    Gnss(String),

    /// User button errors
    #[error("Button error: {0}")]
    Button(String),

    /// Upload errors
    #[error("Upload error: {0}")]
    Upload(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the GNSS-R logger
pub type Result<T> = std::result::Result<T, LoggerError>;
