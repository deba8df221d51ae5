//! # Storage Module
//!
//! Durable, compressed log files on local storage.
//!
//! This module handles:
//! - Buffering record bytes into fixed-size chunks
//! - Writing LZ4 frames through a temporary file
//! - Atomic rename onto the final name when a file is closed
//! - Data/archive directory setup and stale temporary file sweeps

pub mod buffer;
pub mod paths;
pub mod writer;

pub use buffer::StreamBuffer;
pub use writer::{ContextMode, StreamWriter, WriterStats};
