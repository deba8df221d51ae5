//! # LZ4 Frame Codec
//!
//! Implementation of the LZ4 frame format used for the on-storage log files.
//!
//! This module handles:
//! - Frame header encoding (magic number, descriptor, header checksum)
//! - Chunk-wise block compression with a bounded scratch buffer
//! - Frame end mark and optional content checksum
//! - Decoding and verification of finished frames

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod checksum;

pub use encoder::CompressionContext;
pub use protocol::{BlockSize, FramePreferences, CHUNK_SIZE, DEST_CAPACITY};
