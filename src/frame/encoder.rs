//! # LZ4 Frame Encoder
//!
//! Turns a sequence of raw chunks into one LZ4 frame.
//!
//! A [`CompressionContext`] is driven through `begin`, any number of
//! `update` calls and `end`. Every call returns a slice of the context's own
//! scratch buffer which the caller writes to storage before the next call.
//! The context can start a new frame after `end`, so one allocation can be
//! reused across many files.

use lz4_flex::block;
use tracing::trace;

use super::checksum::{header_checksum, ContentHasher};
use super::protocol::*;
use crate::error::CodecError;

/// Where the context is in the frame it is producing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Open,
    Ended,
}

/// Compression state for one frame at a time
pub struct CompressionContext {
    prefs: FramePreferences,
    state: FrameState,
    dest: Box<[u8]>,
    hasher: ContentHasher,
    last: Option<BlockUndo>,
    blocks: u64,
    bytes_in: u64,
    bytes_out: u64,
}

/// State needed to take back the most recent block
struct BlockUndo {
    hasher: Option<ContentHasher>,
    raw: u64,
    encoded: u64,
}

impl std::fmt::Debug for CompressionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionContext")
            .field("prefs", &self.prefs)
            .field("state", &self.state)
            .field("blocks", &self.blocks)
            .finish_non_exhaustive()
    }
}

/// Worst-case size of one encoded chunk (size word + compressed data)
pub fn chunk_output_bound() -> usize {
    BLOCK_HEADER_SIZE + block::get_maximum_output_size(CHUNK_SIZE)
}

impl CompressionContext {
    /// Create a context with its scratch buffer
    ///
    /// # Errors
    ///
    /// Returns `DestinationTooSmall` if [`DEST_CAPACITY`] cannot hold the
    /// frame header, the trailer, or the worst-case output of one chunk.
    pub fn new(prefs: FramePreferences) -> Result<Self, CodecError> {
        let required = chunk_output_bound()
            .max(MAX_HEADER_SIZE)
            .max(MAX_TRAILER_SIZE);
        if DEST_CAPACITY < required {
            return Err(CodecError::DestinationTooSmall {
                capacity: DEST_CAPACITY,
                required,
            });
        }

        Ok(Self {
            prefs,
            state: FrameState::Idle,
            dest: vec![0u8; DEST_CAPACITY].into_boxed_slice(),
            hasher: ContentHasher::new(),
            last: None,
            blocks: 0,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    /// Preferences this context encodes with
    pub fn preferences(&self) -> FramePreferences {
        self.prefs
    }

    /// Start a new frame and return its header
    ///
    /// Resets all per-frame state, so a context that finished (or abandoned)
    /// a previous frame can be reused directly.
    pub fn begin(&mut self) -> Result<&[u8], CodecError> {
        self.hasher.reset();
        self.last = None;
        self.blocks = 0;
        self.bytes_in = 0;
        self.bytes_out = 0;

        let descriptor = [self.prefs.flg(), self.prefs.bd()];
        self.dest[..4].copy_from_slice(&LZ4_FRAME_MAGIC.to_le_bytes());
        self.dest[4..6].copy_from_slice(&descriptor);
        self.dest[6] = header_checksum(&descriptor);

        self.state = FrameState::Open;
        self.bytes_out += FRAME_HEADER_SIZE as u64;
        Ok(&self.dest[..FRAME_HEADER_SIZE])
    }

    /// Compress one chunk into a block
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes, at most [`CHUNK_SIZE`]
    ///
    /// # Returns
    ///
    /// * `&[u8]` - Encoded block, empty when `data` is empty
    ///
    /// # Errors
    ///
    /// Returns `NotStarted` outside of `begin`/`end`, `ChunkTooLarge` for
    /// oversized input and `Compress` when block compression fails.
    pub fn update(&mut self, data: &[u8]) -> Result<&[u8], CodecError> {
        if self.state != FrameState::Open {
            return Err(CodecError::NotStarted);
        }
        if data.len() > CHUNK_SIZE {
            return Err(CodecError::ChunkTooLarge {
                len: data.len(),
                max: CHUNK_SIZE,
            });
        }
        if data.is_empty() {
            return Ok(&[]);
        }

        let compressed = block::compress_into(data, &mut self.dest[BLOCK_HEADER_SIZE..])
            .map_err(|e| CodecError::Compress(e.to_string()))?;

        // Incompressible input is stored as-is
        let (size_word, body_len) = if compressed >= data.len() {
            self.dest[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + data.len()].copy_from_slice(data);
            (data.len() as u32 | BLOCK_UNCOMPRESSED_FLAG, data.len())
        } else {
            (compressed as u32, compressed)
        };
        self.dest[..BLOCK_HEADER_SIZE].copy_from_slice(&size_word.to_le_bytes());
        let total = BLOCK_HEADER_SIZE + body_len;

        let saved = if self.prefs.content_checksum {
            let before = self.hasher.clone();
            self.hasher.update(data);
            Some(before)
        } else {
            None
        };
        self.last = Some(BlockUndo {
            hasher: saved,
            raw: data.len() as u64,
            encoded: total as u64,
        });
        self.blocks += 1;
        self.bytes_in += data.len() as u64;
        self.bytes_out += total as u64;

        trace!("Encoded block {}: {} -> {} bytes", self.blocks, data.len(), total);
        Ok(&self.dest[..total])
    }

    /// Finish the frame and return the trailer
    ///
    /// The trailer is the end mark, followed by the content checksum when
    /// enabled. The context must see `begin` again before the next `update`.
    pub fn end(&mut self) -> Result<&[u8], CodecError> {
        if self.state != FrameState::Open {
            return Err(CodecError::NotStarted);
        }

        self.dest[..4].copy_from_slice(&END_MARK.to_le_bytes());
        let mut len = 4;
        if self.prefs.content_checksum {
            self.dest[4..8].copy_from_slice(&self.hasher.digest().to_le_bytes());
            len += 4;
        }

        self.state = FrameState::Ended;
        self.last = None;
        self.bytes_out += len as u64;
        Ok(&self.dest[..len])
    }

    /// Take back the block returned by the last `update`
    ///
    /// For when that block never reached storage: the frame then continues
    /// as if the chunk had not been given, and the content checksum only
    /// covers blocks that were written. Does nothing if there is no block to
    /// take back.
    pub fn rollback(&mut self) {
        let Some(undo) = self.last.take() else {
            return;
        };
        if let Some(hasher) = undo.hasher {
            self.hasher = hasher;
        }
        self.blocks -= 1;
        self.bytes_in -= undo.raw;
        self.bytes_out -= undo.encoded;
        trace!("Rolled back block {}", self.blocks + 1);
    }

    /// Number of blocks emitted in the current frame
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Raw bytes consumed by the current frame
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Encoded bytes produced for the current frame, header and trailer included
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}
