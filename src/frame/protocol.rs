//! # LZ4 Frame Constants and Types
//!
//! Core format definitions for the LZ4 frame layout:
//!
//! ```text
//! magic(4) | FLG(1) | BD(1) | HC(1) | block* | end mark(4) | [content checksum(4)]
//! block = size(4, LE, high bit = stored uncompressed) | data
//! ```

use crate::error::CodecError;

/// LZ4 frame magic number (little-endian on storage: 04 22 4D 18)
pub const LZ4_FRAME_MAGIC: u32 = 0x184D_2204;

/// Frame format version carried in the FLG byte (bits 7-6)
pub const LZ4_FRAME_VERSION: u8 = 0b01;

/// FLG: blocks are independent (no back-references across blocks)
pub const FLG_BLOCK_INDEPENDENT: u8 = 0x20;

/// FLG: every block is followed by a checksum
pub const FLG_BLOCK_CHECKSUM: u8 = 0x10;

/// FLG: content size field present in the header
pub const FLG_CONTENT_SIZE: u8 = 0x08;

/// FLG: content checksum follows the end mark
pub const FLG_CONTENT_CHECKSUM: u8 = 0x04;

/// FLG: dictionary id present in the header
pub const FLG_DICT_ID: u8 = 0x01;

/// Size of the header this encoder emits: magic(4) + FLG(1) + BD(1) + HC(1)
pub const FRAME_HEADER_SIZE: usize = 7;

/// Largest header the format allows (content size and dictionary id present)
pub const MAX_HEADER_SIZE: usize = 19;

/// Block size word
pub const BLOCK_HEADER_SIZE: usize = 4;

/// High bit of a block size word marks a stored (uncompressed) block
pub const BLOCK_UNCOMPRESSED_FLAG: u32 = 0x8000_0000;

/// End mark (a zero block size)
pub const END_MARK: u32 = 0;

/// End mark plus optional content checksum
pub const MAX_TRAILER_SIZE: usize = 8;

/// Maximum raw input handed to the codec per `update` call
pub const CHUNK_SIZE: usize = 4096;

/// Destination scratch buffer size
///
/// Must hold the worst-case output of one chunk. Checked when a
/// [`CompressionContext`](super::CompressionContext) is created.
pub const DEST_CAPACITY: usize = 5120;

/// Maximum uncompressed block size advertised in the BD byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockSize {
    #[default]
    Max64KB,
    Max256KB,
    Max1MB,
    Max4MB,
}

impl BlockSize {
    /// BD byte encoding (bits 6-4)
    pub fn code(self) -> u8 {
        match self {
            BlockSize::Max64KB => 4,
            BlockSize::Max256KB => 5,
            BlockSize::Max1MB => 6,
            BlockSize::Max4MB => 7,
        }
    }

    /// Decode a BD byte
    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            4 => Ok(BlockSize::Max64KB),
            5 => Ok(BlockSize::Max256KB),
            6 => Ok(BlockSize::Max1MB),
            7 => Ok(BlockSize::Max4MB),
            other => Err(CodecError::InvalidFrame(format!(
                "unsupported block size code {}",
                other
            ))),
        }
    }

    /// Maximum uncompressed bytes per block
    pub fn max_bytes(self) -> usize {
        match self {
            BlockSize::Max64KB => 64 * 1024,
            BlockSize::Max256KB => 256 * 1024,
            BlockSize::Max1MB => 1024 * 1024,
            BlockSize::Max4MB => 4 * 1024 * 1024,
        }
    }
}

/// Frame options chosen by the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramePreferences {
    /// Advertised maximum block size
    pub block_size: BlockSize,

    /// Append an xxHash32 of the uncompressed content after the end mark
    pub content_checksum: bool,
}

impl FramePreferences {
    /// FLG byte for these preferences
    ///
    /// Blocks are always independent; no block checksums, no content size,
    /// no dictionary.
    pub fn flg(&self) -> u8 {
        let mut flg = (LZ4_FRAME_VERSION << 6) | FLG_BLOCK_INDEPENDENT;
        if self.content_checksum {
            flg |= FLG_CONTENT_CHECKSUM;
        }
        flg
    }

    /// BD byte for these preferences
    pub fn bd(&self) -> u8 {
        self.block_size.code() << 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants() {
        assert_eq!(LZ4_FRAME_MAGIC.to_le_bytes(), [0x04, 0x22, 0x4D, 0x18]);
        assert_eq!(END_MARK.to_le_bytes(), [0, 0, 0, 0]);
        assert!(FRAME_HEADER_SIZE <= MAX_HEADER_SIZE);
        assert!(CHUNK_SIZE <= BlockSize::Max64KB.max_bytes());
    }

    #[test]
    fn test_default_descriptor_bytes() {
        let prefs = FramePreferences::default();
        assert_eq!(prefs.flg(), 0x60);
        assert_eq!(prefs.bd(), 0x40);
    }

    #[test]
    fn test_content_checksum_flag() {
        let prefs = FramePreferences {
            content_checksum: true,
            ..Default::default()
        };
        assert_eq!(prefs.flg(), 0x64);
    }

    #[test]
    fn test_block_size_codes() {
        for size in [
            BlockSize::Max64KB,
            BlockSize::Max256KB,
            BlockSize::Max1MB,
            BlockSize::Max4MB,
        ] {
            assert_eq!(BlockSize::from_code(size.code()).unwrap(), size);
        }
        assert!(BlockSize::from_code(3).is_err());
        assert!(BlockSize::from_code(8).is_err());
    }
}
