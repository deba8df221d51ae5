//! # LZ4 Frame Decoder
//!
//! Decodes and verifies frames written by the encoder. Used to check
//! finished log files before they are uploaded.

use std::fs;
use std::path::Path;

use lz4_flex::block;

use super::checksum::{header_checksum, ContentHasher};
use super::protocol::*;
use crate::error::{CodecError, LoggerError, Result};

/// Decode one complete frame
///
/// # Arguments
///
/// * `frame` - Frame bytes from magic number to end mark (and checksum)
///
/// # Returns
///
/// * `Result<Vec<u8>>` - The uncompressed content
///
/// # Errors
///
/// Returns `InvalidFrame` if:
/// - Magic number, version or header checksum is wrong
/// - Linked blocks, block checksums or dictionaries are used
/// - A block is truncated or fails to decompress
/// - The end mark is missing or the content checksum does not match
pub fn decode_frame(frame: &[u8]) -> std::result::Result<Vec<u8>, CodecError> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(invalid("frame too short"));
    }

    let magic = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if magic != LZ4_FRAME_MAGIC {
        return Err(invalid(format!("bad magic number 0x{:08X}", magic)));
    }

    let flg = frame[4];
    let bd = frame[5];
    if flg >> 6 != LZ4_FRAME_VERSION {
        return Err(invalid(format!("unsupported version {}", flg >> 6)));
    }
    if flg & FLG_BLOCK_INDEPENDENT == 0 {
        return Err(invalid("linked blocks are not supported"));
    }
    if flg & (FLG_BLOCK_CHECKSUM | FLG_CONTENT_SIZE | FLG_DICT_ID) != 0 {
        return Err(invalid(format!("unsupported flags 0x{:02X}", flg)));
    }
    let block_size = BlockSize::from_code((bd >> 4) & 0x07)?;

    let expected_hc = header_checksum(&[flg, bd]);
    if frame[6] != expected_hc {
        return Err(invalid(format!(
            "header checksum mismatch: expected 0x{:02X}, got 0x{:02X}",
            expected_hc, frame[6]
        )));
    }

    let content_checksum = flg & FLG_CONTENT_CHECKSUM != 0;
    let mut hasher = ContentHasher::new();
    let mut scratch = vec![0u8; block_size.max_bytes()];
    let mut content = Vec::new();
    let mut pos = FRAME_HEADER_SIZE;

    loop {
        let word = read_u32(frame, pos).ok_or_else(|| invalid("missing end mark"))?;
        pos += BLOCK_HEADER_SIZE;
        if word == END_MARK {
            break;
        }

        let stored = word & BLOCK_UNCOMPRESSED_FLAG != 0;
        let len = (word & !BLOCK_UNCOMPRESSED_FLAG) as usize;
        if len > block_size.max_bytes() {
            return Err(invalid(format!("block of {} bytes exceeds maximum", len)));
        }
        let body = frame
            .get(pos..pos + len)
            .ok_or_else(|| invalid("truncated block"))?;
        pos += len;

        let raw = if stored {
            body
        } else {
            let n = block::decompress_into(body, &mut scratch)
                .map_err(|e| invalid(format!("block decompression failed: {}", e)))?;
            &scratch[..n]
        };
        if content_checksum {
            hasher.update(raw);
        }
        content.extend_from_slice(raw);
    }

    if content_checksum {
        let stored = read_u32(frame, pos).ok_or_else(|| invalid("missing content checksum"))?;
        if stored != hasher.digest() {
            return Err(invalid("content checksum mismatch"));
        }
        pos += 4;
    }

    if pos != frame.len() {
        return Err(invalid(format!(
            "{} trailing bytes after frame end",
            frame.len() - pos
        )));
    }

    Ok(content)
}

/// Read and decode a finished log file
///
/// # Errors
///
/// Returns `Io` when the file cannot be read and `Codec` when it does not
/// hold a complete frame.
pub fn decode_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    decode_frame(&bytes).map_err(LoggerError::from)
}

/// Check that a file holds one complete, decodable frame
pub fn verify_file<P: AsRef<Path>>(path: P) -> Result<()> {
    decode_file(path).map(|_| ())
}

fn read_u32(bytes: &[u8], pos: usize) -> Option<u32> {
    let b = bytes.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn invalid(msg: impl Into<String>) -> CodecError {
    CodecError::InvalidFrame(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CompressionContext;

    fn encode(content_checksum: bool, chunks: &[&[u8]]) -> Vec<u8> {
        let prefs = FramePreferences {
            content_checksum,
            ..Default::default()
        };
        let mut ctx = CompressionContext::new(prefs).unwrap();
        let mut out = ctx.begin().unwrap().to_vec();
        for chunk in chunks {
            out.extend_from_slice(ctx.update(chunk).unwrap());
        }
        out.extend_from_slice(ctx.end().unwrap());
        out
    }

    #[test]
    fn test_decode_empty_frame() {
        let frame = encode(false, &[]);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 4);
        assert!(decode_frame(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_decode_with_content_checksum() {
        let frame = encode(true, &[b"$GPRMC,A\n", b"$GPGSV,B\n"]);
        assert_eq!(decode_frame(&frame).unwrap(), b"$GPRMC,A\n$GPGSV,B\n");
    }

    #[test]
    fn test_decode_frame_too_short() {
        assert!(decode_frame(&[0x04, 0x22]).is_err());
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut frame = encode(false, &[b"$GPRMC,A\n"]);
        frame[0] = 0xFF;
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_decode_bad_header_checksum() {
        let mut frame = encode(false, &[b"$GPRMC,A\n"]);
        frame[6] ^= 0xFF;
        match decode_frame(&frame) {
            Err(CodecError::InvalidFrame(msg)) => assert!(msg.contains("header checksum")),
            other => panic!("Expected InvalidFrame, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_end_mark() {
        // What a crash before close leaves behind: header and blocks only
        let frame = encode(false, &[b"$GPRMC,A\n"]);
        let truncated = &frame[..frame.len() - 4];
        match decode_frame(truncated) {
            Err(CodecError::InvalidFrame(msg)) => assert!(msg.contains("end mark")),
            other => panic!("Expected InvalidFrame, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_corrupted_content() {
        let mut frame = encode(true, &[b"$GPRMC,A\n"]);
        // Flip a byte of the stored block body
        frame[FRAME_HEADER_SIZE + BLOCK_HEADER_SIZE] ^= 0x01;
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        for checksum in [false, true] {
            let mut frame = encode(checksum, &[b"$GPRMC,A\n"]);
            frame.extend_from_slice(b"junk");
            match decode_frame(&frame) {
                Err(CodecError::InvalidFrame(msg)) => assert!(msg.contains("trailing")),
                other => panic!("Expected InvalidFrame, got: {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_lz4_flex_frame() {
        use std::io::Write;

        use lz4_flex::frame::{BlockMode, FrameEncoder, FrameInfo};

        let info = FrameInfo::new().block_mode(BlockMode::Independent);
        let mut encoder = FrameEncoder::with_frame_info(info, Vec::new());
        encoder.write_all(b"$GPRMC,A\n$GPRMC,A\n$GPRMC,A\n").unwrap();
        let frame = encoder.finish().unwrap();

        assert_eq!(decode_frame(&frame).unwrap(), b"$GPRMC,A\n$GPRMC,A\n$GPRMC,A\n");
    }

    #[test]
    fn test_verify_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut good = NamedTempFile::new().unwrap();
        good.write_all(&encode(false, &[b"$GPRMC,A\n"])).unwrap();
        assert!(verify_file(good.path()).is_ok());

        let mut bad = NamedTempFile::new().unwrap();
        bad.write_all(b"not a frame").unwrap();
        assert!(matches!(verify_file(bad.path()), Err(LoggerError::Codec(_))));
    }
}
