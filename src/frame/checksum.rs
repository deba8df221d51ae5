//! # Frame Checksums
//!
//! xxHash32 based checksums used by the LZ4 frame format.
//!
//! - Header checksum: second byte of `xxh32(descriptor, 0)`
//! - Content checksum: `xxh32` of all uncompressed bytes, seed 0

use xxhash_rust::xxh32::{xxh32, Xxh32};

/// Seed used for every frame checksum
const XXH32_SEED: u32 = 0;

/// Calculate the one-byte header checksum over the frame descriptor
///
/// # Arguments
///
/// * `descriptor` - Descriptor bytes (FLG, BD and any optional fields)
///
/// # Returns
///
/// * `u8` - `(xxh32(descriptor) >> 8) & 0xFF`
pub fn header_checksum(descriptor: &[u8]) -> u8 {
    (xxh32(descriptor, XXH32_SEED) >> 8) as u8
}

/// Running checksum over the uncompressed content of a frame
#[derive(Clone)]
pub struct ContentHasher {
    state: Xxh32,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            state: Xxh32::new(XXH32_SEED),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    pub fn digest(&self) -> u32 {
        self.state.digest()
    }

    /// Start over for a new frame
    pub fn reset(&mut self) {
        self.state.reset(XXH32_SEED);
    }
}
