//! Fixed-capacity source buffer feeding the frame encoder.

use crate::frame::CHUNK_SIZE;

/// Byte accumulator holding at most one codec chunk
///
/// The backing storage is allocated once; `clear` only resets the length.
pub struct StreamBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuffer {
    /// Creates an empty buffer of [`CHUNK_SIZE`] bytes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes that still fit before the buffer is full.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Appends as much of `data` as fits and returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Buffered bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}
