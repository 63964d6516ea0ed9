//! Fixed-capacity byte buffers and ordered buffer sequences
//!
//! All per-connection payload moves through `Buffer` (one bounded chunk)
//! and `MultiBuffer` (an ordered run of chunks read as one stream).

use bytes::BytesMut;

/// Capacity of a single Buffer. Sniffers must tolerate at least this much
/// payload in one shot.
pub const BUFFER_SIZE: usize = 2048;

/// A contiguous byte region with a fixed maximum capacity.
#[derive(Debug, Default)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            inner: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Build a buffer holding a copy of `data`.
    ///
    /// Data longer than the capacity is truncated; producers are expected
    /// to chunk with [`MultiBuffer::from_bytes`] instead.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut b = Self::new();
        b.write(data);
        b
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() >= BUFFER_SIZE
    }

    pub fn capacity_left(&self) -> usize {
        BUFFER_SIZE - self.inner.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Append up to `capacity_left` bytes from `data`, returning how many
    /// were taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity_left());
        self.inner.extend_from_slice(&data[..n]);
        n
    }

    /// Drop the first `n` bytes.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.inner.len());
        let _ = self.inner.split_to(n);
    }
}

/// An ordered sequence of Buffers interpreted as a single byte stream.
#[derive(Debug, Default)]
pub struct MultiBuffer {
    buffers: Vec<Buffer>,
}

impl MultiBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk an arbitrary byte slice into buffers.
    pub fn from_bytes(mut data: &[u8]) -> Self {
        let mut mb = Self::new();
        while !data.is_empty() {
            let mut b = Buffer::new();
            let n = b.write(data);
            data = &data[n..];
            mb.append(b);
        }
        mb
    }

    /// Total byte length across all buffers.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(Buffer::len).sum()
    }

    /// Empty iff every contained buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(Buffer::is_empty)
    }

    pub fn append(&mut self, buffer: Buffer) {
        if !buffer.is_empty() {
            self.buffers.push(buffer);
        }
    }

    /// Move every buffer of `other` to the end of `self`.
    pub fn extend(&mut self, other: MultiBuffer) {
        self.buffers.extend(other.buffers);
    }

    /// Remove and return the first non-empty buffer.
    pub fn split_first(&mut self) -> Option<Buffer> {
        while !self.buffers.is_empty() {
            let b = self.buffers.remove(0);
            if !b.is_empty() {
                return Some(b);
            }
        }
        None
    }

    /// Copy up to `dst.len()` bytes into `dst` without draining, returning
    /// the number of bytes copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for b in &self.buffers {
            if copied == dst.len() {
                break;
            }
            let n = b.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&b.bytes()[..n]);
            copied += n;
        }
        copied
    }

    /// Flatten into one contiguous byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for b in &self.buffers {
            out.extend_from_slice(b.bytes());
        }
        out
    }

    /// Drop all contents.
    pub fn release(&mut self) {
        self.buffers.clear();
    }
}

impl From<Buffer> for MultiBuffer {
    fn from(b: Buffer) -> Self {
        let mut mb = MultiBuffer::new();
        mb.append(b);
        mb
    }
}
