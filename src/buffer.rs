//! Minimal outbound byte queue.
//!
//! The spec treats the byte-buffer container as an external collaborator
//! (out of scope) and only assumes it offers append / length / drain-N /
//! read-all. This module is that minimal primitive, kept deliberately
//! thin — a single growable `Vec<u8>` with a consumed-prefix cursor — so
//! that the crate compiles standalone; a host embedding a richer buffer
//! type (the teacher's pooled `BufferPool`, for instance) can swap this
//! out without touching the scheduler.

#[derive(Debug, Default)]
pub struct OutBuffer {
    data: Vec<u8>,
    // Bytes at the front of `data` already written to the socket but not
    // yet compacted away. Compaction is deferred to avoid an O(n) shift on
    // every partial write.
    consumed: usize,
}

impl OutBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Bytes not yet drained.
    pub fn len(&self) -> usize {
        self.data.len() - self.consumed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All undrained bytes, for a single write syscall.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    /// Remove `n` bytes from the head (the amount the OS actually
    /// accepted). Panics if `n` exceeds the current length.
    pub fn drain_n(&mut self, n: usize) {
        assert!(n <= self.len(), "drain_n beyond buffer length");
        self.consumed += n;
        // Compact once the consumed prefix dominates, bounding memory
        // instead of growing `data` forever across many small writes.
        if self.consumed > 0 && (self.consumed == self.data.len() || self.consumed > 64 * 1024) {
            self.data.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    /// Drain and return everything, for callers that want ownership
    /// rather than draining by count.
    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.data.split_off(self.consumed);
        self.data.clear();
        self.consumed = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_drain() {
        let mut buf = OutBuffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.as_slice(), b"hello world");

        buf.drain_n(6);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.as_slice(), b"world");

        buf.drain_n(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn read_all_empties_the_buffer() {
        let mut buf = OutBuffer::new();
        buf.append(b"abc");
        assert_eq!(buf.read_all(), b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn compacts_after_large_partial_drain() {
        let mut buf = OutBuffer::new();
        buf.append(&vec![0u8; 200_000]);
        buf.drain_n(150_000);
        assert_eq!(buf.len(), 50_000);
        assert_eq!(buf.as_slice().len(), 50_000);
    }
}
