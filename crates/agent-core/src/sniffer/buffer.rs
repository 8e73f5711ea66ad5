//! Bounded chunk buffer.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// FIFO of received chunks holding at most `capacity` chunks.
///
/// Pushing into a full buffer drops the oldest chunk. Writers never block.
#[derive(Debug)]
pub struct SniffBuffer {
    chunks: VecDeque<Bytes>,
    capacity: usize,
    dropped: u64,
}

impl SniffBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
            self.dropped += 1;
        }
        self.chunks.push_back(chunk);
    }

    /// Remove every chunk and return them concatenated in arrival order.
    pub fn drain(&mut self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.pop_front().unwrap_or_default(),
            _ => {
                let total = self.chunks.iter().map(Bytes::len).sum();
                let mut out = BytesMut::with_capacity(total);
                for chunk in self.chunks.drain(..) {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_concatenates_in_order() {
        let mut buffer = SniffBuffer::new(10);
        buffer.push(Bytes::from_static(b"ab"));
        buffer.push(Bytes::from_static(b"cd"));
        buffer.push(Bytes::from_static(b"e"));

        assert_eq!(buffer.drain(), Bytes::from_static(b"abcde"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.drain(), Bytes::new());
    }

    #[test]
    fn test_overflow_keeps_most_recent_chunks() {
        let mut buffer = SniffBuffer::new(1000);
        for i in 0..1005u32 {
            buffer.push(Bytes::from(format!("{};", i)));
        }
        assert_eq!(buffer.len(), 1000);
        assert_eq!(buffer.dropped(), 5);

        let expected: String = (5..1005u32).map(|i| format!("{};", i)).collect();
        assert_eq!(buffer.drain(), Bytes::from(expected));
    }
}
