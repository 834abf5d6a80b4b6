//! FIFO intake queue between the coordinator and the sink.
//!
//! The sink accepts one chunk at a time. Chunks that arrive while it is busy
//! wait here in arrival order; nothing is dropped or reordered.

use std::collections::VecDeque;

use voxgate_core::AudioChunk;

/// Ordered, append-only queue of chunks awaiting the sink.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<AudioChunk>,
    /// Bytes currently queued.
    queued_bytes: usize,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to the tail. Never blocks.
    pub fn enqueue(&mut self, chunk: AudioChunk) {
        self.queued_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Hand the head chunk to the sink, but only if the sink is idle.
    ///
    /// While `sink_is_busy` is true the queue is left untouched.
    pub fn drain_if_ready(&mut self, sink_is_busy: bool) -> Option<AudioChunk> {
        if sink_is_busy {
            return None;
        }
        let chunk = self.chunks.pop_front()?;
        self.queued_bytes -= chunk.len();
        Some(chunk)
    }

    /// Get the number of queued chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Get the number of queued bytes.
    pub const fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_busy_sink_leaves_queue_untouched() {
        let mut buffer = ChunkBuffer::new();
        buffer.enqueue(AudioChunk::from(vec![1, 2]));
        buffer.enqueue(AudioChunk::from(vec![3]));

        assert!(buffer.drain_if_ready(true).is_none());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.queued_bytes(), 3);

        let head = buffer.drain_if_ready(false).unwrap();
        assert_eq!(head.as_bytes(), &[1, 2]);
        assert_eq!(buffer.queued_bytes(), 1);
    }

    #[test]
    fn test_empty_queue_yields_nothing() {
        let mut buffer = ChunkBuffer::new();
        assert!(buffer.drain_if_ready(false).is_none());
        assert!(buffer.is_empty());
    }

    proptest! {
        /// Interleaving enqueues with busy/idle drains never loses, duplicates, or reorders bytes.
        #[test]
        fn prop_drain_preserves_arrival_order(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..32),
            busy in prop::collection::vec(any::<bool>(), 0..96),
        ) {
            let submitted: Vec<u8> = chunks.iter().flatten().copied().collect();
            let mut buffer = ChunkBuffer::new();
            let mut delivered = Vec::new();
            let mut pending = chunks.into_iter();
            let mut busy = busy.into_iter();

            loop {
                let next = pending.next();
                let exhausted = next.is_none();
                if let Some(chunk) = next {
                    buffer.enqueue(AudioChunk::from(chunk));
                }
                let sink_is_busy = busy.next().unwrap_or(false);
                if let Some(chunk) = buffer.drain_if_ready(sink_is_busy) {
                    delivered.extend_from_slice(chunk.as_bytes());
                }
                if exhausted && buffer.is_empty() {
                    break;
                }
            }

            prop_assert_eq!(delivered, submitted);
        }
    }
}
