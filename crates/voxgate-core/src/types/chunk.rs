//! Streamed audio fragments.

use bytes::Bytes;

/// One fragment of a streamed audio payload.
///
/// Chunks are moved, never cloned: the buffer owns a chunk until it is handed
/// to the sink, which consumes it.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct AudioChunk {
    bytes: Bytes,
}

impl AudioChunk {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Get the number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the chunk, yielding its bytes.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<Bytes> for AudioChunk {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl From<&'static [u8]> for AudioChunk {
    fn from(bytes: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(bytes))
    }
}
