//! Bounded scrollback for terminal output.
//!
//! Late joiners get a snapshot of recent output instead of a full replay.
//! The buffer grows up to [`BUFFER_CAPACITY`]; when a write pushes it past
//! that, everything but the most recent [`BUFFER_RETAIN`] bytes is dropped.

/// Maximum number of bytes held at any time.
pub const BUFFER_CAPACITY: usize = 64 * 1024;

/// Number of bytes kept after an overflow trim.
pub const BUFFER_RETAIN: usize = 32 * 1024;

#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    data: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, trimming down to the retained tail on overflow.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() > BUFFER_CAPACITY {
            // Nothing already buffered survives a chunk this large.
            self.data.clear();
            self.data
                .extend_from_slice(&chunk[chunk.len() - BUFFER_RETAIN..]);
            return;
        }

        self.data.extend_from_slice(chunk);
        if self.data.len() > BUFFER_CAPACITY {
            let excess = self.data.len() - BUFFER_RETAIN;
            self.data.drain(..excess);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
