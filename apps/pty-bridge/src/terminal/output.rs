/// Most recent terminal output, capped at `ceiling` bytes. Oldest bytes are
/// discarded when the cap is exceeded; `drain` hands everything to the caller.
#[derive(Debug)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    ceiling: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(ceiling: usize) -> Self {
        Self {
            bytes: Vec::new(),
            ceiling: ceiling.max(1),
            dropped: 0,
        }
    }

    /// Returns the number of old bytes discarded to stay under the ceiling.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        self.bytes.extend_from_slice(chunk);
        let excess = self.bytes.len().saturating_sub(self.ceiling);
        if excess > 0 {
            self.bytes.drain(..excess);
            self.dropped += excess as u64;
        }
        excess
    }

    pub fn drain(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Total bytes lost to trimming over the buffer's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
