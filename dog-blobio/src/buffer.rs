use bytes::{Bytes, BytesMut};

pub(crate) const LINE_TERMINATOR: u8 = b'\n';

/// Bytes prefetched for `readline` but not yet handed to the caller. Its
/// first byte always sits at the handle's current position.
#[derive(Debug, Default)]
pub struct ReadlineBuffer {
    pending: Bytes,
}

impl ReadlineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with a freshly downloaded run
    pub fn refill(&mut self, content: Bytes) {
        self.pending = content;
    }

    pub fn clear(&mut self) {
        self.pending = Bytes::new();
    }

    /// Move bytes into `line` up to and including the first terminator found
    /// within `max` bytes, or `min(len, max)` bytes when none is found.
    /// Returns the number of bytes moved.
    pub fn consume_line(&mut self, line: &mut BytesMut, max: usize) -> usize {
        let window = self.pending.len().min(max);
        let end = match self.pending[..window].iter().position(|&b| b == LINE_TERMINATOR) {
            Some(found) => found + 1,
            None => window,
        };
        line.extend_from_slice(&self.pending.split_to(end));
        end
    }
}

/// Written bytes that have not been submitted as a stage operation yet
#[derive(Debug, Default)]
pub struct WriteBuffer {
    pending: BytesMut,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn append(&mut self, payload: &[u8]) {
        self.pending.extend_from_slice(payload);
    }

    /// Take everything buffered so far, leaving the buffer empty
    pub fn drain(&mut self) -> Bytes {
        self.pending.split().freeze()
    }
}
