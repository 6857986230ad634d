//! Receive buffer backing the ESL parser

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{EslError, EslResult},
};

/// Byte buffer with a read cursor. Consumed bytes stay in place until
/// [`compact`](EslBuffer::compact) is called.
pub(crate) struct EslBuffer {
    data: Vec<u8>,
    position: usize,
}

impl EslBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK),
            position: 0,
        }
    }

    /// Unconsumed byte count.
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        let spare = self.data.capacity() - self.data.len();
        if spare < bytes.len() {
            self.data
                .reserve(bytes.len().max(BUF_CHUNK));
        }
        self.data
            .extend_from_slice(bytes);
    }

    pub(crate) fn check_size_limits(&self) -> EslResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            return Err(EslError::protocol_error(format!(
                "Receive buffer holds {} unparsed bytes, limit is {}",
                self.len(),
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Take everything before `pattern` and advance past the pattern.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let pending = &self.data[self.position..];
        let offset = pending
            .windows(pattern.len())
            .position(|window| window == pattern)?;
        let extracted = pending[..offset].to_vec();
        self.position += offset + pattern.len();
        Some(extracted)
    }

    /// Take exactly `count` bytes, or nothing if fewer are buffered.
    pub(crate) fn extract_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.len() < count {
            return None;
        }
        let start = self.position;
        self.position += count;
        Some(self.data[start..self.position].to_vec())
    }

    /// Drop consumed bytes.
    pub(crate) fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        self.data
            .drain(..self.position);
        self.position = 0;
    }
}
