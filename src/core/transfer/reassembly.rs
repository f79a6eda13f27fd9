//! Reassembly buffer: accumulates ordered binary chunks into a file image.
//!
//! The channel is ordered and reliable, so chunks are appended in receipt
//! order with no sequencing metadata. The declared file size comes from the
//! peer and is not trusted: delivery beyond it is rejected rather than
//! silently buffered.

use crate::core::error::ProtocolError;
use bytes::Bytes;

/// Accumulator for one in-flight receive.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    file_size: u64,
    received: u64,
    chunks: Vec<Bytes>,
}

impl ReassemblyBuffer {
    /// Allocate a buffer for a file of `file_size` declared bytes.
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            received: 0,
            chunks: Vec::new(),
        }
    }

    /// Append the next chunk in receipt order.
    ///
    /// Rejects with [`ProtocolError::OverLength`] when the chunk would push
    /// the received total past the declared file size.
    pub fn append(&mut self, chunk: Bytes) -> Result<(), ProtocolError> {
        let total = self.received.saturating_add(chunk.len() as u64);
        if total > self.file_size {
            return Err(ProtocolError::OverLength {
                declared: self.file_size,
                received: total,
            });
        }
        self.received = total;
        self.chunks.push(chunk);
        Ok(())
    }

    /// Bytes received so far. Monotonically non-decreasing, never exceeds
    /// the declared size.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Declared file size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Fraction received, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 1.0;
        }
        self.received as f64 / self.file_size as f64
    }

    /// Whether every declared byte has arrived.
    pub fn is_complete(&self) -> bool {
        self.received == self.file_size
    }

    /// Concatenate all chunks into the complete byte image.
    ///
    /// Only valid once `received == file_size`.
    pub fn finalize(self) -> Result<Vec<u8>, ProtocolError> {
        if self.received != self.file_size {
            return Err(ProtocolError::Incomplete {
                declared: self.file_size,
                received: self.received,
            });
        }
        let mut out = Vec::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }
}
