//! Line splitting for text protocols spoken over the serial port.

use std::mem;

/// Accumulates bytes until a `\n` terminator. `\r` bytes are dropped so both
/// `\n` and `\r\n` terminated lines come out the same. Partial lines are kept
/// across calls.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn new() -> Self {
        LineSplitter::default()
    }

    /// Push a chunk of bytes, returning the lines it completes (without
    /// their terminator).
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = vec![];
        for b in data {
            match *b {
                b'\n' => lines.push(mem::take(&mut self.partial)),
                b'\r' => {}
                other => self.partial.push(other),
            }
        }
        lines
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[u8] {
        &self.partial
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
