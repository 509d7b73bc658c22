//! Bounds-checked reader over a received frame
//!
//! Reading past the end is an end-of-input error, never a silent pad.

use crate::error::{CommError, Result};

/// Forward-only cursor over a byte slice
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread bytes without consuming them
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| CommError::eof(format!("need 1 byte at offset {}", self.pos)))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(CommError::eof(format!(
                "need {} bytes at offset {}, {} available",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Consume one byte and require it to equal `expected`
    pub fn expect(&mut self, expected: u8, what: &str) -> Result<()> {
        let got = self.u8()?;
        if got != expected {
            return Err(CommError::sentinel(format!(
                "{}: expected {:02X}, received {:02X}",
                what, expected, got
            )));
        }
        Ok(())
    }

    /// Require that every byte has been consumed
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(CommError::length(format!(
                "{} trailing bytes after offset {}",
                self.remaining(),
                self.pos
            )));
        }
        Ok(())
    }
}
