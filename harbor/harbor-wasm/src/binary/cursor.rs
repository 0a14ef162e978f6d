//! Forward/seekable byte cursor with offset tracking and little-endian primitives.

use super::{BinaryReadError, Result};

/// Cursor over a borrowed byte slice.
///
/// The loader walks section payloads with it, and the interpreter reuses it
/// to decode instruction immediates in place (it can be repositioned with
/// [`Cursor::seek`] for branches).
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Cursor positioned at `pos` (which may equal `data.len()`).
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos: pos.min(data.len()) }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Move to an absolute position inside the slice.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(BinaryReadError::UnexpectedEof { offset: pos });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BinaryReadError::UnexpectedEof { offset: self.pos })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    /// Read exactly `n` bytes as a view into the underlying data.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BinaryReadError::Malformed {
            offset: self.pos,
            msg: "length overflows input",
        })?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(BinaryReadError::UnexpectedEof { offset: self.pos })?;
        self.pos = end;
        Ok(slice)
    }

    /// Read a fixed-size array (used for float immediates and magic numbers).
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.read_array::<4>().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.read_array::<8>().map(u64::from_le_bytes)
    }
}
