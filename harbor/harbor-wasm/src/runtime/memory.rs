//! Linear memory (32-bit index space, 64 KiB pages).
//!
//! Every access is checked against the current size in 64-bit arithmetic
//! before it touches the buffer, so a failing write leaves memory unchanged.
//! Size only changes through [`Memory::grow`].

use tracing::debug;

use crate::error::MemoryError;
use crate::model::MemoryType;

/// WASM page size in bytes (64 KiB).
pub const PAGE_SIZE: usize = 64 * 1024;

/// Largest page count addressable with 32-bit offsets.
pub const MAX_PAGES: u32 = 65_536;

#[derive(Debug, Clone)]
pub struct Memory {
    buf: Vec<u8>,
    max: u32,
}

fn zeroed(pages: u32) -> Option<Vec<u8>> {
    let len = pages as usize * PAGE_SIZE;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

impl Memory {
    /// Memory of `min` pages that may grow up to `max` pages.
    pub fn new(min: u32, max: u32) -> Result<Self, MemoryError> {
        if min > max || max > MAX_PAGES {
            return Err(MemoryError::InvalidLimits { min, max });
        }
        let buf = zeroed(min).ok_or(MemoryError::InvalidLimits { min, max })?;
        Ok(Self { buf, max })
    }

    /// Memory for a declared type. The maximum is the declared maximum (or
    /// 65536) clamped to `ceiling`.
    pub fn for_type(ty: &MemoryType, ceiling: u32) -> Result<Self, MemoryError> {
        let max = ty.limits.max.unwrap_or(MAX_PAGES).min(ceiling).min(MAX_PAGES);
        Self::new(ty.limits.min, max)
    }

    pub fn size_pages(&self) -> u32 {
        (self.buf.len() / PAGE_SIZE) as u32
    }

    pub fn max_pages(&self) -> u32 {
        self.max
    }

    pub fn size_bytes(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Grow by `delta` pages and return the previous size in pages.
    pub fn grow(&mut self, delta: u32) -> Result<u32, MemoryError> {
        let current = self.size_pages();
        let exceeded = MemoryError::GrowLimitExceeded { current, delta, max: self.max };
        let new = u64::from(current) + u64::from(delta);
        if new > u64::from(self.max) {
            return Err(exceeded);
        }
        let new_len = new as usize * PAGE_SIZE;
        self.buf
            .try_reserve_exact(new_len - self.buf.len())
            .map_err(|_| exceeded)?;
        self.buf.resize(new_len, 0);
        if delta > 0 {
            debug!(from = current, to = new, "memory grown");
        }
        Ok(current)
    }

    #[inline]
    fn range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>, MemoryError> {
        let size = self.size_bytes();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(MemoryError::OutOfBounds { offset, len, size }),
        }
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<&[u8], MemoryError> {
        let r = self.range(offset, len)?;
        Ok(&self.buf[r])
    }

    pub fn read_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8], MemoryError> {
        let r = self.range(offset, len)?;
        Ok(&mut self.buf[r])
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let r = self.range(offset, bytes.len() as u64)?;
        self.buf[r].copy_from_slice(bytes);
        Ok(())
    }

    /// Fixed-width little-endian load.
    #[inline]
    pub fn load<const N: usize>(&self, offset: u64) -> Result<[u8; N], MemoryError> {
        let r = self.range(offset, N as u64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[r]);
        Ok(out)
    }

    #[inline]
    pub fn store<const N: usize>(&mut self, offset: u64, bytes: [u8; N]) -> Result<(), MemoryError> {
        self.write(offset, &bytes)
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, MemoryError> {
        self.load::<4>(offset).map(u32::from_le_bytes)
    }

    pub fn write_u32(&mut self, offset: u64, v: u32) -> Result<(), MemoryError> {
        self.store(offset, v.to_le_bytes())
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, MemoryError> {
        self.load::<8>(offset).map(u64::from_le_bytes)
    }

    pub fn write_u64(&mut self, offset: u64, v: u64) -> Result<(), MemoryError> {
        self.store(offset, v.to_le_bytes())
    }

    pub fn fill(&mut self, offset: u64, value: u8, len: u64) -> Result<(), MemoryError> {
        let r = self.range(offset, len)?;
        self.buf[r].fill(value);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&mut self, src: u64, dst: u64, len: u64) -> Result<(), MemoryError> {
        let from = self.range(src, len)?;
        let to = self.range(dst, len)?;
        self.buf.copy_within(from, to.start);
        Ok(())
    }
}
