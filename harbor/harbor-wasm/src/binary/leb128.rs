//! LEB128 decoding for the integer widths used by the module format.

use super::{cursor::Cursor, BinaryReadError, Result};

pub fn read_uleb_u32(cur: &mut Cursor) -> Result<u32> {
    read_unsigned(cur, 32).map(|v| v as u32)
}

pub fn read_uleb_u64(cur: &mut Cursor) -> Result<u64> {
    read_unsigned(cur, 64)
}

pub fn read_sleb_i32(cur: &mut Cursor) -> Result<i32> {
    read_signed(cur, 32).map(|v| v as i32)
}

/// Signed 33-bit value, used by block types that carry a type index.
pub fn read_sleb_i33(cur: &mut Cursor) -> Result<i64> {
    read_signed(cur, 33)
}

pub fn read_sleb_i64(cur: &mut Cursor) -> Result<i64> {
    read_signed(cur, 64)
}

fn read_unsigned(cur: &mut Cursor, bits: u32) -> Result<u64> {
    let max_bytes = bits.div_ceil(7);
    let mut result = 0u64;
    let mut shift = 0u32;
    for i in 0..max_bytes {
        let byte = cur.read_u8()?;
        let payload = byte & 0x7F;
        if i + 1 == max_bytes {
            // Bits of the final byte beyond the target width must be zero.
            let avail = bits - shift;
            if avail < 7 && (payload >> avail) != 0 {
                return Err(BinaryReadError::Leb128Overflow {
                    target_bits: bits as u8,
                    offset: cur.offset(),
                });
            }
        }
        result |= u64::from(payload) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(BinaryReadError::Leb128TooManyBytes {
        limit: max_bytes as u8,
        offset: cur.offset(),
    })
}

fn read_signed(cur: &mut Cursor, bits: u32) -> Result<i64> {
    let max_bytes = bits.div_ceil(7);
    let mut result = 0i64;
    let mut shift = 0u32;
    for i in 0..max_bytes {
        let byte = cur.read_u8()?;
        let payload = byte & 0x7F;
        if i + 1 == max_bytes {
            // Unused high bits of the final byte must replicate the sign bit.
            let avail = bits - shift;
            if avail < 7 {
                let high = payload >> (avail - 1);
                let all_ones = (1u8 << (8 - avail)) - 1;
                if high != 0 && high != all_ones {
                    return Err(BinaryReadError::Leb128Overflow {
                        target_bits: bits as u8,
                        offset: cur.offset(),
                    });
                }
            }
        }
        result |= i64::from(payload) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
    }
    Err(BinaryReadError::Leb128TooManyBytes {
        limit: max_bytes as u8,
        offset: cur.offset(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb32_basic() {
        let mut c = Cursor::new(&[0xE5, 0x8E, 0x26]);
        assert_eq!(read_uleb_u32(&mut c).unwrap(), 624_485);
        assert!(c.is_eof());
    }

    #[test]
    fn uleb32_max_and_overflow() {
        let mut c = Cursor::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(read_uleb_u32(&mut c).unwrap(), u32::MAX);

        let mut c = Cursor::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        assert!(matches!(
            read_uleb_u32(&mut c),
            Err(BinaryReadError::Leb128Overflow { target_bits: 32, .. })
        ));

        let mut c = Cursor::new(&[0xFF; 6]);
        assert!(matches!(
            read_uleb_u32(&mut c),
            Err(BinaryReadError::Leb128TooManyBytes { .. } | BinaryReadError::Leb128Overflow { .. })
        ));
    }

    #[test]
    fn sleb_values() {
        let mut c = Cursor::new(&[0x9B, 0xF1, 0x59]);
        assert_eq!(read_sleb_i32(&mut c).unwrap(), -624_485);

        let mut c = Cursor::new(&[0x7F]);
        assert_eq!(read_sleb_i32(&mut c).unwrap(), -1);

        let mut c = Cursor::new(&[0x80, 0x80, 0x80, 0x80, 0x78]);
        assert_eq!(read_sleb_i32(&mut c).unwrap(), i32::MIN);

        let mut c = Cursor::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7F]);
        assert_eq!(read_sleb_i64(&mut c).unwrap(), i64::MIN);
    }

    #[test]
    fn sleb32_rejects_non_sign_padding() {
        let mut c = Cursor::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x4F]);
        assert!(matches!(
            read_sleb_i32(&mut c),
            Err(BinaryReadError::Leb128Overflow { .. })
        ));
    }

    #[test]
    fn eof_inside_value() {
        let mut c = Cursor::new(&[0x80, 0x80]);
        assert!(matches!(read_uleb_u32(&mut c), Err(BinaryReadError::UnexpectedEof { .. })));
    }
}
