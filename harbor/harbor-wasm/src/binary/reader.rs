//! Vector, name and byte-string helpers shared by the section decoders.

use super::{cursor::Cursor, leb128, BinaryReadError, Result};

/// Read a vector length. Every element occupies at least one byte, so a
/// length larger than the remaining input is rejected before allocating.
pub fn read_len(cur: &mut Cursor) -> Result<usize> {
    let at = cur.offset();
    let len = leb128::read_uleb_u32(cur)? as usize;
    if len > cur.remaining() {
        return Err(BinaryReadError::Malformed { offset: at, msg: "vector length exceeds input" });
    }
    Ok(len)
}

/// Length-prefixed raw bytes.
pub fn read_byte_vec(cur: &mut Cursor) -> Result<Vec<u8>> {
    let len = read_len(cur)?;
    Ok(cur.read_bytes(len)?.to_vec())
}

/// Length-prefixed UTF-8 name.
pub fn read_name(cur: &mut Cursor) -> Result<String> {
    let at = cur.offset();
    let bytes = read_byte_vec(cur)?;
    String::from_utf8(bytes).map_err(|_| BinaryReadError::InvalidUtf8 { offset: at })
}

/// Vector of `T` decoded by `elem`.
pub fn read_vec<T, F>(cur: &mut Cursor, mut elem: F) -> Result<Vec<T>>
where
    F: FnMut(&mut Cursor) -> Result<T>,
{
    let len = read_len(cur)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(elem(cur)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let data = [0x03, b'r', b'u', b'n'];
        let mut c = Cursor::new(&data);
        assert_eq!(read_name(&mut c).unwrap(), "run");
    }

    #[test]
    fn invalid_utf8_name() {
        let data = [0x02, 0xC3, 0x28];
        let mut c = Cursor::new(&data);
        assert!(matches!(read_name(&mut c), Err(BinaryReadError::InvalidUtf8 { offset: 0 })));
    }

    #[test]
    fn vector_longer_than_input() {
        let data = [0x7F, 0x01];
        let mut c = Cursor::new(&data);
        assert!(read_vec(&mut c, |c| c.read_u8()).is_err());
    }
}
