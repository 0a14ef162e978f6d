#![allow(unused_doc_comments)]
use harbor_wasm::error::Origin;
use harbor_wasm::runtime::PAGE_SIZE;
use harbor_wasm::{Memory, MemoryError};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64, .. ProptestConfig::default()
    })]

    /// Anything not starting with the exact magic and version is rejected at the header.
    #[test]
    fn bad_headers_are_malformed(header in proptest::collection::vec(any::<u8>(), 0..8), tail in proptest::collection::vec(any::<u8>(), 0..16)) {
        let mut bytes = header;
        bytes.extend(tail);
        prop_assume!(!bytes.starts_with(b"\0asm\x01\0\0\0"));
        let err = harbor_wasm::load(&bytes).unwrap_err();
        prop_assert_eq!(err.origin, Origin::Header);
    }

    /// Random bodies after a valid header never panic the loader.
    #[test]
    fn arbitrary_sections_never_panic(body in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.extend(body);
        let _ = harbor_wasm::load(&bytes);
    }

    /// Out-of-bounds writes fail and leave every byte untouched.
    #[test]
    fn out_of_bounds_write_is_atomic(
        seed in any::<u8>(),
        offset in 0u64..(2 * PAGE_SIZE as u64),
        len in 1usize..64,
    ) {
        let mut mem = Memory::new(1, 1).unwrap();
        let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i as u8).wrapping_add(seed)).collect();
        mem.write(0, &pattern).unwrap();
        let payload = vec![0xAA; len];
        let fits = offset + len as u64 <= PAGE_SIZE as u64;
        let result = mem.write(offset, &payload);
        if fits {
            prop_assert!(result.is_ok());
        } else {
            let is_oob = matches!(result, Err(MemoryError::OutOfBounds { .. }));
            prop_assert!(is_oob);
            prop_assert_eq!(mem.data(), pattern.as_slice());
        }
    }

    /// Size never shrinks and successful grows return the previous size.
    #[test]
    fn growth_is_monotonic(deltas in proptest::collection::vec(0u32..4, 1..12)) {
        let mut mem = Memory::new(0, 8).unwrap();
        let mut size = 0u32;
        for delta in deltas {
            match mem.grow(delta) {
                Ok(prev) => {
                    prop_assert_eq!(prev, size);
                    size += delta;
                }
                Err(e) => {
                    let is_limit = matches!(e, MemoryError::GrowLimitExceeded { .. });
                    prop_assert!(is_limit);
                    prop_assert!(size + delta > 8);
                }
            }
            prop_assert_eq!(mem.size_pages(), size);
            prop_assert_eq!(mem.size_bytes(), u64::from(size) * PAGE_SIZE as u64);
        }
    }
}
