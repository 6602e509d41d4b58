//! CRC-32 used as the frame integrity trailer
//!
//! Reflected polynomial 0xEDB88320, register preset to all ones, processed one
//! bit at a time, final register complemented. This is the same value zlib and
//! IEEE 802.3 produce, and must stay bit-exact for the device side to accept
//! our frames.

/// Reflected CRC-32 polynomial
pub const CRC32_POLY: u32 = 0xEDB8_8320;

/// Compute the CRC-32 of `data`
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

/// Continue a CRC-32 computation.
///
/// `previous` is the value returned for the data processed so far
/// (0 for none), so `crc32_update(crc32(a), b) == crc32(a ++ b)`.
pub fn crc32_update(previous: u32, data: &[u8]) -> u32 {
    let mut crc = !previous;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (CRC32_POLY & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(crc32(b"a"), 0xE8B7_BE43);
        assert_eq!(
            crc32(b"The quick brown fox jumps over the lazy dog"),
            0x414F_A339
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"telemetry frame payload";
        let (a, b) = data.split_at(9);
        assert_eq!(crc32_update(crc32(a), b), crc32(data));
    }
}
