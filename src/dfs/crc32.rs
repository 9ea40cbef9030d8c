/// CRC-32 (IEEE 802.3, reflected, polynomial 0xEDB88320) over several chunks.
pub fn crc32<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for chunk in chunks {
        for &byte in chunk {
            crc ^= byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ POLY
                } else {
                    crc >> 1
                };
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values() {
        assert_eq!(crc32([&b""[..]]), 0x0000_0000);
        assert_eq!(crc32([&b"a"[..]]), 0xE8B7_BE43);
        assert_eq!(crc32([&b"123456789"[..]]), 0xCBF4_3926);
    }

    #[test]
    fn chunking_does_not_matter() {
        assert_eq!(
            crc32([&b"1234"[..], &b""[..], &b"56789"[..]]),
            crc32([&b"123456789"[..]])
        );
    }
}
