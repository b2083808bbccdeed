//! Byte-level primitives shared by the image models and wire protocols.
//!
//! Everything here is format-mandated: masked pattern search for the
//! bootloader patchers, fixed-width ASCII/UTF-16LE fields for FFU/GPT
//! headers, the additive checksums UEFI firmware volumes use, and the
//! CRC-16 that frames the legacy Qualcomm serial protocols.

/// Find `pattern` in `data`, honoring a wildcard `mask`.
///
/// A mask byte of 0xFF means the pattern byte must match exactly; 0x00
/// (or any cleared bit) relaxes the comparison. `mask` may be shorter
/// than `pattern`, in which case missing mask bytes default to 0xFF.
pub fn find_pattern(data: &[u8], pattern: &[u8], mask: &[u8]) -> Option<usize> {
    if pattern.is_empty() || data.len() < pattern.len() {
        return None;
    }

    'outer: for start in 0..=(data.len() - pattern.len()) {
        for (i, &p) in pattern.iter().enumerate() {
            let m = mask.get(i).copied().unwrap_or(0xFF);
            if (data[start + i] ^ p) & m != 0 {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}

/// Find a plain ASCII needle (exact match).
pub fn find_ascii(data: &[u8], needle: &[u8]) -> Option<usize> {
    find_pattern(data, needle, &[])
}

/// Read a fixed-width ASCII field, trimming trailing NULs and spaces.
pub fn read_ascii_trimmed(data: &[u8]) -> String {
    let end = data
        .iter()
        .rposition(|&b| b != 0 && b != b' ')
        .map_or(0, |p| p + 1);
    data[..end].iter().map(|&b| b as char).collect()
}

/// Read a UTF-16LE string field, stopping at the first NUL code unit.
pub fn read_utf16_trimmed(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Encode a string into a fixed-width UTF-16LE field, NUL padded.
/// Truncates if the encoded form does not fit.
pub fn write_utf16_fixed(out: &mut [u8], s: &str) {
    out.fill(0);
    let mut offset = 0;
    for unit in s.encode_utf16() {
        if offset + 2 > out.len() {
            break;
        }
        out[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
        offset += 2;
    }
}

/// Round `n` up to the next multiple of `chunk` (idempotent).
pub fn round_up_to_chunk(n: u64, chunk: u64) -> u64 {
    debug_assert!(chunk > 0);
    n.div_ceil(chunk) * chunk
}

/// Additive 16-bit checksum over little-endian u16 words.
///
/// UEFI volume headers store a checksum field chosen so the sum of all
/// words is zero; a valid header therefore sums to 0.
pub fn checksum16(data: &[u8]) -> u16 {
    data.chunks(2)
        .map(|c| {
            if c.len() == 2 {
                u16::from_le_bytes([c[0], c[1]])
            } else {
                c[0] as u16
            }
        })
        .fold(0u16, |acc, w| acc.wrapping_add(w))
}

/// Additive 8-bit checksum. FFS file headers sum to zero when valid.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC-16 used by the Qualcomm HDLC-style serial framing: reflected
/// X.25 polynomial (0x8408), init 0xFFFF, final complement.
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Parse a `0x`-prefixed (or bare) hex string into a u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).ok()
}

/// Format a u64 as the 16-digit `0x` hex form the manifest dialect uses.
pub fn format_hex_u64(v: u64) -> String {
    format!("0x{v:016X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_pattern_exact() {
        let data = [0x00, 0x11, 0x22, 0x33, 0x44];
        assert_eq!(find_pattern(&data, &[0x22, 0x33], &[0xFF, 0xFF]), Some(2));
        assert_eq!(find_pattern(&data, &[0x33, 0x22], &[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_find_pattern_wildcard() {
        let data = [0xE3, 0x10, 0x9F, 0xE5, 0x00, 0x00, 0xA0, 0xE3];
        // Low byte wildcarded
        assert_eq!(
            find_pattern(&data, &[0x00, 0x00, 0xA0, 0xE3], &[0x00, 0xFF, 0xFF, 0xFF]),
            Some(4)
        );
    }

    #[test]
    fn test_find_pattern_short_mask_defaults_exact() {
        let data = [1, 2, 3, 4];
        assert_eq!(find_pattern(&data, &[2, 3], &[]), Some(1));
    }

    #[test]
    fn test_ascii_trim() {
        assert_eq!(read_ascii_trimmed(b"SignedImage \0\0"), "SignedImage");
        assert_eq!(read_ascii_trimmed(b"\0\0"), "");
    }

    #[test]
    fn test_utf16_roundtrip() {
        let mut buf = [0u8; 0x48];
        write_utf16_fixed(&mut buf, "EFIESP");
        assert_eq!(read_utf16_trimmed(&buf), "EFIESP");
    }

    #[test]
    fn test_round_up_idempotent() {
        let chunk = 0x20000;
        for n in [0u64, 1, 511, 512, 0x1FFFF, 0x20000, 0x20001] {
            let r = round_up_to_chunk(n, chunk);
            assert_eq!(round_up_to_chunk(r, chunk), r);
            assert!(r >= n && r - n < chunk);
        }
    }

    #[test]
    fn test_crc16_x25_vector() {
        // CRC-16/X-25 of "123456789"
        assert_eq!(crc16_x25(b"123456789"), 0x906E);
    }

    #[test]
    fn test_checksum16_zero_sum() {
        // A buffer whose stored checksum word zeroes the sum.
        let mut buf = vec![0x12, 0x34, 0x56, 0x78, 0x00, 0x00];
        let partial = checksum16(&buf[..4]);
        let fix = 0u16.wrapping_sub(partial);
        buf[4..6].copy_from_slice(&fix.to_le_bytes());
        assert_eq!(checksum16(&buf), 0);
    }

    #[test]
    fn test_hex_parse() {
        assert_eq!(parse_hex_u64("0x0000000000000100"), Some(0x100));
        assert_eq!(parse_hex_u64("ff"), Some(0xFF));
        assert_eq!(parse_hex_u64("zz"), None);
        assert_eq!(format_hex_u64(0x100), "0x0000000000000100");
    }
}
