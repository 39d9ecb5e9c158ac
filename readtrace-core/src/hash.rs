//! Non-cryptographic string hashing for visitor fingerprints.
//!
//! The output only needs to be stable for a given input. Collisions are
//! acceptable: identities feed approximate analytics, never access control.

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Reduce a string to a short base-36 identifier.
///
/// Rolling `h = h * 31 + c` over UTF-16 code units with signed 32-bit
/// wraparound, then the absolute value rendered in base 36.
pub fn hash_string(input: &str) -> String {
    let hash = input
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));

    // Widen before abs so i32::MIN does not overflow.
    to_base36(i64::from(hash).unsigned_abs().into())
}

/// Render an unsigned integer in lowercase base 36.
pub fn to_base36(mut value: u128) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();

    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let input = "Mozilla/5.0|en-US|1920|1080|-60";
        assert_eq!(hash_string(input), hash_string(input));
    }

    #[test]
    fn test_hash_known_values() {
        // "a" = 97, "ab" = 97 * 31 + 98 = 3105
        assert_eq!(hash_string(""), "0");
        assert_eq!(hash_string("a"), "2p");
        assert_eq!(hash_string("ab"), "2e9");
    }

    #[test]
    fn test_hash_wraps_to_i32() {
        // Long inputs overflow 32 bits; the result must still fit in |i32|.
        let long = "x".repeat(500);
        let value = u64::from_str_radix(&hash_string(&long), 36).unwrap();
        assert!(value <= 2_147_483_648);
    }

    #[test]
    fn test_hash_uses_utf16_units() {
        // U+1F600 is a surrogate pair: two code units, not one char.
        let emoji = hash_string("\u{1F600}");
        let expected = 0xD83Di32.wrapping_mul(31).wrapping_add(0xDE00);
        assert_eq!(emoji, to_base36(u128::from(expected.unsigned_abs())));
    }

    #[test]
    fn test_to_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(2_147_483_648), "zik0zk");
    }
}
