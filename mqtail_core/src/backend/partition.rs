//! Shard-key partitioner
//!
//! Maps a record's routing key onto a partition number the way the
//! keyed backends expect: the key is read as up to 8 hex digits, masked
//! for power-of-two partition counts and reduced modulo otherwise.

/// Compute the partition for `key` out of `partitions`.
///
/// Returns 0 when partitioning is disabled (`partitions < 2`) or when
/// the key contains no leading hex digits.
pub fn partition_for_key(key: &[u8], partitions: u32) -> u32 {
    if partitions < 2 {
        return 0;
    }
    let Some(k) = leading_hex(key) else {
        return 0;
    };
    if partitions.is_power_of_two() {
        k & (partitions - 1)
    } else {
        k % partitions
    }
}

/// Parse up to 8 leading hex digits of `key`; `None` if the first byte
/// is not a hex digit.
fn leading_hex(key: &[u8]) -> Option<u32> {
    let mut value: u32 = 0;
    let mut digits = 0;
    for &b in key.iter().take(8) {
        let d = match b {
            b'0'..=b'9' => (b - b'0') as u32,
            b'a'..=b'f' => (b - b'a' + 10) as u32,
            b'A'..=b'F' => (b - b'A' + 10) as u32,
            _ => break,
        };
        value = (value << 4) | d;
        digits += 1;
    }
    if digits == 0 {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two_uses_mask() {
        // 0x0badcafe & 0x7 == 6
        assert_eq!(partition_for_key(b"0badcafe", 8), 0x0badcafe_u32 & 7);
        assert_eq!(partition_for_key(b"00000010", 16), 0x10 & 15);
    }

    #[test]
    fn test_non_power_of_two_uses_modulo() {
        assert_eq!(partition_for_key(b"0badcafe", 10), 0x0badcafe_u32 % 10);
        assert_eq!(partition_for_key(b"ffffffff", 7), u32::MAX % 7);
    }

    #[test]
    fn test_deterministic_across_calls() {
        let a = partition_for_key(b"deadbeef", 32);
        let b = partition_for_key(b"deadbeef", 32);
        assert_eq!(a, b);
    }

    #[test]
    fn test_disabled_or_unparseable_key() {
        assert_eq!(partition_for_key(b"0badcafe", 0), 0);
        assert_eq!(partition_for_key(b"0badcafe", 1), 0);
        assert_eq!(partition_for_key(b"not-hex!", 8), 0);
        assert_eq!(partition_for_key(b"", 8), 0);
    }

    #[test]
    fn test_partial_hex_prefix() {
        // stops at the first non-hex byte
        assert_eq!(partition_for_key(b"ab-rest", 16), 0xab & 15);
    }
}
