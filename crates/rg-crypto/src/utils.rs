//! Constant-time comparison for hashes and tags.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices without leaking where they first differ.
/// Slices of different length compare unequal.
///
/// ```rust
/// use rg_crypto::utils::constant_time_compare;
///
/// assert!(constant_time_compare(&[0u8; 32], &[0u8; 32]));
/// assert!(!constant_time_compare(&[0u8; 32], &[1u8; 32]));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare(b"hash", b"hash"));
    }

    #[test]
    fn test_constant_time_compare_different() {
        assert!(!constant_time_compare(b"hash", b"hasH"));
    }

    #[test]
    fn test_constant_time_compare_different_length() {
        assert!(!constant_time_compare(b"hash", b""));
    }
}
