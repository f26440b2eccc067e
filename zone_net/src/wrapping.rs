//! Wrapping comparisons for the reliable stream's 32-bit sequence space.
//!
//! `s2cn`/`c2sn` are u32 counters that in practice never wrap during a
//! server's lifetime, but the comparisons below are written wraparound-safe
//! regardless so that sequencing logic does not silently misbehave near the
//! boundary.

/// Returns whether `s1` is ahead of `s2` in the wrapping sequence space.
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= 0x8000_0000)) || ((s1 < s2) && (s2 - s1 > 0x8000_0000))
}

pub fn sequence_less_than(s1: u32, s2: u32) -> bool {
    sequence_greater_than(s2, s1)
}

/// Signed wrapping difference `b - a` in the u32 sequence space.
pub fn wrapping_diff(a: u32, b: u32) -> i64 {
    const ADJUST: i64 = (u32::MAX as i64) + 1;

    let a = a as i64;
    let b = b as i64;
    let result = b - a;
    if result.abs() <= i32::MAX as i64 {
        result
    } else if b > a {
        b - (a + ADJUST)
    } else {
        (b + ADJUST) - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greater_is_greater() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(2, 2));
        assert!(!sequence_greater_than(1, 2));
    }

    #[test]
    fn less_is_less() {
        assert!(sequence_less_than(1, 2));
        assert!(!sequence_less_than(2, 2));
    }

    #[test]
    fn diff_simple() {
        assert_eq!(wrapping_diff(10, 12), 2);
        assert_eq!(wrapping_diff(12, 10), -2);
    }

    #[test]
    fn diff_wraps_at_boundary() {
        let a = u32::MAX;
        let b = a.wrapping_add(2);
        assert_eq!(wrapping_diff(a, b), 2);
        assert_eq!(wrapping_diff(b, a), -2);
    }
}
