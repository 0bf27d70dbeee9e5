//! Translation between 64-bit absolute sequence numbers and the 32-bit sequence numbers that
//!  go over the wire.
//!
//! An absolute sequence number counts from zero (the SYN) and never wraps. The wire carries
//!  `isn + absolute` truncated to 32 bits, so every wire value stands for a whole family of
//!  absolute values that are `2^32` apart. `unwrap` resolves that ambiguity by picking the
//!  candidate closest to a recently seen absolute value, the *checkpoint*.

use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, Sub};
use crate::safe_converter::{PrecheckedCast, SafeCast};

const SPAN: u64 = 1 << 32;

/// A 32 bit sequence number with wrap-around arithmetic, as it appears in a segment header.
///
/// There is deliberately no ordering: comparing wrapping values is only meaningful after
///  unwrapping them relative to a checkpoint.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct WrappingU32(u32);

impl WrappingU32 {
    pub const fn new(raw: u32) -> WrappingU32 {
        WrappingU32(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Display for WrappingU32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for WrappingU32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "W{}", self.0)
    }
}

impl Add<u32> for WrappingU32 {
    type Output = WrappingU32;

    fn add(self, rhs: u32) -> WrappingU32 {
        WrappingU32(self.0.wrapping_add(rhs))
    }
}

/// distance from `rhs` to `self` modulo 2^32
impl Sub for WrappingU32 {
    type Output = u32;

    fn sub(self, rhs: WrappingU32) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}

/// absolute -> wire
pub fn wrap(n: u64, isn: WrappingU32) -> WrappingU32 {
    let offset: u32 = (n % SPAN).prechecked_cast();
    isn + offset
}

/// wire -> absolute: the value congruent to `n - isn` (mod 2^32) that is closest to
///  `checkpoint`, the smaller one if two candidates are equally close
pub fn unwrap(n: WrappingU32, isn: WrappingU32, checkpoint: u64) -> u64 {
    let offset: u64 = (n - isn).safe_cast();

    let mut best = (checkpoint & !(SPAN - 1)) | offset;
    for candidate in [best.checked_sub(SPAN), best.checked_add(SPAN)].into_iter().flatten() {
        let candidate_distance = candidate.abs_diff(checkpoint);
        let best_distance = best.abs_diff(checkpoint);
        if candidate_distance < best_distance || (candidate_distance == best_distance && candidate < best) {
            best = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0, 0)]
    #[case::isn_offset(3, 5, 8)]
    #[case::truncated(SPAN + 3, 5, 8)]
    #[case::wraps(3, u32::MAX, 2)]
    #[case::max_absolute(u64::MAX, 0, u32::MAX)]
    fn test_wrap(#[case] n: u64, #[case] isn: u32, #[case] expected: u32) {
        assert_eq!(wrap(n, WrappingU32::new(isn)), WrappingU32::new(expected));
    }

    #[rstest]
    #[case::first(1, 0, 0, 1)]
    #[case::first_with_isn(16, 15, 0, 1)]
    #[case::below_isn(0, 1, 0, u32::MAX as u64)]
    #[case::second_wrap(3, 0, 3 * SPAN, 3 * SPAN + 3)]
    #[case::just_below_checkpoint(u32::MAX, 0, 3 * SPAN, 3 * SPAN - 1)]
    #[case::far_ahead(u32::MAX - 1, 0, 3 * SPAN, 3 * SPAN - 2)]
    #[case::tie_prefers_smaller(1 << 31, 0, 0, 1 << 31)]
    #[case::tie_prefers_smaller_later(0, 0, SPAN + (1 << 31), SPAN)]
    #[case::top_of_range(u32::MAX, 0, u64::MAX, u64::MAX)]
    #[case::checkpoint_at_top(0, 0, u64::MAX, u64::MAX - u32::MAX as u64)]
    #[case::isn_wraps(10, u32::MAX - 5, SPAN, SPAN + 16)]
    fn test_unwrap(#[case] n: u32, #[case] isn: u32, #[case] checkpoint: u64, #[case] expected: u64) {
        assert_eq!(unwrap(WrappingU32::new(n), WrappingU32::new(isn), checkpoint), expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0)]
    #[case(17, 5)]
    #[case(SPAN - 1, 1 << 31)]
    #[case(SPAN, 1 << 31)]
    #[case(5 * SPAN + 77, u32::MAX)]
    #[case(u64::MAX - 10, 12345)]
    fn test_unwrap_inverts_wrap(#[case] n: u64, #[case] isn: u32) {
        let isn = WrappingU32::new(isn);
        assert_eq!(unwrap(wrap(n, isn), isn, n), n);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(WrappingU32::new(u32::MAX) + 2, WrappingU32::new(1));
        assert_eq!(WrappingU32::new(1) - WrappingU32::new(u32::MAX), 2);
    }
}
