pub mod interner;

use std::hash::{BuildHasher, Hash};

/// Hashes any `Hash` value with FxHash.
///
/// Used for cache keys that are compared by value; not stable across
/// builds, so never persist the result.
#[inline]
#[must_use]
pub fn fx_hash_key<T: Hash + ?Sized>(value: &T) -> u64 {
    rustc_hash::FxBuildHasher.hash_one(value)
}

/// Rounds `value` up to the next multiple of 4.
#[inline]
#[must_use]
pub fn next_multiple_of_4(value: u32) -> u32 {
    value.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_multiple_of_4() {
        assert_eq!(next_multiple_of_4(0), 0);
        assert_eq!(next_multiple_of_4(1), 4);
        assert_eq!(next_multiple_of_4(4), 4);
        assert_eq!(next_multiple_of_4(801), 804);
    }
}
