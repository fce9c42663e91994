//! Debug assertion macros for ring index invariants.
//!
//! Only active in debug builds, so there is zero overhead in release
//! builds. The checks guard the consumer-side index arithmetic; corruption
//! introduced by the foreign producer is handled at runtime instead (see
//! `ShmRing::drain_into`).

/// Assert that an index lies inside the data region.
///
/// **Invariant**: `0 ≤ index ≤ data_len` for every index we compute
/// ourselves (producer-supplied values are range-checked at runtime).
macro_rules! debug_assert_index_in_range {
    ($name:literal, $idx:expr, $data_len:expr) => {
        debug_assert!(
            $idx <= $data_len,
            "ring invariant violated: {} index {} outside data region of {} bytes",
            $name,
            $idx,
            $data_len
        )
    };
}

/// Assert that a drain advanced `tail` by exactly the copied length.
///
/// **Invariant**: `tail_new == (tail_old + copied) % data_len`
macro_rules! debug_assert_tail_advanced {
    ($old:expr, $new:expr, $copied:expr, $data_len:expr) => {
        debug_assert!(
            $new == ($old + $copied) % $data_len,
            "ring invariant violated: tail advanced {} -> {} for {} copied bytes (mod {})",
            $old,
            $new,
            $copied,
            $data_len
        )
    };
}

pub(crate) use debug_assert_index_in_range;
pub(crate) use debug_assert_tail_advanced;
