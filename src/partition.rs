//! Contiguous, disjoint splitting of an index range.
//!
//! Used twice: the manager slices the job's key range across foremen, and each
//! foreman slices its own share across its workers. Both use the same rule so
//! every index in `[start, end)` has exactly one owner across the fleet.

use std::ops::Range;

/// The `index`-th of `parts` contiguous pieces of `range`.
///
/// Piece sizes differ by at most one. When `parts` exceeds the range length
/// some pieces are empty.
pub fn part(range: &Range<u64>, parts: u64, index: u64) -> Range<u64> {
    if parts == 0 || index >= parts || range.end <= range.start {
        return range.start..range.start;
    }
    let len = (range.end - range.start) as u128;
    let lo = range.start + (len * index as u128 / parts as u128) as u64;
    let hi = range.start + (len * (index as u128 + 1) / parts as u128) as u64;
    lo..hi
}

/// All `parts` pieces of `range`, in order.
pub fn partition(range: &Range<u64>, parts: u64) -> Vec<Range<u64>> {
    (0..parts).map(|i| part(range, parts, i)).collect()
}
