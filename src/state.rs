//! The state tree: a range-keyed bitmask map with automatic split/merge.
//!
//! `set_bits` and `clear_bits` each work through five disjoint cases
//! (no overlap, left-aligned hit, left-overhang, hole before the hit,
//! right-overhang) over the underlying [`RangeMap`] built in
//! `range_map.rs`, eagerly merging adjacent extents of identical flags
//! back together as each case completes.

use crate::error::{Error, Result};
use crate::flags::StateFlags;
use crate::range_map::RangeMap;

#[derive(Clone, Copy, Debug, Default)]
struct StateExtentData {
    flags: StateFlags,
    private: u64,
}

/// A range-keyed map of bit-flags over a 64-bit address space.
///
/// Adjacent extents with identical flags are merged automatically unless
/// either carries an [`StateFlags::IOBITS`] bit; extents whose flags drop
/// to empty are removed. Extents are disjoint and kept sorted by `start`.
#[derive(Debug, Default)]
pub struct StateTree {
    ranges: RangeMap<StateExtentData>,
}

impl StateTree {
    /// Creates an empty state tree.
    pub fn new() -> Self {
        Self { ranges: RangeMap::new() }
    }

    /// Number of extents currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates all extents in ascending `start` order, as `(start, end,
    /// flags)` — `end` inclusive. Intended for invariant checks and tests.
    pub fn extents(&self) -> impl Iterator<Item = (u64, u64, StateFlags)> + '_ {
        self.ranges
            .iter()
            .map(|(start, size, data)| (start, start + size - 1, data.flags))
    }

    /// Adds `bits` to every address in `[start, end]`, splitting, merging,
    /// or creating extents as needed.
    ///
    /// Returns whether any bit in `bits` was already set anywhere in the
    /// affected region.
    ///
    /// # Panics
    ///
    /// Panics if `end < start` — a fatal contract violation, not a
    /// recoverable error.
    pub fn set_bits(&mut self, start: u64, end: u64, bits: StateFlags) -> bool {
        assert!(end >= start, "extent-map: end < start in set_bits({start}, {end})");

        let mut cur = start;
        let mut prev_any_set = false;

        loop {
            if cur > end {
                break;
            }

            let Some((ext_start, ext_size, data)) =
                self.ranges.find_first(cur).map(|(s, sz, d)| (s, sz, *d))
            else {
                // Case 1: no overlap anywhere in [cur, end].
                self.insert_new(cur, end, bits);
                break;
            };

            if ext_start > end {
                // Extent found is entirely past our range: the rest of
                // [cur, end] is a hole.
                self.insert_new(cur, end, bits);
                break;
            }

            let ext_end = ext_start + ext_size - 1;

            if ext_start == cur {
                if ext_end <= end {
                    // Case 2: left-aligned hit.
                    prev_any_set |= data.flags.intersects(bits);
                    self.or_flags(ext_start, bits);
                    self.merge_state(ext_start);
                    cur = ext_end + 1;
                } else {
                    // Case 5: right-overhang only.
                    prev_any_set |= data.flags.intersects(bits);
                    self.split_state(ext_start, end + 1);
                    self.or_flags(ext_start, bits);
                    self.merge_state(ext_start);
                    break;
                }
            } else if ext_start < cur {
                // Case 3: left-overhang. Split so the right half starts
                // exactly at `cur`, then retry.
                self.split_state(ext_start, cur);
            } else {
                // Case 4: hole before the hit extent.
                let this_end = if end < ext_start { end } else { ext_start - 1 };
                self.insert_new(cur, this_end, bits);
                cur = this_end + 1;
            }
        }

        prev_any_set
    }

    /// Removes `bits` from every address in `[start, end]`; extents whose
    /// flags become empty are removed entirely.
    ///
    /// Returns whether any of the requested bits were present anywhere in
    /// the affected region.
    ///
    /// # Panics
    ///
    /// Panics if `end < start`.
    pub fn clear_bits(&mut self, start: u64, end: u64, bits: StateFlags) -> bool {
        assert!(end >= start, "extent-map: end < start in clear_bits({start}, {end})");

        let mut cur = start;
        let mut cleared_any_set = false;

        loop {
            let Some((ext_start, ext_size, data)) =
                self.ranges.find_first(cur).map(|(s, sz, d)| (s, sz, *d))
            else {
                break;
            };
            if ext_start > end {
                break;
            }

            if ext_start < cur {
                self.split_state(ext_start, cur);
                continue;
            }

            let ext_end = ext_start + ext_size - 1;

            if ext_end <= end {
                cleared_any_set |= data.flags.intersects(bits);
                self.clear_state_bit(ext_start, bits);
                cur = ext_end + 1;
                if cur > end {
                    break;
                }
            } else {
                self.split_state(ext_start, end + 1);
                cleared_any_set |= data.flags.intersects(bits);
                self.clear_state_bit(ext_start, bits);
                break;
            }
        }

        cleared_any_set
    }

    /// Smallest `s >= start` such that some bit in `bits` is set at `s`,
    /// returned as that extent's inclusive `[start, end]` bounds.
    pub fn find_first_bit(&self, start: u64, bits: StateFlags) -> Option<(u64, u64)> {
        let mut node = self.ranges.find_first(start);

        while let Some((ext_start, ext_size, data)) = node {
            let ext_end = ext_start + ext_size - 1;
            if ext_end >= start && data.flags.intersects(bits) {
                return Some((ext_start, ext_end));
            }
            node = self.ranges.next(ext_start);
        }

        None
    }

    /// Tests `bits` over `[start, end]`.
    ///
    /// If `filled`, returns `true` iff every byte in the range lies in an
    /// extent carrying at least one of `bits`. Otherwise returns `true`
    /// iff *any* byte does, short-circuiting on the first match without
    /// advancing across holes — it does not keep scanning past the first
    /// overlapping extent to confirm there isn't also a hole further in.
    ///
    /// # Panics
    ///
    /// Panics if `end < start`.
    pub fn test_range(&self, start: u64, end: u64, bits: StateFlags, filled: bool) -> bool {
        assert!(end >= start, "extent-map: end < start in test_range({start}, {end})");

        let mut cur = start;
        let mut node = self.ranges.find_first(cur);
        let mut bitset = false;

        loop {
            let Some((ext_start, ext_size, data)) = node else {
                break;
            };
            if cur > end {
                break;
            }

            if filled && ext_start > cur {
                bitset = false;
                break;
            }
            if ext_start > end {
                break;
            }

            if data.flags.intersects(bits) {
                bitset = true;
                if !filled {
                    break;
                }
            } else if filled {
                bitset = false;
                break;
            }

            let ext_end = ext_start + ext_size - 1;
            cur = ext_end + 1;
            if cur > end {
                break;
            }
            node = self.ranges.next(ext_start);
        }

        bitset
    }

    /// Attaches `value` to the extent whose `start` is exactly `start`.
    pub fn set_private(&mut self, start: u64, value: u64) -> Result<()> {
        let (_, data) = self.ranges.get_mut(start).ok_or(Error::NotFound { start })?;
        data.private = value;
        Ok(())
    }

    /// Reads the opaque value attached to the extent beginning exactly at
    /// `start`.
    pub fn get_private(&self, start: u64) -> Result<u64> {
        self.ranges
            .get(start)
            .map(|(_, data)| data.private)
            .ok_or(Error::NotFound { start })
    }

    fn insert_new(&mut self, start: u64, end: u64, bits: StateFlags) {
        let size = end - start + 1;
        self.ranges.insert(start, size, StateExtentData { flags: bits, private: 0 });
        self.merge_state(start);
    }

    fn or_flags(&mut self, start: u64, bits: StateFlags) {
        let (_, data) = self.ranges.get_mut(start).expect("extent-map: or_flags on missing extent");
        data.flags |= bits;
    }

    fn clear_state_bit(&mut self, start: u64, bits: StateFlags) {
        let (_, data) =
            self.ranges.get_mut(start).expect("extent-map: clear_state_bit on missing extent");
        data.flags.remove(bits);
        if data.flags.is_empty() {
            self.ranges.remove(start);
        } else {
            self.merge_state(start);
        }
    }

    /// Splits the extent starting at `orig_start` into `[orig_start,
    /// split)` and `[split, orig_end]`. The left half keeps the original
    /// flags and `private`; the right half keeps the flags but resets
    /// `private` to zero, since `private` is attached to the exact
    /// `start` of an extent and the caller never observes a transient
    /// double-extent mid-split.
    fn split_state(&mut self, orig_start: u64, split: u64) {
        let (orig_size, orig_data) =
            self.ranges.remove(orig_start).expect("extent-map: split on missing extent");
        let orig_end_excl = orig_start + orig_size;
        debug_assert!(orig_start < split && split < orig_end_excl);

        let left_size = split - orig_start;
        let right_size = orig_end_excl - split;

        self.ranges.insert(orig_start, left_size, orig_data);
        self.ranges.insert(
            split,
            right_size,
            StateExtentData { flags: orig_data.flags, private: 0 },
        );
    }

    /// Coalesces the extent at `start` with an abutting previous and/or
    /// next neighbor of identical flags, provided neither carries an
    /// [`StateFlags::IOBITS`] bit. The survivor keeps the leftmost `start`
    /// and the leftmost extent's `private`.
    fn merge_state(&mut self, start: u64) {
        let Some((mut size, mut survivor)) = self.ranges.get(start).map(|(sz, d)| (sz, *d)) else {
            return;
        };
        if survivor.flags.is_iobits() {
            return;
        }

        let mut merged_start = start;

        if let Some((prev_start, prev_size, prev_data)) =
            self.ranges.prev(merged_start).map(|(s, sz, d)| (s, sz, *d))
        {
            if prev_start + prev_size == merged_start && prev_data.flags == survivor.flags {
                self.ranges.remove(prev_start);
                self.ranges.remove(merged_start);
                merged_start = prev_start;
                size += prev_size;
                survivor = prev_data;
                self.ranges.insert(merged_start, size, survivor);
            }
        }

        let merged_end_excl = merged_start + size;
        if let Some((next_start, next_size, next_data)) =
            self.ranges.next(merged_start).map(|(s, sz, d)| (s, sz, *d))
        {
            if next_start == merged_end_excl && next_data.flags == survivor.flags {
                self.ranges.remove(merged_start);
                self.ranges.remove(next_start);
                size += next_size;
                self.ranges.insert(merged_start, size, survivor);
            }
        }
    }
}
