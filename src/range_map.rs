//! Ordered range container: the foundation both the state tree and the
//! buffer cache are built on.
//!
//! A dictionary keyed by `(start, size)` over a disjoint set of ranges,
//! backed by a [`BTreeMap`] keyed by each range's start offset. All
//! operations are `O(log n)`.

use std::collections::BTreeMap;
use std::ops::Bound;

/// A disjoint set of `[start, start + size)` ranges, each carrying a
/// value `V`.
#[derive(Debug, Default)]
pub struct RangeMap<V> {
    entries: BTreeMap<u64, (u64, V)>,
}

impl<V> RangeMap<V> {
    /// Creates an empty range map.
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Number of ranges currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The smallest-`start` entry whose range ends strictly after `addr`
    /// — equivalently, the first entry that could overlap any range
    /// starting at `addr`.
    pub fn find_first(&self, addr: u64) -> Option<(u64, u64, &V)> {
        if let Some((&start, &(size, ref value))) = self.entries.range(..=addr).next_back() {
            if start + size > addr {
                return Some((start, size, value));
            }
        }

        self.entries
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(&start, &(size, ref value))| (start, size, value))
    }

    /// Mutable variant of [`find_first`](Self::find_first).
    pub fn find_first_mut(&mut self, addr: u64) -> Option<(u64, u64, &mut V)> {
        let key = self.find_first(addr).map(|(start, _, _)| start)?;
        self.entries
            .get_mut(&key)
            .map(|&mut (size, ref mut value)| (key, size, value))
    }

    /// The entry that exactly overlaps `[addr, addr + size)`, if any.
    ///
    /// "Overlap" here does not require an entry whose bounds match
    /// `(addr, size)` exactly, only one that intersects the queried
    /// range.
    pub fn find_exact_overlap(&self, addr: u64, size: u64) -> Option<(u64, u64, &V)> {
        if size == 0 {
            return None;
        }
        self.find_first(addr).filter(|&(start, _, _)| start < addr + size)
    }

    /// The entry immediately preceding `start` (largest key `< start`).
    pub fn prev(&self, start: u64) -> Option<(u64, u64, &V)> {
        self.entries
            .range(..start)
            .next_back()
            .map(|(&s, &(sz, ref v))| (s, sz, v))
    }

    /// The entry immediately following `start` (smallest key `> start`).
    pub fn next(&self, start: u64) -> Option<(u64, u64, &V)> {
        self.entries
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
            .map(|(&s, &(sz, ref v))| (s, sz, v))
    }

    /// The smallest-`start` entry with `start >= addr`, ignoring range
    /// extent entirely. Unlike [`find_first`](Self::find_first) this does
    /// not treat `addr` as possibly falling inside a preceding range —
    /// used by the buffer cache, whose ranges are never queried by an
    /// interior address.
    pub fn first_at_or_after(&self, addr: u64) -> Option<(u64, u64, &V)> {
        self.entries.range(addr..).next().map(|(&s, &(sz, ref v))| (s, sz, v))
    }

    /// Looks up the entry starting at exactly `start`.
    pub fn get(&self, start: u64) -> Option<(u64, &V)> {
        self.entries.get(&start).map(|&(size, ref v)| (size, v))
    }

    pub fn get_mut(&mut self, start: u64) -> Option<(u64, &mut V)> {
        self.entries.get_mut(&start).map(|(size, v)| (*size, v))
    }

    /// Inserts a new `[start, start + size)` range.
    ///
    /// # Panics
    ///
    /// Panics if the new range overlaps an existing one — a fatal
    /// programmer error. The caller's split/merge logic is responsible
    /// for guaranteeing disjointness before insertion, so reaching this
    /// panic means that invariant was already broken.
    pub fn insert(&mut self, start: u64, size: u64, value: V) {
        assert!(size > 0, "extent-map: zero-size range insert at {start}");
        if let Some((overlap_start, _, _)) = self.find_exact_overlap(start, size) {
            panic!(
                "extent-map: overlapping insert at [{start}, {}) collides with existing range at {overlap_start}",
                start + size
            );
        }
        self.entries.insert(start, (size, value));
    }

    /// Removes and returns the range starting at exactly `start`.
    pub fn remove(&mut self, start: u64) -> Option<(u64, V)> {
        self.entries.remove(&start)
    }

    /// Iterates all ranges in ascending `start` order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &V)> {
        self.entries.iter().map(|(&s, &(sz, ref v))| (s, sz, v))
    }
}
