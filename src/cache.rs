//! Reference-counted LRU buffer cache: ties a range-keyed lookup table to
//! a recency ordering and a bounded-sweep eviction policy.

use crate::buffer::ExtentBuffer;
use crate::range_map::RangeMap;

/// How many LRU entries a single eviction sweep will inspect before
/// giving up, even if the cache is still over budget.
pub const SCAN_BUDGET: u32 = 64;

/// A reference-counted cache of [`ExtentBuffer`]s, keyed by their logical
/// start offset, with bounded-sweep LRU eviction.
///
/// Buffers are addressed by their `start` offset rather than by a typed
/// handle: the cache alone owns them, and callers that need to reach
/// inside one do so through [`buffer`](Self::buffer) /
/// [`buffer_mut`](Self::buffer_mut) rather than holding a live borrow
/// across other cache calls.
#[derive(Debug)]
pub struct BufferCache {
    buffers: RangeMap<ExtentBuffer>,
    lru: Vec<u64>,
    cache_size: u64,
    cache_max: u64,
}

impl BufferCache {
    pub fn new(cache_max: u64) -> Self {
        Self { buffers: RangeMap::new(), lru: Vec::new(), cache_size: 0, cache_max }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lru.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    /// Shared access to a cached buffer by its start offset.
    #[must_use]
    pub fn buffer(&self, start: u64) -> Option<&ExtentBuffer> {
        self.buffers.get(start).map(|(_, b)| b)
    }

    /// Exclusive access to a cached buffer by its start offset.
    #[must_use]
    pub fn buffer_mut(&mut self, start: u64) -> Option<&mut ExtentBuffer> {
        self.buffers.get_mut(start).map(|(_, b)| b)
    }

    /// Looks up a buffer with both the given start and size. Unlike the
    /// state tree, this is an exact match only — a differently-sized
    /// buffer cached at the same start is a non-match (see
    /// [`alloc`](Self::alloc)).
    pub fn find(&mut self, start: u64, blocksize: u32) -> Option<u64> {
        let matches = matches!(self.buffers.get(start), Some((size, _)) if size == u64::from(blocksize));
        if !matches {
            return None;
        }
        self.touch(start);
        self.get(start);
        Some(start)
    }

    /// The first cached buffer with `start >= start`.
    pub fn find_first(&mut self, start: u64) -> Option<u64> {
        let key = self.buffers.first_at_or_after(start).map(|(s, _, _)| s)?;
        self.touch(key);
        self.get(key);
        Some(key)
    }

    /// Returns the buffer at `start`, allocating and binding a fresh one
    /// of `blocksize` bytes if none is cached there.
    ///
    /// # Panics
    ///
    /// Panics if a differently-sized buffer is already cached at `start`
    /// and is held by someone other than the cache itself (`refs > 1`) —
    /// this is a fatal design error, not a recoverable condition.
    pub fn alloc(&mut self, start: u64, blocksize: u32) -> u64 {
        let conflict = self.buffers.get(start).map(|(size, b)| (size, b.refs));
        if let Some((existing_size, refs)) = conflict {
            if existing_size == u64::from(blocksize) {
                self.touch(start);
                self.get(start);
                return start;
            }
            assert!(
                refs <= 1,
                "extent-map: alloc({start}) conflicts with a differently-sized buffer \
                 still held externally (refs={refs})"
            );
            let (size, _) = self.buffers.remove(start).expect("checked above");
            self.lru_remove(start);
            self.cache_size -= size;
        }

        self.free_some_buffers();

        let mut buffer = ExtentBuffer::new(start, blocksize);
        buffer.refs = 2;
        self.buffers.insert(start, u64::from(blocksize), buffer);
        self.lru.push(start);
        self.cache_size += u64::from(blocksize);
        start
    }

    /// Increments the refcount on an already-cached buffer without
    /// touching its LRU position (used internally by the dirty protocol).
    ///
    /// # Panics
    ///
    /// Panics if no buffer is cached at `start`.
    pub fn get(&mut self, start: u64) {
        let (_, buffer) = self.buffers.get_mut(start).expect("extent-map: get() of uncached buffer");
        buffer.refs += 1;
    }

    /// Drops one reference to the buffer at `start`. If this was the last
    /// reference the buffer is evicted immediately.
    ///
    /// # Panics
    ///
    /// Panics if no buffer is cached at `start`, if its refcount is
    /// already zero, or if it is released dirty while at zero references
    /// (a dirty buffer must be written back or explicitly discarded
    /// before its last release).
    pub fn release(&mut self, start: u64) {
        let refs = {
            let (_, buffer) = self.buffers.get_mut(start).expect("extent-map: release() of uncached buffer");
            assert!(buffer.refs > 0, "extent-map: refcount underflow releasing buffer at {start}");
            buffer.refs -= 1;
            buffer.refs
        };

        if refs == 0 {
            let is_dirty = self.buffers.get(start).unwrap().1.is_dirty();
            assert!(!is_dirty, "extent-map: buffer at {start} freed while still dirty");
            let (size, _) = self.buffers.remove(start).expect("checked above");
            self.lru_remove(start);
            self.cache_size -= size;
        }
    }

    /// Temporarily removes a buffer from the cache without touching its
    /// LRU position, so the caller can borrow it immutably alongside a
    /// mutable borrow of another cached buffer. Must be paired with
    /// [`untake`](Self::untake).
    pub(crate) fn take(&mut self, start: u64) -> Option<(u64, ExtentBuffer)> {
        self.buffers.remove(start)
    }

    /// Restores a buffer previously removed via [`take`](Self::take).
    pub(crate) fn untake(&mut self, start: u64, size: u64, buffer: ExtentBuffer) {
        self.buffers.insert(start, size, buffer);
    }

    fn touch(&mut self, start: u64) {
        if let Some(pos) = self.lru.iter().position(|&k| k == start) {
            self.lru.remove(pos);
        }
        self.lru.push(start);
    }

    fn lru_remove(&mut self, start: u64) {
        if let Some(pos) = self.lru.iter().position(|&k| k == start) {
            self.lru.remove(pos);
        }
    }

    /// Evicts buffers with no external references until the cache is
    /// back under budget, or until [`SCAN_BUDGET`] entries have been
    /// inspected, whichever comes first.
    ///
    /// The scan walks the LRU list oldest-first; an entry's eligibility
    /// (`refs == 1`, i.e. held only by the cache) is checked, the
    /// eviction performed if eligible, and only then is the scan counter
    /// compared against the budget, so a buffer can still be evicted on
    /// the last entry inspected before the sweep gives up.
    fn free_some_buffers(&mut self) {
        if self.cache_size < self.cache_max {
            return;
        }

        let mut scanned = 0u32;
        let mut i = 0;
        while i < self.lru.len() {
            let start = self.lru[i];
            let refs = self.buffers.get(start).map_or(0, |(_, b)| b.refs);

            if refs == 1 {
                let (size, _) = self.buffers.remove(start).expect("lru entry without buffer");
                self.lru.remove(i);
                self.cache_size -= size;
                if self.cache_size < self.cache_max {
                    return;
                }
            } else {
                i += 1;
            }

            scanned += 1;
            if scanned >= SCAN_BUDGET {
                log::trace!(
                    "extent-map: eviction sweep exhausted its scan budget ({SCAN_BUDGET} entries) \
                     with {} bytes still over budget",
                    self.cache_size.saturating_sub(self.cache_max)
                );
                return;
            }
        }
    }

    /// Drains every cached buffer regardless of refcount, logging a
    /// warning for any that were still externally held or dirty. Used by
    /// the owning tree's teardown.
    pub(crate) fn drain_on_teardown(&mut self) {
        for start in std::mem::take(&mut self.lru) {
            if let Some((_, buffer)) = self.buffers.remove(start) {
                if buffer.refs > 1 {
                    log::warn!(
                        "extent-map: buffer at {start} still held ({} references) at teardown",
                        buffer.refs - 1
                    );
                }
                if buffer.is_dirty() {
                    log::warn!("extent-map: buffer at {start} still dirty at teardown");
                }
            }
        }
        self.cache_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_find_returns_same_buffer() {
        let mut cache = BufferCache::new(1 << 20);
        let key = cache.alloc(0, 512);
        assert_eq!(cache.find(0, 512), Some(key));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn find_first_skips_to_next_cached() {
        let mut cache = BufferCache::new(1 << 20);
        cache.alloc(512, 512);
        assert_eq!(cache.find_first(0), Some(512));
    }

    #[test]
    fn release_to_zero_evicts() {
        let mut cache = BufferCache::new(1 << 20);
        let key = cache.alloc(0, 512);
        cache.release(key);
        cache.release(key);
        assert!(cache.is_empty());
    }

    #[test]
    #[should_panic(expected = "still dirty")]
    fn release_last_ref_while_dirty_panics() {
        let mut cache = BufferCache::new(1 << 20);
        let key = cache.alloc(0, 512);
        cache.buffer_mut(key).unwrap().set_dirty_flag();
        cache.release(key);
        cache.release(key);
    }

    #[test]
    fn eviction_sweep_reclaims_unreferenced_buffers() {
        let mut cache = BufferCache::new(1024);
        let a = cache.alloc(0, 512);
        cache.release(a);
        let b = cache.alloc(512, 512);
        cache.release(b);
        // Cache is at budget (1024) and both buffers are unreferenced;
        // allocating a third triggers a sweep that reclaims `a` (the
        // least-recently-used) before the new buffer is inserted.
        cache.alloc(1024, 512);

        assert!(cache.buffer(a).is_none());
        assert!(cache.buffer(b).is_some());
        assert_eq!(cache.cache_size(), 1024);
    }

    #[test]
    fn held_buffer_survives_eviction_sweep() {
        let mut cache = BufferCache::new(1024);
        let a = cache.alloc(0, 512);
        let b = cache.alloc(512, 512);
        cache.release(b);
        cache.alloc(1024, 512);

        assert!(cache.buffer(a).is_some());
    }
}
