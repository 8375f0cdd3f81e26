//! The extent map tree: the public entry point coupling a [`StateTree`]
//! with a [`BufferCache`] over a backing [`BlockDevice`].
//!
//! Teardown walks the buffer cache, logging rather than panicking on
//! leaked references — a production tree may legitimately outlive
//! callers that forgot to release a buffer, and teardown must not itself
//! become a second source of aborts.

use crate::buffer::ExtentBuffer;
use crate::cache::BufferCache;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::flags::StateFlags;
use crate::state::StateTree;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default cache ceiling in bytes, applied when a tree is constructed
/// with [`ExtentMapTree::new`].
pub const DEFAULT_CACHE_MAX: u64 = 32 * 1024 * 1024;

/// Couples a range-keyed state tree with a ref-counted buffer cache over
/// a positional block device.
///
/// This is the crate's main type; [`StateTree`] and [`BufferCache`]
/// remain usable standalone for callers that only need one half.
pub struct ExtentMapTree {
    device: Arc<dyn BlockDevice>,
    blocksize: u32,
    state: StateTree,
    cache: BufferCache,
}

impl ExtentMapTree {
    /// Creates a tree over `device`, caching buffers of `blocksize` bytes
    /// each, with the default cache ceiling.
    pub fn new(device: Arc<dyn BlockDevice>, blocksize: u32) -> Self {
        Self::with_cache_max(device, blocksize, DEFAULT_CACHE_MAX)
    }

    /// Creates a tree with an explicit cache ceiling in bytes.
    pub fn with_cache_max(device: Arc<dyn BlockDevice>, blocksize: u32, cache_max: u64) -> Self {
        Self {
            device,
            blocksize,
            state: StateTree::new(),
            cache: BufferCache::new(cache_max),
        }
    }

    #[must_use]
    pub fn blocksize(&self) -> u32 {
        self.blocksize
    }

    /// Shared access to the state sub-tree.
    #[must_use]
    pub fn state(&self) -> &StateTree {
        &self.state
    }

    /// Exclusive access to the state sub-tree.
    pub fn state_mut(&mut self) -> &mut StateTree {
        &mut self.state
    }

    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.cache.cache_size()
    }

    #[must_use]
    pub fn cached_buffer_count(&self) -> usize {
        self.cache.len()
    }

    /// Looks up a cached buffer at exactly `start`, incrementing its
    /// refcount on a hit. Does not touch the device.
    pub fn find(&mut self, start: u64) -> Option<u64> {
        self.cache.find(start, self.blocksize)
    }

    /// The first cached buffer with `start' >= start`.
    pub fn find_first(&mut self, start: u64) -> Option<u64> {
        self.cache.find_first(start)
    }

    /// Returns the buffer at `start`, allocating and binding a fresh one
    /// to the tree's device if none is cached, and reading it from disk
    /// if it isn't yet up to date.
    pub fn get_buffer(&mut self, start: u64) -> Result<u64> {
        let key = self.cache.alloc(start, self.blocksize);
        {
            let buffer = self.cache.buffer_mut(key).expect("just allocated");
            if buffer.dev_bytenr().is_none() {
                buffer.bind_device(self.device.clone(), start);
            }
        }
        if !self.cache.buffer(key).expect("just allocated").is_uptodate() {
            self.read_buffer(key)?;
        }
        Ok(key)
    }

    /// Forces a read of the buffer at `start` from the device, marking it
    /// up to date on success.
    pub fn read_buffer(&mut self, start: u64) -> Result<()> {
        let buffer = self.cache.buffer_mut(start).expect("extent-map: read_buffer of uncached buffer");
        buffer.read_from_device()?;
        buffer.mark_uptodate();
        Ok(())
    }

    /// Writes the buffer at `start` to the device, without altering its
    /// dirty state — callers typically follow this with
    /// [`clear_dirty`](Self::clear_dirty).
    pub fn write_buffer(&self, start: u64) -> Result<()> {
        let buffer = self.cache.buffer(start).expect("extent-map: write_buffer of uncached buffer");
        buffer.write_to_device()
    }

    /// Drops one reference to the buffer at `start` (see
    /// [`BufferCache::release`]).
    pub fn release(&mut self, start: u64) {
        self.cache.release(start);
    }

    /// Marks the buffer at `start` dirty: records the `DIRTY` bit over
    /// its byte range in the state tree and takes an extra self-reference
    /// pinning it in the cache, mirroring
    /// `set_extent_buffer_dirty`/`set_extent_bits` coupling in the
    /// original.
    pub fn mark_dirty(&mut self, start: u64) {
        let already_dirty = self.cache.buffer(start).expect("extent-map: mark_dirty of uncached buffer").is_dirty();
        if already_dirty {
            return;
        }
        let blocksize = u64::from(self.blocksize);
        self.state.set_bits(start, start + blocksize - 1, StateFlags::DIRTY);
        self.cache.buffer_mut(start).expect("checked above").set_dirty_flag();
        self.cache.get(start);
    }

    /// Clears the `DIRTY` bit on the buffer at `start` and releases the
    /// self-reference [`mark_dirty`](Self::mark_dirty) took, mirroring
    /// `clear_extent_buffer_dirty`'s call into `free_extent_buffer`.
    pub fn clear_dirty(&mut self, start: u64) {
        let is_dirty = self.cache.buffer(start).expect("extent-map: clear_dirty of uncached buffer").is_dirty();
        if !is_dirty {
            return;
        }
        let blocksize = u64::from(self.blocksize);
        self.state.clear_bits(start, start + blocksize - 1, StateFlags::DIRTY);
        self.cache.buffer_mut(start).expect("checked above").clear_dirty_flag();
        self.cache.release(start);
    }

    #[must_use]
    pub fn is_dirty(&self, start: u64) -> bool {
        self.cache.buffer(start).is_some_and(ExtentBuffer::is_dirty)
    }

    #[must_use]
    pub fn is_uptodate(&self, start: u64) -> bool {
        self.cache.buffer(start).is_some_and(ExtentBuffer::is_uptodate)
    }

    /// Shared access to a cached buffer's content, for callers that
    /// already hold a reference via [`find`](Self::find) /
    /// [`get_buffer`](Self::get_buffer).
    #[must_use]
    pub fn buffer(&self, start: u64) -> Option<&ExtentBuffer> {
        self.cache.buffer(start)
    }

    /// Exclusive access to a cached buffer's content.
    pub fn buffer_mut(&mut self, start: u64) -> Option<&mut ExtentBuffer> {
        self.cache.buffer_mut(start)
    }

    /// Copies `len` bytes from the buffer at `src_start` into the buffer
    /// at `dst_start`. Both must already be cached. If `dst_start ==
    /// src_start` this is equivalent to
    /// [`ExtentBuffer::copy_within`](crate::buffer::ExtentBuffer::copy_within).
    ///
    /// # Panics
    ///
    /// Panics if either buffer is not cached, mirroring the other
    /// buffer-content accessors on this type.
    pub fn copy_between(&mut self, dst_start: u64, dst_offset: usize, src_start: u64, src_offset: usize, len: usize) {
        if dst_start == src_start {
            let buffer = self.cache.buffer_mut(dst_start).expect("extent-map: copy_between of uncached buffer");
            buffer.copy_within(dst_offset, src_offset, len);
            return;
        }

        let (size, src_buffer) = self
            .cache
            .take(src_start)
            .expect("extent-map: copy_between of uncached source buffer");

        if let Some(dst) = self.cache.buffer_mut(dst_start) {
            dst.copy_from(dst_offset, &src_buffer, src_offset, len);
        } else {
            self.cache.untake(src_start, size, src_buffer);
            panic!("extent-map: copy_between of uncached destination buffer");
        }
        self.cache.untake(src_start, size, src_buffer);
    }
}

impl Drop for ExtentMapTree {
    fn drop(&mut self) {
        self.cache.drain_on_teardown();
    }
}

/// A `Send + Sync` wrapper around [`ExtentMapTree`] for callers that need
/// to share one tree across threads.
///
/// `ExtentMapTree` itself carries no internal synchronization: it is a
/// single-threaded, cooperative data structure, and concurrent callers
/// must serialize externally. This type bolts on thread safety with a
/// single mutex around every public operation, without changing the
/// tree's semantics. Prefer talking to the bare `ExtentMapTree` directly
/// when a caller already serializes access externally.
pub struct SyncExtentMapTree(Mutex<ExtentMapTree>);

impl SyncExtentMapTree {
    /// Wraps an existing tree for shared, lock-guarded access.
    pub fn new(tree: ExtentMapTree) -> Self {
        Self(Mutex::new(tree))
    }

    /// Locks the tree for the duration of the returned guard.
    ///
    /// # Panics
    ///
    /// Panics if the mutex was poisoned by a panic in another thread
    /// while holding the lock — consistent with this crate's treatment
    /// of contract violations as fatal rather than recoverable.
    pub fn lock(&self) -> MutexGuard<'_, ExtentMapTree> {
        self.0.lock().expect("extent-map: SyncExtentMapTree mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MemDevice;

    fn tree() -> ExtentMapTree {
        ExtentMapTree::new(Arc::new(MemDevice::new(4096)), 512)
    }

    #[test]
    fn get_buffer_reads_through_on_first_access() {
        let mut t = tree();
        let key = t.get_buffer(0).unwrap();
        assert!(t.is_uptodate(key));
        t.release(key);
    }

    #[test]
    fn mark_dirty_sets_state_bits_and_pins_buffer() {
        let mut t = tree();
        let key = t.get_buffer(0).unwrap();
        t.mark_dirty(key);
        assert!(t.state().test_range(0, 511, StateFlags::DIRTY, true));
        assert!(t.is_dirty(key));

        t.clear_dirty(key);
        assert!(!t.is_dirty(key));
        assert!(!t.state().test_range(0, 511, StateFlags::DIRTY, true));
        t.release(key);
    }

    #[test]
    fn sync_wrapper_locks_for_exclusive_access() {
        let shared = SyncExtentMapTree::new(tree());
        let key = shared.lock().get_buffer(0).unwrap();
        shared.lock().buffer_mut(key).unwrap().write(0, b"hi");
        let mut out = [0u8; 2];
        shared.lock().buffer(key).unwrap().read(0, &mut out);
        assert_eq!(&out, b"hi");
        shared.lock().release(key);
    }

    #[test]
    fn copy_between_distinct_buffers() {
        let mut t = tree();
        let a = t.get_buffer(0).unwrap();
        let b = t.get_buffer(512).unwrap();
        t.buffer_mut(a).unwrap().write(0, b"hello");
        t.copy_between(b, 10, a, 0, 5);
        let mut out = [0u8; 5];
        t.buffer(b).unwrap().read(10, &mut out);
        assert_eq!(&out, b"hello");
        t.release(a);
        t.release(b);
    }
}
