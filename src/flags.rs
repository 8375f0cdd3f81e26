//! Flag vocabularies for state extents and extent buffers.

bitflags::bitflags! {
    /// Bits carried by a [`StateExtent`](crate::state::StateExtent).
    ///
    /// `IOBITS` (currently [`StateFlags::LOCKED`] and
    /// [`StateFlags::WRITEBACK`]) disables automatic merging of an extent
    /// with its neighbors: see [`StateFlags::is_iobits`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct StateFlags: u32 {
        /// Buffer content has been modified and not yet written back.
        const DIRTY = 1 << 0;
        /// Buffer content reflects a successful read from the device.
        const UPTODATE = 1 << 1;
        /// Range is locked against concurrent modification.
        const LOCKED = 1 << 2;
        /// Range has I/O in flight to the backing device.
        const WRITEBACK = 1 << 3;
    }
}

impl StateFlags {
    /// The subset of flags that suppress adjacent-extent merging.
    pub const IOBITS: StateFlags = StateFlags::LOCKED.union(StateFlags::WRITEBACK);

    /// Whether this flag set carries any bit that disables merging.
    #[must_use]
    pub fn is_iobits(self) -> bool {
        self.intersects(StateFlags::IOBITS)
    }
}

bitflags::bitflags! {
    /// Bits carried by an [`ExtentBuffer`](crate::buffer::ExtentBuffer) itself
    /// (as opposed to its mirrored range in the state tree).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct BufferFlags: u32 {
        /// Buffer content has been modified since the last write-back.
        const DIRTY = 1 << 0;
        /// Buffer content reflects a successful read from the device.
        const UPTODATE = 1 << 1;
    }
}
