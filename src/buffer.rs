//! Extent buffers: fixed-size I/O blocks cached in memory, plus the
//! positional Range I/O and byte-level content operations that act on
//! them.

use crate::device::BlockDevice;
use crate::error::{Error, IoSnafu};
use crate::flags::BufferFlags;
use snafu::ResultExt;
use std::sync::Arc;

/// A fixed-size block of bytes cached in memory, identified by its
/// logical `start` offset.
///
/// Content operations ([`read`](Self::read), [`write`](Self::write),
/// [`fill`](Self::fill), [`compare`](Self::compare),
/// [`copy_from`](Self::copy_from), [`copy_within`](Self::copy_within))
/// all assume `offset + len <= self.len()`; violating that is a fatal
/// contract error and panics rather than returning a `Result`.
#[derive(Debug)]
pub struct ExtentBuffer {
    start: u64,
    data: Vec<u8>,
    flags: BufferFlags,
    device: Option<Arc<dyn BlockDevice>>,
    dev_bytenr: Option<u64>,
    pub(crate) refs: u32,
}

impl ExtentBuffer {
    pub(crate) fn new(start: u64, blocksize: u32) -> Self {
        Self {
            start,
            data: vec![0u8; blocksize as usize],
            flags: BufferFlags::empty(),
            device: None,
            dev_bytenr: None,
            refs: 0,
        }
    }

    /// The buffer's logical start offset in the address space.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The buffer's fixed block size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BufferFlags::DIRTY)
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(BufferFlags::UPTODATE)
    }

    /// Sets the buffer-local `UPTODATE` flag. Unlike `DIRTY`, this is not
    /// mirrored into the state tree.
    pub fn mark_uptodate(&mut self) {
        self.flags.insert(BufferFlags::UPTODATE);
    }

    pub(crate) fn set_dirty_flag(&mut self) {
        self.flags.insert(BufferFlags::DIRTY);
    }

    pub(crate) fn clear_dirty_flag(&mut self) {
        self.flags.remove(BufferFlags::DIRTY);
    }

    /// Binds the buffer to a device and physical offset. Until this is
    /// called the device handle is "unset": [`read_from_device`] and
    /// [`write_to_device`] will panic.
    ///
    /// [`read_from_device`]: Self::read_from_device
    /// [`write_to_device`]: Self::write_to_device
    pub fn bind_device(&mut self, device: Arc<dyn BlockDevice>, dev_bytenr: u64) {
        self.device = Some(device);
        self.dev_bytenr = Some(dev_bytenr);
    }

    #[must_use]
    pub fn dev_bytenr(&self) -> Option<u64> {
        self.dev_bytenr
    }

    /// Performs a single positional read of exactly `self.len()` bytes
    /// from the bound device into the buffer. A short read is surfaced
    /// as [`Error::Io`].
    ///
    /// # Panics
    ///
    /// Panics if no device has been bound via [`bind_device`](Self::bind_device).
    pub fn read_from_device(&mut self) -> Result<(), Error> {
        let dev_bytenr = self
            .dev_bytenr
            .expect("extent-map: read_from_device on a buffer with no device bound");
        let device = self
            .device
            .clone()
            .expect("extent-map: read_from_device on a buffer with no device bound");

        let n = device.read_at(dev_bytenr, &mut self.data).context(IoSnafu)?;
        if n != self.data.len() {
            return Err(Error::Io {
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"),
            });
        }
        Ok(())
    }

    /// Performs a single positional write of exactly `self.len()` bytes
    /// from the buffer to the bound device. A short write is surfaced as
    /// [`Error::Io`].
    ///
    /// # Panics
    ///
    /// Panics if no device has been bound via [`bind_device`](Self::bind_device).
    pub fn write_to_device(&self) -> Result<(), Error> {
        let dev_bytenr = self
            .dev_bytenr
            .expect("extent-map: write_to_device on a buffer with no device bound");
        let device = self
            .device
            .as_ref()
            .expect("extent-map: write_to_device on a buffer with no device bound");

        let n = device.write_at(dev_bytenr, &self.data).context(IoSnafu)?;
        if n != self.data.len() {
            return Err(Error::Io {
                source: std::io::Error::new(std::io::ErrorKind::WriteZero, "short write"),
            });
        }
        Ok(())
    }

    /// Reads `dst.len()` bytes out of the buffer starting at `offset`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let end = self.bounds_check(offset, dst.len());
        dst.copy_from_slice(&self.data[offset..end]);
    }

    /// Writes `src` into the buffer starting at `offset`.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        let end = self.bounds_check(offset, src.len());
        self.data[offset..end].copy_from_slice(src);
    }

    /// Fills `len` bytes starting at `offset` with `byte`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        let end = self.bounds_check(offset, len);
        self.data[offset..end].fill(byte);
    }

    /// Compares `len(other)` bytes starting at `offset` against `other`.
    pub fn compare(&self, offset: usize, other: &[u8]) -> std::cmp::Ordering {
        let end = self.bounds_check(offset, other.len());
        self.data[offset..end].cmp(other)
    }

    /// Copies `len` bytes from `src_offset` to `dst_offset` within this
    /// buffer. Safe under overlap: implemented via [`slice::copy_within`],
    /// which covers both the `memcpy`- and `memmove`-shaped copies the
    /// original distinguishes (`memcpy_extent_buffer` /
    /// `memmove_extent_buffer`).
    pub fn copy_within(&mut self, dst_offset: usize, src_offset: usize, len: usize) {
        self.bounds_check(dst_offset, len);
        self.bounds_check(src_offset, len);
        self.data.copy_within(src_offset..src_offset + len, dst_offset);
    }

    /// Copies `len` bytes from `src` at `src_offset` into this buffer at
    /// `dst_offset`. For copying within the same buffer use
    /// [`copy_within`](Self::copy_within) instead.
    pub fn copy_from(&mut self, dst_offset: usize, src: &ExtentBuffer, src_offset: usize, len: usize) {
        let dst_end = self.bounds_check(dst_offset, len);
        let src_end = src.bounds_check(src_offset, len);
        self.data[dst_offset..dst_end].copy_from_slice(&src.data[src_offset..src_end]);
    }

    fn bounds_check(&self, offset: usize, len: usize) -> usize {
        let end = offset.checked_add(len).expect("extent-map: buffer offset+len overflow");
        assert!(
            end <= self.data.len(),
            "extent-map: buffer access [{offset}, {end}) exceeds buffer length {}",
            self.data.len()
        );
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MemDevice;

    #[test]
    fn write_then_read_round_trips() {
        let mut eb = ExtentBuffer::new(0, 16);
        eb.write(0, b"hello, world!!!!");
        let mut out = [0u8; 5];
        eb.read(7, &mut out);
        assert_eq!(&out, b"world");
    }

    #[test]
    fn fill_sets_range() {
        let mut eb = ExtentBuffer::new(0, 8);
        eb.fill(2, 4, 0xAB);
        let mut out = [0u8; 8];
        eb.read(0, &mut out);
        assert_eq!(out, [0, 0, 0xAB, 0xAB, 0xAB, 0xAB, 0, 0]);
    }

    #[test]
    fn compare_matches_memcmp_semantics() {
        let mut eb = ExtentBuffer::new(0, 4);
        eb.write(0, b"abcd");
        assert_eq!(eb.compare(0, b"abcd"), std::cmp::Ordering::Equal);
        assert_eq!(eb.compare(0, b"abcc"), std::cmp::Ordering::Greater);
    }

    #[test]
    fn copy_within_handles_overlap() {
        let mut eb = ExtentBuffer::new(0, 8);
        eb.write(0, b"abcdefgh");
        eb.copy_within(2, 0, 6);
        let mut out = [0u8; 8];
        eb.read(0, &mut out);
        assert_eq!(&out, b"ababcdef");
    }

    #[test]
    fn copy_from_other_buffer() {
        let mut dst = ExtentBuffer::new(0, 8);
        let mut src = ExtentBuffer::new(100, 8);
        src.write(0, b"12345678");
        dst.copy_from(2, &src, 4, 4);
        let mut out = [0u8; 8];
        dst.read(0, &mut out);
        assert_eq!(&out, &[0, 0, b'5', b'6', b'7', b'8', 0, 0]);
    }

    #[test]
    #[should_panic(expected = "exceeds buffer length")]
    fn out_of_bounds_access_panics() {
        let eb = ExtentBuffer::new(0, 4);
        let mut out = [0u8; 8];
        eb.read(0, &mut out);
    }

    #[test]
    fn device_round_trip() {
        let device = Arc::new(MemDevice::new(64));
        let mut eb = ExtentBuffer::new(0, 16);
        eb.bind_device(device.clone(), 16);
        eb.write(0, &[7u8; 16]);
        eb.write_to_device().unwrap();

        let mut eb2 = ExtentBuffer::new(16, 16);
        eb2.bind_device(device, 16);
        eb2.read_from_device().unwrap();
        let mut out = [0u8; 16];
        eb2.read(0, &mut out);
        assert_eq!(out, [7u8; 16]);
    }
}
