//! An in-memory range-keyed bitflag state tree coupled with a
//! ref-counted LRU buffer cache over a positional block device.
//!
//! The state tree ([`StateTree`]) and the buffer cache ([`BufferCache`])
//! are usable independently, but [`ExtentMapTree`] is the typical entry
//! point: it owns both, keeps the buffer cache's dirty bit mirrored into
//! the state tree, and drives reads/writes against the bound
//! [`BlockDevice`].
//!
//! # Example
//!
//! ```no_run
//! use extent_map::{BlockDevice, ExtentMapTree, StateFlags};
//! use std::sync::Arc;
//!
//! # fn open_device() -> Arc<dyn BlockDevice> { unimplemented!() }
//! let device = open_device();
//! let mut tree = ExtentMapTree::new(device, 4096);
//!
//! let key = tree.get_buffer(0)?;
//! tree.buffer_mut(key).unwrap().write(0, b"hello");
//! tree.mark_dirty(key);
//! tree.write_buffer(key)?;
//! tree.clear_dirty(key);
//! tree.release(key);
//! # Ok::<(), extent_map::Error>(())
//! ```
//!
//! Contract violations — overlapping inserts, `end < start`, refcount
//! underflow, a dirty buffer at its final release — are programmer
//! errors, not recoverable conditions, so they panic rather than return
//! an [`Error`]; see the crate's `error` module.

mod buffer;
mod cache;
mod device;
mod error;
mod flags;
mod range_map;
mod state;
mod tree;

pub use buffer::ExtentBuffer;
pub use cache::{BufferCache, SCAN_BUDGET};
pub use device::BlockDevice;
pub use error::{Error, Result};
pub use flags::{BufferFlags, StateFlags};
pub use range_map::RangeMap;
pub use state::StateTree;
pub use tree::{DEFAULT_CACHE_MAX, ExtentMapTree, SyncExtentMapTree};
