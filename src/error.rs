//! Recoverable error taxonomy surfaced by the extent map.
//!
//! Contract violations (negative refcounts, overlapping inserts, `end <
//! start`, a dirty buffer surviving to final release, a size-mismatched
//! buffer held externally at [`alloc`](crate::cache::BufferCache::alloc)
//! time) are programmer errors, not recoverable conditions: they are
//! reported with `panic!`/`assert!` rather than a variant here.

use snafu::Snafu;

/// Errors the extent map's public operations may return.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Allocation of a state extent or buffer could not be satisfied.
    #[snafu(display("out of memory"))]
    OutOfMemory,

    /// A positional read or write to the backing device was short or
    /// failed outright.
    #[snafu(display("i/o error on device"))]
    Io { source: std::io::Error },

    /// [`set_private`](crate::state::StateTree::set_private) or
    /// [`get_private`](crate::state::StateTree::get_private) addressed an
    /// offset with no extent beginning exactly there.
    #[snafu(display("no extent begins at offset {start}"))]
    NotFound { start: u64 },
}

/// Convenience alias for this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
