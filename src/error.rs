//! Error taxonomy for the arena, registry, and transport adapter.
//!
//! Errors are returned, never panicked on caller-induced failure (bad
//! offset, OOM, duplicate init). The allocator does not abort the
//! process on any of these; see `Arena::allocate` and `Arena::translate_offset`.

use std::io;

/// A single error type shared by [`crate::arena::Arena`],
/// [`crate::registry::ArenaRegistry`], and [`crate::adapter::TransportAdapter`].
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    /// Null/zero size, non-power-of-two alignment, out-of-bounds
    /// offset/length, or an attach size mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `initialize` or `attach` called on an arena whose `base` is
    /// already published.
    #[error("arena is already initialized")]
    AlreadyInitialized,

    /// Allocation would exceed `pool_size`, or an overflow was detected
    /// while aligning an offset or size.
    #[error("arena out of memory")]
    OutOfMemory,

    /// The underlying SHM object could not be created (already exists,
    /// permission denied, etc).
    #[error("failed to create shared-memory object {name:?}")]
    CreateFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// `ftruncate`/resize of the SHM object failed.
    #[error("failed to resize shared-memory object {name:?} to {size} bytes")]
    ResizeFailed {
        name: String,
        size: usize,
        #[source]
        source: io::Error,
    },

    /// `mmap` of the SHM object failed.
    #[error("failed to map shared-memory region {name:?}")]
    MapFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A registry lookup or remote-segment lookup missed.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ArenaError>;
