//! A shared-memory bump arena: the hot-path allocation and
//! address-translation substrate for a zero-copy data transfer engine.
//!
//! The arena replaces a per-buffer pattern of create-SHM-object /
//! size-it / map-it with a single large, pre-mapped region that
//! individual buffers are carved out of by a lock-free bump cursor.
//! Remote processes that have attached the same region convert an
//! offset published by the owner into a local virtual address by pure
//! arithmetic — `O(1)`, replacing a prior linear segment-table walk.
//!
//! # Modules
//!
//! - [`arena`] — the allocator itself: `initialize`/`attach`/`allocate`/
//!   `translate_offset`/`reset`/`stats`.
//! - [`registry`] — a process-wide, mutex-guarded directory from name to
//!   arena handle, so multiple subsystems in one process share a mapping.
//! - [`adapter`] — the transport-facing shim: allocate a local buffer,
//!   publish `(arena_name, offset, length)`, and translate a remote
//!   `(segment_id, offset, length)` into a local address on the hot
//!   path via a thread-local cache.
//!
//! # Usage
//!
//! ```rust,no_run
//! use zc_arena::{Arena, ArenaConfig};
//!
//! let arena = Arena::new();
//! arena.initialize(&ArenaConfig {
//!     pool_size_bytes: 2 * 1024 * 1024,
//!     ..Default::default()
//! }).unwrap();
//!
//! let handle = arena.allocate(1024, None).unwrap();
//! assert!(!handle.is_null());
//! ```
//!
//! Deallocation is a no-op by design — this is a bump allocator, not a
//! general-purpose malloc replacement. Callers needing reclamation call
//! `Arena::reset`, which invalidates every outstanding allocation at once.

pub mod adapter;
pub mod arena;
pub mod config;
pub mod error;
pub mod platform;
pub mod registry;

pub use adapter::{LocalBuffer, RemoteBuffer, SegmentDirectory, SegmentId, TransportAdapter};
pub use arena::{Arena, AllocationHandle, ArenaStats};
pub use config::{arena_disabled_by_env, ArenaConfig};
pub use error::{ArenaError, Result};
pub use registry::{unlink_orphan, ArenaRegistry};
