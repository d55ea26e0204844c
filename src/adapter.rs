//! Transport-facing shim: the subset of the transfer engine's interface
//! that touches the arena.
//!
//! On the owner side, `allocate_local_memory` turns a buffer request into
//! an arena allocation and hands back `(arena_name, offset, length)` for
//! the control plane to publish. On the requester side, `relocate`
//! attaches to a remote arena on first use (once per segment, behind the
//! adapter mutex) and thereafter translates `(offset, length)` targets
//! into local addresses through a thread-local cache, so the hot path
//! never contends on a lock.
//!
//! The control service / segment manager is an external collaborator
//! (spec §4.4): this module only depends on it through the
//! [`SegmentDirectory`] trait.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::config::ArenaConfig;
use crate::error::{ArenaError, Result};
use crate::registry::ArenaRegistry;

pub type SegmentId = u64;

/// What the control service/segment manager must surface for a remote
/// buffer so the adapter can find the arena that backs it.
#[derive(Debug, Clone)]
pub struct RemoteBuffer {
    pub arena_name: String,
    pub base_offset: u64,
    pub length: u64,
}

/// The external control-plane contract the adapter attaches against.
/// Implemented by the segment manager; treated as a black box here.
pub trait SegmentDirectory: Send + Sync {
    /// Find the buffer within `segment_id` that contains `offset`.
    fn buffer_for(&self, segment_id: SegmentId, offset: u64) -> Option<RemoteBuffer>;
}

/// What the adapter hands back after a local allocation, for the control
/// plane to publish alongside the rest of a buffer descriptor.
#[derive(Debug, Clone)]
pub struct LocalBuffer {
    pub addr: usize,
    pub arena_name: String,
    pub offset: u64,
    pub length: usize,
}

static NEXT_ADAPTER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static RELOCATE_CACHE: RefCell<HashMap<SegmentId, Arc<Arena>>> = RefCell::new(HashMap::new());
}

/// The transport-facing shim. One per process (or per transport
/// instance); `install` creates the process's local arena, `uninstall`
/// releases it.
pub struct TransportAdapter {
    registry: &'static ArenaRegistry,
    local_key: String,
    local_arena: Arc<Arena>,
    local_allocations: Mutex<HashMap<usize, Arc<Arena>>>,
    remote_arenas: Mutex<HashMap<String, Arc<Arena>>>,
    segment_dir: Arc<dyn SegmentDirectory>,
}

impl TransportAdapter {
    /// Read pool size, alignment, and page-backing flags from `config`
    /// and create the process's local arena via the registry.
    pub fn install(config: ArenaConfig, segment_dir: Arc<dyn SegmentDirectory>) -> Result<Self> {
        let registry = ArenaRegistry::global();
        let local_key = format!("adapter-{}", NEXT_ADAPTER_ID.fetch_add(1, Ordering::Relaxed));
        let local_arena = registry.get_or_create(&local_key, &config)?;

        Ok(Self {
            registry,
            local_key,
            local_arena,
            local_allocations: Mutex::new(HashMap::new()),
            remote_arenas: Mutex::new(HashMap::new()),
            segment_dir,
        })
    }

    /// Allocate a buffer from the local arena and return what the control
    /// plane needs to publish for it.
    pub fn allocate_local_memory(&self, size: usize, alignment: Option<usize>) -> Result<LocalBuffer> {
        let handle = self.local_arena.allocate(size, alignment)?;
        let arena_name = self
            .local_arena
            .name()
            .ok_or(ArenaError::InvalidArgument("local arena has no published name"))?;

        self.local_allocations
            .lock()
            .insert(handle.addr, self.local_arena.clone());

        Ok(LocalBuffer {
            addr: handle.addr,
            arena_name,
            offset: handle.offset,
            length: handle.aligned_size,
        })
    }

    /// Forget the adapter's bookkeeping record for `addr`. The
    /// underlying arena memory is not reclaimed — bump arenas only give
    /// memory back on `reset`.
    pub fn free_local_memory(&self, addr: usize) {
        self.local_allocations.lock().remove(&addr);
    }

    /// No-op: buffer deregistration is a control-plane concern once the
    /// arena itself has no per-buffer bookkeeping to undo.
    pub fn remove_memory_buffer(&self, _addr: usize) {}

    /// Translate a remote `(segment_id, offset, length)` target into a
    /// local address.
    ///
    /// Checks the calling thread's cache first (the hot path: no lock).
    /// On a miss, takes the adapter mutex, consults the process-wide
    /// map, and if still absent, asks the segment directory for the
    /// owning buffer, attaches to its arena via the registry, and
    /// populates both maps before translating.
    pub fn relocate(&self, segment_id: SegmentId, offset: u64, length: u64) -> Result<usize> {
        if let Some(arena) = RELOCATE_CACHE.with(|cache| cache.borrow().get(&segment_id).cloned()) {
            return arena.translate_offset(offset, length);
        }

        let arena = {
            let mut remote = self.remote_arenas.lock();
            let buffer = self
                .segment_dir
                .buffer_for(segment_id, offset)
                .ok_or_else(|| ArenaError::NotFound(format!("segment {segment_id}")))?;

            if let Some(existing) = remote.get(&buffer.arena_name) {
                existing.clone()
            } else {
                let attached = self.registry.attach(&buffer.arena_name, None)?;
                remote.insert(buffer.arena_name.clone(), attached.clone());
                attached
            }
        };

        RELOCATE_CACHE.with(|cache| cache.borrow_mut().insert(segment_id, arena.clone()));
        arena.translate_offset(offset, length)
    }

    /// Drop all handle records and caches, and release the registry
    /// reference to the local arena. Does not clear other threads'
    /// relocate caches — each thread drops its own on exit.
    pub fn uninstall(self) {
        RELOCATE_CACHE.with(|cache| cache.borrow_mut().clear());
        self.local_allocations.lock().clear();
        self.remote_arenas.lock().clear();
        self.registry.remove(&self.local_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    struct StaticDirectory {
        buffers: HashMap<SegmentId, RemoteBuffer>,
    }

    impl SegmentDirectory for StaticDirectory {
        fn buffer_for(&self, segment_id: SegmentId, offset: u64) -> Option<RemoteBuffer> {
            self.buffers.get(&segment_id).and_then(|b| {
                if offset >= b.base_offset && offset < b.base_offset + b.length {
                    Some(b.clone())
                } else {
                    None
                }
            })
        }
    }

    fn test_config(suffix: &str) -> ArenaConfig {
        ArenaConfig {
            pool_size_bytes: 2 * 1024 * 1024,
            alignment_bytes: 64,
            name_prefix: format!("/zc_arena_adapter_{}_{}_", process::id(), suffix),
            use_large_pages: false,
            prefault_pages: true,
        }
    }

    #[test]
    fn allocate_then_relocate_round_trip() {
        // Owner side: install an adapter, allocate a buffer, write a marker.
        let owner_dir: Arc<dyn SegmentDirectory> = Arc::new(StaticDirectory {
            buffers: HashMap::new(),
        });
        let owner = TransportAdapter::install(test_config("owner"), owner_dir).unwrap();
        let buf = owner.allocate_local_memory(256, None).unwrap();
        unsafe { std::ptr::write_bytes(buf.addr as *mut u8, 0x5A, 256) };

        // Requester side: a segment directory pointing at the owner's
        // published arena name, and a relocate call through the adapter.
        let mut buffers = HashMap::new();
        buffers.insert(
            1u64,
            RemoteBuffer {
                arena_name: buf.arena_name.clone(),
                base_offset: buf.offset,
                length: buf.length as u64,
            },
        );
        let requester_dir: Arc<dyn SegmentDirectory> = Arc::new(StaticDirectory { buffers });
        let requester = TransportAdapter::install(test_config("requester"), requester_dir).unwrap();

        let local_addr = requester.relocate(1, buf.offset, 256).unwrap();
        unsafe {
            for i in 0..256 {
                assert_eq!(*((local_addr + i) as *const u8), 0x5A);
            }
        }

        // Second call hits the thread-local cache, same result.
        let local_addr_again = requester.relocate(1, buf.offset, 256).unwrap();
        assert_eq!(local_addr, local_addr_again);
    }

    #[test]
    fn relocate_missing_segment_is_not_found() {
        let dir: Arc<dyn SegmentDirectory> = Arc::new(StaticDirectory {
            buffers: HashMap::new(),
        });
        let adapter = TransportAdapter::install(test_config("missing"), dir).unwrap();
        let err = adapter.relocate(99, 0, 8).unwrap_err();
        assert!(matches!(err, ArenaError::NotFound(_)));
    }

    #[test]
    fn free_local_memory_drops_bookkeeping_only() {
        let dir: Arc<dyn SegmentDirectory> = Arc::new(StaticDirectory {
            buffers: HashMap::new(),
        });
        let adapter = TransportAdapter::install(test_config("free"), dir).unwrap();
        let buf = adapter.allocate_local_memory(64, None).unwrap();
        assert_eq!(adapter.local_allocations.lock().len(), 1);

        adapter.free_local_memory(buf.addr);
        assert_eq!(adapter.local_allocations.lock().len(), 0);
    }
}
