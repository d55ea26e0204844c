//! The arena: a single named shared-memory region carved by a lock-free
//! bump cursor.
//!
//! An `Arena` is either an **owner** (created the region, unlinks it on
//! teardown) or an **attacher** (mapped an existing region, never
//! unlinks). `initialize`/`attach` are the only ways to move an arena out
//! of `Uninitialized`; both publish `base` with release ordering only
//! after every other field the hot path depends on (`pool_size`,
//! `alignment`) has been stored, so any thread that observes `base != 0`
//! with an acquire load also observes consistent metadata.

use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustix::fd::OwnedFd;

use crate::config::{ArenaConfig, LARGE_PAGE_SIZE};
use crate::error::{ArenaError, Result};
use crate::platform::sys;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// An immutable record of a successful allocation.
///
/// A zero `addr` denotes an invalid handle; in practice every handle
/// returned from [`Arena::allocate`] is valid, since failures are
/// reported as `Err` rather than as a null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHandle {
    pub addr: usize,
    pub offset: u64,
    pub aligned_size: usize,
    pub arena_id: u64,
}

impl AllocationHandle {
    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

/// Point-in-time counters for an arena.
#[derive(Debug, Clone, Copy)]
pub struct ArenaStats {
    pub allocated_bytes: usize,
    pub peak_allocated: usize,
    pub pool_size: usize,
    pub alignment: usize,
    pub num_allocations: u64,
    pub num_failed_allocs: u64,
}

/// Metadata that only changes under `init_lock`, and is read on the
/// (cold) identity/teardown paths rather than the allocate/translate
/// hot path.
struct Region {
    name: String,
    fd: OwnedFd,
}

/// A single contiguous, pre-mapped shared-memory region carved by a bump
/// cursor. See the module docs for the publication discipline.
pub struct Arena {
    id: u64,
    base: AtomicUsize,
    pool_size: AtomicUsize,
    alignment: AtomicUsize,
    cursor: AtomicUsize,
    peak_used: AtomicUsize,
    num_allocations: AtomicU64,
    num_failed_allocs: AtomicU64,
    is_owner: AtomicBool,
    init_lock: Mutex<()>,
    region: Mutex<Option<Region>>,
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

fn round_up_large_page(size: usize) -> Option<usize> {
    align_up(size, LARGE_PAGE_SIZE)
}

impl Arena {
    /// Create an uninitialized arena with a fresh, process-unique id.
    pub fn new() -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            base: AtomicUsize::new(0),
            pool_size: AtomicUsize::new(0),
            alignment: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            peak_used: AtomicUsize::new(0),
            num_allocations: AtomicU64::new(0),
            num_failed_allocs: AtomicU64::new(0),
            is_owner: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            region: Mutex::new(None),
        }
    }

    /// Process-unique numeric id tagging every allocation this arena
    /// produces.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The SHM object name, once initialized or attached.
    pub fn name(&self) -> Option<String> {
        self.region.lock().as_ref().map(|r| r.name.clone())
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.is_owner.load(Ordering::Relaxed)
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.load(Ordering::Acquire)
    }

    /// Create the backing SHM region, size and map it, and publish `base`.
    ///
    /// Validates inputs, rounds the pool size up to a large-page
    /// multiple, creates the SHM object exclusively (`{prefix}{pid}_{id}`),
    /// resizes and maps it, and eagerly populates pages (or falls back to
    /// an explicit write pass). Serialized by an internal mutex so
    /// concurrent callers resolve to exactly one success; the losers see
    /// [`ArenaError::AlreadyInitialized`].
    pub fn initialize(&self, config: &ArenaConfig) -> Result<()> {
        if config.pool_size_bytes == 0 {
            return Err(ArenaError::InvalidArgument("pool size must be non-zero"));
        }
        let alignment = if config.alignment_bytes == 0 {
            crate::config::DEFAULT_ALIGNMENT
        } else {
            config.alignment_bytes
        };
        if !alignment.is_power_of_two() {
            return Err(ArenaError::InvalidArgument(
                "alignment must be a power of two",
            ));
        }

        let _guard = self.init_lock.lock();
        if self.base_addr() != 0 {
            return Err(ArenaError::AlreadyInitialized);
        }

        let rounded = round_up_large_page(config.pool_size_bytes).ok_or(ArenaError::OutOfMemory)?;
        let name = format!("{}{}_{}", config.name_prefix, process::id(), self.id);

        let fd = sys::create_exclusive(&name)
            .map_err(|source| ArenaError::CreateFailed { name: name.clone(), source })?;

        if let Err(source) = sys::resize(&fd, rounded) {
            if let Err(unlink_err) = sys::unlink(&name) {
                tracing::warn!(arena = %name, error = %unlink_err, "failed to unlink shared-memory object after resize failure");
            }
            return Err(ArenaError::ResizeFailed { name, size: rounded, source });
        }

        let mapped = match sys::map(&fd, rounded, config.prefault_pages, config.use_large_pages) {
            Ok(mapped) => mapped,
            Err(source) => {
                if let Err(unlink_err) = sys::unlink(&name) {
                    tracing::warn!(arena = %name, error = %unlink_err, "failed to unlink shared-memory object after map failure");
                }
                return Err(ArenaError::MapFailed { name, source });
            }
        };

        if config.use_large_pages && !mapped.used_large_pages {
            tracing::warn!(arena = %name, "large-page mapping unsupported, downgraded to regular pages");
        }

        if config.prefault_pages && !sys::populate_is_native() {
            sys::prefault_write_pass(mapped.addr, rounded);
        }

        sys::advise_dontfork(mapped.addr, rounded);

        *self.region.lock() = Some(Region { name: name.clone(), fd });
        self.is_owner.store(true, Ordering::Relaxed);
        self.pool_size.store(rounded, Ordering::Relaxed);
        self.alignment.store(alignment, Ordering::Relaxed);
        self.base.store(mapped.addr, Ordering::Release);

        tracing::info!(arena = %name, size = rounded, alignment, "arena initialized");
        Ok(())
    }

    /// Open an existing region and map it.
    ///
    /// `expected_size`, when `Some`, is compared against the region's
    /// actual size; a mismatch is reported as [`ArenaError::InvalidArgument`].
    /// Passing `None` skips that check (used by the transport adapter's
    /// hot path, which has no independent source of truth for the total
    /// pool size — see `SPEC_FULL.md` §5, resolution 5).
    pub fn attach(&self, name: &str, expected_size: Option<usize>) -> Result<()> {
        let _guard = self.init_lock.lock();
        if self.base_addr() != 0 {
            return Err(ArenaError::AlreadyInitialized);
        }

        let fd = sys::open_existing(name).map_err(|_| ArenaError::NotFound(name.to_string()))?;
        let actual_size = sys::query_size(&fd)
            .map_err(|source| ArenaError::MapFailed { name: name.to_string(), source })?;

        if let Some(expected) = expected_size {
            if actual_size != expected {
                return Err(ArenaError::InvalidArgument("attach size mismatch"));
            }
        }

        let mapped = sys::map(&fd, actual_size, false, false)
            .map_err(|source| ArenaError::MapFailed { name: name.to_string(), source })?;
        sys::advise_dontfork(mapped.addr, actual_size);

        *self.region.lock() = Some(Region {
            name: name.to_string(),
            fd,
        });
        self.is_owner.store(false, Ordering::Relaxed);
        self.pool_size.store(actual_size, Ordering::Relaxed);
        self.alignment.store(crate::config::DEFAULT_ALIGNMENT, Ordering::Relaxed);
        self.base.store(mapped.addr, Ordering::Release);

        tracing::info!(arena = %name, size = actual_size, "arena attached");
        Ok(())
    }

    /// Carve `size` bytes out of the arena, aligned to
    /// `max(arena_alignment, alignment)`. Lock-free: a compare-and-swap
    /// loop aligns the *offset* (not just the size) so the alignment
    /// contract holds regardless of where the cursor sits from a prior,
    /// smaller-alignment allocation. The bounds check happens before the
    /// CAS that advances the cursor, so a failing allocation never
    /// corrupts it.
    pub fn allocate(&self, size: usize, alignment: Option<usize>) -> Result<AllocationHandle> {
        let base = self.base_addr();
        if base == 0 {
            return Err(ArenaError::InvalidArgument("arena not initialized"));
        }
        if size == 0 {
            return Err(ArenaError::InvalidArgument("allocation size must be non-zero"));
        }
        let caller_align = alignment.unwrap_or(1);
        if caller_align == 0 || !caller_align.is_power_of_two() {
            return Err(ArenaError::InvalidArgument(
                "per-call alignment override must be a power of two",
            ));
        }

        let arena_align = self.alignment.load(Ordering::Relaxed);
        let effective_align = arena_align.max(caller_align);
        let pool_size = self.pool_size.load(Ordering::Relaxed);

        loop {
            let raw = self.cursor.load(Ordering::Relaxed);

            let aligned_off = match align_up(raw, effective_align) {
                Some(v) => v,
                None => return self.fail_oom(),
            };
            let aligned_size = match align_up(size, effective_align) {
                Some(v) => v,
                None => return self.fail_oom(),
            };
            let next = match aligned_off.checked_add(aligned_size) {
                Some(v) => v,
                None => return self.fail_oom(),
            };
            if next > pool_size {
                return self.fail_oom();
            }

            if self
                .cursor
                .compare_exchange_weak(raw, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.bump_peak(next);
                self.num_allocations.fetch_add(1, Ordering::Relaxed);
                return Ok(AllocationHandle {
                    addr: base + aligned_off,
                    offset: aligned_off as u64,
                    aligned_size,
                    arena_id: self.id,
                });
            }
            // Contention: another thread's CAS won. Retry with a fresh cursor read.
        }
    }

    fn fail_oom(&self) -> Result<AllocationHandle> {
        self.num_failed_allocs.fetch_add(1, Ordering::Relaxed);
        Err(ArenaError::OutOfMemory)
    }

    fn bump_peak(&self, candidate: usize) {
        let mut current = self.peak_used.load(Ordering::Relaxed);
        while candidate > current {
            match self
                .peak_used
                .compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Compute the local address for `[offset, offset+size)`. `O(1)`,
    /// replacing the prior linear segment-table walk.
    pub fn translate_offset(&self, offset: u64, size: u64) -> Result<usize> {
        let base = self.base_addr();
        if base == 0 {
            return Err(ArenaError::InvalidArgument("arena not initialized"));
        }
        let pool_size = self.pool_size.load(Ordering::Relaxed) as u64;
        let end = offset
            .checked_add(size)
            .ok_or(ArenaError::InvalidArgument("offset + size overflows"))?;
        if offset >= pool_size || end > pool_size {
            return Err(ArenaError::InvalidArgument("offset out of bounds"));
        }
        Ok(base + offset as usize)
    }

    /// Inverse of `translate_offset`: the offset of a local address, or
    /// `None` if it does not belong to this arena.
    pub fn offset_of(&self, addr: usize) -> Option<u64> {
        let base = self.base_addr();
        if base == 0 || !self.owns_with(base, addr) {
            return None;
        }
        Some((addr - base) as u64)
    }

    /// Whether `addr` falls within `[base, base + pool_size)`.
    pub fn owns(&self, addr: usize) -> bool {
        let base = self.base_addr();
        base != 0 && self.owns_with(base, addr)
    }

    fn owns_with(&self, base: usize, addr: usize) -> bool {
        let pool_size = self.pool_size.load(Ordering::Relaxed);
        addr >= base && addr < base + pool_size
    }

    /// Snapshot the current counters.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            allocated_bytes: self.cursor.load(Ordering::Relaxed),
            peak_allocated: self.peak_used.load(Ordering::Relaxed),
            pool_size: self.pool_size.load(Ordering::Relaxed),
            alignment: self.alignment.load(Ordering::Relaxed),
            num_allocations: self.num_allocations.load(Ordering::Relaxed),
            num_failed_allocs: self.num_failed_allocs.load(Ordering::Relaxed),
        }
    }

    /// Rewind the cursor to zero, reclaiming the whole arena at once.
    ///
    /// # Safety
    /// The caller must guarantee that no previously returned allocation
    /// is still in use; the arena has no way to check this itself.
    pub unsafe fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Unmap the region and, if this arena is the owner, unlink its SHM
    /// name. Idempotent: safe to call multiple times, including during
    /// `Drop`.
    pub fn teardown(&self) {
        let base = self.base.swap(0, Ordering::AcqRel);
        if base == 0 {
            return;
        }
        let pool_size = self.pool_size.load(Ordering::Relaxed);
        sys::unmap(base, pool_size);

        if let Some(region) = self.region.lock().take() {
            if self.is_owner.load(Ordering::Relaxed) {
                if let Err(err) = sys::unlink(&region.name) {
                    tracing::warn!(arena = %region.name, error = %err, "failed to unlink shared-memory object");
                }
            }
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.teardown();
    }
}

// Safety: all mutable state is either behind `parking_lot::Mutex` or an
// atomic; `base`/`pool_size`/`alignment` are published with release and
// read with acquire before any other field they gate is touched.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn test_config(pool_size: usize) -> ArenaConfig {
        ArenaConfig {
            pool_size_bytes: pool_size,
            alignment_bytes: 64,
            name_prefix: format!("/zc_arena_test_{}_", process::id()),
            use_large_pages: false,
            prefault_pages: true,
        }
    }

    #[test]
    fn basic_alloc_write_read() {
        let arena = Arena::new();
        arena.initialize(&test_config(2 * 1024 * 1024)).unwrap();

        let handle = arena.allocate(1024, None).unwrap();
        assert!(!handle.is_null());
        assert!(handle.aligned_size >= 1024 && handle.aligned_size <= 1088);

        unsafe {
            std::ptr::write_bytes(handle.addr as *mut u8, 0xAB, 1024);
            for i in 0..1024 {
                assert_eq!(*((handle.addr + i) as *const u8), 0xAB);
            }
        }

        let stats = arena.stats();
        assert_eq!(stats.num_allocations, 1);
        assert!(stats.allocated_bytes >= 1024 && stats.allocated_bytes <= 1088);
    }

    #[test]
    fn overflow_safe_oom() {
        let arena = Arena::new();
        arena.initialize(&test_config(1024 * 1024)).unwrap();

        let err = arena.allocate(usize::MAX, None).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory));
        assert_eq!(arena.stats().allocated_bytes, 0);
        assert_eq!(arena.stats().num_failed_allocs, 1);

        let handle = arena.allocate(1024, None).unwrap();
        assert_eq!(handle.offset, 0);
    }

    #[test]
    fn exact_capacity_then_oom() {
        let arena = Arena::new();
        arena.initialize(&test_config(2 * 1024 * 1024)).unwrap();
        let pool_size = arena.stats().pool_size;

        let handle = arena.allocate(pool_size, None).unwrap();
        assert_eq!(handle.offset, 0);
        assert_eq!(arena.stats().allocated_bytes, pool_size);

        let err = arena.allocate(1, None).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory));
        assert_eq!(arena.stats().allocated_bytes, pool_size);
    }

    #[test]
    fn translate_and_offset_round_trip() {
        let arena = Arena::new();
        arena.initialize(&test_config(2 * 1024 * 1024)).unwrap();
        let pool_size = arena.stats().pool_size as u64;

        let addr = arena.translate_offset(pool_size - 1, 1).unwrap();
        assert_eq!(arena.offset_of(addr), Some(pool_size - 1));

        assert!(arena.translate_offset(pool_size, 0).is_err());
    }

    #[test]
    fn mixed_alignment() {
        let arena = Arena::new();
        arena.initialize(&test_config(16 * 1024 * 1024)).unwrap();

        let a = arena.allocate(1, Some(64)).unwrap();
        let b = arena.allocate(4 * 1024 * 1024, Some(2 * 1024 * 1024)).unwrap();

        assert_eq!(b.addr % (2 * 1024 * 1024), 0);
        assert!(b.addr >= a.addr + 64);
    }

    #[test]
    fn concurrent_allocate_never_exceeds_pool() {
        let arena = Arc::new(Arena::new());
        arena.initialize(&test_config(1024 * 1024)).unwrap();
        let pool_size = arena.stats().pool_size;

        let per_thread = (pool_size / (64 * 16)) + 100;
        let mut handles = vec![];
        for _ in 0..16 {
            let arena = arena.clone();
            handles.push(thread::spawn(move || {
                let mut successes = 0u64;
                let mut failures = 0u64;
                for _ in 0..per_thread {
                    match arena.allocate(64, None) {
                        Ok(_) => successes += 1,
                        Err(_) => failures += 1,
                    }
                }
                (successes, failures)
            }));
        }

        let (mut total_ok, mut total_err) = (0u64, 0u64);
        for h in handles {
            let (ok, err) = h.join().unwrap();
            total_ok += ok;
            total_err += err;
        }

        let stats = arena.stats();
        assert!(stats.allocated_bytes <= pool_size);
        assert!(stats.num_failed_allocs > 0);
        assert_eq!(total_ok + total_err, 16 * per_thread as u64);
    }

    #[test]
    fn concurrent_initialize_exactly_one_winner() {
        let arena = Arc::new(Arena::new());
        let config = Arc::new(test_config(1024 * 1024));

        let mut handles = vec![];
        for _ in 0..16 {
            let arena = arena.clone();
            let config = config.clone();
            handles.push(thread::spawn(move || arena.initialize(&config)));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        let already_count = results
            .iter()
            .filter(|r| matches!(r, Err(ArenaError::AlreadyInitialized)))
            .count();

        assert_eq!(ok_count, 1);
        assert_eq!(already_count, 15);

        let handle = arena.allocate(8, None).unwrap();
        assert!(!handle.is_null());
    }

    #[test]
    fn attach_round_trip() {
        let owner = Arena::new();
        owner.initialize(&test_config(16 * 1024 * 1024)).unwrap();
        let handle = owner.allocate(4096, None).unwrap();
        unsafe { std::ptr::write_bytes(handle.addr as *mut u8, 0xCD, 4096) };

        let name = owner.name().unwrap();
        let pool_size = owner.stats().pool_size;

        let attacher = Arena::new();
        attacher.attach(&name, Some(pool_size)).unwrap();

        let addr = attacher.translate_offset(handle.offset, 4096).unwrap();
        unsafe {
            for i in 0..4096 {
                assert_eq!(*((addr + i) as *const u8), 0xCD);
            }
        }
    }

    #[test]
    fn attach_size_mismatch_is_invalid_argument() {
        let owner = Arena::new();
        owner.initialize(&test_config(2 * 1024 * 1024)).unwrap();
        let name = owner.name().unwrap();

        let attacher = Arena::new();
        let err = attacher.attach(&name, Some(123)).unwrap_err();
        assert!(matches!(err, ArenaError::InvalidArgument(_)));
    }

    #[test]
    fn double_teardown_is_safe() {
        let arena = Arena::new();
        arena.initialize(&test_config(2 * 1024 * 1024)).unwrap();
        arena.teardown();
        arena.teardown();
    }
}
