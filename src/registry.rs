//! Process-wide directory of named arenas.
//!
//! Multiple subsystems within one process ask for the same logical name
//! and get back the same `Arc<Arena>`, so there is exactly one mapping
//! per name per process. The mutex here only ever covers map mutation;
//! the arenas themselves are independently thread-safe (see `arena.rs`).

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::config::ArenaConfig;
use crate::error::Result;
use crate::platform::sys;

static REGISTRY: Lazy<ArenaRegistry> = Lazy::new(ArenaRegistry::new);

/// A process-global, mutex-guarded directory from name to arena handle.
pub struct ArenaRegistry {
    arenas: Mutex<HashMap<String, Arc<Arena>>>,
}

impl ArenaRegistry {
    fn new() -> Self {
        Self {
            arenas: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide singleton. Lazily initialized on first use; there
    /// is no explicit lifecycle beyond that.
    pub fn global() -> &'static ArenaRegistry {
        &REGISTRY
    }

    /// Return the arena already registered under `name`, or create a new
    /// owner arena and register it.
    pub fn get_or_create(&self, name: &str, config: &ArenaConfig) -> Result<Arc<Arena>> {
        let mut arenas = self.arenas.lock();
        if let Some(existing) = arenas.get(name) {
            return Ok(existing.clone());
        }

        let arena = Arc::new(Arena::new());
        arena.initialize(config)?;
        arenas.insert(name.to_string(), arena.clone());
        Ok(arena)
    }

    /// Return the arena already registered under `name`, or attach to an
    /// existing SHM region by that name and register it.
    ///
    /// `name` here is the real SHM object name (what the owner published
    /// over the control plane), not a free-form logical key — an
    /// attacher has nothing else to key by.
    pub fn attach(&self, name: &str, expected_size: Option<usize>) -> Result<Arc<Arena>> {
        let mut arenas = self.arenas.lock();
        if let Some(existing) = arenas.get(name) {
            return Ok(existing.clone());
        }

        let arena = Arc::new(Arena::new());
        arena.attach(name, expected_size)?;
        arenas.insert(name.to_string(), arena.clone());
        Ok(arena)
    }

    /// Drop the registry's reference to `name`. The arena itself survives
    /// until every other `Arc<Arena>` holder (adapter caches, callers)
    /// releases its handle.
    pub fn remove(&self, name: &str) {
        self.arenas.lock().remove(name);
    }

    /// Snapshot of currently-registered names.
    pub fn names(&self) -> Vec<String> {
        self.arenas.lock().keys().cloned().collect()
    }
}

/// Unlink an SHM object by name without going through an `Arena` at all.
///
/// For cleaning up orphaned regions left behind by an owner process that
/// crashed before it could unlink its own name (see `SPEC_FULL.md` §4).
/// Meant for an out-of-band cleanup utility, not for use on a live arena
/// (use [`Arena::teardown`](crate::arena::Arena::teardown) for that).
pub fn unlink_orphan(name: &str) -> Result<()> {
    sys::unlink(name).map_err(|source| crate::error::ArenaError::MapFailed {
        name: name.to_string(),
        source,
    })
}
