//! Arena configuration.
//!
//! Defaults follow the adapter-observable configuration keys: a 64 GiB
//! pool, 64-byte alignment, large pages on, prefault on.

/// Minimum allocation alignment used when a caller does not override it.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Large-page granularity the pool size is rounded up to.
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

const DEFAULT_POOL_SIZE: usize = 64 * 1024 * 1024 * 1024;
const DEFAULT_NAME_PREFIX: &str = "/zc_arena_";

/// Construction parameters for [`crate::arena::Arena::initialize`].
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Requested pool size in bytes, before large-page rounding.
    pub pool_size_bytes: usize,
    /// Minimum allocation alignment; must be a power of two.
    pub alignment_bytes: usize,
    /// Prefix used to build the SHM object name: `{prefix}{pid}_{arena_id}`.
    pub name_prefix: String,
    /// Request large-page backing; downgrades (with a log) if unsupported.
    pub use_large_pages: bool,
    /// Eagerly populate pages at map time so foreign DMA never takes a
    /// lazy fault.
    pub prefault_pages: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            pool_size_bytes: DEFAULT_POOL_SIZE,
            alignment_bytes: DEFAULT_ALIGNMENT,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            use_large_pages: true,
            prefault_pages: true,
        }
    }
}

/// `DISABLE_ARENA=1` escape hatch: callers that observe this should fall
/// back to a direct per-buffer mapping instead of routing through the
/// arena. The fallback path must still honour `alignment_bytes` and
/// large-page rounding; the arena crate only exposes the check, it does
/// not implement the fallback allocator itself (that lives in the
/// transport engine, an external collaborator).
pub fn arena_disabled_by_env() -> bool {
    std::env::var_os("DISABLE_ARENA").map(|v| v == "1").unwrap_or(false)
}
