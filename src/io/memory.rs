//! Physical memory queries and allocator housekeeping.

use std::sync::Arc;

use sysinfo::System;

/// Assumed free memory when the platform cannot report it
pub const DEFAULT_MEMORY_CAPACITY: u64 = 16 * 1024 * 1024 * 1024;

/// Zero-argument query for currently available physical memory in bytes
pub type FreeMemoryFn = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// Available physical memory as reported by the OS
pub fn system_free_memory() -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_memory();
    match sys.available_memory() {
        0 => None,
        available => Some(available),
    }
}

/// [`FreeMemoryFn`] backed by [`system_free_memory`]
pub fn system_memory_query() -> FreeMemoryFn {
    Arc::new(system_free_memory)
}

/// Evaluate `query`, falling back to [`DEFAULT_MEMORY_CAPACITY`]
pub fn free_memory_or_default(query: &FreeMemoryFn) -> u64 {
    query().unwrap_or(DEFAULT_MEMORY_CAPACITY)
}

/// Ask the allocator to hand freed pages back to the OS.
///
/// Large blocks are already unmapped on free; this trims what the heap
/// arenas still hold after many mid-sized allocations.
pub fn release_freed_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe {
        libc::malloc_trim(0);
    }
}
