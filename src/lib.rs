#[cfg(not(target_pointer_width = "64"))]
compile_error!("tieralloc supports only 64-bit targets.");

// public module: tiers and helpers are pub(crate), the API is re-exported below
pub mod memory;

// allocator
pub use memory::config::AllocatorConfig;
pub use memory::tiered::TieredAllocator;

// diagnostics
pub use memory::free_list::FreeListStats;
pub use memory::size_class::SizeClassStats;
pub use memory::stats::MemoryStats;

// errors
pub use memory::error::AllocError;
pub use memory::vm::VmError;

// platform
pub use memory::vm::{HeapVmOps, PlatformVmOps, VmOps};
