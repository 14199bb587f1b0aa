pub mod gtt;

use crate::error::DqmResult;

/// A sub-allocation of GPU-visible memory (MQDs, runlist IBs, fences, HPD EOP buffers).
///
/// Deliberately not `Clone`: every allocation is freed exactly once by handing it back
/// to the allocator that produced it.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    pub gpu_addr: u64, // GPU Virtual Address
    pub size: usize,   // Size in bytes
}

impl Allocation {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.gpu_addr + self.size as u64
    }
}

/// Trait for sub-allocation strategies over a GPU-visible aperture.
///
/// Implementations are internally synchronized; callers may hold device locks while
/// allocating.
pub trait SubAllocator {
    /// Reserve `size` bytes, zero-filled.
    ///
    /// # Errors
    /// Returns `DqmError::AllocationFailure` when no hole is large enough.
    fn allocate(&self, size: usize) -> DqmResult<Allocation>;

    /// Return a previous allocation to the pool.
    fn free(&self, alloc: Allocation);

    /// Get the aperture's base and limit.
    fn bounds(&self) -> (u64, u64);
}

// Re-export the arena for easy access
pub use gtt::GttMemory;
