#![allow(clippy::cast_possible_truncation)]

use super::{Allocation, SubAllocator};
use crate::error::{DqmError, DqmResult};
use crate::utils::align_up;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default sub-allocation granularity. MQDs must be 256-byte aligned.
pub const GTT_SA_ALIGN: u64 = 256;

/// A GPU-visible, CPU-coherent arena in the GTT aperture.
///
/// The CPU writes descriptors and polls fences through `read_u32`/`write_u32`; the
/// device (or `SimulatedGpu`) writes back through the same words. Holes are tracked
/// in an ordered map and handed out first-fit.
#[derive(Debug)]
pub struct GttMemory {
    base: u64,
    limit: u64,
    align: u64,

    words: Box<[AtomicU32]>,

    // Tracks occupied ranges: Start Address -> Size
    // Used to find holes for new allocations.
    allocations: Mutex<BTreeMap<u64, u64>>,
}

impl GttMemory {
    /// Creates an arena of `size` bytes mapped at GPU address `base`.
    ///
    /// # Panics
    /// Panics if `base` or `size` is not dword aligned.
    #[must_use]
    pub fn new(base: u64, size: usize) -> Self {
        assert!(base % 4 == 0 && size % 4 == 0, "GTT arena must be dword aligned");
        let words = (0..size / 4).map(|_| AtomicU32::new(0)).collect();

        Self {
            base,
            limit: base + size as u64,
            align: GTT_SA_ALIGN,
            words,
            allocations: Mutex::new(BTreeMap::new()),
        }
    }

    fn index(&self, gpu_addr: u64) -> DqmResult<usize> {
        if gpu_addr % 4 != 0 || gpu_addr < self.base || gpu_addr + 4 > self.limit {
            return Err(DqmError::InvalidArgument(format!(
                "GTT address 0x{gpu_addr:x} outside arena 0x{:x}..0x{:x}",
                self.base, self.limit
            )));
        }
        Ok(((gpu_addr - self.base) / 4) as usize)
    }

    /// Reads one dword at `gpu_addr` with acquire ordering.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for unaligned or out-of-arena addresses.
    pub fn read_u32(&self, gpu_addr: u64) -> DqmResult<u32> {
        let idx = self.index(gpu_addr)?;
        Ok(self.words[idx].load(Ordering::Acquire))
    }

    /// Writes one dword at `gpu_addr` with release ordering.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for unaligned or out-of-arena addresses.
    pub fn write_u32(&self, gpu_addr: u64, value: u32) -> DqmResult<()> {
        let idx = self.index(gpu_addr)?;
        self.words[idx].store(value, Ordering::Release);
        Ok(())
    }

    /// Copies `data` into the arena starting at `gpu_addr`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if any part of the range falls outside the arena.
    pub fn write_dwords(&self, gpu_addr: u64, data: &[u32]) -> DqmResult<()> {
        let first = self.index(gpu_addr)?;
        if data.len() > 1 {
            self.index(gpu_addr + 4 * (data.len() as u64 - 1))?;
        }
        for (slot, value) in self.words[first..first + data.len()].iter().zip(data) {
            slot.store(*value, Ordering::Release);
        }
        Ok(())
    }

    /// Reads `count` dwords starting at `gpu_addr`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if any part of the range falls outside the arena.
    pub fn read_dwords(&self, gpu_addr: u64, count: usize) -> DqmResult<Vec<u32>> {
        let first = self.index(gpu_addr)?;
        if count > 1 {
            self.index(gpu_addr + 4 * (count as u64 - 1))?;
        }
        Ok(self.words[first..first + count]
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect())
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocations.lock().values().sum()
    }

    fn zero(&self, start: u64, size: u64) {
        let first = ((start - self.base) / 4) as usize;
        let count = (size / 4) as usize;
        for word in &self.words[first..first + count] {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl SubAllocator for GttMemory {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// First-fit hole search over the sorted allocation map.
    fn allocate(&self, size: usize) -> DqmResult<Allocation> {
        if size == 0 {
            return Err(DqmError::InvalidArgument("zero-sized GTT allocation".into()));
        }
        let request_size = align_up(size as u64, 4);
        let mut allocations = self.allocations.lock();

        let mut candidate_start = align_up(self.base, self.align);
        let mut found = None;

        // Iterate over existing allocations to find a hole
        for (&alloc_start, &alloc_size) in allocations.iter() {
            if alloc_start >= candidate_start && alloc_start - candidate_start >= request_size {
                found = Some(candidate_start);
                break;
            }

            // Move candidate to the end of the current allocation, aligned
            candidate_start = align_up(alloc_start + alloc_size, self.align);
        }

        // Check space after the last allocation (or if map was empty)
        if found.is_none() && candidate_start + request_size <= self.limit {
            found = Some(candidate_start);
        }

        let Some(start) = found else {
            warn!("GTT sub-allocator exhausted: {size} bytes requested");
            return Err(DqmError::AllocationFailure(size));
        };

        allocations.insert(start, request_size);
        drop(allocations);
        self.zero(start, request_size);

        debug!("GTT allocation 0x{start:x} ({request_size} bytes)");
        Ok(Allocation {
            gpu_addr: start,
            size: request_size as usize,
        })
    }

    fn free(&self, alloc: Allocation) {
        if self.allocations.lock().remove(&alloc.gpu_addr).is_none() {
            warn!(
                "GTT free of 0x{:x} which was not tracked",
                alloc.gpu_addr
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let gtt = GttMemory::new(0x10_0000, 4096);
        let a = gtt.allocate(12).unwrap();
        gtt.write_dwords(a.gpu_addr, &[1, 2, 3]).unwrap();
        let b = gtt.allocate(8).unwrap();

        assert_eq!(a.gpu_addr % GTT_SA_ALIGN, 0);
        assert_eq!(b.gpu_addr % GTT_SA_ALIGN, 0);
        assert!(b.gpu_addr >= a.end());

        let a_addr = a.gpu_addr;
        gtt.free(a);
        let c = gtt.allocate(12).unwrap();
        assert_eq!(c.gpu_addr, a_addr, "first-fit reuses the freed hole");
        assert_eq!(gtt.read_dwords(c.gpu_addr, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn exhaustion_reports_allocation_failure() {
        let gtt = GttMemory::new(0, 512);
        let _a = gtt.allocate(256).unwrap();
        let _b = gtt.allocate(256).unwrap();
        match gtt.allocate(4) {
            Err(DqmError::AllocationFailure(4)) => {}
            other => panic!("expected allocation failure, got {other:?}"),
        }
    }

    #[test]
    fn out_of_arena_access_is_rejected() {
        let gtt = GttMemory::new(0x1000, 256);
        assert!(gtt.read_u32(0x0ffc).is_err());
        assert!(gtt.read_u32(0x1100).is_err());
        assert!(gtt.write_dwords(0x10f8, &[0, 0, 0]).is_err());
        gtt.write_u32(0x10fc, 7).unwrap();
        assert_eq!(gtt.read_u32(0x10fc).unwrap(), 7);
    }
}
