//! Bitmap allocators for the hardware resources a device multiplexes between contexts.
//!
//! None of these types lock: the device queue manager's exclusive lock covers every
//! allocation, the programming that follows and the commit of the result.

use crate::error::{DqmError, DqmResult, Resource};
use crate::kfd::device::DeviceInfo;
use log::{debug, warn};

// ===============================================================================================
// IdBitmap
// ===============================================================================================

/// A fixed-size set bitmap with lowest-free-bit search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdBitmap {
    words: Vec<u64>,
    len: u32,
}

impl IdBitmap {
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; len.div_ceil(64) as usize],
            len,
        }
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn test(&self, bit: u32) -> bool {
        bit < self.len && self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    pub fn set(&mut self, bit: u32) {
        if bit < self.len {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn clear(&mut self, bit: u32) {
        if bit < self.len {
            self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
        }
    }

    /// Lowest clear bit, if any.
    #[must_use]
    pub fn first_free(&self) -> Option<u32> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i as u32 * 64 + w.trailing_ones())
            .filter(|bit| *bit < self.len)
    }

    /// Sets and returns the lowest clear bit.
    pub fn allocate(&mut self) -> Option<u32> {
        let bit = self.first_free()?;
        self.set(bit);
        Some(bit)
    }

    #[must_use]
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

// ===============================================================================================
// Resource Pool
// ===============================================================================================

/// A hardware queue descriptor slot, relative to the first pipe reserved for queue
/// management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HqdSlot {
    pub pipe: u32,
    pub slot: u32,
}

/// Occupancy of every pool bitmap at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub vmids: IdBitmap,
    pub hqds: Vec<IdBitmap>,
    pub sdma: IdBitmap,
}

impl PoolSnapshot {
    /// True when nothing is allocated.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.vmids.count_set() == 0
            && self.sdma.count_set() == 0
            && self.hqds.iter().all(|p| p.count_set() == 0)
    }
}

#[derive(Debug)]
pub struct ResourcePool {
    first_vmid: u32,
    vmids: IdBitmap,
    hqds: Vec<IdBitmap>,
    next_pipe_to_allocate: u32,
    sdma: IdBitmap,
    sdma_engines: u32,
    quarantined: Vec<HqdSlot>,
}

impl ResourcePool {
    #[must_use]
    pub fn new(info: &DeviceInfo) -> Self {
        Self {
            first_vmid: info.first_vmid,
            vmids: IdBitmap::new(info.vmid_count),
            hqds: (0..info.pipe_count)
                .map(|_| IdBitmap::new(info.queues_per_pipe))
                .collect(),
            next_pipe_to_allocate: 0,
            sdma: IdBitmap::new(info.sdma_engines * info.sdma_queues_per_engine),
            sdma_engines: info.sdma_engines.max(1),
            quarantined: Vec::new(),
        }
    }

    /// # Errors
    /// Returns `ResourceExhausted(Vmid)` when every reserved VMID is in use.
    pub fn allocate_vmid(&mut self) -> DqmResult<u32> {
        let Some(bit) = self.vmids.allocate() else {
            warn!("no free VMID among {} reserved", self.vmids.len());
            return Err(DqmError::ResourceExhausted(Resource::Vmid));
        };
        let vmid = self.first_vmid + bit;
        debug!("allocated VMID {vmid}");
        Ok(vmid)
    }

    pub fn release_vmid(&mut self, vmid: u32) {
        if let Some(bit) = vmid.checked_sub(self.first_vmid) {
            self.vmids.clear(bit);
        }
    }

    /// Lowest free slot on the first pipe, scanning cyclically from the cursor, that
    /// has one. Spreads consecutive allocations across pipes.
    ///
    /// # Errors
    /// Returns `ResourceExhausted(HqdSlot)` when every pipe is full.
    pub fn allocate_hqd(&mut self) -> DqmResult<HqdSlot> {
        let pipe_count = self.hqds.len() as u32;
        for step in 0..pipe_count {
            let pipe = (self.next_pipe_to_allocate + step) % pipe_count;
            if let Some(slot) = self.hqds[pipe as usize].allocate() {
                self.next_pipe_to_allocate = (pipe + 1) % pipe_count;
                debug!("hqd slot allocated - pipe {pipe}, slot {slot}");
                return Ok(HqdSlot { pipe, slot });
            }
        }
        Err(DqmError::ResourceExhausted(Resource::HqdSlot))
    }

    pub fn release_hqd(&mut self, hqd: HqdSlot) {
        if let Some(pipe) = self.hqds.get_mut(hqd.pipe as usize) {
            pipe.clear(hqd.slot);
        }
    }

    /// Keeps a slot whose hardware state is unknown out of circulation.
    pub fn quarantine_hqd(&mut self, hqd: HqdSlot) {
        warn!("quarantining hqd slot pipe {} slot {}", hqd.pipe, hqd.slot);
        self.quarantined.push(hqd);
    }

    #[must_use]
    pub fn quarantined(&self) -> &[HqdSlot] {
        &self.quarantined
    }

    /// # Errors
    /// Returns `ResourceExhausted(SdmaQueue)` when every SDMA queue is in use.
    pub fn allocate_sdma(&mut self) -> DqmResult<u32> {
        let id = self
            .sdma
            .allocate()
            .ok_or(DqmError::ResourceExhausted(Resource::SdmaQueue))?;
        debug!("allocated SDMA queue id {id}");
        Ok(id)
    }

    pub fn release_sdma(&mut self, id: u32) {
        self.sdma.clear(id);
    }

    /// Splits an SDMA id into `(engine, queue)`.
    #[must_use]
    pub const fn sdma_placement(&self, id: u32) -> (u32, u32) {
        (id % self.sdma_engines, id / self.sdma_engines)
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            vmids: self.vmids.clone(),
            hqds: self.hqds.clone(),
            sdma: self.sdma.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DeviceInfo {
        DeviceInfo::carrizo()
    }

    #[test]
    fn bitmap_finds_lowest_free_across_words() {
        let mut map = IdBitmap::new(70);
        for _ in 0..65 {
            map.allocate().unwrap();
        }
        assert_eq!(map.first_free(), Some(65));
        map.clear(3);
        assert_eq!(map.allocate(), Some(3));
        assert_eq!(map.count_set(), 65);

        let mut tiny = IdBitmap::new(2);
        tiny.allocate();
        tiny.allocate();
        assert_eq!(tiny.first_free(), None, "bits past len are never handed out");
    }

    #[test]
    fn vmids_are_offset_by_first_vmid() {
        let mut pool = ResourcePool::new(&info());
        let a = pool.allocate_vmid().unwrap();
        let b = pool.allocate_vmid().unwrap();
        assert_eq!(a, info().first_vmid);
        assert_eq!(b, info().first_vmid + 1);
        pool.release_vmid(a);
        assert_eq!(pool.allocate_vmid().unwrap(), a);
    }

    #[test]
    fn vmid_exhaustion() {
        let mut pool = ResourcePool::new(&info());
        for _ in 0..info().vmid_count {
            pool.allocate_vmid().unwrap();
        }
        assert!(matches!(
            pool.allocate_vmid(),
            Err(DqmError::ResourceExhausted(Resource::Vmid))
        ));
    }

    #[test]
    fn hqd_allocation_is_horizontal() {
        let mut pool = ResourcePool::new(&info());
        let slots: Vec<_> = (0..4).map(|_| pool.allocate_hqd().unwrap()).collect();
        let pipes: Vec<_> = slots.iter().map(|s| s.pipe).collect();
        assert_eq!(pipes, vec![0, 1, 2, 3]);
        assert!(slots.iter().all(|s| s.slot == 0));

        let fifth = pool.allocate_hqd().unwrap();
        assert_eq!(fifth, HqdSlot { pipe: 0, slot: 1 });
    }

    #[test]
    fn hqd_exhaustion_after_every_slot() {
        let mut pool = ResourcePool::new(&info());
        for _ in 0..info().pipe_count * info().queues_per_pipe {
            pool.allocate_hqd().unwrap();
        }
        assert!(matches!(
            pool.allocate_hqd(),
            Err(DqmError::ResourceExhausted(Resource::HqdSlot))
        ));
    }

    #[test]
    fn sdma_ids_alternate_engines() {
        let pool = ResourcePool::new(&info());
        assert_eq!(pool.sdma_placement(0), (0, 0));
        assert_eq!(pool.sdma_placement(1), (1, 0));
        assert_eq!(pool.sdma_placement(2), (0, 1));
        assert_eq!(pool.sdma_placement(3), (1, 1));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut pool = ResourcePool::new(&info());
        let before = pool.snapshot();
        assert!(before.is_free());

        let vmid = pool.allocate_vmid().unwrap();
        let hqd = pool.allocate_hqd().unwrap();
        let sdma = pool.allocate_sdma().unwrap();
        assert_ne!(pool.snapshot(), before);

        pool.release_sdma(sdma);
        pool.release_hqd(hqd);
        pool.release_vmid(vmid);
        assert_eq!(pool.snapshot(), before);
    }
}
