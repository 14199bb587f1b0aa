use crate::dqm::queue::{QpdId, QueueId};
use crate::kfd::device::KfdDevice;
use crate::kfd::kgd::VmHandle;
use std::sync::Arc;

// ===============================================================================================
// Apertures
// ===============================================================================================

/// The flat-address apertures a process sees on one GPU.
///
/// Each GPU gets its own 2^61-byte region, indexed from 1; LDS sits at the bottom,
/// scratch 4 GiB above it and GPUVM 2^48 above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Apertures {
    pub lds_base: u64,
    pub lds_limit: u64,
    pub scratch_base: u64,
    pub scratch_limit: u64,
    pub gpuvm_base: u64,
    pub gpuvm_limit: u64,
}

impl Apertures {
    #[must_use]
    pub const fn for_gpu(gpu_id: u32) -> Self {
        let region = ((gpu_id as u64) + 1) << 61;
        let lds_base = region;
        let scratch_base = region + 0x1_0000_0000;
        let gpuvm_base = region + 0x1_0000_0000_0000;

        Self {
            lds_base,
            lds_limit: (lds_base & 0xFFFF_FFFF_0000_0000) | 0xFFFF_FFFF,
            scratch_base,
            scratch_limit: (scratch_base & 0xFFFF_FFFF_0000_0000) | 0xFFFF_FFFF,
            gpuvm_base,
            gpuvm_limit: (gpuvm_base & 0xFFFF_FF00_0000_0000) | 0xFF_FFFF_FFFF,
        }
    }
}

// ===============================================================================================
// Per-Device Process Data
// ===============================================================================================

/// What a process holds on one device: its address space, its context in the
/// device's queue manager and the queues it created there.
#[derive(Debug)]
pub struct ProcessDevice {
    pub(crate) device: Arc<KfdDevice>,
    pub(crate) qpd: QpdId,
    pub(crate) vm: VmHandle,
    pub(crate) apertures: Apertures,
    pub(crate) bound: bool,
    /// Set when a preemption timed out; wavefronts are reset at unbind or release.
    pub(crate) reset_wavefronts: bool,
    pub(crate) queues: Vec<QueueId>,
}

impl ProcessDevice {
    pub(crate) const fn new(device: Arc<KfdDevice>, qpd: QpdId, vm: VmHandle, apertures: Apertures) -> Self {
        Self {
            device,
            qpd,
            vm,
            apertures,
            bound: false,
            reset_wavefronts: false,
            queues: Vec::new(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<KfdDevice> {
        &self.device
    }

    #[must_use]
    pub const fn qpd(&self) -> QpdId {
        self.qpd
    }

    #[must_use]
    pub const fn vm(&self) -> VmHandle {
        self.vm
    }

    #[must_use]
    pub const fn apertures(&self) -> &Apertures {
        &self.apertures
    }

    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound
    }

    #[must_use]
    pub const fn reset_pending(&self) -> bool {
        self.reset_wavefronts
    }

    #[must_use]
    pub fn queues(&self) -> &[QueueId] {
        &self.queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apertures_of_the_first_gpu() {
        let ap = Apertures::for_gpu(0);
        assert_eq!(ap.lds_base, 0x2000_0000_0000_0000);
        assert_eq!(ap.lds_limit, 0x2000_0000_FFFF_FFFF);
        assert_eq!(ap.scratch_base, 0x2000_0001_0000_0000);
        assert_eq!(ap.scratch_limit, 0x2000_0001_FFFF_FFFF);
        assert_eq!(ap.gpuvm_base, 0x2001_0000_0000_0000);
        assert_eq!(ap.gpuvm_limit, 0x2001_00FF_FFFF_FFFF);
    }

    #[test]
    fn each_gpu_gets_its_own_region() {
        let a = Apertures::for_gpu(0);
        let b = Apertures::for_gpu(1);
        assert_eq!(b.lds_base >> 61, 2);
        assert!(a.gpuvm_limit < b.lds_base);
    }
}
