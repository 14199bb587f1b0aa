use crate::dqm::DeviceQueueManager;
use crate::dqm::asic::{self, AsicOps};
use crate::dqm::config::DqmConfig;
use crate::error::{DqmError, DqmResult};
use crate::kfd::kgd::{Kfd2Kgd, KgdBackend};
use crate::memory::GttMemory;
use log::info;
use std::sync::Arc;

/// GPU generations with distinct shader-memory programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsicFamily {
    /// GFX7 APU
    Kaveri,
    /// GFX7 dGPU
    Hawaii,
    /// GFX8 APU
    Carrizo,
    /// GFX8 dGPU
    Tonga,
    Fiji,
}

impl AsicFamily {
    /// Volcanic Islands (GFX8) and later.
    #[must_use]
    pub const fn is_vi(self) -> bool {
        matches!(self, Self::Carrizo | Self::Tonga | Self::Fiji)
    }
}

/// Immutable description of the queue hardware of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub asic: AsicFamily,
    /// Compute pipes reserved for queue management.
    pub pipe_count: u32,
    /// First MEC pipe of the reserved range; lower pipes belong to the graphics driver.
    pub first_pipe: u32,
    pub queues_per_pipe: u32,
    pub first_vmid: u32,
    pub vmid_count: u32,
    pub sdma_engines: u32,
    pub sdma_queues_per_engine: u32,
    /// Size of the GTT arena used for descriptors, runlists and fences.
    pub gtt_size: usize,
    /// APUs share the CPU page tables through the IOMMU and need a PASID binding.
    pub needs_iommu: bool,
}

impl DeviceInfo {
    /// Carrizo APU: pipes 4..7 of MEC1, VMIDs 8..15, two SDMA engines.
    #[must_use]
    pub const fn carrizo() -> Self {
        Self {
            asic: AsicFamily::Carrizo,
            pipe_count: 4,
            first_pipe: 4,
            queues_per_pipe: 8,
            first_vmid: 8,
            vmid_count: 8,
            sdma_engines: 2,
            sdma_queues_per_engine: 2,
            gtt_size: 4 << 20,
            needs_iommu: true,
        }
    }

    #[must_use]
    pub const fn kaveri() -> Self {
        Self {
            asic: AsicFamily::Kaveri,
            ..Self::carrizo()
        }
    }

    /// Tonga dGPU: no IOMMU.
    #[must_use]
    pub const fn tonga() -> Self {
        Self {
            asic: AsicFamily::Tonga,
            needs_iommu: false,
            ..Self::carrizo()
        }
    }

    #[must_use]
    pub const fn with_pipes(mut self, pipe_count: u32, queues_per_pipe: u32) -> Self {
        self.pipe_count = pipe_count;
        self.queues_per_pipe = queues_per_pipe;
        self
    }

    #[must_use]
    pub const fn with_vmids(mut self, first_vmid: u32, vmid_count: u32) -> Self {
        self.first_vmid = first_vmid;
        self.vmid_count = vmid_count;
        self
    }

    #[must_use]
    pub const fn hqd_count(&self) -> u32 {
        self.pipe_count * self.queues_per_pipe
    }

    /// Checks the ranges the register programming can address: VMIDs live in
    /// `1..16` (VMID 0 belongs to the kernel) and at least one HQD is reserved.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty or out-of-range VMID window, or for a
    /// device with no pipes or no queues per pipe.
    pub fn validate(&self) -> DqmResult<()> {
        let vmid_end = self.first_vmid.checked_add(self.vmid_count);
        if self.vmid_count == 0 || self.first_vmid == 0 || vmid_end.is_none_or(|end| end > MAX_VMIDS) {
            return Err(DqmError::InvalidArgument(format!(
                "VMID range {}+{} is outside 1..{MAX_VMIDS}",
                self.first_vmid, self.vmid_count
            )));
        }
        if self.pipe_count == 0 || self.queues_per_pipe == 0 {
            return Err(DqmError::InvalidArgument(format!(
                "{} pipes x {} queues leaves no HQD",
                self.pipe_count, self.queues_per_pipe
            )));
        }
        Ok(())
    }
}

/// VMIDs addressable through the ATC and VM context registers.
pub const MAX_VMIDS: u32 = 16;

/// One GPU: its description, register programming layer and queue manager.
///
/// Shared behind an `Arc` by every process bound to it.
#[derive(Debug)]
pub struct KfdDevice {
    id: u32,
    info: DeviceInfo,
    kgd: Arc<Kfd2Kgd>,
    dqm: DeviceQueueManager,
}

impl KfdDevice {
    /// Creates and starts a device with the default ASIC strategy of its family.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the scheduler cannot start.
    pub fn new(id: u32, info: DeviceInfo, backend: KgdBackend, config: DqmConfig) -> DqmResult<Arc<Self>> {
        let asic = asic::for_family(info.asic);
        Self::with_asic_ops(id, info, backend, config, asic)
    }

    /// Like `new`, with an explicit ASIC strategy.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the scheduler cannot start.
    pub fn with_asic_ops(
        id: u32,
        info: DeviceInfo,
        backend: KgdBackend,
        config: DqmConfig,
        asic: Box<dyn AsicOps>,
    ) -> DqmResult<Arc<Self>> {
        let kgd = Arc::new(Kfd2Kgd::new(backend, info.first_pipe));
        let dqm = DeviceQueueManager::new(info.clone(), config, kgd.clone(), asic)?;
        dqm.start()?;
        info!("device {id} ({:?}) ready", info.asic);

        Ok(Arc::new(Self { id, info, kgd, dqm }))
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[must_use]
    pub fn kgd(&self) -> &Kfd2Kgd {
        &self.kgd
    }

    #[must_use]
    pub fn gtt(&self) -> &GttMemory {
        self.kgd.gtt()
    }

    #[must_use]
    pub const fn dqm(&self) -> &DeviceQueueManager {
        &self.dqm
    }
}
