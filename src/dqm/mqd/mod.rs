//! Memory queue descriptors: the in-memory image of a hardware queue, loaded into HQD
//! registers directly or fetched by the scheduler firmware from a runlist.

pub mod compute;
pub mod sdma;

use crate::dqm::queue::{QueueProperties, QueueType};
use crate::error::{DqmError, DqmResult};
use crate::kfd::kgd::Kfd2Kgd;
use crate::memory::{Allocation, GttMemory, SubAllocator};
use compute::{ComputeMqd, ComputeMqdManager};
use log::debug;
use sdma::{SdmaMqd, SdmaMqdManager};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqdType {
    /// Compute queue loaded by the driver.
    Cp,
    /// Compute queue mapped by the scheduler firmware.
    CpHws,
    Sdma,
}

impl MqdType {
    /// The descriptor type for `queue_type`, given the compute flavour of the mode.
    #[must_use]
    pub const fn for_queue(queue_type: QueueType, compute: Self) -> Self {
        match queue_type {
            QueueType::Sdma => Self::Sdma,
            QueueType::Compute | QueueType::Diq => compute,
        }
    }
}

/// Dequeue request written to `CP_HQD_DEQUEUE_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PreemptType {
    WavefrontDrain = 1,
    WavefrontReset = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqdDescriptor {
    Compute(ComputeMqd),
    Sdma(SdmaMqd),
}

/// A descriptor and the GTT memory backing it.
#[derive(Debug)]
pub struct MqdObject {
    pub(crate) descriptor: MqdDescriptor,
    pub(crate) mem: Allocation,
    pub(crate) is_active: bool,
}

impl MqdObject {
    #[must_use]
    pub const fn gpu_addr(&self) -> u64 {
        self.mem.gpu_addr
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    #[must_use]
    pub const fn descriptor(&self) -> &MqdDescriptor {
        &self.descriptor
    }

    fn compute(&self) -> DqmResult<&ComputeMqd> {
        match &self.descriptor {
            MqdDescriptor::Compute(m) => Ok(m),
            MqdDescriptor::Sdma(_) => Err(DqmError::InvalidArgument(
                "SDMA descriptor handed to a compute MQD manager".into(),
            )),
        }
    }

    fn sdma(&self) -> DqmResult<&SdmaMqd> {
        match &self.descriptor {
            MqdDescriptor::Sdma(m) => Ok(m),
            MqdDescriptor::Compute(_) => Err(DqmError::InvalidArgument(
                "compute descriptor handed to the SDMA MQD manager".into(),
            )),
        }
    }

    fn dwords(&self) -> &[u32] {
        match &self.descriptor {
            MqdDescriptor::Compute(m) => m.as_dwords(),
            MqdDescriptor::Sdma(m) => m.as_dwords(),
        }
    }

    /// Copies the descriptor into its backing memory.
    fn flush(&self, gtt: &GttMemory) -> DqmResult<()> {
        gtt.write_dwords(self.mem.gpu_addr, self.dwords())
    }
}

/// Operations over one flavour of queue descriptor.
pub trait MqdManager: Send + Sync {
    /// Allocates backing memory and fills every hardware field from `props`.
    ///
    /// # Errors
    /// Returns `AllocationFailure` when the GTT arena is exhausted.
    fn init(&self, props: &QueueProperties) -> DqmResult<MqdObject>;

    /// Pushes the descriptor into the hardware slot. Reads the user write pointer at
    /// `wptr_addr` exactly once.
    ///
    /// # Errors
    /// Returns `Timeout` if the target ring cannot be quiesced first.
    fn load(&self, mqd: &MqdObject, pipe: u32, slot: u32, wptr_addr: u64) -> DqmResult<()>;

    /// Rewrites the fields that depend on the mutable properties and recomputes
    /// `is_active`.
    ///
    /// # Errors
    /// Returns an error if the backing memory cannot be written.
    fn update(&self, mqd: &mut MqdObject, props: &QueueProperties) -> DqmResult<()>;

    /// Preempts the queue out of its hardware slot.
    ///
    /// # Errors
    /// Returns `Timeout` if the hardware does not acknowledge within `timeout`.
    fn destroy(
        &self,
        mqd: &MqdObject,
        preempt: PreemptType,
        timeout: Duration,
        pipe: u32,
        slot: u32,
    ) -> DqmResult<()>;

    fn is_occupied(&self, mqd: &MqdObject, queue_address: u64, pipe: u32, slot: u32) -> bool;

    fn uninit(&self, mqd: MqdObject);
}

/// Allocates backing memory for `descriptor`, writes it and runs `fill` as an update.
fn init_object(
    gtt: &GttMemory,
    descriptor: MqdDescriptor,
    size: usize,
    update: impl FnOnce(&mut MqdObject) -> DqmResult<()>,
) -> DqmResult<MqdObject> {
    let mem = gtt.allocate(size)?;
    let mut mqd = MqdObject {
        descriptor,
        mem,
        is_active: false,
    };
    match update(&mut mqd) {
        Ok(()) => Ok(mqd),
        Err(e) => {
            gtt.free(mqd.mem);
            Err(e)
        }
    }
}

/// One manager per descriptor type, created on first use.
pub struct MqdManagers {
    kgd: Arc<Kfd2Kgd>,
    gtt: Arc<GttMemory>,
    load_timeout: Duration,
    poll: Duration,
    cp: OnceLock<ComputeMqdManager>,
    cp_hws: OnceLock<ComputeMqdManager>,
    sdma: OnceLock<SdmaMqdManager>,
}

impl std::fmt::Debug for MqdManagers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqdManagers")
            .field("cp", &self.cp.get().is_some())
            .field("cp_hws", &self.cp_hws.get().is_some())
            .field("sdma", &self.sdma.get().is_some())
            .finish()
    }
}

impl MqdManagers {
    #[must_use]
    pub fn new(kgd: Arc<Kfd2Kgd>, gtt: Arc<GttMemory>, load_timeout: Duration, poll: Duration) -> Self {
        Self {
            kgd,
            gtt,
            load_timeout,
            poll,
            cp: OnceLock::new(),
            cp_hws: OnceLock::new(),
            sdma: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn get(&self, ty: MqdType) -> &dyn MqdManager {
        let compute = |hws| {
            debug!("creating {ty:?} MQD manager");
            ComputeMqdManager::new(self.kgd.clone(), self.gtt.clone(), hws, self.poll)
        };
        match ty {
            MqdType::Cp => self.cp.get_or_init(|| compute(false)),
            MqdType::CpHws => self.cp_hws.get_or_init(|| compute(true)),
            MqdType::Sdma => self.sdma.get_or_init(|| {
                debug!("creating {ty:?} MQD manager");
                SdmaMqdManager::new(
                    self.kgd.clone(),
                    self.gtt.clone(),
                    self.load_timeout,
                    self.poll,
                )
            }),
        }
    }

    #[must_use]
    pub fn is_created(&self, ty: MqdType) -> bool {
        match ty {
            MqdType::Cp => self.cp.get().is_some(),
            MqdType::CpHws => self.cp_hws.get().is_some(),
            MqdType::Sdma => self.sdma.get().is_some(),
        }
    }
}
