use crate::dqm::mqd::MqdObject;
use crate::dqm::resources::HqdSlot;
use crate::error::{DqmError, DqmResult};
use crate::kfd::kgd::VmHandle;
use crate::process::device::Apertures;
use std::fmt;

pub const MAX_QUEUE_PERCENTAGE: u32 = 100;
pub const MAX_QUEUE_PRIORITY: u32 = 15;
pub const DEFAULT_QUEUE_PRIORITY: u32 = 7;

// ===============================================================================================
// Identifiers
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue {}", self.0)
    }
}

/// Identifies one process-device context inside a device queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QpdId(pub u32);

impl fmt::Display for QpdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {}", self.0)
    }
}

// ===============================================================================================
// Queue Properties
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Compute,
    Sdma,
    /// Kernel debug interface queue; only created through `create_kernel_queue`.
    Diq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFormat {
    #[default]
    Pm4,
    Aql,
}

/// Everything the caller describes about a queue, plus fields filled in by the manager
/// (`vmid`, `is_active`, SDMA placement, trap handler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProperties {
    pub queue_type: QueueType,
    pub format: QueueFormat,
    pub queue_address: u64,
    pub queue_size: u64,
    pub queue_percent: u32,
    pub priority: u32,
    pub read_ptr: u64,
    pub write_ptr: u64,
    pub doorbell_off: u32,
    pub eop_ring_buffer_address: u64,
    pub eop_ring_buffer_size: u32,
    pub ctx_save_restore_area_address: u64,
    pub ctx_save_restore_area_size: u32,
    pub ctl_stack_size: u32,

    pub vmid: u32,
    pub is_active: bool,
    pub sdma_engine_id: u32,
    pub sdma_queue_id: u32,
    pub sdma_vm_addr: u32,
    pub tba_addr: u64,
    pub tma_addr: u64,
}

impl QueueProperties {
    fn new(queue_type: QueueType, queue_address: u64, queue_size: u64) -> Self {
        Self {
            queue_type,
            format: QueueFormat::default(),
            queue_address,
            queue_size,
            queue_percent: MAX_QUEUE_PERCENTAGE,
            priority: DEFAULT_QUEUE_PRIORITY,
            read_ptr: 0,
            write_ptr: 0,
            doorbell_off: 0,
            eop_ring_buffer_address: 0,
            eop_ring_buffer_size: 0,
            ctx_save_restore_area_address: 0,
            ctx_save_restore_area_size: 0,
            ctl_stack_size: 0,
            vmid: 0,
            is_active: false,
            sdma_engine_id: 0,
            sdma_queue_id: 0,
            sdma_vm_addr: 0,
            tba_addr: 0,
            tma_addr: 0,
        }
    }

    #[must_use]
    pub fn compute(queue_address: u64, queue_size: u64) -> Self {
        Self::new(QueueType::Compute, queue_address, queue_size)
    }

    #[must_use]
    pub fn sdma(queue_address: u64, queue_size: u64) -> Self {
        Self::new(QueueType::Sdma, queue_address, queue_size)
    }

    #[must_use]
    pub fn debug(queue_address: u64, queue_size: u64) -> Self {
        Self::new(QueueType::Diq, queue_address, queue_size)
    }

    #[must_use]
    pub const fn with_format(mut self, format: QueueFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub const fn with_percent(mut self, percent: u32) -> Self {
        self.queue_percent = percent;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_pointers(mut self, read_ptr: u64, write_ptr: u64) -> Self {
        self.read_ptr = read_ptr;
        self.write_ptr = write_ptr;
        self
    }

    #[must_use]
    pub const fn with_doorbell(mut self, doorbell_off: u32) -> Self {
        self.doorbell_off = doorbell_off;
        self
    }

    #[must_use]
    pub const fn with_eop_buffer(mut self, address: u64, size: u32) -> Self {
        self.eop_ring_buffer_address = address;
        self.eop_ring_buffer_size = size;
        self
    }

    #[must_use]
    pub const fn with_ctx_save_area(mut self, address: u64, size: u32, ctl_stack_size: u32) -> Self {
        self.ctx_save_restore_area_address = address;
        self.ctx_save_restore_area_size = size;
        self.ctl_stack_size = ctl_stack_size;
        self
    }

    /// Whether these properties describe a queue the hardware should run.
    #[must_use]
    pub const fn describes_active(&self) -> bool {
        self.queue_size > 0 && self.queue_address != 0 && self.queue_percent > 0
    }

    /// Applies an update in place.
    pub const fn apply(&mut self, update: &QueueUpdate) {
        self.queue_address = update.queue_address;
        self.queue_size = update.queue_size;
        self.queue_percent = update.queue_percent;
        self.priority = update.priority;
    }

    /// # Errors
    /// Returns `InvalidArgument` for out-of-range percentage or priority, or a ring
    /// size that is not a power of two.
    pub fn validate(&self) -> DqmResult<()> {
        if self.queue_percent > MAX_QUEUE_PERCENTAGE {
            return Err(DqmError::InvalidArgument(format!(
                "queue percentage {} exceeds {MAX_QUEUE_PERCENTAGE}",
                self.queue_percent
            )));
        }
        if self.priority > MAX_QUEUE_PRIORITY {
            return Err(DqmError::InvalidArgument(format!(
                "queue priority {} exceeds {MAX_QUEUE_PRIORITY}",
                self.priority
            )));
        }
        if self.queue_size != 0 && !self.queue_size.is_power_of_two() {
            return Err(DqmError::InvalidArgument(format!(
                "ring size {} is not a power of two",
                self.queue_size
            )));
        }
        if self.queue_size != 0 && self.queue_address == 0 {
            return Err(DqmError::InvalidArgument("ring of non-zero size at address 0".into()));
        }
        Ok(())
    }
}

/// The mutable subset of `QueueProperties`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueUpdate {
    pub queue_address: u64,
    pub queue_size: u64,
    pub queue_percent: u32,
    pub priority: u32,
}

impl From<&QueueProperties> for QueueUpdate {
    fn from(props: &QueueProperties) -> Self {
        Self {
            queue_address: props.queue_address,
            queue_size: props.queue_size,
            queue_percent: props.queue_percent,
            priority: props.priority,
        }
    }
}

// ===============================================================================================
// Queue
// ===============================================================================================

/// A registered queue. `properties` holds what the owner asked for; the MQD holds what
/// the hardware sees, which differs while the owning context is evicted.
#[derive(Debug)]
pub struct Queue {
    pub(crate) id: QueueId,
    pub(crate) properties: QueueProperties,
    pub(crate) mqd: MqdObject,
    pub(crate) hqd: Option<HqdSlot>,
    pub(crate) sdma_id: Option<u32>,
    pub(crate) evicted: bool,
}

impl Queue {
    #[must_use]
    pub const fn id(&self) -> QueueId {
        self.id
    }

    #[must_use]
    pub const fn properties(&self) -> &QueueProperties {
        &self.properties
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.properties.is_active
    }

    /// Marked for reactivation when the owning context is restored.
    #[must_use]
    pub const fn is_evicted(&self) -> bool {
        self.evicted
    }

    #[must_use]
    pub const fn hqd(&self) -> Option<HqdSlot> {
        self.hqd
    }

    #[must_use]
    pub const fn sdma_id(&self) -> Option<u32> {
        self.sdma_id
    }

    #[must_use]
    pub const fn mqd_addr(&self) -> u64 {
        self.mqd.gpu_addr()
    }

    /// Properties as pushed to hardware: percentage forced to zero while evicted.
    pub(crate) fn effective_properties(&self, context_evicted: bool) -> QueueProperties {
        let mut props = self.properties.clone();
        if context_evicted {
            props.queue_percent = 0;
        }
        props
    }
}

// ===============================================================================================
// Process-Device Context
// ===============================================================================================

/// Per-process, per-device queue state owned by the device queue manager.
#[derive(Debug)]
pub struct Qpd {
    pub(crate) id: QpdId,
    pub(crate) pasid: u32,
    pub(crate) vm: VmHandle,
    pub(crate) apertures: Apertures,
    pub(crate) queues: Vec<Queue>,
    pub(crate) priv_queues: Vec<Queue>,
    pub(crate) vmid: u32,
    pub(crate) page_table_base: u64,
    pub(crate) evicted: u32,
    pub(crate) is_debug: bool,
    pub(crate) registered: bool,

    pub(crate) sh_mem_config: u32,
    pub(crate) sh_mem_bases: u32,
    pub(crate) sh_mem_ape1_base: u32,
    pub(crate) sh_mem_ape1_limit: u32,
    pub(crate) sdma_vm_addr: u32,

    pub(crate) tba_addr: u64,
    pub(crate) tma_addr: u64,
}

impl Qpd {
    pub(crate) fn new(id: QpdId, pasid: u32, vm: VmHandle, page_table_base: u64, apertures: Apertures) -> Self {
        Self {
            id,
            pasid,
            vm,
            apertures,
            queues: Vec::new(),
            priv_queues: Vec::new(),
            vmid: 0,
            page_table_base,
            evicted: 0,
            is_debug: false,
            registered: false,
            sh_mem_config: 0,
            sh_mem_bases: 0,
            sh_mem_ape1_base: 0,
            sh_mem_ape1_limit: 0,
            sdma_vm_addr: 0,
            tba_addr: 0,
            tma_addr: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> QpdId {
        self.id
    }

    #[must_use]
    pub const fn pasid(&self) -> u32 {
        self.pasid
    }

    /// 0 while no VMID is held.
    #[must_use]
    pub const fn vmid(&self) -> u32 {
        self.vmid
    }

    #[must_use]
    pub const fn page_table_base(&self) -> u64 {
        self.page_table_base
    }

    #[must_use]
    pub const fn evicted_count(&self) -> u32 {
        self.evicted
    }

    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.is_debug
    }

    #[must_use]
    pub const fn is_registered(&self) -> bool {
        self.registered
    }

    #[must_use]
    pub const fn sh_mem_config(&self) -> u32 {
        self.sh_mem_config
    }

    #[must_use]
    pub const fn sh_mem_ape1(&self) -> (u32, u32) {
        (self.sh_mem_ape1_base, self.sh_mem_ape1_limit)
    }

    #[must_use]
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    #[must_use]
    pub fn kernel_queues(&self) -> &[Queue] {
        &self.priv_queues
    }

    #[must_use]
    pub fn queue(&self, id: QueueId) -> Option<&Queue> {
        self.queues.iter().find(|q| q.id == id)
    }

    #[must_use]
    pub fn active_queue_count(&self) -> usize {
        self.queues
            .iter()
            .chain(&self.priv_queues)
            .filter(|q| q.is_active())
            .count()
    }

    pub(crate) fn queue_index(&self, id: QueueId) -> DqmResult<usize> {
        self.queues
            .iter()
            .position(|q| q.id == id)
            .ok_or_else(|| DqmError::NotFound(format!("{id} in {}", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_requires_size_address_and_percentage() {
        let props = QueueProperties::compute(0x10_0000, 4096);
        assert!(props.describes_active());
        assert!(!props.clone().with_percent(0).describes_active());
        assert!(!QueueProperties::compute(0, 0).describes_active());
        assert!(!QueueProperties::sdma(0x10_0000, 0).describes_active());
    }

    #[test]
    fn validation_rejects_out_of_range_fields() {
        assert!(QueueProperties::compute(0x1000, 4096).validate().is_ok());
        assert!(QueueProperties::compute(0x1000, 4096).with_percent(101).validate().is_err());
        assert!(QueueProperties::compute(0x1000, 4096).with_priority(16).validate().is_err());
        assert!(QueueProperties::compute(0x1000, 3000).validate().is_err());
        assert!(QueueProperties::compute(0, 4096).validate().is_err());
        assert!(QueueProperties::compute(0, 0).validate().is_ok());
    }

    #[test]
    fn update_replaces_mutable_fields_only() {
        let mut props = QueueProperties::compute(0x1000, 4096).with_doorbell(9);
        props.apply(&QueueUpdate {
            queue_address: 0x2000,
            queue_size: 8192,
            queue_percent: 50,
            priority: 3,
        });
        assert_eq!(props.queue_address, 0x2000);
        assert_eq!(props.queue_size, 8192);
        assert_eq!(props.queue_percent, 50);
        assert_eq!(props.priority, 3);
        assert_eq!(props.doorbell_off, 9);
    }
}
