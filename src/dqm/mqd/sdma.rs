use super::{MqdDescriptor, MqdManager, MqdObject, PreemptType, init_object};
use crate::dqm::queue::QueueProperties;
use crate::error::DqmResult;
use crate::kfd::kgd::Kfd2Kgd;
use crate::kfd::regs;
use crate::memory::{GttMemory, SubAllocator};
use crate::utils::{lower_32_bits, order_base_2, upper_32_bits};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

const RPTR_WRITEBACK_TIMER: u32 = 6;

/// SDMA RLC queue descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdmaMqd {
    pub sdmax_rlcx_rb_cntl: u32,
    pub sdmax_rlcx_rb_base: u32,
    pub sdmax_rlcx_rb_base_hi: u32,
    pub sdmax_rlcx_rb_rptr_addr_lo: u32,
    pub sdmax_rlcx_rb_rptr_addr_hi: u32,
    pub sdmax_rlcx_doorbell: u32,
    pub sdmax_rlcx_virtual_addr: u32,
    pub sdma_engine_id: u32,
    pub sdma_queue_id: u32,
    pub reserved: [u32; 7],
}

const _: () = assert!(mem::size_of::<SdmaMqd>() == 64);

impl SdmaMqd {
    #[must_use]
    pub fn as_dwords(&self) -> &[u32] {
        // SAFETY: repr(C) struct made only of u32 fields.
        unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(self).cast::<u32>(),
                mem::size_of::<Self>() / 4,
            )
        }
    }
}

pub struct SdmaMqdManager {
    kgd: Arc<Kfd2Kgd>,
    gtt: Arc<GttMemory>,
    load_timeout: Duration,
    poll: Duration,
}

impl SdmaMqdManager {
    pub(crate) fn new(kgd: Arc<Kfd2Kgd>, gtt: Arc<GttMemory>, load_timeout: Duration, poll: Duration) -> Self {
        Self {
            kgd,
            gtt,
            load_timeout,
            poll,
        }
    }
}

fn apply_properties(m: &mut SdmaMqd, props: &QueueProperties) {
    m.sdmax_rlcx_rb_cntl = (order_base_2(props.queue_size / 4)
        << regs::SDMA0_RLC0_RB_CNTL_RB_SIZE_SHIFT)
        | (props.vmid << regs::SDMA0_RLC0_RB_CNTL_RB_VMID_SHIFT)
        | regs::SDMA0_RLC0_RB_CNTL_RPTR_WRITEBACK_ENABLE
        | (RPTR_WRITEBACK_TIMER << regs::SDMA0_RLC0_RB_CNTL_RPTR_WRITEBACK_TIMER_SHIFT);
    if props.describes_active() {
        m.sdmax_rlcx_rb_cntl |= regs::SDMA0_RLC0_RB_CNTL_RB_ENABLE;
    }

    m.sdmax_rlcx_rb_base = lower_32_bits(props.queue_address >> 8);
    m.sdmax_rlcx_rb_base_hi = upper_32_bits(props.queue_address >> 8);
    m.sdmax_rlcx_rb_rptr_addr_lo = lower_32_bits(props.read_ptr);
    m.sdmax_rlcx_rb_rptr_addr_hi = upper_32_bits(props.read_ptr);
    m.sdmax_rlcx_doorbell = (props.doorbell_off << regs::SDMA0_RLC0_DOORBELL_OFFSET_SHIFT)
        | regs::SDMA0_RLC0_DOORBELL_ENABLE;
    m.sdmax_rlcx_virtual_addr = props.sdma_vm_addr;
    m.sdma_engine_id = props.sdma_engine_id;
    m.sdma_queue_id = props.sdma_queue_id;
}

impl MqdManager for SdmaMqdManager {
    fn init(&self, props: &QueueProperties) -> DqmResult<MqdObject> {
        init_object(
            &self.gtt,
            MqdDescriptor::Sdma(SdmaMqd::default()),
            mem::size_of::<SdmaMqd>(),
            |mqd| self.update(mqd, props),
        )
    }

    /// Engine and queue come from the descriptor; `pipe` and `slot` are unused.
    fn load(&self, mqd: &MqdObject, _pipe: u32, _slot: u32, _wptr_addr: u64) -> DqmResult<()> {
        self.kgd
            .hqd_sdma_load(mqd.sdma()?, self.load_timeout, self.poll)
    }

    fn update(&self, mqd: &mut MqdObject, props: &QueueProperties) -> DqmResult<()> {
        if let MqdDescriptor::Sdma(m) = &mut mqd.descriptor {
            apply_properties(m, props);
        } else {
            mqd.sdma()?;
        }
        mqd.is_active = props.describes_active();
        mqd.flush(&self.gtt)
    }

    fn destroy(
        &self,
        mqd: &MqdObject,
        _preempt: PreemptType,
        timeout: Duration,
        _pipe: u32,
        _slot: u32,
    ) -> DqmResult<()> {
        self.kgd.hqd_sdma_destroy(mqd.sdma()?, timeout, self.poll)
    }

    fn is_occupied(&self, mqd: &MqdObject, _queue_address: u64, _pipe: u32, _slot: u32) -> bool {
        mqd.sdma().is_ok_and(|m| self.kgd.hqd_sdma_is_occupied(m))
    }

    fn uninit(&self, mqd: MqdObject) {
        self.gtt.free(mqd.mem);
    }
}
