#![allow(clippy::cast_possible_truncation)]

use super::{MqdDescriptor, MqdManager, MqdObject, PreemptType, init_object};
use crate::dqm::queue::{QueueFormat, QueueProperties, QueueType};
use crate::error::DqmResult;
use crate::kfd::kgd::Kfd2Kgd;
use crate::kfd::regs;
use crate::memory::{GttMemory, SubAllocator};
use crate::utils::{lower_32_bits, order_base_2, upper_32_bits};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

const MQD_HEADER: u32 = 0xC031_0800;
const PRELOAD_SIZE: u32 = 0x53;
const QUANTUM_DURATION: u32 = 10;
const RPTR_BLOCK_SIZE: u32 = 5;
const MAX_EOP_CONTROL: u32 = 0xA;

/// GFX8 compute memory queue descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeMqd {
    pub header: u32,
    pub compute_pipelinestat_enable: u32,
    pub compute_static_thread_mgmt_se0: u32,
    pub compute_static_thread_mgmt_se1: u32,
    pub compute_static_thread_mgmt_se2: u32,
    pub compute_static_thread_mgmt_se3: u32,
    pub compute_misc_reserved: u32,
    pub compute_tba_lo: u32,
    pub compute_tba_hi: u32,
    pub compute_tma_lo: u32,
    pub compute_tma_hi: u32,
    pub cp_mqd_base_addr_lo: u32,
    pub cp_mqd_base_addr_hi: u32,
    pub cp_hqd_active: u32,
    pub cp_hqd_vmid: u32,
    pub cp_hqd_persistent_state: u32,
    pub cp_hqd_pipe_priority: u32,
    pub cp_hqd_queue_priority: u32,
    pub cp_hqd_quantum: u32,
    pub cp_hqd_pq_base_lo: u32,
    pub cp_hqd_pq_base_hi: u32,
    pub cp_hqd_pq_rptr: u32,
    pub cp_hqd_pq_rptr_report_addr_lo: u32,
    pub cp_hqd_pq_rptr_report_addr_hi: u32,
    pub cp_hqd_pq_wptr_poll_addr_lo: u32,
    pub cp_hqd_pq_wptr_poll_addr_hi: u32,
    pub cp_hqd_pq_doorbell_control: u32,
    pub cp_hqd_pq_wptr: u32,
    pub cp_hqd_pq_control: u32,
    pub cp_hqd_ib_control: u32,
    pub cp_hqd_iq_timer: u32,
    pub cp_hqd_iq_rptr: u32,
    pub cp_hqd_dequeue_request: u32,
    pub cp_mqd_control: u32,
    pub cp_hqd_eop_base_addr_lo: u32,
    pub cp_hqd_eop_base_addr_hi: u32,
    pub cp_hqd_eop_control: u32,
    pub cp_hqd_ctx_save_base_addr_lo: u32,
    pub cp_hqd_ctx_save_base_addr_hi: u32,
    pub cp_hqd_ctx_save_control: u32,
    pub cp_hqd_cntl_stack_offset: u32,
    pub cp_hqd_cntl_stack_size: u32,
    pub cp_hqd_wg_state_offset: u32,
    pub cp_hqd_ctx_save_size: u32,
    pub cp_hqd_error: u32,
    pub reserved: [u32; 19],
}

const _: () = assert!(mem::size_of::<ComputeMqd>() == 256);
const _: () = assert!(mem::offset_of!(ComputeMqd, cp_mqd_base_addr_lo) == 44);

impl ComputeMqd {
    #[must_use]
    pub fn as_dwords(&self) -> &[u32] {
        // SAFETY: repr(C) struct made only of u32 fields, so it has no padding and
        // u32 alignment.
        unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(self).cast::<u32>(),
                mem::size_of::<Self>() / 4,
            )
        }
    }
}

/// Maps queue priority 0..=15 onto the three pipe priority levels.
const fn pipe_priority(priority: u32) -> u32 {
    match priority {
        0..=6 => 0,
        7..=10 => 1,
        _ => 2,
    }
}

/// Compute descriptors, either loaded through HQD registers or left to the scheduler
/// firmware.
pub struct ComputeMqdManager {
    kgd: Arc<Kfd2Kgd>,
    gtt: Arc<GttMemory>,
    hws: bool,
    hqd_poll: Duration,
}

impl ComputeMqdManager {
    pub(crate) fn new(kgd: Arc<Kfd2Kgd>, gtt: Arc<GttMemory>, hws: bool, hqd_poll: Duration) -> Self {
        Self {
            kgd,
            gtt,
            hws,
            hqd_poll,
        }
    }

    fn static_fields(mqd_addr: u64, props: &QueueProperties) -> ComputeMqd {
        let mut m = ComputeMqd {
            header: MQD_HEADER,
            compute_pipelinestat_enable: 1,
            compute_static_thread_mgmt_se0: 0xFFFF_FFFF,
            compute_static_thread_mgmt_se1: 0xFFFF_FFFF,
            compute_static_thread_mgmt_se2: 0xFFFF_FFFF,
            compute_static_thread_mgmt_se3: 0xFFFF_FFFF,
            cp_mqd_base_addr_lo: lower_32_bits(mqd_addr),
            cp_mqd_base_addr_hi: upper_32_bits(mqd_addr),
            cp_hqd_persistent_state: regs::CP_HQD_PERSISTENT_STATE_PRELOAD_REQ
                | (PRELOAD_SIZE << regs::CP_HQD_PERSISTENT_STATE_PRELOAD_SIZE_SHIFT),
            cp_mqd_control: props.vmid & regs::CP_MQD_CONTROL_VMID_MASK,
            cp_hqd_quantum: regs::CP_HQD_QUANTUM_EN
                | regs::CP_HQD_QUANTUM_SCALE_1MS
                | (QUANTUM_DURATION << regs::CP_HQD_QUANTUM_DURATION_SHIFT),
            compute_tba_lo: lower_32_bits(props.tba_addr >> 8),
            compute_tba_hi: upper_32_bits(props.tba_addr >> 8),
            compute_tma_lo: lower_32_bits(props.tma_addr >> 8),
            compute_tma_hi: upper_32_bits(props.tma_addr >> 8),
            ..ComputeMqd::default()
        };

        if props.format == QueueFormat::Aql {
            m.cp_hqd_iq_rptr = 1;
        }

        if props.ctx_save_restore_area_address != 0 {
            m.cp_hqd_ctx_save_base_addr_lo = lower_32_bits(props.ctx_save_restore_area_address);
            m.cp_hqd_ctx_save_base_addr_hi = upper_32_bits(props.ctx_save_restore_area_address);
            m.cp_hqd_ctx_save_control = regs::CP_HQD_CTX_SAVE_CONTROL_ATC;
            m.cp_hqd_ctx_save_size = props.ctx_save_restore_area_size;
            m.cp_hqd_cntl_stack_size = props.ctl_stack_size;
            m.cp_hqd_cntl_stack_offset = props.ctl_stack_size;
            m.cp_hqd_wg_state_offset = props.ctl_stack_size;
        }
        m
    }

    /// Fields that follow the mutable queue properties.
    fn apply_properties(&self, m: &mut ComputeMqd, props: &QueueProperties) {
        m.cp_hqd_pq_control = (RPTR_BLOCK_SIZE << regs::CP_HQD_PQ_CONTROL_RPTR_BLOCK_SIZE_SHIFT)
            | (order_base_2(props.queue_size / 4).saturating_sub(1)
                & regs::CP_HQD_PQ_CONTROL_QUEUE_SIZE_MASK);
        m.cp_hqd_pq_control |= match props.format {
            QueueFormat::Aql => regs::CP_HQD_PQ_CONTROL_NO_UPDATE_RPTR,
            QueueFormat::Pm4 => regs::CP_HQD_PQ_CONTROL_UNORD_DISPATCH,
        };
        if self.hws && props.queue_type == QueueType::Diq {
            m.cp_hqd_pq_control |=
                regs::CP_HQD_PQ_CONTROL_PRIV_STATE | regs::CP_HQD_PQ_CONTROL_KMD_QUEUE;
        }

        m.cp_hqd_pq_base_lo = lower_32_bits(props.queue_address >> 8);
        m.cp_hqd_pq_base_hi = upper_32_bits(props.queue_address >> 8);
        m.cp_hqd_pq_rptr_report_addr_lo = lower_32_bits(props.read_ptr);
        m.cp_hqd_pq_rptr_report_addr_hi = upper_32_bits(props.read_ptr);
        m.cp_hqd_pq_wptr_poll_addr_lo = lower_32_bits(props.write_ptr);
        m.cp_hqd_pq_wptr_poll_addr_hi = upper_32_bits(props.write_ptr);
        m.cp_hqd_pq_doorbell_control = (props.doorbell_off
            << regs::CP_HQD_PQ_DOORBELL_CONTROL_OFFSET_SHIFT)
            | regs::CP_HQD_PQ_DOORBELL_CONTROL_EN;

        m.cp_hqd_eop_control = order_base_2(u64::from(props.eop_ring_buffer_size / 4))
            .saturating_sub(1)
            .min(MAX_EOP_CONTROL);
        m.cp_hqd_eop_base_addr_lo = lower_32_bits(props.eop_ring_buffer_address >> 8);
        m.cp_hqd_eop_base_addr_hi = upper_32_bits(props.eop_ring_buffer_address >> 8);

        m.cp_hqd_iq_timer = 0;
        m.cp_hqd_vmid = if self.hws { 0 } else { props.vmid };
        m.cp_hqd_pipe_priority = pipe_priority(props.priority);
        m.cp_hqd_queue_priority = props.priority;
        m.cp_hqd_active = u32::from(props.describes_active());
    }
}

impl MqdManager for ComputeMqdManager {
    fn init(&self, props: &QueueProperties) -> DqmResult<MqdObject> {
        init_object(
            &self.gtt,
            MqdDescriptor::Compute(ComputeMqd::default()),
            mem::size_of::<ComputeMqd>(),
            |mqd| {
                let m = Self::static_fields(mqd.gpu_addr(), props);
                mqd.descriptor = MqdDescriptor::Compute(m);
                self.update(mqd, props)
            },
        )
    }

    fn load(&self, mqd: &MqdObject, pipe: u32, slot: u32, wptr_addr: u64) -> DqmResult<()> {
        if self.hws {
            return Ok(());
        }
        self.kgd.hqd_load(mqd.compute()?, pipe, slot, wptr_addr);
        Ok(())
    }

    fn update(&self, mqd: &mut MqdObject, props: &QueueProperties) -> DqmResult<()> {
        if let MqdDescriptor::Compute(m) = &mut mqd.descriptor {
            self.apply_properties(m, props);
        } else {
            mqd.compute()?;
        }
        mqd.is_active = props.describes_active();
        mqd.flush(&self.gtt)
    }

    fn destroy(
        &self,
        mqd: &MqdObject,
        preempt: PreemptType,
        timeout: Duration,
        pipe: u32,
        slot: u32,
    ) -> DqmResult<()> {
        if self.hws {
            return Ok(());
        }
        mqd.compute()?;
        self.kgd
            .hqd_destroy(preempt as u32, timeout, self.hqd_poll, pipe, slot)
    }

    fn is_occupied(&self, _mqd: &MqdObject, queue_address: u64, pipe: u32, slot: u32) -> bool {
        !self.hws && self.kgd.hqd_is_occupied(queue_address, pipe, slot)
    }

    fn uninit(&self, mqd: MqdObject) {
        self.gtt.free(mqd.mem);
    }
}
