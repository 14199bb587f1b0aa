#![allow(clippy::cast_possible_truncation)]

//! PM4 packets for the scheduler firmware and the runlist indirect buffer built from
//! them.

use crate::dqm::queue::{Qpd, Queue, QueueType};
use crate::error::{DqmError, DqmResult, Resource};
use crate::kfd::kgd::KernelQueue;
use crate::memory::{Allocation, GttMemory, SubAllocator};
use crate::utils::{lower_32_bits, pm4_type3_header, upper_32_bits};
use log::{debug, warn};

// ===============================================================================================
// Opcodes and Layouts
// ===============================================================================================

pub const IT_SET_RESOURCES: u32 = 0xA0;
pub const IT_MAP_PROCESS: u32 = 0xA1;
pub const IT_MAP_QUEUES: u32 = 0xA2;
pub const IT_UNMAP_QUEUES: u32 = 0xA3;
pub const IT_QUERY_STATUS: u32 = 0xA4;
pub const IT_RUN_LIST: u32 = 0xA5;

pub const SET_RESOURCES_DWORDS: usize = 8;
pub const RUN_LIST_DWORDS: usize = 4;
pub const MAP_QUEUES_DWORDS: usize = 7;
pub const UNMAP_QUEUES_DWORDS: usize = 6;
pub const QUERY_STATUS_DWORDS: usize = 7;

/// First MEC firmware that understands the scratch-capable MAP_PROCESS.
pub const SCRATCH_FW_VERSION: u32 = 413;

pub const RUN_LIST_IB_SIZE_MASK: u32 = 0xF_FFFF;
pub const RUN_LIST_CHAIN: u32 = 1 << 20;
pub const RUN_LIST_VALID: u32 = 1 << 23;

pub const MAP_PROCESS_DIQ_ENABLE: u32 = 1 << 24;
pub const MAP_PROCESS_PASID_MASK: u32 = 0xFFFF;

pub const MAP_QUEUES_QUEUE_TYPE_SHIFT: u32 = 21;
pub const MAP_QUEUES_ENGINE_SEL_SHIFT: u32 = 26;
pub const MAP_QUEUES_NUM_QUEUES_SHIFT: u32 = 29;
pub const MAP_QUEUES_DOORBELL_SHIFT: u32 = 2;

pub const UNMAP_QUEUES_ACTION_MASK: u32 = 0x3;
pub const UNMAP_QUEUES_QUEUE_SEL_SHIFT: u32 = 4;
pub const UNMAP_QUEUES_ENGINE_SEL_SHIFT: u32 = 26;

pub const QUERY_STATUS_COMMAND_FENCE: u32 = 2 << 30;

const MAP_QUEUE_TYPE_NORMAL_COMPUTE: u32 = 0;
const MAP_QUEUE_TYPE_DEBUG_INTERFACE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapProcessFormat {
    Basic,
    /// Carries the scratch aperture base for firmware that supports it.
    Scratch,
}

impl MapProcessFormat {
    #[must_use]
    pub const fn for_firmware(version: u32) -> Self {
        if version >= SCRATCH_FW_VERSION {
            Self::Scratch
        } else {
            Self::Basic
        }
    }

    #[must_use]
    pub const fn dwords(self) -> usize {
        match self {
            Self::Basic => 10,
            Self::Scratch => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EngineSel {
    Compute = 0,
    Sdma0 = 2,
    Sdma1 = 3,
}

impl EngineSel {
    #[must_use]
    pub const fn sdma(engine: u32) -> Self {
        if engine == 0 { Self::Sdma0 } else { Self::Sdma1 }
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Compute),
            2 => Some(Self::Sdma0),
            3 => Some(Self::Sdma1),
            _ => None,
        }
    }
}

/// Which queues an UNMAP_QUEUES applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UnmapFilter {
    AllQueues = 2,
    /// Everything but statically mapped kernel queues.
    DynamicQueues = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UnmapAction {
    Preempt = 0,
    Reset = 1,
}

/// Resources handed to the scheduler firmware with SET_RESOURCES.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedResources {
    pub vmid_mask: u32,
    pub queue_mask: u64,
    pub gws_mask: u64,
    pub oac_mask: u32,
    pub gds_heap_base: u32,
    pub gds_heap_size: u32,
}

/// Capacity the runlist is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunlistLimits {
    pub vmid_count: u32,
    pub queue_capacity: u32,
    pub allow_oversubscription: bool,
}

// ===============================================================================================
// Encoders
// ===============================================================================================

#[must_use]
pub fn set_resources(res: &SchedResources) -> Vec<u32> {
    vec![
        pm4_type3_header(IT_SET_RESOURCES, SET_RESOURCES_DWORDS),
        res.vmid_mask & 0xFFFF,
        lower_32_bits(res.queue_mask),
        upper_32_bits(res.queue_mask),
        lower_32_bits(res.gws_mask),
        upper_32_bits(res.gws_mask),
        res.oac_mask & 0xFFFF,
        (res.gds_heap_base & 0x3F) | ((res.gds_heap_size & 0x3F) << 16),
    ]
}

#[must_use]
pub fn run_list(ib_addr: u64, ib_dwords: usize, chain: bool) -> Vec<u32> {
    let mut control = (ib_dwords as u32 & RUN_LIST_IB_SIZE_MASK) | RUN_LIST_VALID;
    if chain {
        control |= RUN_LIST_CHAIN;
    }
    vec![
        pm4_type3_header(IT_RUN_LIST, RUN_LIST_DWORDS),
        lower_32_bits(ib_addr),
        upper_32_bits(ib_addr),
        control,
    ]
}

fn map_process(qpd: &Qpd, num_queues: usize, format: MapProcessFormat) -> Vec<u32> {
    let mut dw1 = qpd.pasid & MAP_PROCESS_PASID_MASK;
    if qpd.is_debug {
        dw1 |= MAP_PROCESS_DIQ_ENABLE;
    }
    let mut packet = vec![
        pm4_type3_header(IT_MAP_PROCESS, format.dwords()),
        dw1,
        lower_32_bits(qpd.page_table_base >> 12),
        qpd.sh_mem_bases,
        qpd.sh_mem_ape1_base,
        qpd.sh_mem_ape1_limit,
        qpd.sh_mem_config,
        0, // gds_addr_lo
        0, // gds_addr_hi
        num_queues as u32,
    ];
    if format == MapProcessFormat::Scratch {
        packet.push(lower_32_bits(qpd.apertures.scratch_base));
        packet.push(upper_32_bits(qpd.apertures.scratch_base));
    }
    packet
}

fn map_queues(q: &Queue) -> Vec<u32> {
    let props = q.properties();
    let (engine, queue_type) = match props.queue_type {
        QueueType::Compute => (EngineSel::Compute, MAP_QUEUE_TYPE_NORMAL_COMPUTE),
        QueueType::Diq => (EngineSel::Compute, MAP_QUEUE_TYPE_DEBUG_INTERFACE),
        QueueType::Sdma => (EngineSel::sdma(props.sdma_engine_id), MAP_QUEUE_TYPE_NORMAL_COMPUTE),
    };
    vec![
        pm4_type3_header(IT_MAP_QUEUES, MAP_QUEUES_DWORDS),
        (queue_type << MAP_QUEUES_QUEUE_TYPE_SHIFT)
            | ((engine as u32) << MAP_QUEUES_ENGINE_SEL_SHIFT)
            | (1 << MAP_QUEUES_NUM_QUEUES_SHIFT),
        props.doorbell_off << MAP_QUEUES_DOORBELL_SHIFT,
        lower_32_bits(q.mqd_addr()),
        upper_32_bits(q.mqd_addr()),
        lower_32_bits(props.write_ptr),
        upper_32_bits(props.write_ptr),
    ]
}

#[must_use]
pub fn unmap_queues(filter: UnmapFilter, action: UnmapAction, engine: EngineSel) -> Vec<u32> {
    vec![
        pm4_type3_header(IT_UNMAP_QUEUES, UNMAP_QUEUES_DWORDS),
        (action as u32)
            | ((filter as u32) << UNMAP_QUEUES_QUEUE_SEL_SHIFT)
            | ((engine as u32) << UNMAP_QUEUES_ENGINE_SEL_SHIFT),
        0,
        0,
        0,
        0,
    ]
}

#[must_use]
pub fn query_status(fence_addr: u64, value: u64) -> Vec<u32> {
    vec![
        pm4_type3_header(IT_QUERY_STATUS, QUERY_STATUS_DWORDS),
        QUERY_STATUS_COMMAND_FENCE,
        0,
        lower_32_bits(fence_addr),
        upper_32_bits(fence_addr),
        lower_32_bits(value),
        upper_32_bits(value),
    ]
}

// ===============================================================================================
// Packet Manager
// ===============================================================================================

/// Builds runlists and talks to the scheduler firmware through the HIQ.
#[derive(Debug)]
pub struct PacketManager {
    format: MapProcessFormat,
    ib: Option<Allocation>,
}

impl PacketManager {
    #[must_use]
    pub const fn new(fw_version: u32) -> Self {
        Self {
            format: MapProcessFormat::for_firmware(fw_version),
            ib: None,
        }
    }

    #[must_use]
    pub const fn format(&self) -> MapProcessFormat {
        self.format
    }

    /// True while a runlist IB is in flight.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ib.is_some()
    }

    /// # Errors
    /// Propagates HIQ submission failures.
    pub fn send_set_resources(&self, hiq: &dyn KernelQueue, res: &SchedResources) -> DqmResult<()> {
        debug!(
            "set_resources: vmid mask 0x{:x}, queue mask 0x{:x}",
            res.vmid_mask, res.queue_mask
        );
        hiq.submit(&set_resources(res))
    }

    /// Builds the runlist IB for `processes` and submits it.
    ///
    /// A no-op while a previous IB is still in flight.
    ///
    /// # Errors
    /// `ResourceExhausted(RunlistCapacity)` for a rejected oversubscribed runlist,
    /// `AllocationFailure` if the IB does not fit in the arena.
    pub fn send_runlist(
        &mut self,
        gtt: &GttMemory,
        hiq: &dyn KernelQueue,
        processes: &[&Qpd],
        limits: RunlistLimits,
    ) -> DqmResult<()> {
        if self.ib.is_some() {
            return Ok(());
        }

        let active_compute = processes
            .iter()
            .flat_map(|qpd| qpd.queues.iter().chain(&qpd.priv_queues))
            .filter(|q| q.is_active() && q.properties().queue_type != QueueType::Sdma)
            .count();
        let over_subscription = processes.len() > limits.vmid_count as usize
            || active_compute > limits.queue_capacity as usize;

        if over_subscription {
            if !limits.allow_oversubscription {
                warn!(
                    "runlist oversubscribed ({} processes, {active_compute} compute queues) and chaining is disabled",
                    processes.len()
                );
                return Err(DqmError::ResourceExhausted(Resource::RunlistCapacity));
            }
            warn!("Over subscribed runlist");
        }

        let mut ib = Vec::new();
        for qpd in processes {
            let active: Vec<&Queue> = qpd
                .priv_queues
                .iter()
                .chain(&qpd.queues)
                .filter(|q| q.is_active())
                .collect();
            ib.extend(map_process(qpd, active.len(), self.format));
            for q in active {
                ib.extend(map_queues(q));
            }
        }

        let ib_dwords = ib.len() + if over_subscription { RUN_LIST_DWORDS } else { 0 };
        let alloc = gtt.allocate(ib_dwords * 4)?;
        if over_subscription {
            ib.extend(run_list(alloc.gpu_addr, ib_dwords, true));
        }

        let submitted = gtt
            .write_dwords(alloc.gpu_addr, &ib)
            .and_then(|()| hiq.submit(&run_list(alloc.gpu_addr, ib_dwords, false)));
        if let Err(e) = submitted {
            gtt.free(alloc);
            return Err(e);
        }

        debug!(
            "runlist submitted: {} processes, {ib_dwords} dwords at 0x{:x}",
            processes.len(),
            alloc.gpu_addr
        );
        self.ib = Some(alloc);
        Ok(())
    }

    /// # Errors
    /// Propagates HIQ submission failures.
    pub fn send_unmap_queues(
        &self,
        hiq: &dyn KernelQueue,
        filter: UnmapFilter,
        action: UnmapAction,
        engine: EngineSel,
    ) -> DqmResult<()> {
        hiq.submit(&unmap_queues(filter, action, engine))
    }

    /// # Errors
    /// Propagates HIQ submission failures.
    pub fn send_query_status(&self, hiq: &dyn KernelQueue, fence_addr: u64, value: u32) -> DqmResult<()> {
        hiq.submit(&query_status(fence_addr, u64::from(value)))
    }

    pub fn release_ib(&mut self, gtt: &GttMemory) {
        if let Some(ib) = self.ib.take() {
            gtt.free(ib);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{pm4_opcode, pm4_packet_dwords};

    #[test]
    fn firmware_version_selects_map_process_format() {
        assert_eq!(MapProcessFormat::for_firmware(412), MapProcessFormat::Basic);
        assert_eq!(MapProcessFormat::for_firmware(413), MapProcessFormat::Scratch);
        assert_eq!(PacketManager::new(500).format().dwords(), 12);
    }

    #[test]
    fn headers_match_lengths() {
        let packets = [
            (set_resources(&SchedResources::default()), IT_SET_RESOURCES),
            (run_list(0x1000, 40, false), IT_RUN_LIST),
            (unmap_queues(UnmapFilter::DynamicQueues, UnmapAction::Preempt, EngineSel::Compute), IT_UNMAP_QUEUES),
            (query_status(0x2000, 2), IT_QUERY_STATUS),
        ];
        for (packet, opcode) in packets {
            assert_eq!(pm4_opcode(packet[0]), opcode);
            assert_eq!(pm4_packet_dwords(packet[0]), packet.len());
        }
    }

    #[test]
    fn run_list_encodes_chain_and_size() {
        let packet = run_list(0x1_2345_6700, 96, true);
        assert_eq!(packet[1], 0x2345_6700);
        assert_eq!(packet[2], 1);
        assert_eq!(packet[3] & RUN_LIST_IB_SIZE_MASK, 96);
        assert_ne!(packet[3] & RUN_LIST_CHAIN, 0);
    }
}
