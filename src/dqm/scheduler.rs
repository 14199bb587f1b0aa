//! The two ways queues reach the hardware: direct HQD programming and runlists
//! handed to the scheduler firmware.

use crate::dqm::fence::{FENCE_COMPLETED, Fence};
use crate::dqm::mqd::{MqdType, PreemptType};
use crate::dqm::packets::{
    EngineSel, PacketManager, RunlistLimits, SchedResources, UnmapAction, UnmapFilter,
};
use crate::dqm::queue::{Qpd, Queue, QueueType};
use crate::dqm::resources::ResourcePool;
use crate::dqm::{DqmHw, DqmState};
use crate::error::DqmResult;
use crate::kfd::kgd::Engine;
use crate::memory::{Allocation, SubAllocator};
use log::{debug, error};

const HPD_EOP_BYTES_LOG2: u32 = 11;
const HPD_EOP_BYTES: usize = 1 << HPD_EOP_BYTES_LOG2;

/// The mode-specific half of every queue manager operation. The manager does the
/// bookkeeping and calls these hooks at fixed points.
pub(crate) trait SchedulingPolicy {
    fn start(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()>;

    fn stop(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()>;

    fn uses_runlist(&self) -> bool;

    /// True while the scheduler firmware holds a runlist.
    fn is_active_runlist(&self) -> bool;

    fn compute_mqd_type(&self) -> MqdType;

    /// Programs hardware for a VMID just assigned to `qpd`.
    fn bind_vmid(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()>;

    fn unbind_vmid(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()>;

    /// Gives a freshly initialized queue its hardware placement.
    fn attach(&mut self, hw: &DqmHw, pool: &mut ResourcePool, q: &mut Queue) -> DqmResult<()>;

    /// Takes a queue off the hardware for good and releases its placement. On error
    /// the placement is kept.
    fn detach(&mut self, hw: &DqmHw, pool: &mut ResourcePool, q: &mut Queue) -> DqmResult<()>;

    /// Preempts an active queue without giving up its placement.
    fn deactivate(&mut self, hw: &DqmHw, q: &Queue) -> DqmResult<()>;

    /// Makes a queue with `is_active` run again.
    fn activate(&mut self, hw: &DqmHw, q: &Queue) -> DqmResult<()>;

    /// Stops the hardware from reading descriptors that are about to change.
    fn quiesce(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()>;

    /// Publishes the bookkeeping in `state` to the hardware.
    fn commit(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()>;

    fn page_table_changed(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()>;

    fn program_sh_mem(&mut self, hw: &DqmHw, qpd: &Qpd);
}

// ===============================================================================================
// Direct (no HWS)
// ===============================================================================================

#[derive(Debug, Default)]
pub(crate) struct DirectScheduler {
    pipeline_mem: Option<Allocation>,
}

impl DirectScheduler {
    fn init_pipelines(&mut self, hw: &DqmHw) -> DqmResult<()> {
        let pipes = hw.info.pipe_count;
        let mem = hw.gtt.allocate(pipes as usize * HPD_EOP_BYTES)?;
        for pipe in 0..pipes {
            let hpd = mem.gpu_addr + u64::from(pipe) * HPD_EOP_BYTES as u64;
            hw.kgd.init_pipeline(pipe, HPD_EOP_BYTES_LOG2, hpd);
            hw.kgd.init_interrupts(pipe);
        }
        self.pipeline_mem = Some(mem);
        Ok(())
    }
}

impl SchedulingPolicy for DirectScheduler {
    fn start(&mut self, hw: &DqmHw, _state: &DqmState) -> DqmResult<()> {
        if self.pipeline_mem.is_none() {
            self.init_pipelines(hw)?;
        }
        Ok(())
    }

    fn stop(&mut self, hw: &DqmHw, _state: &DqmState) -> DqmResult<()> {
        if let Some(mem) = self.pipeline_mem.take() {
            hw.gtt.free(mem);
        }
        Ok(())
    }

    fn uses_runlist(&self) -> bool {
        false
    }

    fn is_active_runlist(&self) -> bool {
        false
    }

    fn compute_mqd_type(&self) -> MqdType {
        MqdType::Cp
    }

    fn bind_vmid(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()> {
        self.program_sh_mem(hw, qpd);
        hw.kgd
            .set_pasid_vmid_mapping(qpd.pasid, qpd.vmid, hw.config.preempt_timeout)?;
        hw.kgd
            .set_vm_context_page_table_base(qpd.vmid, qpd.page_table_base);
        hw.kgd.flush_tlb(qpd.pasid);
        Ok(())
    }

    fn unbind_vmid(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()> {
        hw.kgd.flush_tlb(qpd.pasid);
        hw.kgd
            .set_pasid_vmid_mapping(0, qpd.vmid, hw.config.preempt_timeout)
    }

    fn attach(&mut self, hw: &DqmHw, pool: &mut ResourcePool, q: &mut Queue) -> DqmResult<()> {
        if q.properties.queue_type == QueueType::Compute {
            q.hqd = Some(pool.allocate_hqd()?);
        }
        if !q.is_active() {
            return Ok(());
        }
        if let Err(e) = self.activate(hw, q) {
            if let Some(hqd) = q.hqd.take() {
                pool.release_hqd(hqd);
            }
            return Err(e);
        }
        Ok(())
    }

    fn detach(&mut self, hw: &DqmHw, pool: &mut ResourcePool, q: &mut Queue) -> DqmResult<()> {
        let mgr = hw.mqds.get(MqdType::for_queue(q.properties.queue_type, MqdType::Cp));
        let (pipe, slot) = q.hqd.map_or((0, 0), |h| (h.pipe, h.slot));
        mgr.destroy(
            &q.mqd,
            PreemptType::WavefrontReset,
            hw.config.preempt_timeout,
            pipe,
            slot,
        )?;
        if let Some(hqd) = q.hqd.take() {
            pool.release_hqd(hqd);
        }
        Ok(())
    }

    fn deactivate(&mut self, hw: &DqmHw, q: &Queue) -> DqmResult<()> {
        let mgr = hw.mqds.get(MqdType::for_queue(q.properties.queue_type, MqdType::Cp));
        let (pipe, slot) = q.hqd.map_or((0, 0), |h| (h.pipe, h.slot));
        mgr.destroy(
            &q.mqd,
            PreemptType::WavefrontDrain,
            hw.config.preempt_timeout,
            pipe,
            slot,
        )
    }

    fn activate(&mut self, hw: &DqmHw, q: &Queue) -> DqmResult<()> {
        let mgr = hw.mqds.get(MqdType::for_queue(q.properties.queue_type, MqdType::Cp));
        let (pipe, slot) = q.hqd.map_or((0, 0), |h| (h.pipe, h.slot));
        mgr.load(&q.mqd, pipe, slot, q.properties.write_ptr)
    }

    fn quiesce(&mut self, _hw: &DqmHw, _state: &DqmState) -> DqmResult<()> {
        Ok(())
    }

    fn commit(&mut self, _hw: &DqmHw, _state: &DqmState) -> DqmResult<()> {
        Ok(())
    }

    fn page_table_changed(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()> {
        if qpd.vmid != 0 {
            hw.kgd
                .set_vm_context_page_table_base(qpd.vmid, qpd.page_table_base);
            hw.kgd.flush_tlb(qpd.pasid);
        }
        Ok(())
    }

    fn program_sh_mem(&mut self, hw: &DqmHw, qpd: &Qpd) {
        if qpd.vmid != 0 {
            hw.kgd.program_sh_mem_settings(
                qpd.vmid,
                qpd.sh_mem_config,
                qpd.sh_mem_ape1_base,
                qpd.sh_mem_ape1_limit,
                qpd.sh_mem_bases,
            );
        }
    }
}

// ===============================================================================================
// Runlist (HWS)
// ===============================================================================================

#[derive(Debug)]
pub(crate) struct RunlistScheduler {
    allow_oversubscription: bool,
    packets: Option<PacketManager>,
    fence: Option<Fence>,
}

impl RunlistScheduler {
    pub(crate) const fn new(allow_oversubscription: bool) -> Self {
        Self {
            allow_oversubscription,
            packets: None,
            fence: None,
        }
    }

    fn sched_resources(hw: &DqmHw) -> SchedResources {
        let info = &hw.info;
        let vmid_mask = ((1u64 << info.vmid_count) - 1) << info.first_vmid;

        let mut queue_mask = 0u64;
        for pipe in 0..info.pipe_count {
            for queue in 0..info.queues_per_pipe {
                let bit = (info.first_pipe + pipe) * info.queues_per_pipe + queue;
                if bit < 64 {
                    queue_mask |= 1 << bit;
                }
            }
        }

        SchedResources {
            #[allow(clippy::cast_possible_truncation)]
            vmid_mask: vmid_mask as u32,
            queue_mask,
            ..SchedResources::default()
        }
    }

    /// Unmaps everything the current runlist mapped and waits for the firmware to
    /// acknowledge through the fence.
    fn unmap_queues(&mut self, hw: &DqmHw, state: &DqmState, filter: UnmapFilter) -> DqmResult<()> {
        let (Some(pm), Some(fence)) = (self.packets.as_mut(), self.fence.as_ref()) else {
            return Ok(());
        };
        if !pm.is_active() {
            return Ok(());
        }
        let hiq = hw.kgd.hiq();

        if state.counters.sdma_queue_count > 0 {
            for engine in 0..hw.info.sdma_engines {
                pm.send_unmap_queues(hiq, filter, UnmapAction::Preempt, EngineSel::sdma(engine))?;
            }
        }
        pm.send_unmap_queues(hiq, filter, UnmapAction::Preempt, EngineSel::Compute)?;

        fence.reset(&hw.gtt)?;
        pm.send_query_status(hiq, fence.gpu_addr(), FENCE_COMPLETED)?;
        if let Err(e) = fence.wait(
            &hw.gtt,
            FENCE_COMPLETED,
            hw.config.preempt_timeout,
            hw.config.fence_poll_interval,
        ) {
            error!("The cp might be in an unrecoverable state due to an unsuccessful queues preemption");
            return Err(e);
        }

        pm.release_ib(&hw.gtt);
        Ok(())
    }

    fn execute_queues(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        self.unmap_queues(hw, state, UnmapFilter::DynamicQueues)?;

        if state.counters.queue_count == 0 || state.counters.processes_count == 0 {
            return Ok(());
        }
        let Some(pm) = self.packets.as_mut() else {
            return Ok(());
        };

        let processes: Vec<&Qpd> = state
            .registered
            .iter()
            .filter_map(|id| state.qpds.get(id))
            .collect();
        let limits = RunlistLimits {
            vmid_count: hw.info.vmid_count,
            queue_capacity: hw.info.pipe_count * hw.info.queues_per_pipe,
            allow_oversubscription: self.allow_oversubscription,
        };
        pm.send_runlist(&hw.gtt, hw.kgd.hiq(), &processes, limits)
    }
}

impl SchedulingPolicy for RunlistScheduler {
    fn start(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        if self.packets.is_some() {
            return Ok(());
        }
        let pm = PacketManager::new(hw.kgd.firmware().version(Engine::Mec));
        pm.send_set_resources(hw.kgd.hiq(), &Self::sched_resources(hw))?;
        let fence = Fence::new(&hw.gtt)?;

        self.packets = Some(pm);
        self.fence = Some(fence);
        debug!("hardware scheduler started");
        self.execute_queues(hw, state)
    }

    fn stop(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        let unmapped = self.unmap_queues(hw, state, UnmapFilter::AllQueues);
        if unmapped.is_ok() {
            if let Some(fence) = self.fence.take() {
                fence.free(&hw.gtt);
            }
            self.packets = None;
        }
        unmapped
    }

    fn uses_runlist(&self) -> bool {
        true
    }

    fn is_active_runlist(&self) -> bool {
        self.packets.as_ref().is_some_and(PacketManager::is_active)
    }

    fn compute_mqd_type(&self) -> MqdType {
        MqdType::CpHws
    }

    fn bind_vmid(&mut self, _hw: &DqmHw, _qpd: &Qpd) -> DqmResult<()> {
        Ok(())
    }

    fn unbind_vmid(&mut self, _hw: &DqmHw, _qpd: &Qpd) -> DqmResult<()> {
        Ok(())
    }

    fn attach(&mut self, _hw: &DqmHw, _pool: &mut ResourcePool, _q: &mut Queue) -> DqmResult<()> {
        Ok(())
    }

    fn detach(&mut self, _hw: &DqmHw, _pool: &mut ResourcePool, _q: &mut Queue) -> DqmResult<()> {
        Ok(())
    }

    fn deactivate(&mut self, _hw: &DqmHw, _q: &Queue) -> DqmResult<()> {
        Ok(())
    }

    fn activate(&mut self, _hw: &DqmHw, _q: &Queue) -> DqmResult<()> {
        Ok(())
    }

    fn quiesce(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        self.unmap_queues(hw, state, UnmapFilter::DynamicQueues)
    }

    fn commit(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        self.execute_queues(hw, state)
    }

    fn page_table_changed(&mut self, _hw: &DqmHw, _qpd: &Qpd) -> DqmResult<()> {
        Ok(())
    }

    fn program_sh_mem(&mut self, _hw: &DqmHw, _qpd: &Qpd) {}
}

// ===============================================================================================
// Dispatch
// ===============================================================================================

/// The policy chosen once at construction.
#[derive(Debug)]
pub(crate) enum Scheduler {
    Direct(DirectScheduler),
    Runlist(RunlistScheduler),
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $call:expr) => {
        match $self {
            Scheduler::Direct($s) => $call,
            Scheduler::Runlist($s) => $call,
        }
    };
}

impl SchedulingPolicy for Scheduler {
    fn start(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        dispatch!(self, s => s.start(hw, state))
    }

    fn stop(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        dispatch!(self, s => s.stop(hw, state))
    }

    fn uses_runlist(&self) -> bool {
        dispatch!(self, s => s.uses_runlist())
    }

    fn is_active_runlist(&self) -> bool {
        dispatch!(self, s => s.is_active_runlist())
    }

    fn compute_mqd_type(&self) -> MqdType {
        dispatch!(self, s => s.compute_mqd_type())
    }

    fn bind_vmid(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()> {
        dispatch!(self, s => s.bind_vmid(hw, qpd))
    }

    fn unbind_vmid(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()> {
        dispatch!(self, s => s.unbind_vmid(hw, qpd))
    }

    fn attach(&mut self, hw: &DqmHw, pool: &mut ResourcePool, q: &mut Queue) -> DqmResult<()> {
        dispatch!(self, s => s.attach(hw, pool, q))
    }

    fn detach(&mut self, hw: &DqmHw, pool: &mut ResourcePool, q: &mut Queue) -> DqmResult<()> {
        dispatch!(self, s => s.detach(hw, pool, q))
    }

    fn deactivate(&mut self, hw: &DqmHw, q: &Queue) -> DqmResult<()> {
        dispatch!(self, s => s.deactivate(hw, q))
    }

    fn activate(&mut self, hw: &DqmHw, q: &Queue) -> DqmResult<()> {
        dispatch!(self, s => s.activate(hw, q))
    }

    fn quiesce(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        dispatch!(self, s => s.quiesce(hw, state))
    }

    fn commit(&mut self, hw: &DqmHw, state: &DqmState) -> DqmResult<()> {
        dispatch!(self, s => s.commit(hw, state))
    }

    fn page_table_changed(&mut self, hw: &DqmHw, qpd: &Qpd) -> DqmResult<()> {
        dispatch!(self, s => s.page_table_changed(hw, qpd))
    }

    fn program_sh_mem(&mut self, hw: &DqmHw, qpd: &Qpd) {
        dispatch!(self, s => s.program_sh_mem(hw, qpd));
    }
}
