//! The device queue manager: owns every process-device context of one device, hands
//! out hardware resources to their queues and keeps the hardware in step with the
//! bookkeeping, either by programming HQDs directly or through runlists.
//!
//! Every public operation takes the manager's lock for its whole duration, including
//! hardware polls and fence waits.

pub mod asic;
pub mod config;
pub mod fence;
pub mod mqd;
pub mod packets;
pub mod queue;
pub mod resources;
pub(crate) mod scheduler;

use crate::error::{DqmError, DqmResult};
use crate::kfd::device::DeviceInfo;
use crate::kfd::kgd::{Kfd2Kgd, VmHandle};
use crate::memory::GttMemory;
use crate::process::device::Apertures;
use asic::{AsicOps, CachePolicy};
use config::{DqmConfig, SchedPolicy};
use log::{debug, error, info, warn};
use mqd::{MqdManagers, MqdObject, MqdType};
use parking_lot::Mutex;
use queue::{Qpd, QpdId, Queue, QueueId, QueueProperties, QueueType, QueueUpdate};
use resources::{HqdSlot, PoolSnapshot, ResourcePool};
use scheduler::{DirectScheduler, RunlistScheduler, Scheduler, SchedulingPolicy};
use std::collections::BTreeMap;
use std::sync::Arc;

/// APE1 base and limit are programmed in 64 KiB units below bit 47.
pub const APE1_FIXED_BITS_MASK: u64 = 0xFFFF_8000_0000_FFFF;
pub const APE1_LIMIT_ALIGNMENT: u64 = 0xFFFF;

// ===============================================================================================
// Shared State
// ===============================================================================================

/// Immutable half of the manager, shared with the scheduling policies.
#[derive(Debug)]
pub(crate) struct DqmHw {
    pub(crate) info: DeviceInfo,
    pub(crate) config: DqmConfig,
    pub(crate) kgd: Arc<Kfd2Kgd>,
    pub(crate) gtt: Arc<GttMemory>,
    pub(crate) asic: Box<dyn AsicOps>,
    pub(crate) mqds: MqdManagers,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    /// Queues with `is_active`.
    pub(crate) queue_count: u32,
    /// Every registered queue, kernel queues included.
    pub(crate) total_queue_count: u32,
    pub(crate) sdma_queue_count: u32,
    pub(crate) processes_count: u32,
}

impl Counters {
    fn add(&mut self, q: &Queue) {
        self.total_queue_count += 1;
        if q.is_active() {
            self.queue_count += 1;
        }
        if q.sdma_id.is_some() {
            self.sdma_queue_count += 1;
        }
    }

    fn remove(&mut self, q: &Queue) {
        self.total_queue_count = self.total_queue_count.saturating_sub(1);
        if q.is_active() {
            self.queue_count = self.queue_count.saturating_sub(1);
        }
        if q.sdma_id.is_some() {
            self.sdma_queue_count = self.sdma_queue_count.saturating_sub(1);
        }
    }

    fn activity_changed(&mut self, was_active: bool, is_active: bool) {
        match (was_active, is_active) {
            (false, true) => self.queue_count += 1,
            (true, false) => self.queue_count = self.queue_count.saturating_sub(1),
            _ => {}
        }
    }
}

/// Mutable half of the manager, guarded by its lock.
#[derive(Debug)]
pub(crate) struct DqmState {
    pub(crate) pool: ResourcePool,
    pub(crate) qpds: BTreeMap<QpdId, Qpd>,
    /// Contexts taking part in runlists, in registration order.
    pub(crate) registered: Vec<QpdId>,
    pub(crate) counters: Counters,
    next_queue_id: u32,
    next_qpd_id: u32,
    started: bool,
    /// Descriptors the hardware may still reference after a failed preemption.
    quarantined_mqds: Vec<MqdObject>,
}

#[derive(Debug)]
struct DqmInner {
    state: DqmState,
    sched: Scheduler,
}

/// Point-in-time view of the manager's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DqmStats {
    pub queue_count: u32,
    pub total_queue_count: u32,
    pub sdma_queue_count: u32,
    pub processes_count: u32,
    pub active_runlist: bool,
    pub quarantined_hqds: usize,
    pub quarantined_mqds: usize,
}

fn qpd_mut(qpds: &mut BTreeMap<QpdId, Qpd>, id: QpdId) -> DqmResult<&mut Qpd> {
    qpds.get_mut(&id).ok_or_else(|| DqmError::NotFound(id.to_string()))
}

/// Gives the context's VMID back. Hardware cleanup failures are logged, the VMID is
/// released regardless.
fn release_vmid(hw: &DqmHw, sched: &mut Scheduler, pool: &mut ResourcePool, qpd: &mut Qpd) -> DqmResult<()> {
    if qpd.vmid == 0 {
        return Ok(());
    }
    let unbound = sched.unbind_vmid(hw, qpd);
    if let Err(e) = &unbound {
        warn!("clearing the PASID mapping of VMID {} failed: {e}", qpd.vmid);
    }
    debug!("releasing VMID {} of {}", qpd.vmid, qpd.id);
    pool.release_vmid(qpd.vmid);
    qpd.vmid = 0;
    unbound
}

/// Frees a descriptor, or keeps its memory out of circulation when the hardware may
/// still be reading it.
fn release_mqd(hw: &DqmHw, ty: MqdType, quarantine: &mut Vec<MqdObject>, mqd: MqdObject, hung: bool) {
    if hung {
        warn!("quarantining MQD at 0x{:x}", mqd.gpu_addr());
        quarantine.push(mqd);
    } else {
        hw.mqds.get(ty).uninit(mqd);
    }
}

/// Acquires the SDMA id, descriptor and hardware placement of a new queue. Undoes its
/// own acquisitions on failure.
fn build_queue(
    hw: &DqmHw,
    sched: &mut Scheduler,
    pool: &mut ResourcePool,
    qpd: &Qpd,
    id: QueueId,
    mut props: QueueProperties,
) -> DqmResult<Queue> {
    props.vmid = qpd.vmid;
    props.tba_addr = qpd.tba_addr;
    props.tma_addr = qpd.tma_addr;

    let sdma_id = if props.queue_type == QueueType::Sdma {
        let sdma_id = pool.allocate_sdma()?;
        (props.sdma_engine_id, props.sdma_queue_id) = pool.sdma_placement(sdma_id);
        hw.asic.init_sdma_vm(qpd, &mut props);
        Some(sdma_id)
    } else {
        None
    };

    let context_evicted = qpd.evicted > 0;
    let mut effective = props.clone();
    if context_evicted {
        effective.queue_percent = 0;
    }

    let mgr = hw
        .mqds
        .get(MqdType::for_queue(props.queue_type, sched.compute_mqd_type()));
    let mqd = match mgr.init(&effective) {
        Ok(mqd) => mqd,
        Err(e) => {
            if let Some(sdma_id) = sdma_id {
                pool.release_sdma(sdma_id);
            }
            return Err(e);
        }
    };

    props.is_active = mqd.is_active();
    let evicted = context_evicted && props.describes_active();
    let mut queue = Queue {
        id,
        properties: props,
        mqd,
        hqd: None,
        sdma_id,
        evicted,
    };

    if let Err(e) = sched.attach(hw, pool, &mut queue) {
        mgr.uninit(queue.mqd);
        if let Some(sdma_id) = sdma_id {
            pool.release_sdma(sdma_id);
        }
        return Err(e);
    }
    Ok(queue)
}

/// Patches one queue's properties and descriptor and adjusts the active count. In
/// direct mode the HQD is unloaded around the change; under the hardware scheduler
/// the caller owns quiescing and resubmitting the runlist.
fn apply_update(
    hw: &DqmHw,
    sched: &mut Scheduler,
    state: &mut DqmState,
    qpd_id: QpdId,
    idx: usize,
    was_active: bool,
    update: &QueueUpdate,
) -> DqmResult<()> {
    let uses_runlist = sched.uses_runlist();
    let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
    let context_evicted = qpd.evicted > 0;
    let q = &mut qpd.queues[idx];
    if was_active && !uses_runlist {
        sched.deactivate(hw, q)?;
    }

    q.properties.apply(update);
    if context_evicted {
        q.evicted = q.properties.describes_active();
    }
    let effective = q.effective_properties(context_evicted);
    hw.mqds
        .get(MqdType::for_queue(q.properties.queue_type, sched.compute_mqd_type()))
        .update(&mut q.mqd, &effective)?;
    q.properties.is_active = q.mqd.is_active();
    let now_active = q.is_active();
    state.counters.activity_changed(was_active, now_active);

    if now_active && !uses_runlist {
        sched.activate(hw, q)?;
    }
    Ok(())
}

// ===============================================================================================
// Device Queue Manager
// ===============================================================================================

#[derive(Debug)]
pub struct DeviceQueueManager {
    hw: DqmHw,
    inner: Mutex<DqmInner>,
}

impl DeviceQueueManager {
    /// Builds a stopped manager for one device.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an inconsistent configuration or a device whose
    /// VMID or HQD ranges cannot be programmed.
    pub fn new(info: DeviceInfo, config: DqmConfig, kgd: Arc<Kfd2Kgd>, asic: Box<dyn AsicOps>) -> DqmResult<Self> {
        config.validate()?;
        info.validate()?;

        let sched = match config.sched_policy {
            SchedPolicy::NoHws => Scheduler::Direct(DirectScheduler::default()),
            SchedPolicy::Hws => Scheduler::Runlist(RunlistScheduler::new(true)),
            SchedPolicy::HwsNoOversubscription => Scheduler::Runlist(RunlistScheduler::new(false)),
        };
        let gtt = kgd.gtt().clone();
        let mqds = MqdManagers::new(
            kgd.clone(),
            gtt.clone(),
            config.preempt_timeout,
            config.hqd_poll_interval,
        );
        let state = DqmState {
            pool: ResourcePool::new(&info),
            qpds: BTreeMap::new(),
            registered: Vec::new(),
            counters: Counters::default(),
            next_queue_id: 1,
            next_qpd_id: 1,
            started: false,
            quarantined_mqds: Vec::new(),
        };
        info!(
            "device queue manager initialized: policy {:?}, {} pipes x {} queues, VMIDs {}..{}",
            config.sched_policy,
            info.pipe_count,
            info.queues_per_pipe,
            info.first_vmid,
            info.first_vmid + info.vmid_count
        );

        Ok(Self {
            hw: DqmHw {
                info,
                config,
                kgd,
                gtt,
                asic,
                mqds,
            },
            inner: Mutex::new(DqmInner { state, sched }),
        })
    }

    #[must_use]
    pub const fn policy(&self) -> SchedPolicy {
        self.hw.config.sched_policy
    }

    #[must_use]
    pub const fn config(&self) -> &DqmConfig {
        &self.hw.config
    }

    #[must_use]
    pub fn mqd_managers(&self) -> &MqdManagers {
        &self.hw.mqds
    }

    /// Brings up the scheduling mode: pipelines in direct mode, the scheduler
    /// firmware resources and fence otherwise.
    ///
    /// # Errors
    /// Propagates allocation and HIQ failures.
    pub fn start(&self) -> DqmResult<()> {
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        if state.started {
            return Ok(());
        }
        sched.start(&self.hw, state)?;
        state.started = true;
        Ok(())
    }

    /// # Errors
    /// Returns `Timeout` if the firmware does not acknowledge unmapping every queue.
    pub fn stop(&self) -> DqmResult<()> {
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        if !state.started {
            return Ok(());
        }
        sched.stop(&self.hw, state)?;
        state.started = false;
        Ok(())
    }

    /// Stops the manager for good.
    ///
    /// # Errors
    /// Returns `Busy` while contexts are still registered.
    pub fn uninitialize(&self) -> DqmResult<()> {
        if !self.inner.lock().state.qpds.is_empty() {
            return Err(DqmError::Busy("process contexts still registered"));
        }
        self.stop()
    }

    // ===========================================================================================
    // Contexts
    // ===========================================================================================

    /// Creates an empty context for `pasid` on address space `vm`.
    pub fn create_qpd(&self, pasid: u32, vm: VmHandle, apertures: Apertures) -> QpdId {
        let page_table_base = self.hw.kgd.vm().page_directory_base(vm);
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        let id = QpdId(state.next_qpd_id);
        state.next_qpd_id += 1;
        state
            .qpds
            .insert(id, Qpd::new(id, pasid, vm, page_table_base, apertures));
        debug!("created {id} for PASID {pasid}");
        id
    }

    /// Adds the context to the scheduled set and computes its shader memory setup.
    ///
    /// # Errors
    /// `NotFound` for an unknown context, `InvalidArgument` if its apertures cannot be
    /// programmed.
    pub fn register_process(&self, qpd_id: QpdId) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        if qpd.registered {
            return Ok(());
        }

        qpd.page_table_base = hw.kgd.vm().page_directory_base(qpd.vm);
        hw.asic.register_process(qpd)?;
        sched.program_sh_mem(hw, qpd);

        qpd.registered = true;
        state.registered.push(qpd_id);
        state.counters.processes_count += 1;
        debug!("registered {qpd_id}, {} processes", state.counters.processes_count);
        Ok(())
    }

    /// # Errors
    /// `NotFound` if the context is not registered.
    pub fn unregister_process(&self, qpd_id: QpdId) -> DqmResult<()> {
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        if !qpd.registered {
            return Err(DqmError::NotFound(format!("registration of {qpd_id}")));
        }
        qpd.registered = false;
        state.registered.retain(|id| *id != qpd_id);
        state.counters.processes_count = state.counters.processes_count.saturating_sub(1);
        debug!("unregistered {qpd_id}");
        Ok(())
    }

    // ===========================================================================================
    // User Queues
    // ===========================================================================================

    /// Creates a queue in `qpd_id` and returns its id and the context's VMID.
    ///
    /// A queue created while its context is evicted starts inactive and is marked
    /// for restore if its properties describe an active queue.
    ///
    /// # Errors
    /// `QuotaExceeded` at the per-device queue limit, `ResourceExhausted` when no
    /// VMID, HQD slot or SDMA queue is free, `AllocationFailure` for descriptor
    /// memory, and any error of the runlist commit. Every partially acquired resource
    /// is released on failure.
    pub fn create_queue(&self, qpd_id: QpdId, props: QueueProperties) -> DqmResult<(QueueId, u32)> {
        props.validate()?;
        if props.queue_type == QueueType::Diq {
            return Err(DqmError::InvalidArgument(
                "debug queues are created through create_kernel_queue".into(),
            ));
        }

        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;

        if state.counters.total_queue_count >= hw.config.max_queues_per_device {
            warn!(
                "Can't create new usermode queue because {} queues were already created",
                state.counters.total_queue_count
            );
            return Err(DqmError::QuotaExceeded(state.counters.total_queue_count));
        }

        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        let allocated_vmid = qpd.queues.is_empty() && qpd.vmid == 0;
        if allocated_vmid {
            qpd.vmid = state.pool.allocate_vmid()?;
            if let Err(e) = sched.bind_vmid(hw, qpd) {
                let _ = release_vmid(hw, sched, &mut state.pool, qpd);
                return Err(e);
            }
        }

        let id = QueueId(state.next_queue_id);
        let queue = match build_queue(hw, sched, &mut state.pool, qpd, id, props) {
            Ok(queue) => queue,
            Err(e) => {
                if allocated_vmid {
                    let _ = release_vmid(hw, sched, &mut state.pool, qpd);
                }
                return Err(e);
            }
        };
        state.next_queue_id += 1;

        let vmid = qpd.vmid;
        let active = queue.is_active();
        state.counters.add(&queue);
        qpd.queues.push(queue);
        debug!(
            "created {id} in {qpd_id}: vmid {vmid}, active {active}, {} active / {} total",
            state.counters.queue_count, state.counters.total_queue_count
        );

        if active && sched.uses_runlist() {
            if let Err(e) = sched.commit(hw, state) {
                return Err(self.rollback_create(state, sched, qpd_id, id, e));
            }
        }
        Ok((id, vmid))
    }

    /// Takes a just-created queue back out after its runlist commit failed, then
    /// resubmits what remains.
    fn rollback_create(
        &self,
        state: &mut DqmState,
        sched: &mut Scheduler,
        qpd_id: QpdId,
        id: QueueId,
        err: DqmError,
    ) -> DqmError {
        let hw = &self.hw;
        warn!("runlist commit for new {id} failed ({err}), rolling back");

        if let Some(qpd) = state.qpds.get_mut(&qpd_id) {
            if let Ok(idx) = qpd.queue_index(id) {
                let q = qpd.queues.remove(idx);
                state.counters.remove(&q);
                if let Some(sdma_id) = q.sdma_id {
                    state.pool.release_sdma(sdma_id);
                }
                if qpd.queues.is_empty() {
                    let _ = release_vmid(hw, sched, &mut state.pool, qpd);
                }
                let ty = MqdType::for_queue(q.properties.queue_type, sched.compute_mqd_type());
                release_mqd(hw, ty, &mut state.quarantined_mqds, q.mqd, err.requires_reset());
            }
        }

        if let Err(e) = sched.commit(hw, state) {
            warn!("could not resubmit the runlist after rollback: {e}");
        }
        err
    }

    /// Destroys a user queue.
    ///
    /// # Errors
    /// `Busy` if the context has a kernel debug queue under the hardware scheduler,
    /// `NotFound` for an unknown queue and `Timeout` when preemption does not
    /// complete. A direct-mode timeout leaves the queue registered and its HQD slot
    /// held.
    pub fn destroy_queue(&self, qpd_id: QpdId, queue_id: QueueId) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let uses_runlist = sched.uses_runlist();

        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        if uses_runlist && qpd.is_debug {
            return Err(DqmError::Busy("context has a kernel debug queue"));
        }
        let idx = qpd.queue_index(queue_id)?;

        if !uses_runlist {
            if let Err(e) = sched.detach(hw, &mut state.pool, &mut qpd.queues[idx]) {
                error!("failed to preempt {queue_id} of {qpd_id}: {e}");
                return Err(e);
            }
        }

        let q = qpd.queues.remove(idx);
        state.counters.remove(&q);
        if let Some(sdma_id) = q.sdma_id {
            state.pool.release_sdma(sdma_id);
        }
        if qpd.queues.is_empty() {
            let _ = release_vmid(hw, sched, &mut state.pool, qpd);
        }
        debug!(
            "destroyed {queue_id} of {qpd_id}, {} active / {} total",
            state.counters.queue_count, state.counters.total_queue_count
        );

        let committed = if uses_runlist {
            sched.commit(hw, state)
        } else {
            Ok(())
        };
        let hung = committed.as_ref().is_err_and(DqmError::requires_reset);
        let ty = MqdType::for_queue(q.properties.queue_type, sched.compute_mqd_type());
        release_mqd(hw, ty, &mut state.quarantined_mqds, q.mqd, hung);
        committed
    }

    /// Replaces the mutable properties of a queue.
    ///
    /// # Errors
    /// `InvalidArgument` for out-of-range values, `NotFound` for an unknown queue,
    /// and preemption or commit failures.
    pub fn update_queue(&self, qpd_id: QpdId, queue_id: QueueId, update: QueueUpdate) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let uses_runlist = sched.uses_runlist();

        let (idx, was_active) = {
            let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
            let idx = qpd.queue_index(queue_id)?;
            let q = &qpd.queues[idx];
            let mut proposed = q.properties.clone();
            proposed.apply(&update);
            proposed.validate()?;
            (idx, q.is_active())
        };

        if !uses_runlist {
            return apply_update(hw, sched, state, qpd_id, idx, was_active, &update);
        }

        if was_active {
            sched.quiesce(hw, state)?;
        }
        let updated = apply_update(hw, sched, state, qpd_id, idx, was_active, &update);
        if let Err(e) = &updated {
            warn!("update of {queue_id} failed ({e}), resubmitting the runlist");
        }
        let committed = sched.commit(hw, state);
        updated.and(committed)
    }

    // ===========================================================================================
    // Eviction
    // ===========================================================================================

    /// Deactivates every active queue of the context. Nested calls only count.
    ///
    /// # Errors
    /// Preemption or commit failures. The eviction count stays incremented.
    pub fn evict_process_queues(&self, qpd_id: QpdId) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let uses_runlist = sched.uses_runlist();
        let compute = sched.compute_mqd_type();

        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        qpd.evicted += 1;
        if qpd.evicted > 1 {
            return Ok(());
        }
        debug!("evicting queues of {qpd_id}");

        for q in &mut qpd.queues {
            q.evicted = q.is_active();
            if !q.evicted {
                continue;
            }
            if !uses_runlist {
                sched.deactivate(hw, q)?;
            }
            let effective = q.effective_properties(true);
            hw.mqds
                .get(MqdType::for_queue(q.properties.queue_type, compute))
                .update(&mut q.mqd, &effective)?;
            q.properties.is_active = false;
            state.counters.activity_changed(true, false);
        }

        if uses_runlist {
            sched.commit(hw, state)?;
        }
        Ok(())
    }

    /// Undoes one eviction; the last one reactivates the marked queues in order.
    ///
    /// # Errors
    /// Load or commit failures.
    pub fn restore_process_queues(&self, qpd_id: QpdId) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let uses_runlist = sched.uses_runlist();
        let compute = sched.compute_mqd_type();

        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        match qpd.evicted {
            0 => {
                warn!("restore of {qpd_id}, which is not evicted");
                return Ok(());
            }
            1 => {}
            _ => {
                qpd.evicted -= 1;
                return Ok(());
            }
        }
        debug!("restoring queues of {qpd_id}");

        let pd_base = hw.kgd.vm().page_directory_base(qpd.vm);
        if pd_base != qpd.page_table_base {
            qpd.page_table_base = pd_base;
            sched.page_table_changed(hw, qpd)?;
        }

        for q in &mut qpd.queues {
            if !q.evicted {
                continue;
            }
            let effective = q.effective_properties(false);
            hw.mqds
                .get(MqdType::for_queue(q.properties.queue_type, compute))
                .update(&mut q.mqd, &effective)?;
            q.evicted = false;
            q.properties.is_active = q.mqd.is_active();
            if !q.is_active() {
                continue;
            }
            state.counters.activity_changed(false, true);
            if !uses_runlist {
                sched.activate(hw, q)?;
            }
        }
        qpd.evicted = 0;

        if uses_runlist {
            sched.commit(hw, state)?;
        }
        Ok(())
    }

    // ===========================================================================================
    // Termination
    // ===========================================================================================

    /// Tears down every queue of the context, releases its resources, unregisters it
    /// and drops it. Teardown always runs to the end; HQD slots and descriptors whose
    /// preemption timed out are quarantined, and the first error is returned.
    ///
    /// # Errors
    /// `NotFound` for an unknown context, otherwise the first teardown failure.
    pub fn process_termination(&self, qpd_id: QpdId) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let uses_runlist = sched.uses_runlist();
        let compute = sched.compute_mqd_type();

        let mut qpd = state
            .qpds
            .remove(&qpd_id)
            .ok_or_else(|| DqmError::NotFound(qpd_id.to_string()))?;
        let mut first_err: Option<DqmError> = None;
        let mut retired: Vec<(MqdType, MqdObject)> = Vec::new();

        for q in qpd.priv_queues.drain(..) {
            state.counters.remove(&q);
            retired.push((compute, q.mqd));
        }
        qpd.is_debug = false;

        for mut q in std::mem::take(&mut qpd.queues) {
            let ty = MqdType::for_queue(q.properties.queue_type, compute);
            if !uses_runlist {
                if let Err(e) = sched.detach(hw, &mut state.pool, &mut q) {
                    error!("termination of {qpd_id}: {} did not preempt: {e}", q.id);
                    if let Some(hqd) = q.hqd.take() {
                        state.pool.quarantine_hqd(hqd);
                    }
                    state.counters.remove(&q);
                    release_mqd(hw, ty, &mut state.quarantined_mqds, q.mqd, true);
                    first_err.get_or_insert(e);
                    continue;
                }
            }
            state.counters.remove(&q);
            if let Some(sdma_id) = q.sdma_id {
                state.pool.release_sdma(sdma_id);
            }
            retired.push((ty, q.mqd));
        }

        if qpd.registered {
            qpd.registered = false;
            state.registered.retain(|id| *id != qpd_id);
            state.counters.processes_count = state.counters.processes_count.saturating_sub(1);
        }
        if let Err(e) = release_vmid(hw, sched, &mut state.pool, &mut qpd) {
            first_err.get_or_insert(e);
        }

        let hung = if uses_runlist {
            match sched.commit(hw, state) {
                Ok(()) => false,
                Err(e) => {
                    let hung = e.requires_reset();
                    first_err.get_or_insert(e);
                    hung
                }
            }
        } else {
            false
        };
        for (ty, mqd) in retired {
            release_mqd(hw, ty, &mut state.quarantined_mqds, mqd, hung);
        }

        info!(
            "terminated {qpd_id} (PASID {}), {} active / {} total queues remain",
            qpd.pasid, state.counters.queue_count, state.counters.total_queue_count
        );
        first_err.map_or(Ok(()), Err)
    }

    // ===========================================================================================
    // Context Settings
    // ===========================================================================================

    /// Refreshes the page-table base from the VM manager and republishes it.
    ///
    /// # Errors
    /// Commit failures under the hardware scheduler.
    pub fn set_page_directory_base(&self, qpd_id: QpdId) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;

        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        let base = hw.kgd.vm().page_directory_base(qpd.vm);
        if base == qpd.page_table_base {
            return Ok(());
        }
        debug!("{qpd_id} page table base 0x{:x} -> 0x{base:x}", qpd.page_table_base);
        qpd.page_table_base = base;

        if sched.uses_runlist() {
            sched.commit(hw, state)
        } else {
            sched.page_table_changed(hw, qpd)
        }
    }

    /// Sets the cache policy of the default aperture and of APE1, which covers
    /// `[ape1_base, ape1_base + ape1_size)`. A zero size disables APE1.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is not expressible in the APE1 registers; the
    /// context is left unchanged.
    pub fn set_cache_memory_policy(
        &self,
        qpd_id: QpdId,
        default_policy: CachePolicy,
        alternate_policy: CachePolicy,
        ape1_base: u64,
        ape1_size: u64,
    ) -> DqmResult<()> {
        let (base_reg, limit_reg) = if ape1_size == 0 {
            // base > limit disables the aperture
            (1, 0)
        } else {
            let limit = ape1_base.wrapping_add(ape1_size - 1);
            if limit <= ape1_base
                || ape1_base & APE1_FIXED_BITS_MASK != 0
                || limit & APE1_FIXED_BITS_MASK != APE1_LIMIT_ALIGNMENT
            {
                return Err(DqmError::InvalidArgument(format!(
                    "APE1 range 0x{ape1_base:x}+0x{ape1_size:x} is not 64K aligned below 2^47"
                )));
            }
            #[allow(clippy::cast_possible_truncation)]
            ((ape1_base >> 16) as u32, (limit >> 16) as u32)
        };

        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;

        qpd.sh_mem_ape1_base = base_reg;
        qpd.sh_mem_ape1_limit = limit_reg;
        hw.asic
            .set_cache_memory_policy(qpd, default_policy, alternate_policy);
        sched.program_sh_mem(hw, qpd);

        debug!(
            "{qpd_id} sh_mem_config 0x{:x}, ape1 0x{base_reg:x}..0x{limit_reg:x}",
            qpd.sh_mem_config
        );
        Ok(())
    }

    /// Stores the trap handler addresses copied into queues created afterwards.
    ///
    /// # Errors
    /// `NotFound` for an unknown context.
    pub fn set_trap_handler(&self, qpd_id: QpdId, tba_addr: u64, tma_addr: u64) -> DqmResult<()> {
        let mut inner = self.inner.lock();
        let qpd = qpd_mut(&mut inner.state.qpds, qpd_id)?;
        qpd.tba_addr = tba_addr;
        qpd.tma_addr = tma_addr;
        Ok(())
    }

    // ===========================================================================================
    // Kernel Queues
    // ===========================================================================================

    /// Registers a kernel debug queue and marks the context as being debugged.
    ///
    /// # Errors
    /// `InvalidArgument` without the hardware scheduler or for a non-debug queue type,
    /// `QuotaExceeded` at the device limit, and commit failures.
    pub fn create_kernel_queue(&self, qpd_id: QpdId, props: QueueProperties) -> DqmResult<QueueId> {
        props.validate()?;
        if props.queue_type != QueueType::Diq {
            return Err(DqmError::InvalidArgument(format!(
                "kernel queues must be debug queues, not {:?}",
                props.queue_type
            )));
        }

        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        if !sched.uses_runlist() {
            return Err(DqmError::InvalidArgument(
                "kernel debug queues require the hardware scheduler".into(),
            ));
        }
        if state.counters.total_queue_count >= hw.config.max_queues_per_device {
            warn!(
                "Can't create new kernel queue because {} queues were already created",
                state.counters.total_queue_count
            );
            return Err(DqmError::QuotaExceeded(state.counters.total_queue_count));
        }

        let compute = sched.compute_mqd_type();
        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        let mgr = hw.mqds.get(compute);
        let mqd = mgr.init(&props)?;

        let id = QueueId(state.next_queue_id);
        state.next_queue_id += 1;
        let mut properties = props;
        properties.is_active = mqd.is_active();
        let queue = Queue {
            id,
            properties,
            mqd,
            hqd: None,
            sdma_id: None,
            evicted: false,
        };
        state.counters.add(&queue);
        qpd.priv_queues.push(queue);
        qpd.is_debug = true;
        debug!("created kernel {id} in {qpd_id}");

        if let Err(e) = sched.commit(hw, state) {
            warn!("runlist commit for kernel {id} failed ({e}), rolling back");
            if let Some(qpd) = state.qpds.get_mut(&qpd_id) {
                if let Some(pos) = qpd.priv_queues.iter().position(|q| q.id == id) {
                    let q = qpd.priv_queues.remove(pos);
                    qpd.is_debug = !qpd.priv_queues.is_empty();
                    state.counters.remove(&q);
                    release_mqd(hw, compute, &mut state.quarantined_mqds, q.mqd, e.requires_reset());
                }
            }
            if let Err(again) = sched.commit(hw, state) {
                warn!("could not resubmit the runlist after rollback: {again}");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// # Errors
    /// `NotFound` for an unknown queue, and commit failures.
    pub fn destroy_kernel_queue(&self, qpd_id: QpdId, queue_id: QueueId) -> DqmResult<()> {
        let hw = &self.hw;
        let mut inner = self.inner.lock();
        let DqmInner { state, sched } = &mut *inner;
        let compute = sched.compute_mqd_type();

        let qpd = qpd_mut(&mut state.qpds, qpd_id)?;
        let pos = qpd
            .priv_queues
            .iter()
            .position(|q| q.id == queue_id)
            .ok_or_else(|| DqmError::NotFound(format!("kernel {queue_id} in {qpd_id}")))?;
        let q = qpd.priv_queues.remove(pos);
        qpd.is_debug = !qpd.priv_queues.is_empty();
        state.counters.remove(&q);

        let committed = sched.commit(hw, state);
        let hung = committed.as_ref().is_err_and(DqmError::requires_reset);
        release_mqd(hw, compute, &mut state.quarantined_mqds, q.mqd, hung);
        committed
    }

    // ===========================================================================================
    // Introspection
    // ===========================================================================================

    #[must_use]
    pub fn stats(&self) -> DqmStats {
        let inner = self.inner.lock();
        let c = inner.state.counters;
        DqmStats {
            queue_count: c.queue_count,
            total_queue_count: c.total_queue_count,
            sdma_queue_count: c.sdma_queue_count,
            processes_count: c.processes_count,
            active_runlist: inner.sched.is_active_runlist(),
            quarantined_hqds: inner.state.pool.quarantined().len(),
            quarantined_mqds: inner.state.quarantined_mqds.len(),
        }
    }

    #[must_use]
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.inner.lock().state.pool.snapshot()
    }

    #[must_use]
    pub fn quarantined_hqds(&self) -> Vec<HqdSlot> {
        self.inner.lock().state.pool.quarantined().to_vec()
    }

    /// Runs `f` on the context under the manager's lock.
    ///
    /// # Errors
    /// `NotFound` for an unknown context.
    pub fn with_qpd<R>(&self, qpd_id: QpdId, f: impl FnOnce(&Qpd) -> R) -> DqmResult<R> {
        let inner = self.inner.lock();
        inner
            .state
            .qpds
            .get(&qpd_id)
            .map(f)
            .ok_or_else(|| DqmError::NotFound(qpd_id.to_string()))
    }

    /// Whether the queue's hardware slot is currently running its ring.
    ///
    /// # Errors
    /// `NotFound` for an unknown context or queue.
    pub fn queue_is_occupied(&self, qpd_id: QpdId, queue_id: QueueId) -> DqmResult<bool> {
        let inner = self.inner.lock();
        let qpd = inner
            .state
            .qpds
            .get(&qpd_id)
            .ok_or_else(|| DqmError::NotFound(qpd_id.to_string()))?;
        let q = &qpd.queues[qpd.queue_index(queue_id)?];
        let (pipe, slot) = q.hqd.map_or((0, 0), |h| (h.pipe, h.slot));
        let mgr = self.hw.mqds.get(MqdType::for_queue(
            q.properties.queue_type,
            inner.sched.compute_mqd_type(),
        ));
        Ok(mgr.is_occupied(&q.mqd, q.properties.queue_address, pipe, slot))
    }
}
