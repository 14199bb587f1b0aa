//! Processes and their bindings to devices.
//!
//! A `KfdProcess` owns one `ProcessDevice` per device it has touched. The global
//! `ProcessRegistry` maps OS process identity to processes, hands out PASIDs and
//! drives binding, unbinding and release. Lock order is table writer, then process
//! mutex, then device lock.

pub mod device;
pub mod table;

use crate::dqm::config::DqmConfig;
use crate::dqm::queue::{QpdId, QueueId, QueueProperties, QueueUpdate};
use crate::dqm::resources::IdBitmap;
use crate::error::{DqmError, DqmResult, Resource};
use crate::kfd::device::KfdDevice;
use device::{Apertures, ProcessDevice};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, OnceLock};
use table::ProcessTable;

/// OS identity of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub libc::pid_t);

impl ProcessId {
    #[must_use]
    pub fn current() -> Self {
        // SAFETY: getpid has no preconditions and cannot fail.
        Self(unsafe { libc::getpid() })
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

// ===============================================================================================
// Process
// ===============================================================================================

#[derive(Debug, Default)]
struct ProcessState {
    devices: Vec<ProcessDevice>,
}

impl ProcessState {
    fn device_mut(&mut self, device_id: u32) -> Option<&mut ProcessDevice> {
        self.devices.iter_mut().find(|pdd| pdd.device.id() == device_id)
    }

    /// The data of a device the process is currently bound to.
    fn bound_device(&mut self, pid: ProcessId, device_id: u32) -> DqmResult<&mut ProcessDevice> {
        self.device_mut(device_id)
            .filter(|pdd| pdd.bound)
            .ok_or_else(|| DqmError::NotFound(format!("{pid} is not bound to device {device_id}")))
    }
}

#[derive(Debug)]
pub struct KfdProcess {
    pid: ProcessId,
    pasid: u32,
    state: Mutex<ProcessState>,
}

impl KfdProcess {
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    #[must_use]
    pub const fn pasid(&self) -> u32 {
        self.pasid
    }

    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock()
    }

    /// The queue manager context of this process on `device_id`.
    ///
    /// # Errors
    /// `NotFound` if the process never touched the device.
    pub fn qpd(&self, device_id: u32) -> DqmResult<QpdId> {
        self.with_device(device_id, ProcessDevice::qpd)
    }

    /// Runs `f` on the per-device data of `device_id`.
    ///
    /// # Errors
    /// `NotFound` if the process never touched the device.
    pub fn with_device<R>(&self, device_id: u32, f: impl FnOnce(&ProcessDevice) -> R) -> DqmResult<R> {
        let mut state = self.lock();
        state
            .device_mut(device_id)
            .map(|pdd| f(pdd))
            .ok_or_else(|| DqmError::NotFound(format!("{} has no data on device {device_id}", self.pid)))
    }

    #[must_use]
    pub fn device_ids(&self) -> Vec<u32> {
        self.lock().devices.iter().map(|pdd| pdd.device.id()).collect()
    }

    /// Creates a user queue on a bound device. The first queue registers the process
    /// with the device's scheduler.
    ///
    /// # Errors
    /// `NotFound` if the device is not bound, otherwise whatever the queue manager
    /// returns.
    pub fn create_queue(&self, device_id: u32, props: QueueProperties) -> DqmResult<(QueueId, u32)> {
        let mut state = self.lock();
        let pdd = state.bound_device(self.pid, device_id)?;
        let dqm = pdd.device.dqm();

        let first = pdd.queues.is_empty();
        if first {
            dqm.register_process(pdd.qpd)?;
        }
        match dqm.create_queue(pdd.qpd, props) {
            Ok((queue, vmid)) => {
                pdd.queues.push(queue);
                Ok((queue, vmid))
            }
            Err(e) => {
                if first {
                    if let Err(unreg) = dqm.unregister_process(pdd.qpd) {
                        warn!("{}: unregister after failed create: {unreg}", self.pid);
                    }
                }
                Err(e)
            }
        }
    }

    /// Destroys a user queue. The last queue unregisters the process from the device's
    /// scheduler. A preemption timeout marks the device for a wavefront reset.
    ///
    /// # Errors
    /// `NotFound` for an unknown queue, otherwise whatever the queue manager returns.
    pub fn destroy_queue(&self, device_id: u32, queue: QueueId) -> DqmResult<()> {
        let mut state = self.lock();
        let pid = self.pid;
        let pdd = state
            .device_mut(device_id)
            .ok_or_else(|| DqmError::NotFound(format!("{pid} has no data on device {device_id}")))?;
        let pos = pdd
            .queues
            .iter()
            .position(|q| *q == queue)
            .ok_or_else(|| DqmError::NotFound(format!("{queue} of {pid}")))?;
        let dqm = pdd.device.dqm();

        let destroyed = dqm.destroy_queue(pdd.qpd, queue);
        if let Err(e) = &destroyed {
            if e.requires_reset() {
                pdd.reset_wavefronts = true;
            }
        }
        // A failed runlist commit happens after the queue is already gone.
        if destroyed.is_err() && dqm.with_qpd(pdd.qpd, |q| q.queue(queue).is_some())? {
            return destroyed;
        }
        if let Err(e) = &destroyed {
            warn!("{pid}: {queue} was removed despite: {e}");
        }
        pdd.queues.remove(pos);
        if pdd.queues.is_empty() {
            if let Err(unreg) = dqm.unregister_process(pdd.qpd) {
                if destroyed.is_ok() {
                    return Err(unreg);
                }
                warn!("{pid}: unregister after failed destroy: {unreg}");
            }
        }
        destroyed
    }

    /// # Errors
    /// `NotFound` for an unknown queue, otherwise whatever the queue manager returns.
    pub fn update_queue(&self, device_id: u32, queue: QueueId, update: QueueUpdate) -> DqmResult<()> {
        let mut state = self.lock();
        let pid = self.pid;
        let pdd = state
            .device_mut(device_id)
            .ok_or_else(|| DqmError::NotFound(format!("{pid} has no data on device {device_id}")))?;
        if !pdd.queues.contains(&queue) {
            return Err(DqmError::NotFound(format!("{queue} of {pid}")));
        }
        pdd.device.dqm().update_queue(pdd.qpd, queue, update)
    }

    /// Evicts the queues of the process on every device. If one device fails, the
    /// devices already evicted are restored.
    ///
    /// # Errors
    /// The first eviction failure.
    pub fn evict_queues(&self) -> DqmResult<()> {
        let state = self.lock();
        for (n, pdd) in state.devices.iter().enumerate() {
            if let Err(e) = pdd.device.dqm().evict_process_queues(pdd.qpd) {
                error!("{}: eviction on device {} failed: {e}", self.pid, pdd.device.id());
                for done in &state.devices[..n] {
                    if let Err(undo) = done.device.dqm().restore_process_queues(done.qpd) {
                        warn!("{}: restore on device {} failed: {undo}", self.pid, done.device.id());
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Restores the queues of the process on every device.
    ///
    /// # Errors
    /// The first restore failure; every device is attempted.
    pub fn restore_queues(&self) -> DqmResult<()> {
        let state = self.lock();
        let mut first_err = None;
        for pdd in &state.devices {
            if let Err(e) = pdd.device.dqm().restore_process_queues(pdd.qpd) {
                error!("{}: restore on device {} failed: {e}", self.pid, pdd.device.id());
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

/// All processes known to the driver, keyed by OS identity.
#[derive(Debug)]
pub struct ProcessRegistry {
    table: ProcessTable<ProcessId, Arc<KfdProcess>>,
    pasids: Mutex<IdBitmap>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DqmConfig::default().pasid_limit)
    }
}

impl ProcessRegistry {
    /// A registry handing out PASIDs `1..pasid_limit`.
    #[must_use]
    pub fn new(pasid_limit: u32) -> Self {
        let mut pasids = IdBitmap::new(pasid_limit);
        pasids.set(0);
        Self {
            table: ProcessTable::new(),
            pasids: Mutex::new(pasids),
        }
    }

    /// A registry sized by `config.pasid_limit`.
    ///
    /// # Errors
    /// `InvalidArgument` if the configuration does not validate.
    pub fn from_config(config: &DqmConfig) -> DqmResult<Self> {
        config.validate()?;
        Ok(Self::new(config.pasid_limit))
    }

    /// Returns the process for `pid`, creating it with a fresh PASID on first call.
    ///
    /// # Errors
    /// `ResourceExhausted(Pasid)` when every PASID is taken.
    pub fn create_process(&self, pid: ProcessId) -> DqmResult<Arc<KfdProcess>> {
        let (process, created) = self.table.get_or_try_insert_with(pid, || {
            let pasid = self
                .pasids
                .lock()
                .allocate()
                .ok_or(DqmError::ResourceExhausted(Resource::Pasid))?;
            Ok::<_, DqmError>(Arc::new(KfdProcess {
                pid,
                pasid,
                state: Mutex::new(ProcessState::default()),
            }))
        })?;
        if created {
            info!("created process for {pid} with PASID {}", process.pasid);
        } else {
            debug!("{pid} already has a process");
        }
        Ok(process)
    }

    #[must_use]
    pub fn find_process(&self, pid: ProcessId) -> Option<Arc<KfdProcess>> {
        self.table.get(&pid)
    }

    #[must_use]
    pub fn lookup_by_pasid(&self, pasid: u32) -> Option<Arc<KfdProcess>> {
        self.table.find(|p| p.pasid == pasid)
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.table.read().len()
    }

    /// Binds `process` to `device`, creating its per-device data on first touch.
    /// Repeated binds return the existing context.
    ///
    /// # Errors
    /// Address-space creation or IOMMU binding failures. A failed IOMMU bind leaves
    /// the per-device data in place, unbound.
    pub fn bind(&self, process: &KfdProcess, device: &Arc<KfdDevice>) -> DqmResult<QpdId> {
        let mut state = process.lock();
        let device_id = device.id();

        if state.device_mut(device_id).is_none() {
            let vm = device.kgd().vm().create_address_space()?;
            let apertures = Apertures::for_gpu(device_id);
            let qpd = device.dqm().create_qpd(process.pasid, vm, apertures);
            state
                .devices
                .push(ProcessDevice::new(device.clone(), qpd, vm, apertures));
        }

        let pid = process.pid;
        let pdd = state
            .device_mut(device_id)
            .ok_or_else(|| DqmError::NotFound(format!("{pid} has no data on device {device_id}")))?;
        if pdd.bound {
            return Ok(pdd.qpd);
        }
        if device.info().needs_iommu {
            device.kgd().iommu().bind_pasid(process.pasid, pid)?;
        }
        pdd.bound = true;
        debug!("bound {pid} (PASID {}) to device {device_id}", process.pasid);
        Ok(pdd.qpd)
    }

    /// Marks the binding of `pasid` to `device` as gone. Queues stay until the process
    /// is released; a pending wavefront reset is carried out.
    ///
    /// # Errors
    /// `NotFound` if no process owns `pasid` or it has no data on the device.
    pub fn unbind(&self, device: &KfdDevice, pasid: u32) -> DqmResult<()> {
        let process = self
            .lookup_by_pasid(pasid)
            .ok_or_else(|| DqmError::NotFound(format!("PASID {pasid}")))?;
        let mut state = process.lock();
        let device_id = device.id();
        let pdd = state
            .device_mut(device_id)
            .ok_or_else(|| DqmError::NotFound(format!("PASID {pasid} on device {device_id}")))?;

        if pdd.reset_wavefronts {
            warn!("resetting wavefronts of PASID {pasid} on device {device_id}");
            device.kgd().iommu().reset_wavefronts(pasid);
            pdd.reset_wavefronts = false;
        }
        pdd.bound = false;
        Ok(())
    }

    /// Interrupt entry: the IOMMU reports that `pasid` lost its binding on `device`.
    ///
    /// # Errors
    /// As for `unbind`.
    pub fn notify_vmid_unbind(&self, device: &KfdDevice, pasid: u32) -> DqmResult<()> {
        debug!("unbind notification for PASID {pasid} on device {}", device.id());
        self.unbind(device, pasid)
    }

    /// Tears the process down on every device and forgets it: terminates its queue
    /// manager contexts, resets wavefronts where needed, drops the IOMMU binding,
    /// flushes the TLB, destroys the address spaces and frees the PASID.
    ///
    /// # Errors
    /// `NotFound` for an unknown process, otherwise the first teardown failure. The
    /// release always completes.
    pub fn release_process(&self, pid: ProcessId) -> DqmResult<()> {
        let process = self
            .table
            .remove(&pid)
            .ok_or_else(|| DqmError::NotFound(pid.to_string()))?;
        let pasid = process.pasid;
        let mut first_err = None;

        let mut state = process.lock();
        for mut pdd in state.devices.drain(..) {
            let device = pdd.device.clone();
            let kgd = device.kgd();

            if let Err(e) = device.dqm().process_termination(pdd.qpd) {
                error!("{pid}: termination on device {} failed: {e}", device.id());
                if e.requires_reset() {
                    pdd.reset_wavefronts = true;
                }
                first_err.get_or_insert(e);
            }
            if pdd.reset_wavefronts {
                warn!("resetting wavefronts of PASID {pasid} on device {}", device.id());
                kgd.iommu().reset_wavefronts(pasid);
            }
            if pdd.bound && device.info().needs_iommu {
                kgd.iommu().unbind_pasid(pasid);
            }
            kgd.flush_tlb(pasid);
            kgd.vm().destroy_address_space(pdd.vm);
        }
        drop(state);

        self.pasids.lock().clear(pasid);
        info!("released {pid} (PASID {pasid})");
        first_err.map_or(Ok(()), Err)
    }
}

static REGISTRY: OnceLock<ProcessRegistry> = OnceLock::new();

/// The driver-wide process registry, sized from the environment on first use.
pub fn registry() -> &'static ProcessRegistry {
    REGISTRY.get_or_init(|| {
        DqmConfig::from_env()
            .and_then(|config| ProcessRegistry::from_config(&config))
            .unwrap_or_else(|e| {
                warn!("process registry falls back to defaults: {e}");
                ProcessRegistry::default()
            })
    })
}
