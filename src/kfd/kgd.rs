//! Interfaces to the graphics driver underneath the queue manager, and the register
//! programming sequences built on top of them.

use crate::dqm::mqd::compute::ComputeMqd;
use crate::dqm::mqd::sdma::SdmaMqd;
use crate::error::{DqmError, DqmResult};
use crate::kfd::regs;
use crate::memory::GttMemory;
use crate::process::ProcessId;
use crate::utils::{lower_32_bits, upper_32_bits};
use log::{debug, error};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Compute pipes per micro engine.
pub const PIPES_PER_MEC: u32 = 4;

// ===============================================================================================
// Collaborator Contracts
// ===============================================================================================

/// Raw MMIO access to the device.
pub trait RegisterInterface: Send + Sync {
    fn read(&self, reg: u32) -> u32;
    fn write(&self, reg: u32, value: u32);
}

/// Opaque handle of a device-side GPU virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmHandle(pub u64);

/// The GPUVM subsystem owning page tables.
pub trait VmManager: Send + Sync {
    /// # Errors
    /// Returns an error if the address space cannot be created.
    fn create_address_space(&self) -> DqmResult<VmHandle>;
    fn destroy_address_space(&self, vm: VmHandle);
    fn page_directory_base(&self, vm: VmHandle) -> u64;
    fn invalidate_tlb(&self, pasid: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Mec,
    Sdma,
}

/// Versions of the firmware loaded on each engine.
pub trait FirmwareInfo: Send + Sync {
    fn version(&self, engine: Engine) -> u32;
}

/// The privileged interface queue (HIQ) feeding PM4 packets to the scheduler firmware.
pub trait KernelQueue: Send + Sync {
    /// Write one complete packet to the ring and ring the doorbell.
    ///
    /// # Errors
    /// Returns an error if the ring has no room for the packet.
    fn submit(&self, packet: &[u32]) -> DqmResult<()>;
}

/// IOMMU PASID binding and the wavefront-reset side channel.
pub trait Iommu: Send + Sync {
    /// # Errors
    /// Returns an error if the IOMMU refuses the binding.
    fn bind_pasid(&self, pasid: u32, pid: ProcessId) -> DqmResult<()>;
    fn unbind_pasid(&self, pasid: u32);
    fn reset_wavefronts(&self, pasid: u32);
}

/// Reads from the address space of the process owning a queue.
pub trait UserMemory: Send + Sync {
    /// # Errors
    /// Returns an error if the address is not mapped.
    fn read_u32(&self, addr: u64) -> DqmResult<u32>;
}

/// The bundle of collaborators a device is built on.
#[derive(Clone)]
pub struct KgdBackend {
    pub regs: Arc<dyn RegisterInterface>,
    pub vm: Arc<dyn VmManager>,
    pub firmware: Arc<dyn FirmwareInfo>,
    pub hiq: Arc<dyn KernelQueue>,
    pub iommu: Arc<dyn Iommu>,
    pub user_mem: Arc<dyn UserMemory>,
    /// GPU-visible system memory for descriptors, runlists and fences.
    pub gtt: Arc<GttMemory>,
}

impl std::fmt::Debug for KgdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KgdBackend")
            .field("gtt", &self.gtt)
            .finish_non_exhaustive()
    }
}

// ===============================================================================================
// Register Bank Selection
// ===============================================================================================

/// Holds the SRBM selection for one pipe/queue/VMID; deselects on drop.
pub struct SrbmGuard<'a> {
    regs: &'a dyn RegisterInterface,
    _lock: MutexGuard<'a, ()>,
}

impl SrbmGuard<'_> {
    pub fn read(&self, reg: u32) -> u32 {
        self.regs.read(reg)
    }

    pub fn write(&self, reg: u32, value: u32) {
        self.regs.write(reg, value);
    }
}

impl Drop for SrbmGuard<'_> {
    fn drop(&mut self) {
        self.regs.write(regs::SRBM_GFX_CNTL, 0);
    }
}

/// Polls `done` every `quantum` until it returns true or `timeout` elapses.
fn poll_until(timeout: Duration, quantum: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if done() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(quantum);
    }
}

// ===============================================================================================
// Register Programming
// ===============================================================================================

/// GFX8 programming sequences used by queue management.
///
/// All banked accesses go through `SrbmGuard`, which serializes selection across
/// threads.
#[derive(Debug)]
pub struct Kfd2Kgd {
    backend: KgdBackend,
    first_pipe: u32,
    srbm: Mutex<()>,
}

impl Kfd2Kgd {
    #[must_use]
    pub fn new(backend: KgdBackend, first_pipe: u32) -> Self {
        Self {
            backend,
            first_pipe,
            srbm: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn vm(&self) -> &dyn VmManager {
        self.backend.vm.as_ref()
    }

    #[must_use]
    pub fn hiq(&self) -> &dyn KernelQueue {
        self.backend.hiq.as_ref()
    }

    #[must_use]
    pub fn firmware(&self) -> &dyn FirmwareInfo {
        self.backend.firmware.as_ref()
    }

    #[must_use]
    pub fn gtt(&self) -> &Arc<GttMemory> {
        &self.backend.gtt
    }

    #[must_use]
    pub fn iommu(&self) -> &dyn Iommu {
        self.backend.iommu.as_ref()
    }

    fn lock_srbm(&self, mec: u32, pipe: u32, queue: u32, vmid: u32) -> SrbmGuard<'_> {
        let lock = self.srbm.lock();
        let regs = self.backend.regs.as_ref();
        regs.write(regs::SRBM_GFX_CNTL, regs::srbm_gfx_cntl(mec, pipe, queue, vmid));
        SrbmGuard { regs, _lock: lock }
    }

    /// Selects the HQD of a KFD-relative pipe.
    fn acquire_queue(&self, pipe_id: u32, queue_id: u32) -> SrbmGuard<'_> {
        let hw_pipe = pipe_id + self.first_pipe;
        let mec = hw_pipe / PIPES_PER_MEC + 1;
        let pipe = hw_pipe % PIPES_PER_MEC;
        self.lock_srbm(mec, pipe, queue_id, 0)
    }

    pub fn program_sh_mem_settings(
        &self,
        vmid: u32,
        sh_mem_config: u32,
        sh_mem_ape1_base: u32,
        sh_mem_ape1_limit: u32,
        sh_mem_bases: u32,
    ) {
        let srbm = self.lock_srbm(0, 0, 0, vmid);
        srbm.write(regs::SH_MEM_CONFIG, sh_mem_config);
        srbm.write(regs::SH_MEM_APE1_BASE, sh_mem_ape1_base);
        srbm.write(regs::SH_MEM_APE1_LIMIT, sh_mem_ape1_limit);
        srbm.write(regs::SH_MEM_BASES, sh_mem_bases);
    }

    /// Binds (or, with `pasid == 0`, clears) the ATC and IH PASID lookup for `vmid`.
    ///
    /// The update-status bit may be stale from an earlier mapping, so the protocol is
    /// always write, wait, clear.
    ///
    /// # Errors
    /// Returns `Timeout` if the ATC never acknowledges the update.
    pub fn set_pasid_vmid_mapping(&self, pasid: u32, vmid: u32, timeout: Duration) -> DqmResult<()> {
        let regs = self.backend.regs.as_ref();
        let mapping = if pasid == 0 {
            0
        } else {
            pasid | regs::ATC_VMID_PASID_MAPPING_VALID
        };

        regs.write(regs::ATC_VMID0_PASID_MAPPING + vmid, mapping);
        let acked = poll_until(timeout, Duration::from_micros(10), || {
            regs.read(regs::ATC_VMID_PASID_MAPPING_UPDATE_STATUS) & (1 << vmid) != 0
        });
        if !acked {
            error!("ATC PASID mapping update for VMID {vmid} timed out");
            return Err(DqmError::timeout("PASID/VMID mapping", timeout));
        }
        regs.write(regs::ATC_VMID_PASID_MAPPING_UPDATE_STATUS, 1 << vmid);

        regs.write(regs::IH_VMID_0_LUT + vmid, mapping);
        Ok(())
    }

    pub fn set_vm_context_page_table_base(&self, vmid: u32, page_table_base: u64) {
        // Register holds the 4K page frame number
        #[allow(clippy::cast_possible_truncation)]
        self.backend.regs.write(
            regs::vm_context_page_table_base_addr(vmid),
            (page_table_base >> 12) as u32,
        );
    }

    pub fn init_pipeline(&self, pipe_id: u32, hpd_size_log2: u32, hpd_gpu_addr: u64) {
        let srbm = self.acquire_queue(pipe_id, 0);
        srbm.write(regs::CP_HPD_EOP_BASE_ADDR, lower_32_bits(hpd_gpu_addr >> 8));
        srbm.write(regs::CP_HPD_EOP_BASE_ADDR_HI, upper_32_bits(hpd_gpu_addr >> 8));
        srbm.write(regs::CP_HPD_EOP_CONTROL, hpd_size_log2);
    }

    pub fn init_interrupts(&self, pipe_id: u32) {
        let srbm = self.acquire_queue(pipe_id, 0);
        srbm.write(
            regs::CPC_INT_CNTL,
            regs::CP_INT_CNTL_RING0_TIME_STAMP_INT_ENABLE,
        );
    }

    /// Reads the user-mode write pointer once. A fault means no pending writes.
    fn read_user_wptr(&self, wptr_addr: u64) -> Option<u32> {
        if wptr_addr == 0 {
            return None;
        }
        match self.backend.user_mem.read_u32(wptr_addr) {
            Ok(wptr) => Some(wptr),
            Err(e) => {
                debug!("wptr read at 0x{wptr_addr:x} failed ({e}), assuming empty ring");
                None
            }
        }
    }

    /// Loads a compute MQD into the HQD registers of `(pipe_id, queue_id)`.
    pub fn hqd_load(&self, m: &ComputeMqd, pipe_id: u32, queue_id: u32, wptr_addr: u64) {
        let shadow_wptr = self.read_user_wptr(wptr_addr);
        let srbm = self.acquire_queue(pipe_id, queue_id);

        srbm.write(regs::CP_MQD_CONTROL, m.cp_mqd_control);
        srbm.write(regs::CP_MQD_BASE_ADDR, m.cp_mqd_base_addr_lo);
        srbm.write(regs::CP_MQD_BASE_ADDR_HI, m.cp_mqd_base_addr_hi);

        srbm.write(regs::CP_HQD_VMID, m.cp_hqd_vmid);
        srbm.write(regs::CP_HQD_PERSISTENT_STATE, m.cp_hqd_persistent_state);
        srbm.write(regs::CP_HQD_PIPE_PRIORITY, m.cp_hqd_pipe_priority);
        srbm.write(regs::CP_HQD_QUEUE_PRIORITY, m.cp_hqd_queue_priority);
        srbm.write(regs::CP_HQD_QUANTUM, m.cp_hqd_quantum);
        srbm.write(regs::CP_HQD_PQ_BASE, m.cp_hqd_pq_base_lo);
        srbm.write(regs::CP_HQD_PQ_BASE_HI, m.cp_hqd_pq_base_hi);
        srbm.write(regs::CP_HQD_PQ_RPTR_REPORT_ADDR, m.cp_hqd_pq_rptr_report_addr_lo);
        srbm.write(regs::CP_HQD_PQ_RPTR_REPORT_ADDR_HI, m.cp_hqd_pq_rptr_report_addr_hi);
        srbm.write(regs::CP_HQD_PQ_WPTR_POLL_ADDR, m.cp_hqd_pq_wptr_poll_addr_lo);
        srbm.write(regs::CP_HQD_PQ_WPTR_POLL_ADDR_HI, m.cp_hqd_pq_wptr_poll_addr_hi);

        if let Some(wptr) = shadow_wptr {
            srbm.write(regs::CP_HQD_PQ_WPTR, wptr);
        }

        srbm.write(regs::CP_HQD_PQ_CONTROL, m.cp_hqd_pq_control);
        srbm.write(regs::CP_HQD_PQ_DOORBELL_CONTROL, m.cp_hqd_pq_doorbell_control);

        srbm.write(regs::CP_HQD_EOP_BASE_ADDR, m.cp_hqd_eop_base_addr_lo);
        srbm.write(regs::CP_HQD_EOP_BASE_ADDR_HI, m.cp_hqd_eop_base_addr_hi);
        srbm.write(regs::CP_HQD_EOP_CONTROL, m.cp_hqd_eop_control);
        srbm.write(regs::CP_HQD_EOP_RPTR, 0);
        srbm.write(regs::CP_HQD_EOP_WPTR, 0);

        srbm.write(regs::CP_HQD_CTX_SAVE_BASE_ADDR_LO, m.cp_hqd_ctx_save_base_addr_lo);
        srbm.write(regs::CP_HQD_CTX_SAVE_BASE_ADDR_HI, m.cp_hqd_ctx_save_base_addr_hi);
        srbm.write(regs::CP_HQD_CTX_SAVE_CONTROL, m.cp_hqd_ctx_save_control);
        srbm.write(regs::CP_HQD_CNTL_STACK_OFFSET, m.cp_hqd_cntl_stack_offset);
        srbm.write(regs::CP_HQD_CNTL_STACK_SIZE, m.cp_hqd_cntl_stack_size);
        srbm.write(regs::CP_HQD_WG_STATE_OFFSET, m.cp_hqd_wg_state_offset);
        srbm.write(regs::CP_HQD_CTX_SAVE_SIZE, m.cp_hqd_ctx_save_size);

        srbm.write(regs::CP_HQD_IB_CONTROL, m.cp_hqd_ib_control);
        srbm.write(regs::CP_HQD_DEQUEUE_REQUEST, 0);
        srbm.write(regs::CP_HQD_ERROR, 0);

        srbm.write(regs::CP_HQD_ACTIVE, m.cp_hqd_active);
    }

    #[must_use]
    pub fn hqd_is_occupied(&self, queue_address: u64, pipe_id: u32, queue_id: u32) -> bool {
        let srbm = self.acquire_queue(pipe_id, queue_id);
        if srbm.read(regs::CP_HQD_ACTIVE) & regs::CP_HQD_ACTIVE_ACTIVE_MASK == 0 {
            return false;
        }
        let low = lower_32_bits(queue_address >> 8);
        let high = upper_32_bits(queue_address >> 8);
        low == srbm.read(regs::CP_HQD_PQ_BASE) && high == srbm.read(regs::CP_HQD_PQ_BASE_HI)
    }

    /// Requests a dequeue and waits for the HQD to report inactive.
    ///
    /// # Errors
    /// Returns `Timeout` if the queue is still active after `timeout`. The HQD state
    /// is then indeterminate.
    pub fn hqd_destroy(
        &self,
        reset_type: u32,
        timeout: Duration,
        poll: Duration,
        pipe_id: u32,
        queue_id: u32,
    ) -> DqmResult<()> {
        let srbm = self.acquire_queue(pipe_id, queue_id);
        srbm.write(regs::CP_HQD_DEQUEUE_REQUEST, reset_type);

        let drained = poll_until(timeout, poll, || {
            srbm.read(regs::CP_HQD_ACTIVE) & regs::CP_HQD_ACTIVE_ACTIVE_MASK == 0
        });
        if !drained {
            error!(
                "cp queue preemption time out (pipe {pipe_id} queue {queue_id}, {} ms)",
                timeout.as_millis()
            );
            return Err(DqmError::timeout("HQD preemption", timeout));
        }
        Ok(())
    }

    /// Programs an SDMA RLC queue from its MQD.
    ///
    /// # Errors
    /// Returns `Timeout` if the ring does not go idle before reprogramming.
    pub fn hqd_sdma_load(&self, m: &SdmaMqd, timeout: Duration, poll: Duration) -> DqmResult<()> {
        let regs = self.backend.regs.as_ref();
        let base = regs::sdma_rlc_base(m.sdma_engine_id, m.sdma_queue_id);

        regs.write(
            base + regs::SDMA0_RLC0_RB_CNTL,
            m.sdmax_rlcx_rb_cntl & !regs::SDMA0_RLC0_RB_CNTL_RB_ENABLE,
        );
        let idle = poll_until(timeout, poll, || {
            regs.read(base + regs::SDMA0_RLC0_CONTEXT_STATUS) & regs::SDMA0_RLC0_CONTEXT_STATUS_IDLE
                != 0
        });
        if !idle {
            return Err(DqmError::timeout("SDMA ring idle", timeout));
        }

        let ctx_cntl = if m.sdma_engine_id == 0 {
            regs::SDMA0_GFX_CONTEXT_CNTL
        } else {
            regs::SDMA1_GFX_CONTEXT_CNTL
        };
        regs.write(
            ctx_cntl,
            regs.read(ctx_cntl) & !regs::SDMA_GFX_CONTEXT_CNTL_RESUME_CTX,
        );

        regs.write(base + regs::SDMA0_RLC0_DOORBELL, m.sdmax_rlcx_doorbell);
        regs.write(base + regs::SDMA0_RLC0_RB_RPTR, 0);
        regs.write(base + regs::SDMA0_RLC0_RB_WPTR, 0);
        regs.write(base + regs::SDMA0_RLC0_VIRTUAL_ADDR, m.sdmax_rlcx_virtual_addr);
        regs.write(base + regs::SDMA0_RLC0_RB_BASE, m.sdmax_rlcx_rb_base);
        regs.write(base + regs::SDMA0_RLC0_RB_BASE_HI, m.sdmax_rlcx_rb_base_hi);
        regs.write(base + regs::SDMA0_RLC0_RB_RPTR_ADDR_LO, m.sdmax_rlcx_rb_rptr_addr_lo);
        regs.write(base + regs::SDMA0_RLC0_RB_RPTR_ADDR_HI, m.sdmax_rlcx_rb_rptr_addr_hi);
        regs.write(base + regs::SDMA0_RLC0_RB_CNTL, m.sdmax_rlcx_rb_cntl);
        Ok(())
    }

    #[must_use]
    pub fn hqd_sdma_is_occupied(&self, m: &SdmaMqd) -> bool {
        let base = regs::sdma_rlc_base(m.sdma_engine_id, m.sdma_queue_id);
        self.backend.regs.read(base + regs::SDMA0_RLC0_RB_CNTL) & regs::SDMA0_RLC0_RB_CNTL_RB_ENABLE
            != 0
    }

    /// Disables an SDMA RLC queue and waits for its context to idle.
    ///
    /// # Errors
    /// Returns `Timeout` if the context never reports idle.
    pub fn hqd_sdma_destroy(&self, m: &SdmaMqd, timeout: Duration, poll: Duration) -> DqmResult<()> {
        let regs = self.backend.regs.as_ref();
        let base = regs::sdma_rlc_base(m.sdma_engine_id, m.sdma_queue_id);

        let cntl = regs.read(base + regs::SDMA0_RLC0_RB_CNTL);
        regs.write(
            base + regs::SDMA0_RLC0_RB_CNTL,
            cntl & !regs::SDMA0_RLC0_RB_CNTL_RB_ENABLE,
        );

        let idle = poll_until(timeout, poll, || {
            regs.read(base + regs::SDMA0_RLC0_CONTEXT_STATUS) & regs::SDMA0_RLC0_CONTEXT_STATUS_IDLE
                != 0
        });
        if !idle {
            error!(
                "sdma queue preemption time out (engine {} queue {})",
                m.sdma_engine_id, m.sdma_queue_id
            );
            return Err(DqmError::timeout("SDMA preemption", timeout));
        }

        regs.write(base + regs::SDMA0_RLC0_DOORBELL, 0);
        regs.write(base + regs::SDMA0_RLC0_RB_RPTR, 0);
        regs.write(base + regs::SDMA0_RLC0_RB_WPTR, 0);
        Ok(())
    }

    pub fn flush_tlb(&self, pasid: u32) {
        self.backend.vm.invalidate_tlb(pasid);
    }
}
