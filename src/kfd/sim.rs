//! A software model of the device side of queue management.
//!
//! `SimulatedGpu` implements every collaborator trait in `kgd`: a banked register file
//! that behaves like the HQD, SDMA RLC and ATC blocks, a scheduler firmware that
//! executes the PM4 packets it receives on the HIQ against the GTT arena, GPUVM
//! address spaces, the IOMMU and user memory. Faults can be injected to exercise the
//! timeout paths.

use crate::dqm::packets::{
    EngineSel, IT_MAP_PROCESS, IT_MAP_QUEUES, IT_QUERY_STATUS, IT_RUN_LIST, IT_SET_RESOURCES,
    IT_UNMAP_QUEUES, MAP_PROCESS_DIQ_ENABLE, MAP_PROCESS_PASID_MASK, MAP_QUEUES_DOORBELL_SHIFT,
    MAP_QUEUES_ENGINE_SEL_SHIFT, MAP_QUEUES_QUEUE_TYPE_SHIFT, MapProcessFormat, RUN_LIST_CHAIN,
    RUN_LIST_IB_SIZE_MASK, UNMAP_QUEUES_ENGINE_SEL_SHIFT,
};
use crate::error::{DqmError, DqmResult};
use crate::kfd::device::DeviceInfo;
use crate::kfd::kgd::{
    Engine, FirmwareInfo, Iommu, KernelQueue, KgdBackend, PIPES_PER_MEC, RegisterInterface,
    UserMemory, VmHandle, VmManager,
};
use crate::kfd::regs;
use crate::memory::GttMemory;
use crate::process::ProcessId;
use crate::utils::{make_u64, pm4_opcode, pm4_packet_dwords, pm4_type};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// GPU address of the simulated GTT arena.
pub const SIM_GTT_BASE: u64 = 0x1_0000_0000;
pub const SIM_MEC_FW_VERSION: u32 = 440;
pub const SIM_SDMA_FW_VERSION: u32 = 52;

/// Page directories handed out by `create_address_space` are spaced this far apart.
const SIM_PAGE_DIR_STRIDE: u64 = 0x10_0000;

const SRBM_VMID_MASK: u32 = 0xF << regs::SRBM_GFX_CNTL_VMID_SHIFT;

// ===============================================================================================
// Observable State
// ===============================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedQueue {
    pub engine: EngineSel,
    pub queue_type: u32,
    pub doorbell_off: u32,
    pub mqd_addr: u64,
    pub wptr_addr: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedProcess {
    pub pasid: u32,
    pub debug: bool,
    pub page_table_base: u64,
    pub sh_mem_bases: u32,
    pub sh_mem_config: u32,
    /// Present in the scratch-capable MAP_PROCESS format only.
    pub scratch_base: Option<u64>,
    pub queues: Vec<MappedQueue>,
}

/// The runlist the firmware is currently executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runlist {
    pub ib_addr: u64,
    pub ib_dwords: usize,
    pub chained: bool,
    pub processes: Vec<MappedProcess>,
}

impl Runlist {
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.processes.iter().map(|p| p.queues.len()).sum()
    }

    #[must_use]
    pub fn process(&self, pasid: u32) -> Option<&MappedProcess> {
        self.processes.iter().find(|p| p.pasid == pasid)
    }
}

// ===============================================================================================
// Internal State
// ===============================================================================================

#[derive(Debug, Default)]
struct RegisterFile {
    srbm: u32,
    banked: HashMap<(u32, u32), u32>,
    global: HashMap<u32, u32>,
    atc_update_status: u32,
}

impl RegisterFile {
    /// Bank a register access lands in under the current selection, if it is banked.
    fn bank(&self, reg: u32) -> Option<u32> {
        match reg {
            regs::SH_MEM_BASES | regs::SH_MEM_APE1_BASE | regs::SH_MEM_APE1_LIMIT | regs::SH_MEM_CONFIG => {
                Some((self.srbm & SRBM_VMID_MASK) >> regs::SRBM_GFX_CNTL_VMID_SHIFT)
            }
            regs::CPC_INT_CNTL | regs::CP_HQD_BANK_FIRST..=regs::CP_HQD_BANK_LAST => {
                Some(self.srbm & !SRBM_VMID_MASK)
            }
            _ => None,
        }
    }

    fn get(&self, reg: u32) -> u32 {
        match self.bank(reg) {
            Some(bank) => self.banked.get(&(bank, reg)),
            None => self.global.get(&reg),
        }
        .copied()
        .unwrap_or(0)
    }

    fn set(&mut self, reg: u32, value: u32) {
        match self.bank(reg) {
            Some(bank) => self.banked.insert((bank, reg), value),
            None => self.global.insert(reg, value),
        };
    }
}

#[derive(Debug, Default)]
struct FirmwareState {
    resources: Option<(u32, u64)>,
    runlist: Option<Runlist>,
    runlists_submitted: u32,
    /// An unmap arrived while preemption was stalled.
    preemption_pending: bool,
    opcodes: Vec<u32>,
}

#[derive(Debug, Default)]
struct VmState {
    next: u64,
    page_dirs: HashMap<u64, u64>,
    tlb_flushes: HashMap<u32, u32>,
}

#[derive(Debug, Default)]
struct IommuState {
    bound: HashMap<u32, ProcessId>,
    wavefront_resets: Vec<u32>,
}

#[derive(Debug, Default)]
struct Faults {
    stall_preemption: AtomicBool,
    stall_sdma: AtomicBool,
    swallow_fences: AtomicBool,
    fail_user_reads: AtomicBool,
    fail_hiq: AtomicBool,
}

// ===============================================================================================
// Simulated GPU
// ===============================================================================================

#[derive(Debug)]
pub struct SimulatedGpu {
    info: DeviceInfo,
    gtt: Arc<GttMemory>,
    regs: Mutex<RegisterFile>,
    firmware: Mutex<FirmwareState>,
    vms: Mutex<VmState>,
    iommu: Mutex<IommuState>,
    user_mem: Mutex<HashMap<u64, u32>>,
    faults: Faults,
    mec_fw_version: AtomicU32,
}

impl SimulatedGpu {
    #[must_use]
    pub fn new(info: &DeviceInfo) -> Arc<Self> {
        Arc::new(Self {
            info: info.clone(),
            gtt: Arc::new(GttMemory::new(SIM_GTT_BASE, info.gtt_size)),
            regs: Mutex::new(RegisterFile::default()),
            firmware: Mutex::new(FirmwareState::default()),
            vms: Mutex::new(VmState::default()),
            iommu: Mutex::new(IommuState::default()),
            user_mem: Mutex::new(HashMap::new()),
            faults: Faults::default(),
            mec_fw_version: AtomicU32::new(SIM_MEC_FW_VERSION),
        })
    }

    /// The collaborator bundle a device is built on, all backed by this model.
    #[must_use]
    pub fn backend(self: &Arc<Self>) -> KgdBackend {
        KgdBackend {
            regs: self.clone(),
            vm: self.clone(),
            firmware: self.clone(),
            hiq: self.clone(),
            iommu: self.clone(),
            user_mem: self.clone(),
            gtt: self.gtt.clone(),
        }
    }

    #[must_use]
    pub fn gtt(&self) -> &Arc<GttMemory> {
        &self.gtt
    }

    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    // ===========================================================================================
    // Fault Injection
    // ===========================================================================================

    /// HQD dequeue requests and UNMAP_QUEUES are ignored while set. Clearing it
    /// completes any pending unmap.
    pub fn set_stall_preemption(&self, stall: bool) {
        self.faults.stall_preemption.store(stall, Ordering::SeqCst);
        if !stall {
            self.firmware.lock().preemption_pending = false;
        }
    }

    /// SDMA contexts never report idle while set.
    pub fn set_stall_sdma(&self, stall: bool) {
        self.faults.stall_sdma.store(stall, Ordering::SeqCst);
    }

    /// QUERY_STATUS never writes its fence while set.
    pub fn set_swallow_fences(&self, swallow: bool) {
        self.faults.swallow_fences.store(swallow, Ordering::SeqCst);
    }

    pub fn set_fail_user_reads(&self, fail: bool) {
        self.faults.fail_user_reads.store(fail, Ordering::SeqCst);
    }

    /// The HIQ rejects every packet while set.
    pub fn set_fail_hiq(&self, fail: bool) {
        self.faults.fail_hiq.store(fail, Ordering::SeqCst);
    }

    pub fn set_firmware_version(&self, version: u32) {
        self.mec_fw_version.store(version, Ordering::SeqCst);
    }

    // ===========================================================================================
    // Memory and VMs
    // ===========================================================================================

    pub fn write_user_u32(&self, addr: u64, value: u32) {
        self.user_mem.lock().insert(addr, value);
    }

    /// Creates an address space with a chosen page directory base.
    pub fn new_vm(&self, page_directory_base: u64) -> VmHandle {
        let mut vms = self.vms.lock();
        vms.next += 1;
        let handle = vms.next;
        vms.page_dirs.insert(handle, page_directory_base);
        VmHandle(handle)
    }

    /// Moves the page directory of `vm`, as a page-table rebuild would.
    pub fn set_page_directory_base(&self, vm: VmHandle, base: u64) {
        self.vms.lock().page_dirs.insert(vm.0, base);
    }

    #[must_use]
    pub fn live_vms(&self) -> usize {
        self.vms.lock().page_dirs.len()
    }

    #[must_use]
    pub fn tlb_flushes(&self, pasid: u32) -> u32 {
        self.vms.lock().tlb_flushes.get(&pasid).copied().unwrap_or(0)
    }

    // ===========================================================================================
    // Register Inspection
    // ===========================================================================================

    /// Reads a register outside any bank.
    #[must_use]
    pub fn register(&self, reg: u32) -> u32 {
        self.regs.lock().global.get(&reg).copied().unwrap_or(0)
    }

    /// Reads an HQD register of a pipe relative to the first managed pipe.
    #[must_use]
    pub fn hqd_register(&self, pipe: u32, queue: u32, reg: u32) -> u32 {
        let hw_pipe = pipe + self.info.first_pipe;
        let bank = regs::srbm_gfx_cntl(hw_pipe / PIPES_PER_MEC + 1, hw_pipe % PIPES_PER_MEC, queue, 0);
        self.regs
            .lock()
            .banked
            .get(&(bank, reg))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn hqd_active(&self, pipe: u32, queue: u32) -> bool {
        self.hqd_register(pipe, queue, regs::CP_HQD_ACTIVE) & regs::CP_HQD_ACTIVE_ACTIVE_MASK != 0
    }

    /// Number of HQDs currently running a queue.
    #[must_use]
    pub fn active_hqds(&self) -> usize {
        self.regs
            .lock()
            .banked
            .iter()
            .filter(|((_, reg), value)| *reg == regs::CP_HQD_ACTIVE && **value & regs::CP_HQD_ACTIVE_ACTIVE_MASK != 0)
            .count()
    }

    #[must_use]
    pub fn sh_mem_register(&self, vmid: u32, reg: u32) -> u32 {
        self.regs
            .lock()
            .banked
            .get(&(vmid, reg))
            .copied()
            .unwrap_or(0)
    }

    /// The PASID `vmid` is mapped to in the ATC, if any.
    #[must_use]
    pub fn pasid_mapping(&self, vmid: u32) -> Option<u32> {
        let mapping = self.register(regs::ATC_VMID0_PASID_MAPPING + vmid);
        (mapping & regs::ATC_VMID_PASID_MAPPING_VALID != 0).then_some(mapping & 0xFFFF)
    }

    #[must_use]
    pub fn page_table_base(&self, vmid: u32) -> u64 {
        u64::from(self.register(regs::vm_context_page_table_base_addr(vmid))) << 12
    }

    #[must_use]
    pub fn sdma_enabled(&self, engine: u32, queue: u32) -> bool {
        let base = regs::sdma_rlc_base(engine, queue);
        self.register(base + regs::SDMA0_RLC0_RB_CNTL) & regs::SDMA0_RLC0_RB_CNTL_RB_ENABLE != 0
    }

    // ===========================================================================================
    // Firmware Inspection
    // ===========================================================================================

    #[must_use]
    pub fn runlist(&self) -> Option<Runlist> {
        self.firmware.lock().runlist.clone()
    }

    #[must_use]
    pub fn runlists_submitted(&self) -> u32 {
        self.firmware.lock().runlists_submitted
    }

    /// `(vmid_mask, queue_mask)` of the last SET_RESOURCES.
    #[must_use]
    pub fn sched_resources(&self) -> Option<(u32, u64)> {
        self.firmware.lock().resources
    }

    /// Opcodes of every packet accepted on the HIQ, in order.
    #[must_use]
    pub fn submitted_opcodes(&self) -> Vec<u32> {
        self.firmware.lock().opcodes.clone()
    }

    // ===========================================================================================
    // IOMMU Inspection
    // ===========================================================================================

    #[must_use]
    pub fn is_bound(&self, pasid: u32) -> bool {
        self.iommu.lock().bound.contains_key(&pasid)
    }

    #[must_use]
    pub fn wavefront_resets(&self) -> Vec<u32> {
        self.iommu.lock().wavefront_resets.clone()
    }

    // ===========================================================================================
    // Packet Execution
    // ===========================================================================================

    fn parse_runlist(&self, ib_addr: u64, ib_dwords: usize) -> DqmResult<Runlist> {
        let ib = self.gtt.read_dwords(ib_addr, ib_dwords)?;
        let mut runlist = Runlist {
            ib_addr,
            ib_dwords,
            chained: false,
            processes: Vec::new(),
        };

        let mut pos = 0;
        while pos < ib.len() {
            let header = ib[pos];
            let len = pm4_packet_dwords(header);
            let Some(p) = ib.get(pos..pos + len) else {
                return Err(DqmError::Hardware(format!("truncated packet at IB dword {pos}")));
            };
            match pm4_opcode(header) {
                IT_MAP_PROCESS => runlist.processes.push(MappedProcess {
                    pasid: p[1] & MAP_PROCESS_PASID_MASK,
                    debug: p[1] & MAP_PROCESS_DIQ_ENABLE != 0,
                    page_table_base: u64::from(p[2]) << 12,
                    sh_mem_bases: p[3],
                    sh_mem_config: p[6],
                    scratch_base: (len == MapProcessFormat::Scratch.dwords())
                        .then(|| make_u64(p[10], p[11])),
                    queues: Vec::new(),
                }),
                IT_MAP_QUEUES => {
                    let engine = EngineSel::from_raw((p[1] >> MAP_QUEUES_ENGINE_SEL_SHIFT) & 0x7)
                        .ok_or_else(|| DqmError::Hardware("bad MAP_QUEUES engine".into()))?;
                    let process = runlist
                        .processes
                        .last_mut()
                        .ok_or_else(|| DqmError::Hardware("MAP_QUEUES before MAP_PROCESS".into()))?;
                    process.queues.push(MappedQueue {
                        engine,
                        queue_type: (p[1] >> MAP_QUEUES_QUEUE_TYPE_SHIFT) & 0x7,
                        doorbell_off: p[2] >> MAP_QUEUES_DOORBELL_SHIFT,
                        mqd_addr: make_u64(p[3], p[4]),
                        wptr_addr: make_u64(p[5], p[6]),
                    });
                }
                IT_RUN_LIST => runlist.chained = p[3] & RUN_LIST_CHAIN != 0,
                other => {
                    return Err(DqmError::Hardware(format!(
                        "unexpected opcode 0x{other:x} in runlist IB"
                    )));
                }
            }
            pos += len;
        }
        Ok(runlist)
    }

    fn execute(&self, packet: &[u32]) -> DqmResult<()> {
        let opcode = pm4_opcode(packet[0]);
        match opcode {
            IT_SET_RESOURCES => {
                self.firmware.lock().resources = Some((packet[1], make_u64(packet[2], packet[3])));
            }
            IT_RUN_LIST => {
                let ib_addr = make_u64(packet[1], packet[2]);
                let ib_dwords = (packet[3] & RUN_LIST_IB_SIZE_MASK) as usize;
                let runlist = self.parse_runlist(ib_addr, ib_dwords)?;
                debug!(
                    "sim: runlist of {} processes, {} queues",
                    runlist.processes.len(),
                    runlist.queue_count()
                );
                let mut fw = self.firmware.lock();
                fw.runlist = Some(runlist);
                fw.runlists_submitted += 1;
            }
            IT_UNMAP_QUEUES => {
                let engine = EngineSel::from_raw((packet[1] >> UNMAP_QUEUES_ENGINE_SEL_SHIFT) & 0x7);
                let mut fw = self.firmware.lock();
                if self.faults.stall_preemption.load(Ordering::SeqCst) {
                    fw.preemption_pending = true;
                } else if engine == Some(EngineSel::Compute) {
                    fw.runlist = None;
                } else if let (Some(engine), Some(runlist)) = (engine, fw.runlist.as_mut()) {
                    for process in &mut runlist.processes {
                        process.queues.retain(|q| q.engine != engine);
                    }
                }
            }
            IT_QUERY_STATUS => {
                let pending = self.firmware.lock().preemption_pending;
                if !pending && !self.faults.swallow_fences.load(Ordering::SeqCst) {
                    self.gtt.write_u32(make_u64(packet[3], packet[4]), packet[5])?;
                }
            }
            other => {
                return Err(DqmError::Hardware(format!("unknown PM4 opcode 0x{other:x}")));
            }
        }
        self.firmware.lock().opcodes.push(opcode);
        Ok(())
    }
}

// ===============================================================================================
// Collaborator Implementations
// ===============================================================================================

impl RegisterInterface for SimulatedGpu {
    fn read(&self, reg: u32) -> u32 {
        let file = self.regs.lock();
        if reg == regs::ATC_VMID_PASID_MAPPING_UPDATE_STATUS {
            return file.atc_update_status;
        }
        if let Some((base, offset)) = regs::split_sdma_rlc_reg(reg) {
            if offset == regs::SDMA0_RLC0_CONTEXT_STATUS - regs::SDMA0_RLC0_RB_CNTL {
                let cntl = file
                    .global
                    .get(&(base + regs::SDMA0_RLC0_RB_CNTL))
                    .copied()
                    .unwrap_or(0);
                let busy = cntl & regs::SDMA0_RLC0_RB_CNTL_RB_ENABLE != 0
                    || self.faults.stall_sdma.load(Ordering::SeqCst);
                return if busy { 0 } else { regs::SDMA0_RLC0_CONTEXT_STATUS_IDLE };
            }
        }
        file.get(reg)
    }

    fn write(&self, reg: u32, value: u32) {
        trace!("sim: write 0x{reg:04x} = 0x{value:08x}");
        let mut file = self.regs.lock();
        match reg {
            regs::SRBM_GFX_CNTL => file.srbm = value,
            regs::ATC_VMID_PASID_MAPPING_UPDATE_STATUS => file.atc_update_status &= !value,
            r if (regs::ATC_VMID0_PASID_MAPPING..regs::ATC_VMID0_PASID_MAPPING + 16).contains(&r) => {
                file.global.insert(r, value);
                file.atc_update_status |= 1 << (r - regs::ATC_VMID0_PASID_MAPPING);
            }
            regs::CP_HQD_DEQUEUE_REQUEST => {
                file.set(reg, value);
                if value != 0 && !self.faults.stall_preemption.load(Ordering::SeqCst) {
                    file.set(regs::CP_HQD_ACTIVE, 0);
                }
            }
            _ => file.set(reg, value),
        }
    }
}

impl VmManager for SimulatedGpu {
    fn create_address_space(&self) -> DqmResult<VmHandle> {
        let mut vms = self.vms.lock();
        vms.next += 1;
        let handle = vms.next;
        vms.page_dirs.insert(handle, handle * SIM_PAGE_DIR_STRIDE);
        Ok(VmHandle(handle))
    }

    fn destroy_address_space(&self, vm: VmHandle) {
        self.vms.lock().page_dirs.remove(&vm.0);
    }

    fn page_directory_base(&self, vm: VmHandle) -> u64 {
        self.vms.lock().page_dirs.get(&vm.0).copied().unwrap_or(0)
    }

    fn invalidate_tlb(&self, pasid: u32) {
        *self.vms.lock().tlb_flushes.entry(pasid).or_default() += 1;
    }
}

impl FirmwareInfo for SimulatedGpu {
    fn version(&self, engine: Engine) -> u32 {
        match engine {
            Engine::Mec => self.mec_fw_version.load(Ordering::SeqCst),
            Engine::Sdma => SIM_SDMA_FW_VERSION,
        }
    }
}

impl KernelQueue for SimulatedGpu {
    fn submit(&self, packet: &[u32]) -> DqmResult<()> {
        if self.faults.fail_hiq.load(Ordering::SeqCst) {
            return Err(DqmError::Hardware("HIQ ring full".into()));
        }
        let Some(&header) = packet.first() else {
            return Err(DqmError::Hardware("empty HIQ packet".into()));
        };
        if pm4_type(header) != 3 || pm4_packet_dwords(header) != packet.len() {
            return Err(DqmError::Hardware(format!(
                "malformed PM4 header 0x{header:08x} for {} dwords",
                packet.len()
            )));
        }
        self.execute(packet)
    }
}

impl Iommu for SimulatedGpu {
    fn bind_pasid(&self, pasid: u32, pid: ProcessId) -> DqmResult<()> {
        self.iommu.lock().bound.insert(pasid, pid);
        Ok(())
    }

    fn unbind_pasid(&self, pasid: u32) {
        self.iommu.lock().bound.remove(&pasid);
    }

    fn reset_wavefronts(&self, pasid: u32) {
        self.iommu.lock().wavefront_resets.push(pasid);
    }
}

impl UserMemory for SimulatedGpu {
    fn read_u32(&self, addr: u64) -> DqmResult<u32> {
        if self.faults.fail_user_reads.load(Ordering::SeqCst) {
            return Err(DqmError::Hardware(format!("page fault at 0x{addr:x}")));
        }
        self.user_mem
            .lock()
            .get(&addr)
            .copied()
            .ok_or_else(|| DqmError::Hardware(format!("unmapped user address 0x{addr:x}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dqm::packets::{UnmapAction, UnmapFilter, query_status, unmap_queues};

    #[test]
    fn dequeue_request_clears_active_unless_stalled() {
        let gpu = SimulatedGpu::new(&DeviceInfo::carrizo());
        let bank = regs::srbm_gfx_cntl(2, 0, 3, 0);
        gpu.write(regs::SRBM_GFX_CNTL, bank);
        gpu.write(regs::CP_HQD_ACTIVE, 1);

        gpu.set_stall_preemption(true);
        gpu.write(regs::CP_HQD_DEQUEUE_REQUEST, 2);
        assert_eq!(gpu.read(regs::CP_HQD_ACTIVE), 1);

        gpu.set_stall_preemption(false);
        gpu.write(regs::CP_HQD_DEQUEUE_REQUEST, 2);
        assert_eq!(gpu.read(regs::CP_HQD_ACTIVE), 0);
    }

    #[test]
    fn banks_follow_the_selection() {
        let gpu = SimulatedGpu::new(&DeviceInfo::carrizo());
        gpu.write(regs::SRBM_GFX_CNTL, regs::srbm_gfx_cntl(0, 0, 0, 9));
        gpu.write(regs::SH_MEM_CONFIG, 0x1234);
        gpu.write(regs::SRBM_GFX_CNTL, regs::srbm_gfx_cntl(0, 0, 0, 10));
        assert_eq!(gpu.read(regs::SH_MEM_CONFIG), 0);
        assert_eq!(gpu.sh_mem_register(9, regs::SH_MEM_CONFIG), 0x1234);
    }

    #[test]
    fn atc_status_is_write_one_to_clear() {
        let gpu = SimulatedGpu::new(&DeviceInfo::carrizo());
        gpu.write(regs::ATC_VMID0_PASID_MAPPING + 8, 5 | regs::ATC_VMID_PASID_MAPPING_VALID);
        assert_eq!(gpu.read(regs::ATC_VMID_PASID_MAPPING_UPDATE_STATUS), 1 << 8);
        gpu.write(regs::ATC_VMID_PASID_MAPPING_UPDATE_STATUS, 1 << 8);
        assert_eq!(gpu.read(regs::ATC_VMID_PASID_MAPPING_UPDATE_STATUS), 0);
        assert_eq!(gpu.pasid_mapping(8), Some(5));
    }

    #[test]
    fn fence_is_held_back_by_a_stalled_unmap() {
        let gpu = SimulatedGpu::new(&DeviceInfo::carrizo());
        let fence = SIM_GTT_BASE;
        gpu.set_stall_preemption(true);
        gpu.submit(&unmap_queues(UnmapFilter::DynamicQueues, UnmapAction::Preempt, EngineSel::Compute))
            .unwrap();
        gpu.submit(&query_status(fence, 2)).unwrap();
        assert_eq!(gpu.gtt().read_u32(fence).unwrap(), 0);

        gpu.set_stall_preemption(false);
        gpu.submit(&query_status(fence, 2)).unwrap();
        assert_eq!(gpu.gtt().read_u32(fence).unwrap(), 2);
    }

    #[test]
    fn malformed_packets_are_rejected() {
        let gpu = SimulatedGpu::new(&DeviceInfo::carrizo());
        let mut packet = query_status(SIM_GTT_BASE, 2);
        packet.pop();
        assert!(gpu.submit(&packet).is_err());
        assert!(gpu.submitted_opcodes().is_empty());
    }
}
