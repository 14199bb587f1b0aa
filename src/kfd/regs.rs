//! Register offsets (dword indices) and field masks for the GFX8 compute and SDMA blocks
//! touched by queue management.

// ===============================================================================================
// Register Bank Selection
// ===============================================================================================

pub const SRBM_GFX_CNTL: u32 = 0x0391;

pub const SRBM_GFX_CNTL_PIPEID_SHIFT: u32 = 0;
pub const SRBM_GFX_CNTL_MEID_SHIFT: u32 = 2;
pub const SRBM_GFX_CNTL_VMID_SHIFT: u32 = 4;
pub const SRBM_GFX_CNTL_QUEUEID_SHIFT: u32 = 8;

#[must_use]
pub const fn srbm_gfx_cntl(mec: u32, pipe: u32, queue: u32, vmid: u32) -> u32 {
    ((pipe & 0x3) << SRBM_GFX_CNTL_PIPEID_SHIFT)
        | ((mec & 0x3) << SRBM_GFX_CNTL_MEID_SHIFT)
        | ((vmid & 0xF) << SRBM_GFX_CNTL_VMID_SHIFT)
        | ((queue & 0x7) << SRBM_GFX_CNTL_QUEUEID_SHIFT)
}

// ===============================================================================================
// Per-VMID Shader Memory Configuration (banked by VMID)
// ===============================================================================================

pub const SH_MEM_BASES: u32 = 0x2300;
pub const SH_MEM_APE1_BASE: u32 = 0x230A;
pub const SH_MEM_APE1_LIMIT: u32 = 0x230B;
pub const SH_MEM_CONFIG: u32 = 0x230C;

pub const SH_MEM_CONFIG_PTR32: u32 = 1 << 0;
pub const SH_MEM_CONFIG_ADDRESS_MODE_SHIFT: u32 = 0;
pub const SH_MEM_CONFIG_ADDRESS_MODE_MASK: u32 = 0x3;
pub const SH_MEM_CONFIG_ALIGNMENT_MODE_SHIFT: u32 = 2;
pub const SH_MEM_CONFIG_DEFAULT_MTYPE_SHIFT: u32 = 4;
pub const SH_MEM_CONFIG_APE1_MTYPE_SHIFT: u32 = 7;
pub const SH_MEM_CONFIG_PRIVATE_ATC: u32 = 1 << 25;

pub const SH_MEM_ADDRESS_MODE_HSA64: u32 = 1;
pub const SH_MEM_ALIGNMENT_MODE_UNALIGNED: u32 = 3;

// CIK memory types
pub const MTYPE_CACHED: u32 = 0;
pub const MTYPE_NONCACHED: u32 = 3;
// VI memory types
pub const MTYPE_CC: u32 = 2;
pub const MTYPE_UC: u32 = 3;

pub const SH_MEM_BASES_SHARED_BASE_SHIFT: u32 = 16;
pub const SH_MEM_BASES_PRIVATE_BASE_MASK: u32 = 0xFFFF;

// ===============================================================================================
// ATC / IH PASID Mapping
// ===============================================================================================

pub const ATC_VMID_PASID_MAPPING_UPDATE_STATUS: u32 = 0x0338;
pub const ATC_VMID0_PASID_MAPPING: u32 = 0x0339;
pub const ATC_VMID_PASID_MAPPING_VALID: u32 = 1 << 31;
pub const IH_VMID_0_LUT: u32 = 0x0F50;

// ===============================================================================================
// VM Contexts
// ===============================================================================================

pub const VM_CONTEXT0_PAGE_TABLE_BASE_ADDR: u32 = 0x054F;
pub const VM_CONTEXT8_PAGE_TABLE_BASE_ADDR: u32 = 0x050E;

#[must_use]
pub const fn vm_context_page_table_base_addr(vmid: u32) -> u32 {
    if vmid < 8 {
        VM_CONTEXT0_PAGE_TABLE_BASE_ADDR + vmid
    } else {
        VM_CONTEXT8_PAGE_TABLE_BASE_ADDR + vmid - 8
    }
}

// ===============================================================================================
// Compute Pipe Interrupts (banked by MEC/pipe)
// ===============================================================================================

pub const CPC_INT_CNTL: u32 = 0x30B4;
pub const CP_INT_CNTL_RING0_TIME_STAMP_INT_ENABLE: u32 = 1 << 26;

pub const CP_HPD_EOP_BASE_ADDR: u32 = 0x3240;
pub const CP_HPD_EOP_BASE_ADDR_HI: u32 = 0x3241;
pub const CP_HPD_EOP_CONTROL: u32 = 0x3243;

// ===============================================================================================
// Hardware Queue Descriptor (banked by MEC/pipe/queue)
// ===============================================================================================

pub const CP_MQD_BASE_ADDR: u32 = 0x3245;
pub const CP_MQD_BASE_ADDR_HI: u32 = 0x3246;
pub const CP_HQD_ACTIVE: u32 = 0x3247;
pub const CP_HQD_VMID: u32 = 0x3248;
pub const CP_HQD_PERSISTENT_STATE: u32 = 0x3249;
pub const CP_HQD_PIPE_PRIORITY: u32 = 0x324A;
pub const CP_HQD_QUEUE_PRIORITY: u32 = 0x324B;
pub const CP_HQD_QUANTUM: u32 = 0x324C;
pub const CP_HQD_PQ_BASE: u32 = 0x324D;
pub const CP_HQD_PQ_BASE_HI: u32 = 0x324E;
pub const CP_HQD_PQ_RPTR: u32 = 0x324F;
pub const CP_HQD_PQ_RPTR_REPORT_ADDR: u32 = 0x3250;
pub const CP_HQD_PQ_RPTR_REPORT_ADDR_HI: u32 = 0x3251;
pub const CP_HQD_PQ_WPTR_POLL_ADDR: u32 = 0x3252;
pub const CP_HQD_PQ_WPTR_POLL_ADDR_HI: u32 = 0x3253;
pub const CP_HQD_PQ_DOORBELL_CONTROL: u32 = 0x3254;
pub const CP_HQD_PQ_WPTR: u32 = 0x3255;
pub const CP_HQD_PQ_CONTROL: u32 = 0x3256;
pub const CP_HQD_IB_CONTROL: u32 = 0x325A;
pub const CP_HQD_DEQUEUE_REQUEST: u32 = 0x325D;
pub const CP_MQD_CONTROL: u32 = 0x3267;
pub const CP_HQD_EOP_BASE_ADDR: u32 = 0x326A;
pub const CP_HQD_EOP_BASE_ADDR_HI: u32 = 0x326B;
pub const CP_HQD_EOP_CONTROL: u32 = 0x326C;
pub const CP_HQD_EOP_RPTR: u32 = 0x326D;
pub const CP_HQD_EOP_WPTR: u32 = 0x326E;
pub const CP_HQD_CTX_SAVE_BASE_ADDR_LO: u32 = 0x3270;
pub const CP_HQD_CTX_SAVE_BASE_ADDR_HI: u32 = 0x3271;
pub const CP_HQD_CTX_SAVE_CONTROL: u32 = 0x3272;
pub const CP_HQD_CNTL_STACK_OFFSET: u32 = 0x3273;
pub const CP_HQD_CNTL_STACK_SIZE: u32 = 0x3274;
pub const CP_HQD_WG_STATE_OFFSET: u32 = 0x3275;
pub const CP_HQD_CTX_SAVE_SIZE: u32 = 0x3276;
pub const CP_HQD_ERROR: u32 = 0x3278;

/// First and last banked HQD register.
pub const CP_HQD_BANK_FIRST: u32 = CP_HPD_EOP_BASE_ADDR;
pub const CP_HQD_BANK_LAST: u32 = CP_HQD_ERROR;

pub const CP_HQD_ACTIVE_ACTIVE_MASK: u32 = 1 << 0;

pub const CP_HQD_PQ_CONTROL_QUEUE_SIZE_MASK: u32 = 0x3F;
pub const CP_HQD_PQ_CONTROL_RPTR_BLOCK_SIZE_SHIFT: u32 = 8;
pub const CP_HQD_PQ_CONTROL_NO_UPDATE_RPTR: u32 = 1 << 27;
pub const CP_HQD_PQ_CONTROL_UNORD_DISPATCH: u32 = 1 << 28;
pub const CP_HQD_PQ_CONTROL_PRIV_STATE: u32 = 1 << 30;
pub const CP_HQD_PQ_CONTROL_KMD_QUEUE: u32 = 1 << 31;

pub const CP_HQD_PQ_DOORBELL_CONTROL_OFFSET_SHIFT: u32 = 2;
pub const CP_HQD_PQ_DOORBELL_CONTROL_EN: u32 = 1 << 30;

pub const CP_HQD_PERSISTENT_STATE_PRELOAD_REQ: u32 = 1 << 0;
pub const CP_HQD_PERSISTENT_STATE_PRELOAD_SIZE_SHIFT: u32 = 8;
pub const CP_HQD_QUANTUM_EN: u32 = 1 << 0;
pub const CP_HQD_QUANTUM_SCALE_1MS: u32 = 1 << 4;
pub const CP_HQD_QUANTUM_DURATION_SHIFT: u32 = 8;
pub const CP_HQD_CTX_SAVE_CONTROL_ATC: u32 = 1 << 0;
pub const CP_MQD_CONTROL_VMID_MASK: u32 = 0xF;

// ===============================================================================================
// SDMA RLC Queues (engine/queue offset added to each)
// ===============================================================================================

pub const SDMA0_RLC0_RB_CNTL: u32 = 0x3400;
pub const SDMA0_RLC0_RB_BASE: u32 = 0x3401;
pub const SDMA0_RLC0_RB_BASE_HI: u32 = 0x3402;
pub const SDMA0_RLC0_RB_RPTR: u32 = 0x3403;
pub const SDMA0_RLC0_RB_WPTR: u32 = 0x3404;
pub const SDMA0_RLC0_VIRTUAL_ADDR: u32 = 0x3405;
pub const SDMA0_RLC0_RB_RPTR_ADDR_HI: u32 = 0x3408;
pub const SDMA0_RLC0_RB_RPTR_ADDR_LO: u32 = 0x3409;
pub const SDMA0_RLC0_CONTEXT_STATUS: u32 = 0x3411;
pub const SDMA0_RLC0_DOORBELL: u32 = 0x3412;

pub const SDMA0_GFX_CONTEXT_CNTL: u32 = 0x3493;
pub const SDMA1_GFX_CONTEXT_CNTL: u32 = 0x3693;
pub const SDMA_GFX_CONTEXT_CNTL_RESUME_CTX: u32 = 1 << 16;

pub const SDMA1_REGISTER_OFFSET: u32 = 0x200;
pub const SDMA_QUEUE_REGISTER_OFFSET: u32 = 0x80;

pub const SDMA0_RLC0_RB_CNTL_RB_ENABLE: u32 = 1 << 0;
pub const SDMA0_RLC0_RB_CNTL_RB_SIZE_SHIFT: u32 = 1;
pub const SDMA0_RLC0_RB_CNTL_RPTR_WRITEBACK_ENABLE: u32 = 1 << 12;
pub const SDMA0_RLC0_RB_CNTL_RPTR_WRITEBACK_TIMER_SHIFT: u32 = 16;
pub const SDMA0_RLC0_CONTEXT_STATUS_IDLE: u32 = 1 << 2;
pub const SDMA0_RLC0_DOORBELL_ENABLE: u32 = 1 << 28;
pub const SDMA0_RLC0_DOORBELL_OFFSET_SHIFT: u32 = 2;
pub const SDMA0_RLC0_RB_CNTL_RB_VMID_SHIFT: u32 = 24;
pub const SDMA0_RLC0_VIRTUAL_ADDR_ATC: u32 = 1 << 0;
pub const SDMA0_RLC0_VIRTUAL_ADDR_SHARED_BASE_SHIFT: u32 = 26;
pub const SDMA0_RLC0_VIRTUAL_ADDR_SHARED_BASE_MASK: u32 = 0x3C00_0000;

/// Register base of one RLC queue on one SDMA engine.
#[must_use]
pub const fn sdma_rlc_base(engine: u32, queue: u32) -> u32 {
    engine * SDMA1_REGISTER_OFFSET + queue * SDMA_QUEUE_REGISTER_OFFSET
}

/// Splits `reg` into `(rlc_base, offset)` if it addresses an SDMA RLC queue register on
/// one of the two engines' first two queues.
#[must_use]
pub const fn split_sdma_rlc_reg(reg: u32) -> Option<(u32, u32)> {
    if reg < SDMA0_RLC0_RB_CNTL || reg >= SDMA0_RLC0_RB_CNTL + 2 * SDMA1_REGISTER_OFFSET {
        return None;
    }
    let rel = reg - SDMA0_RLC0_RB_CNTL;
    if rel % SDMA1_REGISTER_OFFSET >= 2 * SDMA_QUEUE_REGISTER_OFFSET {
        return None;
    }
    let offset = rel % SDMA_QUEUE_REGISTER_OFFSET;
    if offset > SDMA0_RLC0_DOORBELL - SDMA0_RLC0_RB_CNTL {
        return None;
    }
    Some((rel - offset, offset))
}
