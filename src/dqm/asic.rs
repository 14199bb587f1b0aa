//! Per-generation shader memory and SDMA addressing setup.

use crate::dqm::queue::{Qpd, QueueProperties};
use crate::error::{DqmError, DqmResult};
use crate::kfd::device::AsicFamily;
use crate::kfd::regs;
use crate::process::device::Apertures;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Coherent,
    NonCoherent,
}

/// The chip-specific part of queue management.
pub trait AsicOps: Send + Sync + std::fmt::Debug {
    /// Fills the context's default shader memory configuration and aperture bases.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the apertures cannot be expressed in SH_MEM_BASES.
    fn register_process(&self, qpd: &mut Qpd) -> DqmResult<()>;

    /// Computes the SDMA virtual address base for a queue of `qpd`.
    fn init_sdma_vm(&self, qpd: &Qpd, props: &mut QueueProperties);

    /// Rewrites the memory types of the default and APE1 apertures.
    fn set_cache_memory_policy(&self, qpd: &mut Qpd, default_policy: CachePolicy, alternate_policy: CachePolicy);
}

#[must_use]
pub fn for_family(family: AsicFamily) -> Box<dyn AsicOps> {
    if family.is_vi() {
        Box::new(ViAsic)
    } else {
        Box::new(CikAsic)
    }
}

/// In 64-bit mode only the top nybble of the LDS/scratch/GPUVM apertures is
/// programmable.
const fn top_address_nybble(apertures: &Apertures) -> u32 {
    ((apertures.lds_base >> 60) & 0x0E) as u32
}

fn sh_mem_bases_64bit(top_address_nybble: u32) -> DqmResult<u32> {
    if top_address_nybble & 1 != 0 || top_address_nybble > 0xE || top_address_nybble == 0 {
        return Err(DqmError::InvalidArgument(format!(
            "aperture nybble 0x{top_address_nybble:x} not programmable"
        )));
    }
    let base = top_address_nybble << 12;
    Ok((base & regs::SH_MEM_BASES_PRIVATE_BASE_MASK)
        | ((base & regs::SH_MEM_BASES_PRIVATE_BASE_MASK) << regs::SH_MEM_BASES_SHARED_BASE_SHIFT))
}

const fn sh_mem_config(default_mtype: u32, ape1_mtype: u32) -> u32 {
    (regs::SH_MEM_ALIGNMENT_MODE_UNALIGNED << regs::SH_MEM_CONFIG_ALIGNMENT_MODE_SHIFT)
        | (default_mtype << regs::SH_MEM_CONFIG_DEFAULT_MTYPE_SHIFT)
        | (ape1_mtype << regs::SH_MEM_CONFIG_APE1_MTYPE_SHIFT)
}

// ===============================================================================================
// CIK
// ===============================================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct CikAsic;

impl CikAsic {
    const fn mtype(policy: CachePolicy) -> u32 {
        match policy {
            CachePolicy::Coherent => regs::MTYPE_NONCACHED,
            CachePolicy::NonCoherent => regs::MTYPE_CACHED,
        }
    }
}

impl AsicOps for CikAsic {
    fn register_process(&self, qpd: &mut Qpd) -> DqmResult<()> {
        if qpd.sh_mem_config == 0 {
            qpd.sh_mem_config = sh_mem_config(regs::MTYPE_NONCACHED, regs::MTYPE_NONCACHED);
            qpd.sh_mem_ape1_limit = 0;
            qpd.sh_mem_ape1_base = 0;
        }
        qpd.sh_mem_bases = sh_mem_bases_64bit(top_address_nybble(&qpd.apertures))?;
        Ok(())
    }

    fn init_sdma_vm(&self, qpd: &Qpd, props: &mut QueueProperties) {
        props.sdma_vm_addr = regs::SDMA0_RLC0_VIRTUAL_ADDR_ATC
            | ((top_address_nybble(&qpd.apertures) << regs::SDMA0_RLC0_VIRTUAL_ADDR_SHARED_BASE_SHIFT)
                & regs::SDMA0_RLC0_VIRTUAL_ADDR_SHARED_BASE_MASK);
    }

    fn set_cache_memory_policy(&self, qpd: &mut Qpd, default_policy: CachePolicy, alternate_policy: CachePolicy) {
        qpd.sh_mem_config = sh_mem_config(Self::mtype(default_policy), Self::mtype(alternate_policy));
    }
}

// ===============================================================================================
// VI
// ===============================================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ViAsic;

impl ViAsic {
    const fn mtype(policy: CachePolicy) -> u32 {
        match policy {
            CachePolicy::Coherent => regs::MTYPE_CC,
            CachePolicy::NonCoherent => regs::MTYPE_UC,
        }
    }
}

impl AsicOps for ViAsic {
    fn register_process(&self, qpd: &mut Qpd) -> DqmResult<()> {
        if qpd.sh_mem_config == 0 {
            qpd.sh_mem_config = sh_mem_config(regs::MTYPE_CC, regs::MTYPE_CC);
            qpd.sh_mem_ape1_limit = 0;
            qpd.sh_mem_ape1_base = 0;
        }
        qpd.sh_mem_bases = sh_mem_bases_64bit(top_address_nybble(&qpd.apertures))?;
        qpd.sh_mem_config = (qpd.sh_mem_config & !regs::SH_MEM_CONFIG_ADDRESS_MODE_MASK)
            | (regs::SH_MEM_ADDRESS_MODE_HSA64 << regs::SH_MEM_CONFIG_ADDRESS_MODE_SHIFT);
        Ok(())
    }

    fn init_sdma_vm(&self, qpd: &Qpd, props: &mut QueueProperties) {
        props.sdma_vm_addr = (top_address_nybble(&qpd.apertures)
            << regs::SDMA0_RLC0_VIRTUAL_ADDR_SHARED_BASE_SHIFT)
            & regs::SDMA0_RLC0_VIRTUAL_ADDR_SHARED_BASE_MASK;
    }

    fn set_cache_memory_policy(&self, qpd: &mut Qpd, default_policy: CachePolicy, alternate_policy: CachePolicy) {
        qpd.sh_mem_config = (qpd.sh_mem_config & regs::SH_MEM_CONFIG_ADDRESS_MODE_MASK)
            | sh_mem_config(Self::mtype(default_policy), Self::mtype(alternate_policy));
    }
}
