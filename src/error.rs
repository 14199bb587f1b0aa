use std::fmt;
use thiserror::Error;

/// The pooled hardware resource that ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Vmid,
    HqdSlot,
    SdmaQueue,
    Pasid,
    RunlistCapacity,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vmid => "VMID",
            Self::HqdSlot => "HQD slot",
            Self::SdmaQueue => "SDMA queue",
            Self::Pasid => "PASID",
            Self::RunlistCapacity => "runlist capacity",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DqmError {
    #[error("Queue quota exceeded: {0} queues already registered on the device")]
    QuotaExceeded(u32),

    #[error("No free {0} available")]
    ResourceExhausted(Resource),

    #[error("Device busy: {0}")]
    Busy(&'static str),

    #[error("Hardware did not acknowledge {what} within {timeout_ms} ms")]
    Timeout { what: &'static str, timeout_ms: u64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Out of GPU-visible memory (requested {0} bytes)")]
    AllocationFailure(usize),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Hardware collaborator error: {0}")]
    Hardware(String),
}

impl DqmError {
    /// Errors the caller may retry after other queues or processes release resources.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded(_) | Self::ResourceExhausted(_) | Self::AllocationFailure(_)
        )
    }

    /// Errors that leave the hardware queue table in an indeterminate state.
    ///
    /// These must be escalated to a device reset rather than retried.
    #[must_use]
    pub const fn requires_reset(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The errno surfaced to user space for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::QuotaExceeded(_) => libc::EPERM,
            Self::ResourceExhausted(_) => libc::ENOSPC,
            Self::Busy(_) => libc::EBUSY,
            Self::Timeout { .. } => libc::ETIME,
            Self::NotFound(_) => libc::ESRCH,
            Self::AllocationFailure(_) => libc::ENOMEM,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::Hardware(_) => libc::EIO,
        }
    }

    pub(crate) fn timeout(what: &'static str, timeout: std::time::Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self::Timeout {
            what,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

// A convenient alias
pub type DqmResult<T> = Result<T, DqmError>;
