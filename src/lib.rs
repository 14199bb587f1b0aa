//! Compute-queue scheduling core of a GPU kernel driver.
//!
//! A [`DeviceQueueManager`] multiplexes the hardware queue slots, VMIDs and SDMA
//! queues of one device across process contexts, either by programming HQD registers
//! directly or by handing runlists to the scheduler firmware. The [`process`] layer
//! binds OS processes to devices and owns their per-device contexts.

pub mod dqm;
pub mod error;
pub mod kfd;
pub mod memory;
pub mod process;
pub mod utils;

pub use dqm::config::{DqmConfig, SchedPolicy};
pub use dqm::queue::{QpdId, QueueFormat, QueueId, QueueProperties, QueueType, QueueUpdate};
pub use dqm::{DeviceQueueManager, DqmStats};
pub use error::{DqmError, DqmResult, Resource};
pub use kfd::device::{AsicFamily, DeviceInfo, KfdDevice};
pub use kfd::kgd::KgdBackend;
pub use process::{KfdProcess, ProcessId, ProcessRegistry, registry};
