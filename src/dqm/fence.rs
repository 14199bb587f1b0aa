use crate::error::{DqmError, DqmResult};
use crate::memory::{Allocation, GttMemory, SubAllocator};
use log::error;
use std::time::{Duration, Instant};

pub const FENCE_INIT: u32 = 1;
pub const FENCE_COMPLETED: u32 = 2;

/// A GTT word the scheduler firmware writes on QUERY_STATUS and the CPU polls.
#[derive(Debug)]
pub struct Fence {
    mem: Allocation,
}

impl Fence {
    /// # Errors
    /// Returns `AllocationFailure` if the arena is exhausted.
    pub fn new(gtt: &GttMemory) -> DqmResult<Self> {
        let mem = gtt.allocate(std::mem::size_of::<u64>())?;
        gtt.write_u32(mem.gpu_addr, FENCE_INIT)?;
        Ok(Self { mem })
    }

    #[must_use]
    pub const fn gpu_addr(&self) -> u64 {
        self.mem.gpu_addr
    }

    /// # Errors
    /// Propagates arena access errors.
    pub fn reset(&self, gtt: &GttMemory) -> DqmResult<()> {
        gtt.write_u32(self.mem.gpu_addr, FENCE_INIT)
    }

    /// Polls until the fence holds `value`, sleeping `poll` between reads.
    ///
    /// # Errors
    /// Returns `Timeout` once `timeout` has elapsed without a match.
    pub fn wait(&self, gtt: &GttMemory, value: u32, timeout: Duration, poll: Duration) -> DqmResult<()> {
        let start = Instant::now();
        loop {
            if gtt.read_u32(self.mem.gpu_addr)? == value {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                error!("qcm fence wait loop timeout expired");
                return Err(DqmError::timeout("runlist fence", timeout));
            }
            std::thread::sleep(poll);
        }
    }

    pub fn free(self, gtt: &GttMemory) {
        gtt.free(self.mem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_sees_a_late_write() {
        let gtt = Arc::new(GttMemory::new(0x1000, 4096));
        let fence = Fence::new(&gtt).unwrap();
        let addr = fence.gpu_addr();

        let writer = {
            let gtt = gtt.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                gtt.write_u32(addr, FENCE_COMPLETED).unwrap();
            })
        };
        fence
            .wait(&gtt, FENCE_COMPLETED, Duration::from_secs(2), Duration::from_millis(1))
            .unwrap();
        writer.join().unwrap();
        fence.free(&gtt);
        assert_eq!(gtt.allocated_bytes(), 0);
    }

    #[test]
    fn wait_times_out() {
        let gtt = GttMemory::new(0x1000, 4096);
        let fence = Fence::new(&gtt).unwrap();
        let err = fence
            .wait(&gtt, FENCE_COMPLETED, Duration::from_millis(10), Duration::from_millis(1))
            .unwrap_err();
        assert!(err.requires_reset());
    }
}
