#![allow(dead_code)]

use kfd_dqm::dqm::config::{DqmConfig, SchedPolicy};
use kfd_dqm::dqm::queue::{QpdId, Queue, QueueId, QueueProperties};
use kfd_dqm::kfd::device::{DeviceInfo, KfdDevice};
use kfd_dqm::kfd::sim::SimulatedGpu;
use kfd_dqm::process::device::Apertures;
use std::sync::Arc;
use std::time::Duration;

pub const BOTH_MODES: [SchedPolicy; 2] = [SchedPolicy::NoHws, SchedPolicy::Hws];

pub struct Rig {
    pub gpu: Arc<SimulatedGpu>,
    pub device: Arc<KfdDevice>,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short timeouts so the stalled-hardware paths finish quickly.
pub fn config(policy: SchedPolicy) -> DqmConfig {
    DqmConfig::default()
        .with_sched_policy(policy)
        .with_preempt_timeout(Duration::from_millis(50))
        .with_hqd_poll_interval(Duration::from_millis(1))
        .with_fence_poll_interval(Duration::from_millis(1))
}

pub fn rig(policy: SchedPolicy) -> Rig {
    rig_with(0, DeviceInfo::carrizo(), config(policy))
}

pub fn rig_with(id: u32, info: DeviceInfo, config: DqmConfig) -> Rig {
    init_logging();
    let gpu = SimulatedGpu::new(&info);
    let device = KfdDevice::new(id, info, gpu.backend(), config).expect("device");
    Rig { gpu, device }
}

impl Rig {
    /// A registered context with its own address space.
    pub fn context(&self, pasid: u32) -> QpdId {
        let vm = self.gpu.new_vm(0x10_0000 * u64::from(pasid));
        let dqm = self.device.dqm();
        let qpd = dqm.create_qpd(pasid, vm, Apertures::for_gpu(self.device.id()));
        dqm.register_process(qpd).expect("register");
        qpd
    }

    pub fn vmid(&self, qpd: QpdId) -> u32 {
        self.device.dqm().with_qpd(qpd, |q| q.vmid()).expect("context")
    }

    pub fn queue<R>(&self, qpd: QpdId, id: QueueId, f: impl FnOnce(&Queue) -> R) -> R {
        self.device
            .dqm()
            .with_qpd(qpd, |q| q.queue(id).map(f))
            .expect("context")
            .expect("queue")
    }

    pub fn active_ids(&self, qpd: QpdId) -> Vec<QueueId> {
        self.device
            .dqm()
            .with_qpd(qpd, |q| {
                q.queues()
                    .iter()
                    .filter(|q| q.is_active())
                    .map(Queue::id)
                    .collect()
            })
            .expect("context")
    }

    /// The first dwords of a queue's descriptor as the hardware would read them.
    pub fn mqd_words(&self, qpd: QpdId, id: QueueId) -> Vec<u32> {
        let addr = self.queue(qpd, id, Queue::mqd_addr);
        self.gpu.gtt().read_dwords(addr, 16).expect("mqd")
    }
}

pub fn compute(n: u64) -> QueueProperties {
    QueueProperties::compute(0x1000_0000 + n * 0x1_0000, 4096).with_doorbell(n as u32)
}

pub fn sdma(n: u64) -> QueueProperties {
    QueueProperties::sdma(0x2000_0000 + n * 0x1_0000, 4096).with_doorbell(0x100 + n as u32)
}
