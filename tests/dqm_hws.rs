//! Queue management through runlists handed to the scheduler firmware.

mod common;

use common::{Rig, compute, config, rig, rig_with, sdma};
use kfd_dqm::dqm::config::SchedPolicy;
use kfd_dqm::dqm::packets::{EngineSel, IT_QUERY_STATUS, IT_RUN_LIST, IT_SET_RESOURCES, IT_UNMAP_QUEUES};
use kfd_dqm::dqm::queue::{QueueProperties, QueueUpdate};
use kfd_dqm::error::{DqmError, Resource};
use kfd_dqm::kfd::device::{DeviceInfo, KfdDevice};
use kfd_dqm::kfd::sim::SimulatedGpu;
use kfd_dqm::process::device::Apertures;

fn hws() -> Rig {
    rig(SchedPolicy::Hws)
}

#[test]
fn start_hands_the_reserved_resources_to_the_firmware() {
    let rig = hws();
    assert_eq!(rig.gpu.sched_resources(), Some((0xFF00, 0xFFFF_FFFF_0000_0000)));
    assert_eq!(rig.gpu.submitted_opcodes(), vec![IT_SET_RESOURCES]);
    assert!(rig.gpu.runlist().is_none());
    assert!(!rig.device.dqm().stats().active_runlist);
}

#[test]
fn runlist_maps_every_active_queue_of_registered_contexts() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(3);

    let (a, _) = dqm.create_queue(qpd, compute(1)).unwrap();
    let (b, _) = dqm.create_queue(qpd, sdma(1)).unwrap();
    dqm.create_queue(qpd, compute(2).with_percent(0)).unwrap();
    assert!(dqm.stats().active_runlist);
    assert_eq!(rig.gpu.active_hqds(), 0, "no direct HQD programming");

    let runlist = rig.gpu.runlist().expect("runlist");
    assert!(!runlist.chained);
    assert_eq!(runlist.processes.len(), 1);
    let process = runlist.process(3).expect("pasid 3");
    assert!(!process.debug);
    assert_eq!(process.page_table_base, 0x30_0000);
    assert_eq!(process.scratch_base, Some(Apertures::for_gpu(0).scratch_base));
    assert_eq!(process.queues.len(), 2);

    let mqd_a = rig.queue(qpd, a, |q| q.mqd_addr());
    let mqd_b = rig.queue(qpd, b, |q| q.mqd_addr());
    assert_eq!(process.queues[0].engine, EngineSel::Compute);
    assert_eq!(process.queues[0].mqd_addr, mqd_a);
    assert_eq!(process.queues[0].doorbell_off, 1);
    assert_eq!(process.queues[1].engine, EngineSel::Sdma0);
    assert_eq!(process.queues[1].mqd_addr, mqd_b);
}

#[test]
fn every_change_preempts_then_resubmits() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);

    dqm.create_queue(qpd, compute(0)).unwrap();
    assert_eq!(
        rig.gpu.submitted_opcodes(),
        vec![IT_SET_RESOURCES, IT_RUN_LIST]
    );

    dqm.create_queue(qpd, compute(1)).unwrap();
    assert_eq!(
        rig.gpu.submitted_opcodes()[2..],
        [IT_UNMAP_QUEUES, IT_QUERY_STATUS, IT_RUN_LIST]
    );

    dqm.create_queue(qpd, sdma(0)).unwrap();
    assert_eq!(
        rig.gpu.submitted_opcodes()[5..],
        [IT_UNMAP_QUEUES, IT_UNMAP_QUEUES, IT_UNMAP_QUEUES, IT_QUERY_STATUS, IT_RUN_LIST],
        "one unmap per SDMA engine before compute"
    );
    assert_eq!(rig.gpu.runlists_submitted(), 3);
    assert_eq!(rig.gpu.runlist().unwrap().queue_count(), 3);
}

#[test]
fn empty_schedule_leaves_no_runlist() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (id, _) = dqm.create_queue(qpd, compute(0)).unwrap();

    let mut update = QueueUpdate::from(&compute(0));
    update.queue_percent = 0;
    dqm.update_queue(qpd, id, update).unwrap();
    assert!(rig.gpu.runlist().is_none());
    assert!(!dqm.stats().active_runlist);

    update.queue_percent = 100;
    dqm.update_queue(qpd, id, update).unwrap();
    assert_eq!(rig.gpu.runlist().unwrap().queue_count(), 1);

    dqm.destroy_queue(qpd, id).unwrap();
    assert!(rig.gpu.runlist().is_none());
}

#[test]
fn old_firmware_gets_the_basic_map_process() {
    let info = DeviceInfo::carrizo();
    let gpu = SimulatedGpu::new(&info);
    gpu.set_firmware_version(400);
    let device = KfdDevice::new(0, info, gpu.backend(), config(SchedPolicy::Hws)).unwrap();
    let rig = Rig { gpu, device };

    let qpd = rig.context(1);
    rig.device.dqm().create_queue(qpd, compute(0)).unwrap();
    let runlist = rig.gpu.runlist().unwrap();
    assert_eq!(runlist.process(1).unwrap().scratch_base, None);
    assert_eq!(runlist.queue_count(), 1);
}

#[test]
fn oversubscribed_runlist_is_chained() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);

    for n in 0..32 {
        dqm.create_queue(qpd, compute(n)).unwrap();
    }
    assert!(!rig.gpu.runlist().unwrap().chained);

    dqm.create_queue(qpd, compute(32)).unwrap();
    let runlist = rig.gpu.runlist().unwrap();
    assert!(runlist.chained);
    assert_eq!(runlist.queue_count(), 33);
}

#[test]
fn oversubscription_is_refused_when_chaining_is_disabled() {
    let rig = rig(SchedPolicy::HwsNoOversubscription);
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    for n in 0..32 {
        dqm.create_queue(qpd, compute(n)).unwrap();
    }
    let submitted = rig.gpu.runlists_submitted();

    let err = dqm.create_queue(qpd, compute(32)).unwrap_err();
    assert!(matches!(err, DqmError::ResourceExhausted(Resource::RunlistCapacity)));
    assert_eq!(dqm.stats().total_queue_count, 32);
    assert_eq!(rig.gpu.runlists_submitted(), submitted + 1, "previous schedule restored");
    let runlist = rig.gpu.runlist().unwrap();
    assert_eq!(runlist.queue_count(), 32);
    assert!(!runlist.chained);
}

#[test]
fn more_contexts_than_vmids_are_refused() {
    let rig = rig_with(
        0,
        DeviceInfo::carrizo().with_vmids(8, 2),
        config(SchedPolicy::Hws),
    );
    let dqm = rig.device.dqm();
    for pasid in 1..=2 {
        let qpd = rig.context(pasid);
        dqm.create_queue(qpd, compute(u64::from(pasid))).unwrap();
    }
    let third = rig.context(3);
    assert!(matches!(
        dqm.create_queue(third, compute(3)),
        Err(DqmError::ResourceExhausted(Resource::Vmid))
    ));
    assert_eq!(rig.gpu.runlist().unwrap().processes.len(), 2);
}

#[test]
fn lost_fence_times_out_and_quarantines_the_descriptor() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (keep, _) = dqm.create_queue(qpd, compute(0)).unwrap();
    let (doomed, _) = dqm.create_queue(qpd, compute(1)).unwrap();

    rig.gpu.set_swallow_fences(true);
    let err = dqm.destroy_queue(qpd, doomed).unwrap_err();
    assert!(matches!(err, DqmError::Timeout { .. }));
    assert!(err.requires_reset());
    let stats = dqm.stats();
    assert_eq!(stats.total_queue_count, 1);
    assert_eq!(stats.quarantined_mqds, 1);

    rig.gpu.set_swallow_fences(false);
    dqm.update_queue(qpd, keep, QueueUpdate::from(&compute(0).with_priority(3)))
        .unwrap();
    assert_eq!(rig.gpu.runlist().unwrap().queue_count(), 1);
}

#[test]
fn stalled_preemption_fails_eviction_until_the_firmware_recovers() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    dqm.create_queue(qpd, compute(0)).unwrap();

    rig.gpu.set_stall_preemption(true);
    let err = dqm.evict_process_queues(qpd).unwrap_err();
    assert!(matches!(err, DqmError::Timeout { .. }));
    assert_eq!(dqm.with_qpd(qpd, |q| q.evicted_count()).unwrap(), 1);
    assert_eq!(dqm.stats().queue_count, 0);

    rig.gpu.set_stall_preemption(false);
    dqm.restore_process_queues(qpd).unwrap();
    assert_eq!(dqm.stats().queue_count, 1);
    assert_eq!(rig.gpu.runlist().unwrap().queue_count(), 1);
}

#[test]
fn rejected_submission_rolls_the_create_back() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);

    rig.gpu.set_fail_hiq(true);
    let err = dqm.create_queue(qpd, compute(0)).unwrap_err();
    assert!(matches!(err, DqmError::Hardware(_)));
    assert_eq!(rig.vmid(qpd), 0);
    assert!(dqm.pool_snapshot().is_free());
    assert_eq!(dqm.stats().total_queue_count, 0);
    assert_eq!(dqm.stats().quarantined_mqds, 0);

    rig.gpu.set_fail_hiq(false);
    dqm.create_queue(qpd, compute(0)).unwrap();
    assert_eq!(rig.gpu.runlist().unwrap().queue_count(), 1);
}

#[test]
fn kernel_debug_queue_pins_the_context() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(4);
    let (user, _) = dqm.create_queue(qpd, compute(0)).unwrap();

    let kq = dqm
        .create_kernel_queue(qpd, QueueProperties::debug(0x3000_0000, 4096))
        .unwrap();
    assert!(dqm.with_qpd(qpd, |q| q.is_debug()).unwrap());
    let runlist = rig.gpu.runlist().unwrap();
    let process = runlist.process(4).unwrap();
    assert!(process.debug);
    assert_eq!(process.queues.len(), 2);
    assert_eq!(process.queues[0].queue_type, 4, "kernel queues lead the process");

    let err = dqm.destroy_queue(qpd, user).unwrap_err();
    assert!(matches!(err, DqmError::Busy(_)));
    assert_eq!(err.errno(), libc::EBUSY);

    dqm.destroy_kernel_queue(qpd, kq).unwrap();
    assert!(!dqm.with_qpd(qpd, |q| q.is_debug()).unwrap());
    dqm.destroy_queue(qpd, user).unwrap();
    assert_eq!(dqm.stats().total_queue_count, 0);
}

#[test]
fn page_directory_moves_reach_the_runlist() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let vm = rig.gpu.new_vm(0x10_0000);
    let qpd = dqm.create_qpd(1, vm, Apertures::for_gpu(0));
    dqm.register_process(qpd).unwrap();
    dqm.create_queue(qpd, compute(0)).unwrap();

    rig.gpu.set_page_directory_base(vm, 0x44_0000);
    dqm.set_page_directory_base(qpd).unwrap();
    assert_eq!(rig.gpu.runlist().unwrap().process(1).unwrap().page_table_base, 0x44_0000);
}

#[test]
fn stop_unmaps_everything() {
    let rig = hws();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    dqm.create_queue(qpd, compute(0)).unwrap();

    dqm.stop().unwrap();
    assert!(rig.gpu.runlist().is_none());
    assert!(!dqm.stats().active_runlist);

    dqm.process_termination(qpd).unwrap();
    dqm.uninitialize().unwrap();
}
