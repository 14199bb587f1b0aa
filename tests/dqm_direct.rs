//! Queue management with the driver programming HQD registers itself.

mod common;

use common::{Rig, compute, rig, sdma};
use kfd_dqm::dqm::asic::CachePolicy;
use kfd_dqm::dqm::config::SchedPolicy;
use kfd_dqm::dqm::queue::{QueueProperties, QueueUpdate};
use kfd_dqm::dqm::resources::HqdSlot;
use kfd_dqm::error::{DqmError, Resource};
use kfd_dqm::kfd::regs;

fn direct() -> Rig {
    rig(SchedPolicy::NoHws)
}

#[test]
fn start_programs_every_managed_pipe() {
    let rig = direct();
    for pipe in 0..4 {
        assert_ne!(rig.gpu.hqd_register(pipe, 0, regs::CP_HPD_EOP_BASE_ADDR), 0);
    }
    assert!(rig.gpu.submitted_opcodes().is_empty());
}

#[test]
fn slots_are_spread_horizontally_over_pipes() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);

    for n in 0..32u32 {
        let (id, _) = dqm.create_queue(qpd, compute(u64::from(n))).unwrap();
        let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();
        assert_eq!(hqd, HqdSlot { pipe: n % 4, slot: n / 4 }, "queue {n}");
        assert!(rig.gpu.hqd_active(hqd.pipe, hqd.slot));
    }
    assert_eq!(rig.gpu.active_hqds(), 32);

    let err = dqm.create_queue(qpd, compute(99)).unwrap_err();
    assert!(matches!(err, DqmError::ResourceExhausted(Resource::HqdSlot)));
    assert_eq!(dqm.stats().total_queue_count, 32);
}

#[test]
fn freed_slots_are_reused_from_the_cursor() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);

    let (first, _) = dqm.create_queue(qpd, compute(0)).unwrap();
    dqm.create_queue(qpd, compute(1)).unwrap();
    dqm.destroy_queue(qpd, first).unwrap();
    assert!(!rig.gpu.hqd_active(0, 0));

    let (next, _) = dqm.create_queue(qpd, compute(2)).unwrap();
    assert_eq!(rig.queue(qpd, next, |q| q.hqd()), Some(HqdSlot { pipe: 2, slot: 0 }));
}

#[test]
fn first_queue_programs_the_vmid() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(5);

    let (id, vmid) = dqm.create_queue(qpd, compute(0)).unwrap();
    assert_eq!(rig.gpu.pasid_mapping(vmid), Some(5));
    assert_eq!(rig.gpu.page_table_base(vmid), 0x50_0000);
    assert_ne!(rig.gpu.sh_mem_register(vmid, regs::SH_MEM_CONFIG), 0);
    assert_ne!(rig.gpu.sh_mem_register(vmid, regs::SH_MEM_BASES), 0);
    assert_eq!(rig.gpu.tlb_flushes(5), 1);

    let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();
    assert_eq!(rig.gpu.hqd_register(hqd.pipe, hqd.slot, regs::CP_HQD_VMID), vmid);
    assert!(dqm.queue_is_occupied(qpd, id).unwrap());

    dqm.destroy_queue(qpd, id).unwrap();
    assert_eq!(rig.gpu.pasid_mapping(vmid), None);
    assert_eq!(rig.gpu.tlb_flushes(5), 2);
}

#[test]
fn user_write_pointer_is_read_once_at_load() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    rig.gpu.write_user_u32(0x7000_0000, 0x40);

    let (id, _) = dqm
        .create_queue(qpd, compute(0).with_pointers(0x7000_1000, 0x7000_0000))
        .unwrap();
    let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();
    assert_eq!(rig.gpu.hqd_register(hqd.pipe, hqd.slot, regs::CP_HQD_PQ_WPTR), 0x40);

    rig.gpu.write_user_u32(0x7000_0000, 0x80);
    assert_eq!(rig.gpu.hqd_register(hqd.pipe, hqd.slot, regs::CP_HQD_PQ_WPTR), 0x40);
}

#[test]
fn unreadable_write_pointer_loads_an_empty_ring() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    rig.gpu.set_fail_user_reads(true);

    let (id, _) = dqm
        .create_queue(qpd, compute(0).with_pointers(0x7000_1000, 0x7000_0000))
        .unwrap();
    let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();
    assert!(rig.gpu.hqd_active(hqd.pipe, hqd.slot));
    assert_eq!(rig.gpu.hqd_register(hqd.pipe, hqd.slot, regs::CP_HQD_PQ_WPTR), 0);
}

#[test]
fn sdma_queues_are_programmed_on_their_engine() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);

    let (a, _) = dqm.create_queue(qpd, sdma(0)).unwrap();
    let (b, _) = dqm.create_queue(qpd, sdma(1)).unwrap();
    let placement = |id| {
        rig.queue(qpd, id, |q| {
            (q.sdma_id(), q.properties().sdma_engine_id, q.properties().sdma_queue_id)
        })
    };
    assert_eq!(placement(a), (Some(0), 0, 0));
    assert_eq!(placement(b), (Some(1), 1, 0));
    assert!(rig.gpu.sdma_enabled(0, 0));
    assert!(rig.gpu.sdma_enabled(1, 0));

    dqm.evict_process_queues(qpd).unwrap();
    assert!(!rig.gpu.sdma_enabled(0, 0));
    dqm.restore_process_queues(qpd).unwrap();
    assert!(rig.gpu.sdma_enabled(0, 0));

    dqm.destroy_queue(qpd, a).unwrap();
    assert!(!rig.gpu.sdma_enabled(0, 0));
}

#[test]
fn busy_sdma_engine_fails_the_create_cleanly() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    rig.gpu.set_stall_sdma(true);

    let err = dqm.create_queue(qpd, sdma(0)).unwrap_err();
    assert!(matches!(err, DqmError::Timeout { .. }));
    assert!(err.requires_reset());
    assert!(dqm.pool_snapshot().is_free());
    assert_eq!(dqm.stats().total_queue_count, 0);
    assert_eq!(rig.vmid(qpd), 0);
}

#[test]
fn eviction_drains_and_restore_reloads_hqds() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (a, _) = dqm.create_queue(qpd, compute(0)).unwrap();
    let (b, _) = dqm.create_queue(qpd, compute(1)).unwrap();
    let slots: Vec<HqdSlot> = [a, b]
        .iter()
        .map(|id| rig.queue(qpd, *id, |q| q.hqd()).unwrap())
        .collect();

    dqm.evict_process_queues(qpd).unwrap();
    for s in &slots {
        assert!(!rig.gpu.hqd_active(s.pipe, s.slot));
        assert_eq!(
            rig.gpu.hqd_register(s.pipe, s.slot, regs::CP_HQD_DEQUEUE_REQUEST),
            1,
            "drain, not reset"
        );
    }
    assert_eq!(rig.queue(qpd, a, |q| q.hqd()), Some(slots[0]));

    dqm.restore_process_queues(qpd).unwrap();
    for s in &slots {
        assert!(rig.gpu.hqd_active(s.pipe, s.slot));
    }
}

#[test]
fn update_toggles_the_hqd() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (id, _) = dqm.create_queue(qpd, compute(0)).unwrap();
    let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();

    let mut update = QueueUpdate::from(&compute(0));
    update.queue_percent = 0;
    dqm.update_queue(qpd, id, update).unwrap();
    assert!(!rig.gpu.hqd_active(hqd.pipe, hqd.slot));
    assert_eq!(dqm.stats().queue_count, 0);

    update.queue_percent = 100;
    update.priority = 15;
    dqm.update_queue(qpd, id, update).unwrap();
    assert!(rig.gpu.hqd_active(hqd.pipe, hqd.slot));
    assert_eq!(rig.gpu.hqd_register(hqd.pipe, hqd.slot, regs::CP_HQD_QUEUE_PRIORITY), 15);
    assert_eq!(dqm.stats().queue_count, 1);

    update.priority = 16;
    assert!(matches!(
        dqm.update_queue(qpd, id, update),
        Err(DqmError::InvalidArgument(_))
    ));
    assert!(rig.gpu.hqd_active(hqd.pipe, hqd.slot));
}

#[test]
fn destroy_timeout_keeps_the_queue_and_its_slot() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (id, _) = dqm.create_queue(qpd, compute(0)).unwrap();
    let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();
    let stats = dqm.stats();

    rig.gpu.set_stall_preemption(true);
    let err = dqm.destroy_queue(qpd, id).unwrap_err();
    assert!(matches!(err, DqmError::Timeout { .. }));
    assert_eq!(err.errno(), libc::ETIME);
    assert_eq!(dqm.stats(), stats);
    assert_eq!(rig.queue(qpd, id, |q| q.hqd()), Some(hqd));
    assert!(dqm.pool_snapshot().hqds[hqd.pipe as usize].test(hqd.slot));

    rig.gpu.set_stall_preemption(false);
    dqm.destroy_queue(qpd, id).unwrap();
    assert!(dqm.pool_snapshot().is_free());
}

#[test]
fn termination_runs_through_timeouts_and_quarantines() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (id, _) = dqm.create_queue(qpd, compute(0)).unwrap();
    dqm.create_queue(qpd, sdma(0)).unwrap();
    let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();

    rig.gpu.set_stall_preemption(true);
    let err = dqm.process_termination(qpd).unwrap_err();
    assert!(matches!(err, DqmError::Timeout { .. }));

    let stats = dqm.stats();
    assert_eq!(stats.total_queue_count, 0);
    assert_eq!(stats.processes_count, 0);
    assert_eq!(stats.quarantined_hqds, 1);
    assert_eq!(stats.quarantined_mqds, 1);
    assert_eq!(dqm.quarantined_hqds(), vec![hqd]);

    let pool = dqm.pool_snapshot();
    assert_eq!(pool.vmids.count_set(), 0);
    assert_eq!(pool.sdma.count_set(), 0);
    assert!(pool.hqds[hqd.pipe as usize].test(hqd.slot));

    rig.gpu.set_stall_preemption(false);
    let other = rig.context(2);
    let (fresh, _) = dqm.create_queue(other, compute(1)).unwrap();
    assert_ne!(rig.queue(other, fresh, |q| q.hqd()), Some(hqd));
}

#[test]
fn cache_policy_reaches_the_shader_memory_registers() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (_, vmid) = dqm.create_queue(qpd, compute(0)).unwrap();

    dqm.set_cache_memory_policy(qpd, CachePolicy::NonCoherent, CachePolicy::Coherent, 0x10_0000, 0x10_0000)
        .unwrap();
    let (config, (base, limit)) = dqm.with_qpd(qpd, |q| (q.sh_mem_config(), q.sh_mem_ape1())).unwrap();
    assert_eq!((base, limit), (0x10, 0x1F));
    assert_eq!(rig.gpu.sh_mem_register(vmid, regs::SH_MEM_CONFIG), config);
    assert_eq!(rig.gpu.sh_mem_register(vmid, regs::SH_MEM_APE1_BASE), 0x10);
    assert_eq!(rig.gpu.sh_mem_register(vmid, regs::SH_MEM_APE1_LIMIT), 0x1F);
}

#[test]
fn page_directory_moves_are_republished() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let vm = rig.gpu.new_vm(0x20_0000);
    let qpd = dqm.create_qpd(2, vm, kfd_dqm::process::device::Apertures::for_gpu(0));
    dqm.register_process(qpd).unwrap();
    let (_, vmid) = dqm.create_queue(qpd, compute(0)).unwrap();
    let flushes = rig.gpu.tlb_flushes(2);

    dqm.set_page_directory_base(qpd).unwrap();
    assert_eq!(rig.gpu.tlb_flushes(2), flushes);

    rig.gpu.set_page_directory_base(vm, 0x90_0000);
    dqm.set_page_directory_base(qpd).unwrap();
    assert_eq!(rig.gpu.page_table_base(vmid), 0x90_0000);
    assert_eq!(dqm.with_qpd(qpd, |q| q.page_table_base()).unwrap(), 0x90_0000);
    assert_eq!(rig.gpu.tlb_flushes(2), flushes + 1);
}

#[test]
fn inactive_queues_take_a_slot_but_stay_unloaded() {
    let rig = direct();
    let dqm = rig.device.dqm();
    let qpd = rig.context(1);
    let (id, _) = dqm
        .create_queue(qpd, QueueProperties::compute(0x1000_0000, 4096).with_percent(0))
        .unwrap();
    let hqd = rig.queue(qpd, id, |q| q.hqd()).unwrap();
    assert!(!rig.gpu.hqd_active(hqd.pipe, hqd.slot));
    assert!(!dqm.queue_is_occupied(qpd, id).unwrap());
    dqm.destroy_queue(qpd, id).unwrap();
}
