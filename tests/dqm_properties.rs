//! Accounting and lifecycle properties that hold under both scheduling modes.

mod common;

use common::{BOTH_MODES, compute, config, rig, rig_with, sdma};
use kfd_dqm::dqm::config::SchedPolicy;
use kfd_dqm::dqm::queue::{QueueProperties, QueueUpdate};
use kfd_dqm::error::DqmError;
use kfd_dqm::kfd::device::DeviceInfo;

#[test]
fn counters_track_total_and_active_queues() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);

        let (a, _) = dqm.create_queue(qpd, compute(0)).unwrap();
        dqm.create_queue(qpd, sdma(1)).unwrap();
        let (idle, _) = dqm.create_queue(qpd, compute(2).with_percent(0)).unwrap();

        let stats = dqm.stats();
        assert_eq!(stats.total_queue_count, 3, "{policy:?}");
        assert_eq!(stats.queue_count, 2, "{policy:?}");
        assert_eq!(stats.sdma_queue_count, 1, "{policy:?}");
        assert_eq!(stats.processes_count, 1, "{policy:?}");

        let mut update = QueueUpdate::from(&compute(2));
        update.queue_percent = 50;
        dqm.update_queue(qpd, idle, update).unwrap();
        assert_eq!(dqm.stats().queue_count, 3, "{policy:?}");

        dqm.destroy_queue(qpd, a).unwrap();
        let stats = dqm.stats();
        assert_eq!((stats.total_queue_count, stats.queue_count), (2, 2), "{policy:?}");
    }
}

#[test]
fn vmid_is_held_exactly_while_queues_exist() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let qpd = rig.context(3);
        assert_eq!(rig.vmid(qpd), 0);

        let (a, vmid) = dqm.create_queue(qpd, compute(0)).unwrap();
        assert!((8..16).contains(&vmid), "{policy:?}: vmid {vmid}");
        let (b, again) = dqm.create_queue(qpd, sdma(0)).unwrap();
        assert_eq!(again, vmid);

        dqm.destroy_queue(qpd, a).unwrap();
        assert_eq!(rig.vmid(qpd), vmid);
        dqm.destroy_queue(qpd, b).unwrap();
        assert_eq!(rig.vmid(qpd), 0, "{policy:?}");
        assert!(dqm.pool_snapshot().vmids.count_set() == 0);
    }
}

#[test]
fn contexts_get_distinct_vmids() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let mut seen = Vec::new();
        for pasid in 1..=8 {
            let qpd = rig.context(pasid);
            let (_, vmid) = dqm.create_queue(qpd, compute(u64::from(pasid))).unwrap();
            assert!(!seen.contains(&vmid));
            seen.push(vmid);
        }
        let ninth = rig.context(9);
        assert!(matches!(
            dqm.create_queue(ninth, compute(9)),
            Err(DqmError::ResourceExhausted(_))
        ));
        assert_eq!(dqm.stats().total_queue_count, 8);
    }
}

#[test]
fn eviction_is_counted_and_restore_is_exact() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);

        let (a, _) = dqm.create_queue(qpd, compute(0)).unwrap();
        let (b, _) = dqm.create_queue(qpd, compute(1).with_percent(0)).unwrap();
        let (c, _) = dqm.create_queue(qpd, sdma(2)).unwrap();
        let active = rig.active_ids(qpd);
        let words: Vec<_> = [a, b, c].iter().map(|id| rig.mqd_words(qpd, *id)).collect();
        let before = dqm.stats();

        dqm.evict_process_queues(qpd).unwrap();
        let after_first = dqm.stats();
        assert!(rig.active_ids(qpd).is_empty());
        assert_eq!(after_first.queue_count, 0);

        dqm.evict_process_queues(qpd).unwrap();
        assert_eq!(dqm.stats(), after_first, "{policy:?}");
        assert_eq!(dqm.with_qpd(qpd, |q| q.evicted_count()).unwrap(), 2);

        dqm.restore_process_queues(qpd).unwrap();
        assert!(rig.active_ids(qpd).is_empty());
        assert_eq!(dqm.with_qpd(qpd, |q| q.evicted_count()).unwrap(), 1);

        dqm.restore_process_queues(qpd).unwrap();
        assert_eq!(rig.active_ids(qpd), active, "{policy:?}");
        assert_eq!(dqm.stats(), before, "{policy:?}");
        for (id, expected) in [a, b, c].iter().zip(&words) {
            assert_eq!(&rig.mqd_words(qpd, *id), expected, "{policy:?}: {id}");
        }
    }
}

#[test]
fn restore_of_a_resident_context_is_a_no_op() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);
        dqm.create_queue(qpd, compute(0)).unwrap();
        let before = dqm.stats();

        dqm.restore_process_queues(qpd).unwrap();
        assert_eq!(dqm.stats(), before);
        assert_eq!(dqm.with_qpd(qpd, |q| q.evicted_count()).unwrap(), 0);
    }
}

#[test]
fn pool_round_trips_bit_for_bit() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let pristine = dqm.pool_snapshot();
        assert!(pristine.is_free());

        let p = rig.context(1);
        let q = rig.context(2);
        let mut created = Vec::new();
        for n in 0..5 {
            created.push((p, dqm.create_queue(p, compute(n)).unwrap().0));
        }
        created.push((p, dqm.create_queue(p, sdma(0)).unwrap().0));
        created.push((q, dqm.create_queue(q, sdma(1)).unwrap().0));
        created.push((q, dqm.create_queue(q, compute(9)).unwrap().0));
        assert_ne!(dqm.pool_snapshot(), pristine);

        for (qpd, id) in created.into_iter().rev() {
            dqm.destroy_queue(qpd, id).unwrap();
        }
        assert_eq!(dqm.pool_snapshot(), pristine, "{policy:?}");

        dqm.create_queue(p, compute(0)).unwrap();
        dqm.create_queue(q, sdma(0)).unwrap();
        dqm.process_termination(p).unwrap();
        dqm.process_termination(q).unwrap();
        assert_eq!(dqm.pool_snapshot(), pristine, "{policy:?}");
        assert_eq!(dqm.stats().total_queue_count, 0);
    }
}

#[test]
fn quota_boundary() {
    let cases = [
        (SchedPolicy::Hws, 128u32),
        (SchedPolicy::NoHws, 8),
    ];
    for (policy, max) in cases {
        let rig = rig_with(
            0,
            DeviceInfo::carrizo(),
            config(policy).with_max_queues_per_device(max),
        );
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);
        for n in 0..max {
            dqm.create_queue(qpd, compute(u64::from(n))).unwrap();
        }
        let err = dqm.create_queue(qpd, compute(999)).unwrap_err();
        assert!(matches!(err, DqmError::QuotaExceeded(n) if n == max), "{policy:?}: {err}");
        assert!(err.is_retriable());
        assert_eq!(dqm.stats().total_queue_count, max);
    }
}

#[test]
fn evicted_context_scenario() {
    for policy in BOTH_MODES {
        let rig = rig_with(
            0,
            DeviceInfo::carrizo(),
            config(policy).with_max_queues_per_device(128),
        );
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);

        let (cq, vmid) = dqm.create_queue(qpd, compute(0)).unwrap();
        let (sq, _) = dqm.create_queue(qpd, sdma(0)).unwrap();
        let stats = dqm.stats();
        assert_eq!((stats.total_queue_count, stats.queue_count), (2, 2));
        let pool = dqm.pool_snapshot();
        assert_eq!(pool.vmids.count_set(), 1);
        assert_eq!(pool.sdma.count_set(), 1);
        let hqds: u32 = pool.hqds.iter().map(|p| p.count_set()).sum();
        assert_eq!(hqds, u32::from(policy == SchedPolicy::NoHws));

        dqm.evict_process_queues(qpd).unwrap();
        assert_eq!(dqm.stats().queue_count, 0);

        let (late, late_vmid) = dqm.create_queue(qpd, compute(1)).unwrap();
        assert_eq!(late_vmid, vmid);
        let stats = dqm.stats();
        assert_eq!((stats.total_queue_count, stats.queue_count), (3, 0), "{policy:?}");
        rig.queue(qpd, late, |q| {
            assert!(q.is_evicted());
            assert!(!q.is_active());
            assert_eq!(q.properties().queue_percent, 100);
        });

        dqm.restore_process_queues(qpd).unwrap();
        let stats = dqm.stats();
        assert_eq!((stats.total_queue_count, stats.queue_count), (3, 3), "{policy:?}");
        assert_eq!(rig.active_ids(qpd), vec![cq, sq, late]);

        let processes = dqm.stats().processes_count;
        dqm.process_termination(qpd).unwrap();
        let stats = dqm.stats();
        assert_eq!(stats.total_queue_count, 0);
        assert_eq!(stats.processes_count, processes - 1);
        assert!(dqm.pool_snapshot().is_free(), "{policy:?}");
        assert!(matches!(dqm.with_qpd(qpd, |_| ()), Err(DqmError::NotFound(_))));
    }
}

#[test]
fn update_of_an_evicted_queue_keeps_it_parked() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);
        let (id, _) = dqm.create_queue(qpd, compute(0).with_percent(0)).unwrap();

        dqm.evict_process_queues(qpd).unwrap();
        dqm.update_queue(qpd, id, QueueUpdate::from(&compute(0))).unwrap();
        rig.queue(qpd, id, |q| assert!(q.is_evicted() && !q.is_active()));
        assert_eq!(dqm.stats().queue_count, 0);

        dqm.restore_process_queues(qpd).unwrap();
        rig.queue(qpd, id, |q| assert!(!q.is_evicted() && q.is_active()));
        assert_eq!(dqm.stats().queue_count, 1, "{policy:?}");
    }
}

#[test]
fn invalid_properties_are_rejected_before_any_allocation() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);
        let bad = [
            compute(0).with_percent(101),
            QueueProperties::compute(0x1000_0000, 3000),
            QueueProperties::compute(0, 4096),
        ];
        for props in bad {
            assert!(matches!(
                dqm.create_queue(qpd, props),
                Err(DqmError::InvalidArgument(_))
            ));
        }
        assert!(dqm.pool_snapshot().is_free());
        assert_eq!(dqm.stats().total_queue_count, 0);
    }
}

#[test]
fn unknown_ids_are_not_found() {
    for policy in BOTH_MODES {
        let rig = rig(policy);
        let dqm = rig.device.dqm();
        let qpd = rig.context(1);
        let (id, _) = dqm.create_queue(qpd, compute(0)).unwrap();
        dqm.destroy_queue(qpd, id).unwrap();

        let err = dqm.destroy_queue(qpd, id).unwrap_err();
        assert!(matches!(err, DqmError::NotFound(_)));
        assert_eq!(err.errno(), libc::ESRCH);
        assert!(dqm.evict_process_queues(kfd_dqm::QpdId(999)).is_err());
    }
}
