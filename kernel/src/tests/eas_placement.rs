//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

use super::sim::Sim;
use crate::sched::class::TaskSnapshot;
use crate::sched::topology::ArchTopology;
use crate::sched::SchedAttr;

const LITTLE: [(u64, u64); 2] = [(500_000, 50), (1_000_000, 150)];
const BIG: [(u64, u64); 2] = [(1_000_000, 400), (2_000_000, 1200)];

fn two_plus_two() -> Sim {
    Sim::new(ArchTopology::big_little(2, 438, &LITTLE, 2, 1024, &BIG))
}

/// 以 `util` 的利用率从 `prev_cpu` 醒来的任务
fn waking_task(sim: &Sim, util: u64, prev_cpu: usize) -> TaskSnapshot {
    let pid = sim.spawn_on("t", SchedAttr::normal(0), prev_cpu);
    // rq 上的利用率只来自这个任务
    let mut p = sim.sched.with_rq(prev_cpu, |rq| {
        rq.cfs[0].avg.util_avg = util;
        rq.cfs[0].avg.util_est.enqueued = 0;
        sim.sched.task_snapshot(rq, rq.task(pid))
    });
    p.cpus_mask = sim.sched.possible_mask();
    p.nr_cpus_allowed = 4;
    p.util = util;
    p.util_est = util;
    p
}

#[test]
fn small_task_goes_to_the_little_cluster() {
    let sim = two_plus_two();
    assert!(sim.sched.eas_enabled_any());
    let p = waking_task(&sim, 300, 2);
    let cpu = sim.sched.find_energy_efficient_cpu(&p, 2).unwrap();
    assert!(cpu < 2, "picked CPU{}", cpu);
}

#[test]
fn big_task_does_not_fit_on_little() {
    let sim = two_plus_two();
    assert!(sim.sched.eas_enabled_any());
    let p = waking_task(&sim, 700, 0);
    let cpu = sim.sched.find_energy_efficient_cpu(&p, 0).unwrap();
    assert!(cpu >= 2, "picked CPU{}", cpu);

    let p = waking_task(&sim, 700, 3);
    assert_eq!(sim.sched.find_energy_efficient_cpu(&p, 3), Some(3));
}

#[test]
fn symmetric_system_has_no_energy_model() {
    let sim = Sim::flat(4);
    assert!(!sim.sched.eas_enabled_any());
    let p = waking_task(&sim, 300, 1);
    assert_eq!(sim.sched.find_energy_efficient_cpu(&p, 1), None);
}
