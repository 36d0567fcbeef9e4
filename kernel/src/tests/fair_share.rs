//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

use super::sim::{Sim, MS};
use crate::config::TICK_NSEC;
use crate::sched::SchedAttr;

#[test]
fn two_equal_tasks_share_one_cpu() {
    let sim = Sim::flat(1);
    let a = sim.spawn_on("a", SchedAttr::normal(0), 0);
    let b = sim.spawn_on("b", SchedAttr::normal(0), 0);
    sim.schedule(0);

    sim.run_ms(1000);

    let (ra, rb) = (sim.runtime(a), sim.runtime(b));
    assert!(ra + rb >= 1000 * MS - TICK_NSEC, "only {} ns accounted", ra + rb);
    assert!(ra.abs_diff(rb) <= 4 * MS, "a={} b={}", ra, rb);
}

#[test]
fn nice_shifts_the_split() {
    let sim = Sim::flat(1);
    let heavy = sim.spawn_on("heavy", SchedAttr::normal(-5), 0);
    let light = sim.spawn_on("light", SchedAttr::normal(5), 0);
    sim.schedule(0);

    sim.run_ms(2000);

    // 权重 3121 对 335，约 9:1
    let (rh, rl) = (sim.runtime(heavy), sim.runtime(light));
    assert!(rh > 7 * rl, "heavy={} light={}", rh, rl);
    assert!(rl > 0);
}

#[test]
fn four_tasks_use_both_cpus() {
    let sim = Sim::flat(2);
    let pids: alloc::vec::Vec<_> = (0..4)
        .map(|i| {
            sim.on(0);
            let p = sim.spawn(&alloc::format!("t{}", i), SchedAttr::normal(0), None).unwrap();
            sim.settle();
            p
        })
        .collect();
    sim.schedule(0);
    sim.schedule(1);

    sim.run_ms(500);

    let on0 = pids.iter().filter(|&&p| sim.cpu_of(p) == 0).count();
    assert!((1..=3).contains(&on0), "placement {:?}", pids.iter().map(|&p| sim.cpu_of(p)).collect::<alloc::vec::Vec<_>>());
    assert!(pids.iter().all(|&p| sim.runtime(p) > 0));
}
