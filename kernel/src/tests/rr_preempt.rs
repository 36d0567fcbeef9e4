//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

use super::sim::{rr, Sim};

#[test]
fn higher_rr_task_preempts_within_a_tick() {
    let sim = Sim::flat(2);
    let a = sim.spawn_on("a", rr(50), 0);
    sim.schedule(0);
    assert_eq!(sim.curr(0), a);
    sim.run_ms(20);

    let b = sim.spawn_on("b", rr(70), 0);
    sim.tick();
    assert_eq!(sim.curr(0), b);

    let a_ran = sim.runtime(a);
    let slice = sim.sched.tunables.rr_timeslice();
    for _ in 0..2 * slice {
        sim.tick();
        assert_eq!(sim.curr(0), b);
    }
    // B 的时间片用完只会排到同优先级队尾，A 始终拿不到 CPU
    assert_eq!(sim.runtime(a), a_ran);
    assert_eq!(sim.cpu_of(a), 0);
}

#[test]
fn equal_rr_tasks_alternate() {
    let sim = Sim::flat(1);
    let a = sim.spawn_on("a", rr(40), 0);
    let b = sim.spawn_on("b", rr(40), 0);
    sim.schedule(0);
    sim.run_ms(1000);
    let (ra, rb) = (sim.runtime(a), sim.runtime(b));
    assert!(ra.abs_diff(rb) <= 100_000_000 + 4_000_000, "a={} b={}", ra, rb);
    assert!(ra > 0 && rb > 0);
}
