//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

use super::sim::{fifo, Sim};
use crate::cpumask::CpuMask;
use crate::process::TaskState;
use crate::sched::{SchedAttr, MAX_RT_PRIO};

/// 内核优先级到 sched_setattr 的 rt_priority
fn user_prio(kernel_prio: i32) -> u32 {
    (MAX_RT_PRIO - 1 - kernel_prio) as u32
}

#[test]
fn waking_rt_task_goes_to_a_cpu_running_fair() {
    let sim = Sim::flat(4);

    // T 先在 CPU0 上跑一下再睡下，prev_cpu 就是 0
    let t = sim.spawn_on("t", fifo(user_prio(40)), 0);
    sim.schedule(0);
    assert_eq!(sim.curr(0), t);
    sim.sched.block_current(TaskState::INTERRUPTIBLE);
    assert_ne!(sim.curr(0), t);
    sim.sched.set_cpus_allowed_ptr(t, CpuMask::first_n(4)).unwrap();
    assert_eq!(sim.cpu_of(t), 0);

    let busy = sim.spawn_on("busy", fifo(user_prio(30)), 0);
    sim.schedule(0);
    assert_eq!(sim.curr(0), busy);
    let fair: alloc::vec::Vec<_> = (1..4).map(|c| sim.spawn_on("fair", SchedAttr::normal(0), c)).collect();
    for c in 1..4 {
        sim.schedule(c);
        assert_eq!(sim.curr(c), fair[c - 1]);
    }

    sim.on(0);
    assert!(sim.sched.wake_up_process(t));
    sim.settle();

    let cpu = sim.cpu_of(t);
    assert!((1..4).contains(&cpu), "T landed on CPU{}", cpu);
    assert_eq!(sim.curr(cpu), t);
    assert_eq!(sim.curr(0), busy);
}
