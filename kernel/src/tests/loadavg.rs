//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

use super::sim::Sim;
use crate::process::TaskState;
use crate::sched::loadavg::FIXED_1;
use crate::sched::SchedAttr;

#[test]
fn four_busy_cpus_then_idle() {
    let sim = Sim::flat(4);
    for cpu in 0..4 {
        sim.spawn_on("spin", SchedAttr::normal(0), cpu);
    }

    sim.run_ms(300_000);
    let busy = sim.sched.loadavg.avenrun();
    assert!(busy[0] >= 7 * FIXED_1 / 2, "1min={}", busy[0]);
    assert!(busy[0] > busy[1] && busy[1] > busy[2]);

    for cpu in 0..4 {
        sim.on(cpu);
        sim.sched.block_current(TaskState::INTERRUPTIBLE);
    }
    sim.settle();
    assert_eq!(sim.sched.nr_running(), 0);

    // 空闲一分钟后再多一个采样窗口
    sim.run_ms(65_000);
    let idle = sim.sched.loadavg.avenrun();
    assert!(idle[0] <= 3 * FIXED_1 / 2, "1min={}", idle[0]);
    // 15 分钟平均衰减得最慢
    assert!(idle[2] < busy[2]);
    assert!(idle[0] < idle[1]);
}
