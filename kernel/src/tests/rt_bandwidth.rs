//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

use super::sim::{fifo, Sim, MS};
use crate::config::{RT_GROUP_SCHED, TICK_NSEC};
use crate::sched::group::ROOT_TASK_GROUP;
use crate::sched::SchedAttr;

#[test]
fn group_quota_caps_a_spinning_fifo_task() {
    if !RT_GROUP_SCHED {
        return;
    }
    let sim = Sim::flat(1);
    let g = sim.sched.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
    sim.sched.tg_set_rt_period(g, 1_000_000).unwrap();
    sim.sched.tg_set_rt_runtime(g, 100_000).unwrap();

    let p = sim.spawn_on("spin", fifo(10), 0);
    sim.sched.sched_move_task(p, g).unwrap();
    let filler = sim.spawn_on("filler", SchedAttr::normal(0), 0);
    sim.settle();
    sim.schedule(0);
    assert_eq!(sim.curr(0), p);

    // 第一个周期：用完 100ms 后被节流，普通任务接手
    sim.run_ms(200);
    assert!(sim.sched.with_rq(0, |rq| rq.rt[g].rt_throttled));
    assert_eq!(sim.curr(0), filler);
    let first = sim.runtime(p);
    assert!(first >= 100 * MS && first <= 100 * MS + TICK_NSEC, "first period ran {}", first);

    // 下一个周期开始时恢复
    sim.run_ms(820);
    assert_eq!(sim.curr(0), p);

    sim.run_ms(10_000 - 1020);
    let total = sim.runtime(p);
    assert!(total.abs_diff(1000 * MS) <= 10 * MS, "ran {} over 10s", total);
}

#[test]
fn throttled_group_does_not_block_root_rt_tasks() {
    if !RT_GROUP_SCHED {
        return;
    }
    let sim = Sim::flat(1);
    let g = sim.sched.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
    sim.sched.tg_set_rt_runtime(g, 50_000).unwrap();
    let inner = sim.spawn_on("inner", fifo(80), 0);
    sim.sched.sched_move_task(inner, g).unwrap();
    let outer = sim.spawn_on("outer", fifo(10), 0);
    sim.settle();
    sim.schedule(0);
    assert_eq!(sim.curr(0), inner);

    sim.run_ms(100);
    assert_eq!(sim.curr(0), outer);
    assert!(sim.runtime(outer) > 0);
}
