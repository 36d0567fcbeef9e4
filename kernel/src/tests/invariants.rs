//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 混合负载下每个 tick 之后都要成立的性质

use alloc::collections::BTreeMap;

use super::sim::{fifo, rr, Sim, MS};
use crate::cpumask::CpuMask;
use crate::process::{OnRq, Pid, SchedPolicy, TaskState};
use crate::sched::cpupri::CPUPRI_NR_PRIORITIES;
use crate::sched::SchedAttr;

fn check(sim: &Sim) {
    let mut owner: BTreeMap<Pid, usize> = BTreeMap::new();
    for cpu in 0..sim.sched.nr_cpus() {
        sim.sched.with_rq(cpu, |rq| {
            assert_eq!(rq.nr_running, rq.class_nr_running(), "CPU{} nr_running", cpu);

            for &pid in rq.tasks.keys().filter(|&&pid| pid != rq.idle) {
                if let Some(other) = owner.insert(pid, cpu) {
                    panic!("task {} on CPU{} and CPU{}", pid, other, cpu);
                }
            }

            let rt = &rq.rt[0];
            if let Some(&(prio, _, _)) = rt.pushable.first() {
                assert_eq!(rt.highest_prio_next, prio, "CPU{} highest_prio.next", cpu);
            }
            let curr = rq.curr;
            assert!(!rt.pushable.iter().any(|&(_, _, pid)| pid == curr), "CPU{} running task is pushable", cpu);
            for &(_, _, pid) in rt.pushable.iter() {
                let st = rq.task(pid);
                assert_eq!(st.task.on_rq(), OnRq::Queued);
                assert!(st.nr_cpus_allowed > 1);
            }
        });
    }

    let rd = sim.sched.with_rq(0, |rq| rq.rd.clone());
    for pri in 0..CPUPRI_NR_PRIORITIES {
        assert_eq!(rd.cpupri.count(pri) as usize, rd.cpupri.mask(pri).weight(), "cpupri[{}]", pri);
    }
}

#[test]
fn mixed_load_keeps_queues_consistent() {
    let sim = Sim::flat(4);
    let mut sleepers = alloc::vec::Vec::new();
    for i in 0..6 {
        sim.spawn("fair", SchedAttr::normal(i - 3), None).unwrap();
    }
    for prio in [10, 20, 20] {
        sleepers.push(sim.spawn("rr", rr(prio), None).unwrap());
    }
    sleepers.push(sim.spawn("fifo", fifo(40), None).unwrap());
    sim.settle();
    check(&sim);

    for round in 0..200u32 {
        sim.tick();
        check(&sim);

        // 每隔几个 tick 让一个 RT 任务睡下，再叫醒另一个
        if round % 7 == 3 {
            let cpu = (round as usize / 7) % 4;
            if sleepers.contains(&sim.curr(cpu)) {
                sim.on(cpu);
                sim.sched.block_current(TaskState::INTERRUPTIBLE);
                sim.settle();
                check(&sim);
            }
        }
        if round % 5 == 0 {
            sim.on((round as usize / 5) % 4);
            for &pid in &sleepers {
                sim.sched.wake_up_process(pid);
            }
            sim.settle();
            check(&sim);
        }
    }
}

#[test]
fn spinning_task_util_converges() {
    let sim = Sim::flat(1);
    let pid = sim.spawn_on("spin", SchedAttr::normal(0), 0);
    sim.run_ms(1000);
    let util = sim.sched.with_task(pid, |st| st.se.avg.util_avg).unwrap();
    assert!(util > 950 && util <= 1024, "util={}", util);
}

#[test]
fn same_affinity_twice_is_a_no_op() {
    let sim = Sim::flat(4);
    let pid = sim.spawn("t", SchedAttr::normal(0), None).unwrap();
    sim.settle();
    let mask = CpuMask::from_cpus(&[1, 2]);

    sim.sched.set_cpus_allowed_ptr(pid, mask).unwrap();
    sim.settle();
    let cpu = sim.cpu_of(pid);
    assert!(mask.test(cpu));

    sim.sched.set_cpus_allowed_ptr(pid, mask).unwrap();
    sim.settle();
    assert_eq!(sim.cpu_of(pid), cpu);
    assert_eq!(sim.sched.with_task(pid, |st| st.cpus_mask), Some(mask));
}

#[test]
fn attributes_read_back_as_written() {
    let sim = Sim::flat(2);
    let pid = sim.spawn("t", SchedAttr::normal(0), None).unwrap();
    sim.settle();

    for nice in [-20, -7, 0, 13, 19] {
        sim.sched.sched_setattr(pid, &SchedAttr::normal(nice)).unwrap();
        assert_eq!(sim.sched.sched_getattr(pid).unwrap().nice, nice);
    }

    let dl = SchedAttr::deadline(10 * MS, 30 * MS, 100 * MS);
    sim.sched.sched_setattr(pid, &dl).unwrap();
    let got = sim.sched.sched_getattr(pid).unwrap();
    assert_eq!(got.policy, SchedPolicy::Deadline);
    assert_eq!((got.runtime, got.deadline, got.period), (10 * MS, 30 * MS, 100 * MS));
    check(&sim);
}
