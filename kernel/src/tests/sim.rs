//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 确定性调度模拟器

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::cmdline::BootParams;
use crate::config::TICK_NSEC;
use crate::cpumask::CpuMask;
use crate::errno::SchedResult;
use crate::process::{Pid, SchedPolicy};
use crate::sched::hooks::{IpiKind, ManualClock, SchedHooks};
use crate::sched::topology::ArchTopology;
use crate::sched::{SchedAttr, Scheduler};

pub const MS: u64 = 1_000_000;

/// 记录 IPI、可以切换“当前 CPU”的回调
#[derive(Default)]
pub struct SimHooks {
    cpu: AtomicUsize,
    ipis: Mutex<Vec<(usize, IpiKind)>>,
}

impl SchedHooks for SimHooks {
    fn this_cpu_id(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn send_ipi(&self, cpu: usize, kind: IpiKind) {
        self.ipis.lock().push((cpu, kind));
    }
}

pub struct Sim {
    pub sched: Scheduler,
    pub clock: Arc<ManualClock>,
    pub hooks: Arc<SimHooks>,
}

impl Sim {
    pub fn new(topo: ArchTopology) -> Self {
        let clock = Arc::new(ManualClock::new(topo.nr_cpus));
        let hooks = Arc::new(SimHooks::default());
        let sched = Scheduler::with_boot_params(topo, clock.clone(), hooks.clone(), BootParams::new());
        Self { sched, clock, hooks }
    }

    pub fn flat(nr_cpus: usize) -> Self {
        Self::new(ArchTopology::flat(nr_cpus))
    }

    /// 之后的调用都以 `cpu` 为当前 CPU
    pub fn on(&self, cpu: usize) {
        self.hooks.cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn spawn(&self, name: &str, attr: SchedAttr, cpus: Option<CpuMask>) -> SchedResult<Pid> {
        self.sched.spawn(name, attr, cpus)
    }

    pub fn spawn_on(&self, name: &str, attr: SchedAttr, cpu: usize) -> Pid {
        self.on(cpu);
        let pid = self.sched.spawn(name, attr, Some(CpuMask::of(cpu))).expect("spawn");
        self.settle();
        pid
    }

    pub fn schedule(&self, cpu: usize) {
        self.on(cpu);
        self.sched.schedule_on(cpu, false);
    }

    /// 投递所有挂起的 IPI，并让收到重调度请求的 CPU 完成切换
    pub fn settle(&self) {
        let saved = self.hooks.this_cpu_id();
        loop {
            let pending: Vec<(usize, IpiKind)> = core::mem::take(&mut *self.hooks.ipis.lock());
            let mut resched: Vec<usize> = (0..self.sched.nr_cpus()).filter(|&c| self.sched.need_resched(c)).collect();
            if pending.is_empty() && resched.is_empty() {
                break;
            }
            for (cpu, kind) in pending {
                self.on(cpu);
                match kind {
                    IpiKind::Reschedule | IpiKind::NohzKick => self.sched.scheduler_ipi(cpu),
                    IpiKind::RtPush => self.sched.rto_push_irq_work(cpu),
                    IpiKind::CallFunction => {}
                }
                self.sched.run_softirqs(cpu);
                if !resched.contains(&cpu) {
                    resched.push(cpu);
                }
            }
            for cpu in resched {
                self.on(cpu);
                self.sched.preempt_schedule_irq(cpu);
            }
        }
        self.on(saved);
    }

    /// 所有在线 CPU 各走一个 tick
    pub fn tick(&self) {
        self.clock.advance(TICK_NSEC);
        for cpu in self.sched.online_mask().iter() {
            self.on(cpu);
            self.sched.timer_interrupt(cpu, false);
            self.sched.run_softirqs(cpu);
            self.sched.preempt_schedule_irq(cpu);
        }
        self.settle();
    }

    pub fn run_ms(&self, ms: u64) {
        for _ in 0..(ms * MS).div_ceil(TICK_NSEC) {
            self.tick();
        }
    }

    pub fn runtime(&self, pid: Pid) -> u64 {
        self.sched.with_task(pid, |st| st.se.sum_exec_runtime).unwrap_or(0)
    }

    pub fn cpu_of(&self, pid: Pid) -> usize {
        self.sched.with_task(pid, |st| st.cpu()).expect("task exists")
    }

    pub fn curr(&self, cpu: usize) -> Pid {
        self.sched.curr_on(cpu)
    }
}

pub fn fifo(rt_priority: u32) -> SchedAttr {
    SchedAttr::rt(SchedPolicy::Fifo, rt_priority)
}

pub fn rr(rt_priority: u32) -> SchedAttr {
    SchedAttr::rt(SchedPolicy::Rr, rt_priority)
}
