//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! idle 调度类与 CPU 空闲循环
//!
//! 每个 CPU 有且只有一个 idle 任务，没有其他可运行任务时被选中。
//! [`Scheduler::do_idle`] 是 idle 任务的一次循环：进入 nohz，选择
//! 轮询、s2idle、延迟受限状态或调速器给出的状态，醒来后处理挂起的
//! 跨核调用，需要时重新调度。

use core::sync::atomic::Ordering;

use super::core::Scheduler;
use super::rq::Rq;
use crate::process::Pid;
use crate::sched_bug_on;

/// 一次 idle 循环走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePath {
    /// 进入时已经需要调度
    Skipped,
    /// 忙等 need_resched
    Poll,
    /// 没有 cpuidle 驱动，走架构默认的 wfi
    Default,
    /// suspend-to-idle，进最深的状态
    S2Idle(usize),
    /// 受延迟上限约束的最深状态
    LatencyLimited(usize),
    /// 调速器选择的状态
    Governor(usize),
    /// CPU 已下线，idle 任务不再运行
    Dead,
}

impl Scheduler {
    pub(crate) fn dequeue_task_idle(&self, rq: &mut Rq, pid: Pid) {
        super::bug(format_args!("CPU{}: bad dequeue of idle task {}", rq.cpu, pid));
    }

    pub(crate) fn put_prev_task_idle(&self, _rq: &mut Rq, _pid: Pid) {}

    pub(crate) fn set_next_task_idle(&self, rq: &mut Rq, _pid: Pid, _first: bool) {
        rq.stats.sched_goidle += 1;
        self.update_idle_core(rq);
    }

    /// 强制轮询由命令行 `nohlt` 打开，`hlt` 关闭
    pub fn cpu_idle_force_poll(&self) -> bool {
        self.boot.force_idle_poll.unwrap_or(false)
    }

    /// 设置 idle 状态的退出延迟上限，`u64::MAX` 表示不限
    pub fn set_idle_latency_limit(&self, ns: u64) {
        self.idle_latency_limit.store(ns, Ordering::Relaxed);
    }

    /// idle 任务的一次循环
    ///
    /// 调用方是 `cpu` 上的 idle 任务。返回时若有任务可运行，已经调度过。
    pub fn do_idle(&self, cpu: usize) -> IdlePath {
        sched_bug_on!(!self.rq_lock(cpu).curr_is_idle(), "CPU{}: do_idle outside the idle task", cpu);

        self.tick_nohz_idle_enter(cpu);

        let path = if self.need_resched(cpu) {
            IdlePath::Skipped
        } else if !self.cpu_online(cpu) {
            self.tick_nohz_idle_exit(cpu);
            self.cpuhp_report_idle_dead(cpu);
            return IdlePath::Dead;
        } else if self.cpu_idle_force_poll() || self.hooks.tick_broadcast_imminent(cpu) {
            self.cpu_idle_poll(cpu);
            IdlePath::Poll
        } else {
            self.cpuidle_idle_call(cpu)
        };

        // 醒来后先处理积压的跨核调用，其中可能有远程唤醒
        self.hooks.smp_call_pending(cpu);
        self.sched_ttwu_pending(cpu);

        if self.need_resched(cpu) {
            self.tick_nohz_idle_exit(cpu);
            self.schedule_idle(cpu);
        }
        path
    }

    fn cpu_idle_poll(&self, cpu: usize) {
        let idle = &self.idle_tasks[cpu];
        self.hooks.rcu_idle_enter(cpu);
        idle.set_polling(true);
        if !idle.need_resched() {
            core::hint::spin_loop();
        }
        idle.set_polling(false);
        self.hooks.rcu_idle_exit(cpu);
    }

    fn cpuidle_idle_call(&self, cpu: usize) -> IdlePath {
        let Some((drv, gov)) = self.cpuidle.read().clone() else {
            self.hooks.rcu_idle_enter(cpu);
            self.hooks.arch_cpu_idle(cpu);
            self.hooks.rcu_idle_exit(cpu);
            return IdlePath::Default;
        };
        let states = drv.states();
        if states.is_empty() {
            self.hooks.arch_cpu_idle(cpu);
            return IdlePath::Default;
        }

        let limit = self.idle_latency_limit.load(Ordering::Relaxed);
        let (idx, path) = if self.hooks.system_suspending() {
            let idx = states.len() - 1;
            (idx, IdlePath::S2Idle(idx))
        } else if limit != u64::MAX {
            let idx = states
                .iter()
                .rposition(|s| s.exit_latency_ns <= limit)
                .unwrap_or(0);
            (idx, IdlePath::LatencyLimited(idx))
        } else {
            let (idx, stop_tick) = gov.select(cpu, states, limit);
            let idx = idx.min(states.len() - 1);
            if !stop_tick {
                self.tick_nohz_idle_retain_tick(cpu);
            }
            (idx, IdlePath::Governor(idx))
        };

        self.rq_lock(cpu).idle_state = Some(idx);
        self.hooks.rcu_idle_enter(cpu);
        let residency = drv.enter_idle_state(cpu, idx);
        self.hooks.rcu_idle_exit(cpu);
        self.rq_lock(cpu).idle_state = None;

        if let IdlePath::Governor(_) = path {
            gov.reflect(cpu, idx, residency);
        }
        log::trace!("CPU{}: idle state {} for {} ns", cpu, idx, residency);
        path
    }

    /// idle 任务让出 CPU
    fn schedule_idle(&self, cpu: usize) {
        self.schedule_on(cpu, false);
    }

    /// 进入 idle 时停 tick：加入 nohz idle 集合并冻结本 CPU 的负载贡献
    pub(crate) fn tick_nohz_idle_enter(&self, cpu: usize) {
        let pc = &self.pcpu[cpu];
        if pc.nohz_tick_stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut rq = self.rq_lock(cpu);
            let (nr, unint) = (rq.nr_running, rq.nr_uninterruptible);
            let j = self.jiffies();
            self.loadavg.calc_load_nohz_start(&mut rq.calc_load, j, nr, unint);
        }
        self.nohz_balance_enter_idle(cpu);
    }

    /// 调速器要求保留 tick
    fn tick_nohz_idle_retain_tick(&self, cpu: usize) {
        self.tick_nohz_idle_exit(cpu);
    }

    pub(crate) fn tick_nohz_idle_exit(&self, cpu: usize) {
        let pc = &self.pcpu[cpu];
        if !pc.nohz_tick_stopped.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut rq = self.rq_lock(cpu);
            let j = self.jiffies();
            self.loadavg.calc_load_nohz_stop(&mut rq.calc_load, j);
        }
        self.nohz_balance_exit_idle(cpu);
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::cmdline::BootParams;
    use crate::sched::hooks::{CpuidleDriver, IdleGovernor, IdleState, ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;

    struct Driver {
        states: Vec<IdleState>,
        entered: Mutex<Vec<usize>>,
    }

    impl CpuidleDriver for Driver {
        fn states(&self) -> &[IdleState] {
            &self.states
        }

        fn enter_idle_state(&self, _cpu: usize, index: usize) -> u64 {
            self.entered.lock().push(index);
            1000 * (index as u64 + 1)
        }
    }

    struct Gov {
        pick: usize,
        reflected: AtomicUsize,
    }

    impl IdleGovernor for Gov {
        fn select(&self, _cpu: usize, _states: &[IdleState], _limit: u64) -> (usize, bool) {
            (self.pick, true)
        }

        fn reflect(&self, _cpu: usize, _index: usize, _residency_ns: u64) {
            self.reflected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn state(lat: u64) -> IdleState {
        IdleState {
            exit_latency_ns: lat,
            target_residency_ns: lat * 2,
            timer_stop: false,
        }
    }

    fn sched(boot: BootParams) -> Scheduler {
        Scheduler::with_boot_params(
            ArchTopology::flat(1),
            Arc::new(ManualClock::new(1)),
            Arc::new(NoopHooks),
            boot,
        )
    }

    #[test]
    fn governor_state_is_entered_and_reflected() {
        let s = sched(BootParams::new());
        let drv = Arc::new(Driver {
            states: vec![state(1_000), state(50_000), state(500_000)],
            entered: Mutex::new(Vec::new()),
        });
        let gov = Arc::new(Gov { pick: 1, reflected: AtomicUsize::new(0) });
        s.register_cpuidle(drv.clone(), gov.clone());

        assert_eq!(s.do_idle(0), IdlePath::Governor(1));
        assert_eq!(*drv.entered.lock(), vec![1]);
        assert_eq!(gov.reflected.load(Ordering::Relaxed), 1);
        assert!(s.pcpu[0].nohz_tick_stopped.load(Ordering::Relaxed));
    }

    #[test]
    fn latency_limit_caps_the_state() {
        let s = sched(BootParams::new());
        let drv = Arc::new(Driver {
            states: vec![state(1_000), state(50_000), state(500_000)],
            entered: Mutex::new(Vec::new()),
        });
        s.register_cpuidle(drv.clone(), Arc::new(Gov { pick: 2, reflected: AtomicUsize::new(0) }));
        s.set_idle_latency_limit(100_000);
        assert_eq!(s.do_idle(0), IdlePath::LatencyLimited(1));
    }

    #[test]
    fn force_poll_from_cmdline() {
        let mut boot = BootParams::new();
        boot.force_idle_poll = Some(true);
        let s = sched(boot);
        assert_eq!(s.do_idle(0), IdlePath::Poll);
        assert!(!s.idle_tasks[0].thread_flags().contains(crate::process::ThreadFlags::POLLING_NRFLAG));
    }

    #[test]
    fn remote_tick_accounts_a_tickless_cpu() {
        let clock = Arc::new(ManualClock::new(1));
        let s = Scheduler::with_boot_params(ArchTopology::flat(1), clock.clone(), Arc::new(NoopHooks), BootParams::new());
        let pid = s.spawn("busy", crate::sched::SchedAttr::normal(0), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), pid);

        clock.advance(10_000_000);
        s.sched_tick_remote(0);
        assert_eq!(s.with_task(pid, |st| st.se.sum_exec_runtime), Some(0));

        s.pcpu[0].nohz_tick_stopped.store(true, Ordering::Release);
        s.sched_tick_remote(0);
        let ran = s.with_task(pid, |st| st.se.sum_exec_runtime).unwrap();
        assert!(ran > 0 && ran <= 10_000_000, "ran {}", ran);
    }

    #[test]
    fn no_driver_uses_default_idle() {
        let s = sched(BootParams::new());
        assert_eq!(s.do_idle(0), IdlePath::Default);
    }
}
