//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度核心
//!
//! [`Scheduler`] 持有全部调度状态。本文件实现与调度类无关的部分：
//! rq 加锁与时钟、入队出队、唤醒、`__schedule`、tick、fork/exit 以及
//! 亲和性修改。各调度类分布在同目录的其他文件中。
//!
//! 加锁顺序：`Task::pi_lock` -> rq 锁（多个 rq 按 CPU 号升序）->
//! 任务组带宽锁 -> 全局任务表。持有 rq 锁时不能唤醒任务，先记入
//! [`WakeQ`]，解锁后再 [`Scheduler::wake_up_q`]。

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard, RwLock};

use super::class::{SchedClass, TaskSnapshot};
use super::entity::SchedTask;
use super::fair_lb::Nohz;
use super::features::{Features, SchedFeatures};
use super::fixedpt::SCHED_CAPACITY_SCALE;
use super::group::{GroupTable, TaskGroup, ROOT_TASK_GROUP};
use super::hooks::{cpufreq_flags, ClockSource, CpuidleDriver, IdleGovernor, IpiKind, SchedHooks};
use super::hrtimer::{HrtimerBase, HrtimerRestart, TimerEvent};
use super::loadavg::LoadAvg;
use super::pelt::update_irq_avg;
use super::pid::PidAllocator;
use super::root_domain::RootDomain;
use super::rq::clock_flags::{RQCF_ACT_SKIP, RQCF_REQ_SKIP, RQCF_UPDATED};
use super::rq::{BalanceCallback, PerCpu, Rq, RqGuard, IDLE_PID};
use super::stop::{CpuStopper, StopWork};
use super::sysctl::Tunables;
use super::topology::{ArchTopology, DomainAttr, DomainTree};
use super::uclamp::{uclamp_eff_get, uclamp_none, UclampId, UclampSe, UCLAMP_FLAG_IDLE, UCLAMP_IDS};
use super::{dl_prio, nice_to_prio, rt_prio, DequeueFlags, EnqueueFlags, WakeFlags, MAX_RT_PRIO};
use crate::cmdline::BootParams;
use crate::config::{MAX_CPUS, UCLAMP};
use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::errno::{SchedError, SchedResult};
use crate::process::task::Affinity;
use crate::process::{ExitState, OnRq, Pid, SchedPolicy, Task, TaskFlags, TaskState, ThreadFlags};
use crate::sched_bug_on;

/// 全部调度状态
pub struct Scheduler {
    pub(crate) nr_cpus: usize,
    pub(crate) rqs: Vec<Mutex<Rq>>,
    pub(crate) pcpu: Vec<Arc<PerCpu>>,
    /// 除 idle 任务外的全部任务
    pub(crate) tasks: RwLock<BTreeMap<Pid, Arc<Task>>>,
    pub(crate) idle_tasks: Vec<Arc<Task>>,
    pub(crate) stoppers: Vec<CpuStopper>,
    pub(crate) groups: RwLock<GroupTable>,
    pub(crate) domains: RwLock<Arc<DomainTree>>,
    /// 串行化调度域重建
    pub(crate) domains_mutex: Mutex<()>,
    /// 串行化 RT/DL 带宽配置
    pub(crate) bandwidth_mutex: Mutex<()>,
    /// cpuset 设置的分区，`None` 表示按在线 CPU 自动划分
    pub(crate) cpuset_partitions: Mutex<Option<Vec<(CpuMask, DomainAttr)>>>,
    pub(crate) def_root_domain: Arc<RootDomain>,
    pub(crate) topo: ArchTopology,
    pub(crate) clock: Arc<dyn ClockSource>,
    pub(crate) hooks: Arc<dyn SchedHooks>,
    pub(crate) cpuidle: RwLock<Option<(Arc<dyn CpuidleDriver>, Arc<dyn IdleGovernor>)>>,
    pub(crate) timers: HrtimerBase,
    pub(crate) nohz: Nohz,
    pub(crate) boot: BootParams,
    pub(crate) pids: PidAllocator,
    pub(crate) cpu_online: AtomicCpuMask,
    pub(crate) cpu_active: AtomicCpuMask,
    pub(crate) softirq_pending: Vec<AtomicBool>,
    pub(crate) jiffies: AtomicU64,
    /// 负责推进 jiffies 的 CPU
    pub(crate) tick_do_timer_cpu: AtomicUsize,
    pub(crate) total_forks: AtomicU64,
    pub(crate) rt_throttle_warned: AtomicBool,
    /// SD_SERIALIZE 层的均衡互斥
    pub(crate) balancing: AtomicBool,
    /// PM QoS 的 CPU 延迟上限
    pub(crate) idle_latency_limit: AtomicU64,
    pub loadavg: LoadAvg,
    pub tunables: Tunables,
    pub features: Features,
}

/// 解锁后才执行的唤醒
#[derive(Debug, Default)]
pub struct WakeQ {
    pids: Vec<Pid>,
}

impl WakeQ {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一任务只排一次
    pub fn add(&mut self, pid: Pid) {
        if !self.pids.contains(&pid) {
            self.pids.push(pid);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// fork 时从父任务继承的调度属性
struct Inherit {
    policy: SchedPolicy,
    static_prio: i32,
    normal_prio: i32,
    rt_priority: u32,
    reset_on_fork: bool,
    uclamp_req: [UclampSe; 2],
    group: usize,
    depth: u32,
    cpus_mask: CpuMask,
}

#[inline]
fn update_avg(avg: &mut u64, sample: u64) {
    let diff = sample as i64 - *avg as i64;
    *avg = (*avg as i64 + diff / 8) as u64;
}

impl Scheduler {
    /// 按启动命令行创建调度器并让全部 CPU 上线
    pub fn new(topo: ArchTopology, clock: Arc<dyn ClockSource>, hooks: Arc<dyn SchedHooks>) -> Self {
        Self::with_boot_params(topo, clock, hooks, crate::cmdline::boot_params())
    }

    pub fn with_boot_params(
        topo: ArchTopology,
        clock: Arc<dyn ClockSource>,
        hooks: Arc<dyn SchedHooks>,
        boot: BootParams,
    ) -> Self {
        let n = topo.nr_cpus;
        sched_bug_on!(n == 0 || n > MAX_CPUS, "sched: {} CPUs, at most {} supported", n, MAX_CPUS);

        let tunables = Tunables::new(n);
        if let Some(us) = boot.sched_rt_runtime_us {
            tunables.rt_runtime_us.store(us, Ordering::Relaxed);
        }
        if let Some(on) = boot.sched_energy_aware {
            tunables.energy_aware.store(on, Ordering::Relaxed);
        }

        let def_rd = Arc::new(RootDomain::new(n));
        let root = Arc::new(TaskGroup::root(n));
        {
            let mut b = root.rt_bandwidth.lock();
            b.period = tunables.rt_period();
            b.runtime = tunables.rt_runtime();
            for rt in &root.rt_runtime {
                rt.lock().rt_runtime = b.runtime;
            }
        }
        let loadavg = LoadAvg::new();
        let rql = loadavg.init(0);
        let pids = PidAllocator::new();
        let now = clock.sched_clock();

        let mut rqs = Vec::with_capacity(n);
        let mut pcpu = Vec::with_capacity(n);
        let mut idle_tasks = Vec::with_capacity(n);
        let mut stoppers = Vec::with_capacity(n);
        let mut registry = BTreeMap::new();

        for cpu in 0..n {
            let cap = topo.cpu_capacity.get(cpu).copied().unwrap_or(SCHED_CAPACITY_SCALE);
            let shared = Arc::new(PerCpu::new(cpu, cap));
            let mut rq = Rq::new(cpu, cap, def_rd.clone(), shared.clone());
            rq.calc_load = rql;
            rq.clock = now;
            rq.clock_task = now;
            rq.dl.bw_ratio = Self::dl_bw_ratio(tunables.rt_period(), tunables.rt_runtime());

            // init_idle
            let idle = Arc::new(Task::new(IDLE_PID, IDLE_PID, &format!("swapper/{}", cpu), cpu, CpuMask::of(cpu), now));
            idle.set_flags(TaskFlags::IDLE | TaskFlags::KTHREAD | TaskFlags::NO_SETAFFINITY);
            idle.set_state(TaskState::RUNNING);
            idle.set_on_rq(OnRq::Queued);
            idle.set_on_cpu(true);
            let mut st = SchedTask::new(idle.clone(), ROOT_TASK_GROUP, 0);
            st.class = SchedClass::Idle;
            rq.tasks.insert(IDLE_PID, st);
            rq.publish_curr();

            // 每 CPU 的 stopper 线程
            let Some(spid) = pids.alloc() else {
                super::bug(format_args!("sched: out of pids for CPU{} stopper", cpu));
            };
            let stopper = Arc::new(Task::new(spid, spid, &format!("migration/{}", cpu), cpu, CpuMask::of(cpu), now));
            stopper.set_flags(TaskFlags::KTHREAD | TaskFlags::NO_SETAFFINITY);
            stopper.set_state(TaskState::INTERRUPTIBLE);
            let mut st = SchedTask::new(stopper.clone(), ROOT_TASK_GROUP, 0);
            st.class = SchedClass::Stop;
            st.policy = SchedPolicy::Fifo;
            st.rt_priority = (MAX_RT_PRIO - 1) as u32;
            st.normal_prio = 0;
            st.prio = 0;
            rq.tasks.insert(spid, st);
            rq.stop = Some(spid);
            registry.insert(spid, stopper);
            stoppers.push(CpuStopper::new(spid));

            idle_tasks.push(idle);
            pcpu.push(shared);
            rqs.push(Mutex::new(rq));
        }

        let s = Self {
            nr_cpus: n,
            rqs,
            pcpu,
            tasks: RwLock::new(registry),
            idle_tasks,
            stoppers,
            groups: RwLock::new(alloc::vec![Some(root)]),
            domains: RwLock::new(Arc::new(DomainTree::empty(&topo))),
            domains_mutex: Mutex::new(()),
            bandwidth_mutex: Mutex::new(()),
            cpuset_partitions: Mutex::new(None),
            def_root_domain: def_rd,
            topo,
            clock,
            hooks,
            cpuidle: RwLock::new(None),
            timers: HrtimerBase::new(),
            nohz: Nohz::new(n),
            boot,
            pids,
            cpu_online: AtomicCpuMask::default(),
            cpu_active: AtomicCpuMask::default(),
            softirq_pending: (0..n).map(|_| AtomicBool::new(false)).collect(),
            jiffies: AtomicU64::new(0),
            tick_do_timer_cpu: AtomicUsize::new(0),
            total_forks: AtomicU64::new(0),
            rt_throttle_warned: AtomicBool::new(false),
            balancing: AtomicBool::new(false),
            idle_latency_limit: AtomicU64::new(u64::MAX),
            loadavg,
            tunables,
            features: Features::new(SchedFeatures::defaults()),
        };
        s.sched_init_smp();
        s
    }

    /// 启动时全部 CPU 一次性上线，之后只建一次调度域
    fn sched_init_smp(&self) {
        for cpu in 0..self.nr_cpus {
            self.cpu_online.set_cpu(cpu, Ordering::Release);
            self.cpu_active.set_cpu(cpu, Ordering::Release);
        }
        self.tunables.update_factor(self.nr_cpus);
        self.rebuild_sched_domains();
        log::info!(
            "sched: {} CPUs online, HZ={}, energy aware: {}",
            self.nr_cpus,
            crate::config::HZ,
            self.eas_enabled_any()
        );
    }

    /// 注册 cpuidle 驱动和调速器
    pub fn register_cpuidle(&self, drv: Arc<dyn CpuidleDriver>, gov: Arc<dyn IdleGovernor>) {
        *self.cpuidle.write() = Some((drv, gov));
    }

    // ---------------------------------------------------------------
    // 基本查询
    // ---------------------------------------------------------------

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// 当前执行的 CPU
    #[track_caller]
    pub fn this_cpu(&self) -> usize {
        let cpu = self.hooks.this_cpu_id();
        sched_bug_on!(cpu >= self.nr_cpus, "sched: this_cpu {} out of range", cpu);
        cpu
    }

    pub fn cpu_online(&self, cpu: usize) -> bool {
        self.cpu_online.test_cpu(cpu, Ordering::Acquire)
    }

    pub fn cpu_active(&self, cpu: usize) -> bool {
        self.cpu_active.test_cpu(cpu, Ordering::Acquire)
    }

    pub fn online_mask(&self) -> CpuMask {
        self.cpu_online.load(Ordering::Acquire)
    }

    pub fn active_mask(&self) -> CpuMask {
        self.cpu_active.load(Ordering::Acquire)
    }

    pub fn possible_mask(&self) -> CpuMask {
        CpuMask::first_n(self.nr_cpus)
    }

    pub fn jiffies(&self) -> u64 {
        self.jiffies.load(Ordering::Acquire)
    }

    pub fn sched_clock(&self) -> u64 {
        self.clock.sched_clock()
    }

    pub fn find_task(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.read().get(&pid).cloned()
    }

    pub fn group(&self, id: usize) -> Option<Arc<TaskGroup>> {
        self.groups.read().get(id).and_then(|g| g.clone())
    }

    pub(crate) fn domain_tree(&self) -> Arc<DomainTree> {
        self.domains.read().clone()
    }

    /// 本 CPU 上正在运行的任务
    pub fn current_pid(&self) -> Pid {
        self.pcpu[self.this_cpu()].curr_pid.load(Ordering::Acquire)
    }

    pub fn curr_on(&self, cpu: usize) -> Pid {
        self.pcpu[cpu].curr_pid.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Arc<Task> {
        let cpu = self.this_cpu();
        let rq = self.rq_lock(cpu);
        rq.curr_task().task.clone()
    }

    /// 持有任务所在 rq 锁执行 `f`
    pub fn with_task<R>(&self, pid: Pid, f: impl FnOnce(&SchedTask) -> R) -> Option<R> {
        let p = self.find_task(pid)?;
        let (_pi, rq) = self.task_rq_lock(&p);
        rq.try_task(pid).map(f)
    }

    /// 持有 `cpu` 的 rq 锁执行 `f`
    pub fn with_rq<R>(&self, cpu: usize, f: impl FnOnce(&mut Rq) -> R) -> R {
        let mut rq = self.rq_lock(cpu);
        f(&mut rq)
    }

    pub fn nr_running_on(&self, cpu: usize) -> u32 {
        self.pcpu[cpu].nr_running.load(Ordering::Acquire)
    }

    pub fn nr_running(&self) -> u64 {
        self.pcpu.iter().map(|p| p.nr_running.load(Ordering::Relaxed) as u64).sum()
    }

    /// 本 CPU 没有任务在运行也没有待处理的唤醒
    pub fn idle_cpu(&self, cpu: usize) -> bool {
        self.pcpu[cpu].idle_cpu()
    }

    /// 只能运行 SCHED_IDLE 任务
    pub fn sched_idle_cpu(&self, cpu: usize) -> bool {
        let rq = self.rq_lock(cpu);
        rq.nr_running > 0 && rq.nr_running == rq.cfs[0].idle_h_nr_running
    }

    pub fn available_idle_cpu(&self, cpu: usize) -> bool {
        self.idle_cpu(cpu)
    }

    pub fn capacity_of(&self, cpu: usize) -> u64 {
        self.pcpu[cpu].capacity()
    }

    pub fn capacity_orig_of(&self, cpu: usize) -> u64 {
        self.pcpu[cpu].capacity_orig()
    }

    #[inline]
    pub(crate) fn freq_scale(&self, cpu: usize) -> u64 {
        self.pcpu[cpu].freq_scale.load(Ordering::Relaxed)
    }

    /// cpufreq 通知当前频率比例
    pub fn set_freq_scale(&self, cpu: usize, scale: u64) {
        self.pcpu[cpu].freq_scale.store(scale.min(SCHED_CAPACITY_SCALE), Ordering::Relaxed);
    }

    /// 热管理通知被限制掉的容量
    pub fn set_thermal_pressure(&self, cpus: CpuMask, capped: u64) {
        for cpu in cpus {
            if cpu < self.nr_cpus {
                self.pcpu[cpu].thermal_pressure.store(capped, Ordering::Relaxed);
            }
        }
    }

    // ---------------------------------------------------------------
    // 加锁
    // ---------------------------------------------------------------

    #[inline]
    pub(crate) fn rq_lock(&self, cpu: usize) -> RqGuard<'_> {
        self.rqs[cpu].lock()
    }

    /// 锁住任务当前所在的 rq，调用方已持有 `pi_lock`
    pub(crate) fn __task_rq_lock(&self, p: &Task) -> RqGuard<'_> {
        loop {
            let cpu = p.task_cpu();
            let rq = self.rq_lock(cpu);
            if p.task_cpu() == cpu && p.on_rq() != OnRq::Migrating {
                return rq;
            }
            drop(rq);
            core::hint::spin_loop();
        }
    }

    pub(crate) fn task_rq_lock<'a>(&'a self, p: &'a Task) -> (MutexGuard<'a, Affinity>, RqGuard<'a>) {
        let pi = p.pi_lock.lock();
        let rq = self.__task_rq_lock(p);
        (pi, rq)
    }

    /// 按 CPU 号升序锁两个不同的 rq
    pub(crate) fn double_rq_lock(&self, a: usize, b: usize) -> (RqGuard<'_>, RqGuard<'_>) {
        sched_bug_on!(a == b, "sched: double_rq_lock on CPU{} twice", a);
        if a < b {
            let ga = self.rq_lock(a);
            let gb = self.rq_lock(b);
            (ga, gb)
        } else {
            let gb = self.rq_lock(b);
            let ga = self.rq_lock(a);
            (ga, gb)
        }
    }

    /// 已持有 `this` 时再锁 `other`
    ///
    /// 必要时先释放 `this` 再按顺序重新加锁，第三个返回值为 true 表示
    /// 中间释放过，调用方需要重新检查状态。
    pub(crate) fn double_lock_balance<'a>(&'a self, this: RqGuard<'a>, other: usize) -> (RqGuard<'a>, RqGuard<'a>, bool) {
        if let Some(g) = self.rqs[other].try_lock() {
            return (this, g, false);
        }
        if other > this.cpu {
            let g = self.rq_lock(other);
            return (this, g, false);
        }
        let cpu = this.cpu;
        drop(this);
        let (a, b) = self.double_rq_lock(cpu, other);
        (a, b, true)
    }

    /// 执行挂起的均衡回调后释放 rq 锁
    pub(crate) fn unlock_with_callbacks(&self, rq: RqGuard<'_>) {
        drop(self.run_balance_callbacks(rq));
    }

    pub(crate) fn run_balance_callbacks<'a>(&'a self, mut rq: RqGuard<'a>) -> RqGuard<'a> {
        while !rq.balance_callbacks.is_empty() {
            let cbs = core::mem::take(&mut rq.balance_callbacks);
            for cb in cbs {
                rq = match cb {
                    BalanceCallback::PushRt => self.push_rt_tasks(rq),
                    BalanceCallback::PullRt => self.pull_rt_task(rq),
                    BalanceCallback::PushDl => self.push_dl_tasks(rq),
                    BalanceCallback::PullDl => self.pull_dl_task(rq),
                };
            }
        }
        rq
    }

    // ---------------------------------------------------------------
    // 时钟
    // ---------------------------------------------------------------

    pub(crate) fn update_rq_clock(&self, rq: &mut Rq) {
        if rq.clock_update_flags & RQCF_ACT_SKIP != 0 {
            return;
        }
        let now = self.clock.sched_clock();
        if now > rq.clock {
            let delta = now - rq.clock;
            rq.clock = now;
            self.update_rq_clock_task(rq, delta);
        }
        rq.clock_update_flags |= RQCF_UPDATED;
    }

    fn update_rq_clock_task(&self, rq: &mut Rq, mut delta: u64) {
        let irq_now = self.clock.irq_time(rq.cpu);
        let irq_delta = irq_now.saturating_sub(rq.prev_irq_time).min(delta);
        rq.prev_irq_time += irq_delta;
        delta -= irq_delta;
        rq.clock_task += delta;

        let freq = self.freq_scale(rq.cpu);
        if irq_delta != 0 && self.features.has(SchedFeatures::NONTASK_CAPACITY) {
            let (clock, cap) = (rq.clock, rq.cpu_capacity_orig);
            update_irq_avg(&mut rq.avg_irq, clock, irq_delta, cap, freq);
        }

        if rq.curr_is_idle() {
            let total = rq.cfs[0].avg.util_sum + rq.avg_rt.util_sum + rq.avg_dl.util_sum;
            let clock_task = rq.clock_task;
            rq.pelt.sync_idle(clock_task, total);
        } else {
            let cap = rq.cpu_capacity_orig;
            rq.pelt.advance(delta, cap, freq);
        }
    }

    /// 请求跳过下一次 `__schedule` 中的时钟更新
    pub(crate) fn rq_clock_skip_update(&self, rq: &mut Rq) {
        rq.clock_update_flags |= RQCF_REQ_SKIP;
    }

    // ---------------------------------------------------------------
    // 入队出队
    // ---------------------------------------------------------------

    pub(crate) fn add_nr_running(&self, rq: &mut Rq, count: u32) {
        let prev = rq.nr_running;
        rq.set_nr_running(prev + count);
        if prev < 2 && rq.nr_running >= 2 && !rq.rd.overload.load(Ordering::Relaxed) {
            rq.rd.set_overload(true);
        }
    }

    #[track_caller]
    pub(crate) fn sub_nr_running(&self, rq: &mut Rq, count: u32) {
        sched_bug_on!(rq.nr_running < count, "CPU{}: nr_running underflow", rq.cpu);
        let nr = rq.nr_running - count;
        rq.set_nr_running(nr);
    }

    fn add_nr_uninterruptible(&self, rq: &mut Rq, delta: i64) {
        rq.nr_uninterruptible += delta;
        rq.shared.nr_uninterruptible.store(rq.nr_uninterruptible, Ordering::Relaxed);
    }

    fn sched_info_enqueue(&self, rq: &mut Rq, pid: Pid) {
        let now = rq.clock;
        let st = rq.task_mut(pid);
        if st.last_queued == 0 {
            st.last_queued = now;
        }
    }

    fn sched_info_dequeue(&self, rq: &mut Rq, pid: Pid) {
        let now = rq.clock;
        let st = rq.task_mut(pid);
        let mut delta = 0;
        if st.last_queued != 0 {
            delta = now.saturating_sub(st.last_queued);
            st.last_queued = 0;
        }
        st.run_delay += delta;
        rq.stats.run_delay += delta;
    }

    fn sched_info_switch(&self, rq: &mut Rq, prev: Pid, next: Pid) {
        let now = rq.clock;
        if prev != rq.idle {
            let st = rq.task(prev);
            let delta = now.saturating_sub(st.last_arrival);
            let requeue = st.task.state().is_running() && st.task.on_rq() == OnRq::Queued;
            rq.stats.rq_cpu_time += delta;
            if requeue {
                self.sched_info_enqueue(rq, prev);
            }
        }
        if next != rq.idle {
            let st = rq.task_mut(next);
            let mut delta = 0;
            if st.last_queued != 0 {
                delta = now.saturating_sub(st.last_queued);
                st.last_queued = 0;
            }
            st.run_delay += delta;
            st.last_arrival = now;
            st.pcount += 1;
            rq.stats.run_delay += delta;
            rq.stats.pcount += 1;
        }
    }

    fn uclamp_rq_inc(&self, rq: &mut Rq, pid: Pid) {
        if !UCLAMP {
            return;
        }
        let defaults = self.tunables.uclamp_defaults();
        let Rq { tasks, uclamp, .. } = rq;
        let Some(st) = tasks.get_mut(&pid) else {
            return;
        };
        if !matches!(st.class, SchedClass::Fair | SchedClass::Rt) {
            return;
        }
        for id in UCLAMP_IDS {
            let eff = uclamp_eff_get(st.uclamp_req[id as usize], id, defaults);
            st.uclamp[id as usize] = uclamp.inc_id(eff, id);
        }
        if uclamp.flags & UCLAMP_FLAG_IDLE != 0 {
            uclamp.clear_idle_flag();
        }
    }

    fn uclamp_rq_dec(&self, rq: &mut Rq, pid: Pid) {
        if !UCLAMP {
            return;
        }
        let Rq { tasks, uclamp, .. } = rq;
        let Some(st) = tasks.get_mut(&pid) else {
            return;
        };
        for id in UCLAMP_IDS {
            if st.uclamp[id as usize].active {
                uclamp.dec_id(&mut st.uclamp[id as usize], id);
            }
        }
    }

    pub(crate) fn enqueue_task(&self, rq: &mut Rq, pid: Pid, flags: EnqueueFlags) {
        if !flags.contains(EnqueueFlags::NOCLOCK) {
            self.update_rq_clock(rq);
        }
        if !flags.contains(EnqueueFlags::RESTORE) {
            self.sched_info_enqueue(rq, pid);
        }
        self.uclamp_rq_inc(rq, pid);
        let class = rq.task(pid).class;
        class.enqueue_task(self, rq, pid, flags);
    }

    pub(crate) fn dequeue_task(&self, rq: &mut Rq, pid: Pid, flags: DequeueFlags) {
        if !flags.contains(DequeueFlags::NOCLOCK) {
            self.update_rq_clock(rq);
        }
        if !flags.contains(DequeueFlags::SAVE) {
            self.sched_info_dequeue(rq, pid);
        }
        self.uclamp_rq_dec(rq, pid);
        let class = rq.task(pid).class;
        class.dequeue_task(self, rq, pid, flags);
    }

    pub(crate) fn activate_task(&self, rq: &mut Rq, pid: Pid, flags: EnqueueFlags) {
        self.enqueue_task(rq, pid, flags);
        rq.task(pid).task.set_on_rq(OnRq::Queued);
    }

    pub(crate) fn deactivate_task(&self, rq: &mut Rq, pid: Pid, flags: DequeueFlags) {
        let on_rq = if flags.contains(DequeueFlags::SLEEP) { OnRq::None } else { OnRq::Migrating };
        rq.task(pid).task.set_on_rq(on_rq);
        self.dequeue_task(rq, pid, flags);
    }

    /// 摘下任务执行 `f`，再按原状放回
    ///
    /// `f` 返回额外的入队标志（例如降低优先级时的 HEAD）。
    pub(crate) fn change_queued_with<R>(&self, rq: &mut Rq, pid: Pid, f: impl FnOnce(&mut Rq) -> (R, EnqueueFlags)) -> R {
        let queued = rq.task(pid).task.on_rq() == OnRq::Queued;
        let running = rq.curr == pid;
        let flags = DequeueFlags::SAVE | DequeueFlags::MOVE | DequeueFlags::NOCLOCK;
        if queued {
            self.dequeue_task(rq, pid, flags);
        }
        if running {
            let class = rq.task(pid).class;
            class.put_prev_task(self, rq, pid);
        }
        let (r, extra) = f(rq);
        if queued {
            self.enqueue_task(rq, pid, flags.restore() | extra);
        }
        if running {
            let class = rq.task(pid).class;
            class.set_next_task(self, rq, pid, false);
        }
        r
    }

    pub(crate) fn change_queued<R>(&self, rq: &mut Rq, pid: Pid, f: impl FnOnce(&mut Rq) -> R) -> R {
        self.change_queued_with(rq, pid, |rq| (f(rq), EnqueueFlags::empty()))
    }

    /// 优先级或调度类改变后的通知
    pub(crate) fn check_class_changed(&self, rq: &mut Rq, pid: Pid, prev_class: SchedClass, oldprio: i32) {
        let (class, prio) = {
            let st = rq.task(pid);
            (st.class, st.prio)
        };
        if prev_class != class {
            prev_class.switched_from(self, rq, pid);
            class.switched_to(self, rq, pid);
        } else if oldprio != prio || class == SchedClass::Dl {
            class.prio_changed(self, rq, pid, oldprio);
        }
    }

    // ---------------------------------------------------------------
    // 抢占
    // ---------------------------------------------------------------

    /// 标记 rq 的当前任务需要重新调度，远程 CPU 通过 IPI 通知
    pub fn resched_curr(&self, rq: &mut Rq) {
        let cpu = rq.cpu;
        let curr = &rq.task(rq.curr).task;
        if curr.need_resched() {
            return;
        }
        if cpu == self.this_cpu() {
            curr.set_need_resched_polling();
            return;
        }
        if !curr.set_need_resched_polling() {
            self.hooks.send_ipi(cpu, IpiKind::Reschedule);
        }
    }

    pub fn resched_cpu(&self, cpu: usize) {
        let mut rq = self.rq_lock(cpu);
        if self.cpu_online(cpu) || cpu == self.this_cpu() {
            self.resched_curr(&mut rq);
        }
    }

    /// 唤醒的任务是否应抢占当前任务
    pub(crate) fn check_preempt_curr(&self, rq: &mut Rq, pid: Pid, wf: WakeFlags) {
        let class = rq.task(pid).class;
        let curr_class = rq.curr_task().class;
        if class == curr_class {
            class.check_preempt_curr(self, rq, pid, wf);
        } else if class.above(curr_class) {
            self.resched_curr(rq);
        }
        // 当前任务马上要被切走，schedule 里不必再更新时钟
        if rq.task(rq.curr).task.on_rq() == OnRq::Queued && rq.task(rq.curr).task.need_resched() {
            self.rq_clock_skip_update(rq);
        }
    }

    pub fn need_resched(&self, cpu: usize) -> bool {
        let rq = self.rq_lock(cpu);
        rq.curr_task().task.need_resched()
    }

    // ---------------------------------------------------------------
    // 放置与迁移
    // ---------------------------------------------------------------

    /// 在 rq 锁内拍下放置决策需要的任务信息
    pub(crate) fn task_snapshot(&self, rq: &Rq, st: &SchedTask) -> TaskSnapshot {
        let avg = self.synced_task_avg(rq, st);
        TaskSnapshot {
            pid: st.pid(),
            cpu: st.cpu(),
            class: st.class,
            policy: st.policy,
            prio: st.prio,
            cpus_mask: st.cpus_mask,
            nr_cpus_allowed: st.nr_cpus_allowed,
            migration_disabled: st.migration_disabled > 0,
            util: avg.util_avg,
            util_est: avg.util_est.value(),
            uclamp_min: st.uclamp_eff_value(UclampId::Min),
            uclamp_max: st.uclamp_eff_value(UclampId::Max),
            load_avg: avg.load_avg,
            dl_deadline: st.dl.deadline,
            dl_rel_deadline: st.dl.params.dl_deadline,
            dl_runtime: st.dl.params.dl_runtime,
            dl_bw: st.dl.params.dl_bw,
            wakee_flips: st.wakee_flips,
            recent_used_cpu: st.recent_used_cpu,
            is_kthread: st.task.flags().contains(TaskFlags::KTHREAD),
        }
    }

    /// 任务能否在 `cpu` 上运行
    pub(crate) fn is_cpu_allowed(&self, mask: CpuMask, kthread: bool, migration_disabled: bool, cpu: usize) -> bool {
        if !mask.test(cpu) {
            return false;
        }
        if migration_disabled || kthread {
            return self.cpu_online(cpu);
        }
        self.cpu_active(cpu)
    }

    /// 原 CPU 不可用时的兜底，掩码内全部不可用则放宽到所有可能的 CPU
    pub(crate) fn select_fallback_rq(&self, p: &TaskSnapshot) -> (usize, Option<CpuMask>) {
        let mask = p.cpus_mask;
        if let Some(cpu) = mask.iter().find(|&c| self.is_cpu_allowed(mask, p.is_kthread, false, c)) {
            return (cpu, None);
        }
        let wide = self.possible_mask();
        let dest = wide
            .iter()
            .find(|&c| self.is_cpu_allowed(wide, p.is_kthread, false, c))
            .unwrap_or(p.cpu);
        log::info!("sched: process {} no longer affine to cpu{}", p.pid, p.cpu);
        (dest, Some(wide))
    }

    /// 为唤醒或新任务选择 CPU
    ///
    /// 第二个返回值非空时，任务的亲和性被放宽成了该掩码。
    pub(crate) fn select_task_rq(&self, p: &TaskSnapshot, prev_cpu: usize, wf: WakeFlags) -> (usize, Option<CpuMask>) {
        let cpu = if p.nr_cpus_allowed > 1 && !p.migration_disabled {
            p.class.select_task_rq(self, p, prev_cpu, wf)
        } else if p.migration_disabled {
            p.cpu
        } else {
            p.cpus_mask.first().unwrap_or(p.cpu)
        };
        if self.is_cpu_allowed(p.cpus_mask, p.is_kthread, p.migration_disabled, cpu) {
            return (cpu, None);
        }
        self.select_fallback_rq(p)
    }

    /// 把任务的调度状态从 `rq` 取出，准备放到 `new_cpu`
    ///
    /// 任务必须已经出队。
    pub(crate) fn detach_task_rq(&self, rq: &mut Rq, pid: Pid, new_cpu: usize) -> SchedTask {
        let class = rq.task(pid).class;
        class.migrate_task_rq(self, rq, pid, new_cpu);
        let Some(mut st) = rq.tasks.remove(&pid) else {
            super::bug(format_args!("CPU{}: detach of unknown task {}", rq.cpu, pid));
        };
        st.se.nr_migrations += 1;
        st.task.set_cpu(new_cpu);
        st.task.set_wake_cpu(new_cpu);
        st
    }

    pub(crate) fn attach_task_rq(&self, rq: &mut Rq, st: SchedTask) {
        sched_bug_on!(st.cpu() != rq.cpu, "CPU{}: attach of task {} bound to CPU{}", rq.cpu, st.pid(), st.cpu());
        rq.tasks.insert(st.pid(), st);
    }

    /// 两个 rq 都已锁住时搬运排队中的任务，调用方负责抢占检查
    pub(crate) fn move_task_locked(&self, src: &mut Rq, dst: &mut Rq, pid: Pid) {
        self.deactivate_task(src, pid, DequeueFlags::NOCLOCK);
        let st = self.detach_task_rq(src, pid, dst.cpu);
        self.update_rq_clock(dst);
        self.attach_task_rq(dst, st);
        self.activate_task(dst, pid, EnqueueFlags::NOCLOCK);
    }

    /// 把排队中的任务搬到 `new_cpu`，返回新 rq 的锁
    pub(crate) fn move_queued_task<'a>(&'a self, mut rq: RqGuard<'a>, pid: Pid, new_cpu: usize) -> RqGuard<'a> {
        self.deactivate_task(&mut rq, pid, DequeueFlags::NOCLOCK);
        let st = self.detach_task_rq(&mut rq, pid, new_cpu);
        self.unlock_with_callbacks(rq);

        let mut rq = self.rq_lock(new_cpu);
        self.update_rq_clock(&mut rq);
        self.attach_task_rq(&mut rq, st);
        self.activate_task(&mut rq, pid, EnqueueFlags::NOCLOCK);
        self.check_preempt_curr(&mut rq, pid, WakeFlags::empty());
        rq
    }

    // ---------------------------------------------------------------
    // 唤醒
    // ---------------------------------------------------------------

    pub fn wake_up_process(&self, pid: Pid) -> bool {
        self.try_to_wake_up(pid, TaskState::NORMAL, WakeFlags::empty())
    }

    pub fn wake_up_state(&self, pid: Pid, state: TaskState) -> bool {
        self.try_to_wake_up(pid, state, WakeFlags::empty())
    }

    pub fn wake_up_q(&self, q: WakeQ) {
        for pid in q.pids {
            self.wake_up_process(pid);
        }
    }

    /// 唤醒状态在 `state` 中的任务，返回是否真的唤醒了
    pub fn try_to_wake_up(&self, pid: Pid, state: TaskState, wf: WakeFlags) -> bool {
        let Some(p) = self.find_task(pid) else {
            return false;
        };
        let this_cpu = self.this_cpu();

        // 唤醒还没睡下去的自己：只改状态
        if self.curr_on(this_cpu) == pid && p.task_cpu() == this_cpu && p.on_cpu() {
            if !p.state().intersects(state) {
                return false;
            }
            p.set_state(TaskState::RUNNING);
            return true;
        }

        let mut pi = p.pi_lock.lock();
        if !p.state().intersects(state) {
            return false;
        }
        fence(Ordering::SeqCst);

        if p.on_rq() != OnRq::None && self.ttwu_runnable(&p, wf) {
            return true;
        }

        fence(Ordering::Acquire);
        p.set_state(TaskState::WAKING);
        let mut wf = wf;

        if p.on_cpu() {
            if self.ttwu_queue_wakelist(&p, p.task_cpu(), wf | WakeFlags::ON_CPU) {
                return true;
            }
            while p.on_cpu() {
                core::hint::spin_loop();
            }
        }

        let prev_cpu = p.task_cpu();
        let snap = {
            let rq = self.rq_lock(prev_cpu);
            match rq.try_task(pid) {
                Some(st) => self.task_snapshot(&rq, st),
                None => super::bug(format_args!("sched: waking task {} lost its rq state", pid)),
            }
        };
        let (cpu, widened) = self.select_task_rq(&snap, p.wake_cpu(), wf | WakeFlags::TTWU);
        if let Some(mask) = widened {
            pi.cpus_mask = mask;
        }

        if cpu != prev_cpu || widened.is_some() {
            let mut src = self.rq_lock(prev_cpu);
            if let Some(mask) = widened {
                self.set_cpus_allowed_common(&mut src, pid, mask);
            }
            if cpu != prev_cpu {
                if src.task(pid).in_iowait {
                    src.shared.nr_iowait.fetch_sub(1, Ordering::Relaxed);
                }
                wf |= WakeFlags::MIGRATED;
                self.update_rq_clock(&mut src);
                let st = self.detach_task_rq(&mut src, pid, cpu);
                drop(src);
                let mut dst = self.rq_lock(cpu);
                self.attach_task_rq(&mut dst, st);
            }
        }

        self.ttwu_queue(&p, cpu, wf);
        drop(pi);
        true
    }

    /// 任务还在队列上（刚设置睡眠状态尚未切走）
    fn ttwu_runnable(&self, p: &Task, wf: WakeFlags) -> bool {
        let mut rq = self.__task_rq_lock(p);
        let mut ret = false;
        if p.on_rq() == OnRq::Queued {
            self.update_rq_clock(&mut rq);
            self.ttwu_do_wakeup(&mut rq, p.pid(), wf);
            ret = true;
        }
        self.unlock_with_callbacks(rq);
        ret
    }

    fn ttwu_do_wakeup(&self, rq: &mut Rq, pid: Pid, wf: WakeFlags) {
        self.check_preempt_curr(rq, pid, wf);
        let class = {
            let st = rq.task(pid);
            st.task.set_state(TaskState::RUNNING);
            st.class
        };
        class.task_woken(self, rq, pid);

        if rq.idle_stamp != 0 {
            let delta = rq.clock.saturating_sub(rq.idle_stamp);
            let max = 2 * rq.max_idle_balance_cost;
            update_avg(&mut rq.avg_idle, delta);
            if rq.avg_idle > max {
                rq.avg_idle = max;
            }
            rq.wake_stamp = self.jiffies();
            rq.wake_avg_idle = rq.avg_idle / 2;
            rq.idle_stamp = 0;
        }
    }

    fn ttwu_do_activate(&self, rq: &mut Rq, pid: Pid, wf: WakeFlags) {
        let this_cpu = self.this_cpu();
        let (contrib, iowait) = {
            let st = rq.task(pid);
            (st.sched_contributes_to_load, st.in_iowait)
        };
        if contrib {
            self.add_nr_uninterruptible(rq, -1);
        }
        let mut en = EnqueueFlags::WAKEUP | EnqueueFlags::NOCLOCK;
        if wf.contains(WakeFlags::MIGRATED) {
            en |= EnqueueFlags::MIGRATED;
        } else if iowait {
            rq.shared.nr_iowait.fetch_sub(1, Ordering::Relaxed);
        }

        rq.stats.ttwu_count += 1;
        let local = rq.cpu == this_cpu;
        if local {
            rq.stats.ttwu_local += 1;
        }
        {
            let st = &mut rq.task_mut(pid).se.statistics;
            st.nr_wakeups += 1;
            if wf.contains(WakeFlags::SYNC) {
                st.nr_wakeups_sync += 1;
            }
            if wf.contains(WakeFlags::MIGRATED) {
                st.nr_wakeups_migrate += 1;
            }
            if local {
                st.nr_wakeups_local += 1;
            } else {
                st.nr_wakeups_remote += 1;
            }
        }

        self.activate_task(rq, pid, en);
        self.ttwu_do_wakeup(rq, pid, wf);
    }

    /// 是否应该把唤醒交给目标 CPU 自己完成
    fn ttwu_queue_cond(&self, cpu: usize, wf: WakeFlags) -> bool {
        let this_cpu = self.this_cpu();
        if !self.domain_tree().cpus_share_cache(this_cpu, cpu) {
            return true;
        }
        if cpu == this_cpu {
            return false;
        }
        wf.contains(WakeFlags::ON_CPU) && self.nr_running_on(cpu) <= 1
    }

    fn ttwu_queue_wakelist(&self, p: &Task, cpu: usize, wf: WakeFlags) -> bool {
        if !self.features.has(SchedFeatures::TTWU_QUEUE) || !self.ttwu_queue_cond(cpu, wf) {
            return false;
        }
        if cpu == self.this_cpu() {
            return false;
        }
        p.set_remote_wakeup(wf.contains(WakeFlags::MIGRATED));
        let pc = &self.pcpu[cpu];
        pc.wake_list.lock().push((p.pid(), wf));
        pc.ttwu_pending.store(1, Ordering::Release);
        self.hooks.send_ipi(cpu, IpiKind::Reschedule);
        true
    }

    fn ttwu_queue(&self, p: &Task, cpu: usize, wf: WakeFlags) {
        if self.ttwu_queue_wakelist(p, cpu, wf) {
            return;
        }
        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        self.ttwu_do_activate(&mut rq, p.pid(), wf);
        self.unlock_with_callbacks(rq);
    }

    /// 处理其他 CPU 交过来的唤醒
    pub fn sched_ttwu_pending(&self, cpu: usize) {
        let pc = &self.pcpu[cpu];
        let list = core::mem::take(&mut *pc.wake_list.lock());
        if list.is_empty() {
            pc.ttwu_pending.store(0, Ordering::Release);
            return;
        }
        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        for (pid, wf) in list {
            if rq.try_task(pid).is_none() {
                log::warn!("CPU{}: queued wakeup of task {} not on this rq", cpu, pid);
                continue;
            }
            self.ttwu_do_activate(&mut rq, pid, wf);
        }
        pc.ttwu_pending.store(0, Ordering::Release);
        self.unlock_with_callbacks(rq);
    }

    /// Reschedule IPI 处理
    pub fn scheduler_ipi(&self, cpu: usize) {
        self.sched_ttwu_pending(cpu);
        if self.nohz_kick_pending(cpu) {
            self.raise_softirq(cpu);
        }
    }

    /// idle CPU 收到唤醒后重新调度
    pub fn wake_up_if_idle(&self, cpu: usize) {
        if !self.idle_cpu(cpu) {
            return;
        }
        let mut rq = self.rq_lock(cpu);
        if rq.curr_is_idle() {
            self.resched_curr(&mut rq);
        }
    }

    // ---------------------------------------------------------------
    // 调度
    // ---------------------------------------------------------------

    /// 当前 CPU 主动调度
    pub fn schedule(&self) {
        self.schedule_on(self.this_cpu(), false);
    }

    /// 中断返回时的抢占点
    pub fn preempt_schedule_irq(&self, cpu: usize) {
        if self.need_resched(cpu) {
            self.schedule_on(cpu, true);
        }
    }

    /// 在 `cpu` 上调度，直到当前任务不再需要调度
    ///
    /// 切到 stopper 时就地执行它的工作，然后让它睡下。
    pub fn schedule_on(&self, cpu: usize, preempt: bool) {
        let mut preempt = preempt;
        loop {
            self.__schedule(cpu, preempt);
            preempt = false;
            if self.stopper_is_curr(cpu) {
                self.cpu_stopper_thread(cpu);
                continue;
            }
            if !self.need_resched(cpu) {
                break;
            }
        }
    }

    /// 设置当前任务的状态，随后的 `schedule` 才真正让它睡下
    pub fn set_current_state(&self, state: TaskState) {
        self.current().set_current_state(state);
    }

    /// 以 `state` 睡眠，直到被唤醒
    ///
    /// 状态与唤醒之间的竞争由 `try_to_wake_up` 处理：在 `schedule` 之前
    /// 到来的唤醒会把状态改回 RUNNING，任务不会出队。
    pub fn block_current(&self, state: TaskState) {
        self.set_current_state(state);
        self.schedule();
    }

    /// 带 iowait 标记睡眠
    pub fn io_schedule(&self) {
        let cpu = self.this_cpu();
        let pid = self.curr_on(cpu);
        self.with_rq(cpu, |rq| {
            if let Some(st) = rq.tasks.get_mut(&pid) {
                st.in_iowait = true;
            }
        });
        self.schedule();
        if let Some(p) = self.find_task(pid) {
            let (_pi, mut rq) = self.task_rq_lock(&p);
            if let Some(st) = rq.tasks.get_mut(&pid) {
                st.in_iowait = false;
            }
        }
    }

    pub(crate) fn __schedule(&self, cpu: usize, preempt: bool) {
        let mut rq = self.rq_lock(cpu);
        let prev = rq.curr;
        let prev_task = rq.task(prev).task.clone();

        self.hooks.rcu_note_context_switch(cpu, preempt);
        if self.features.has(SchedFeatures::HRTICK) && rq.hrtick_expires.take().is_some() {
            self.timers.cancel(TimerEvent::Hrtick(cpu));
        }
        rq.clock_update_flags <<= 1;
        self.update_rq_clock(&mut rq);
        rq.stats.sched_count += 1;

        let prev_state = prev_task.state();
        let mut voluntary = false;
        if !preempt && !prev_state.is_running() {
            if prev_state.contains(TaskState::INTERRUPTIBLE) && prev_task.thread_flags().contains(ThreadFlags::SIGPENDING)
            {
                prev_task.set_state(TaskState::RUNNING);
            } else {
                let contrib = prev_state.contributes_to_load();
                rq.task_mut(prev).sched_contributes_to_load = contrib;
                if contrib {
                    self.add_nr_uninterruptible(&mut rq, 1);
                }
                self.deactivate_task(&mut rq, prev, DequeueFlags::SLEEP | DequeueFlags::NOCLOCK);
                if rq.task(prev).in_iowait {
                    rq.shared.nr_iowait.fetch_add(1, Ordering::Relaxed);
                }
            }
            voluntary = true;
        }

        let (mut rq, next) = self.pick_next_task(rq, prev);
        prev_task.clear_need_resched();
        rq.clock_update_flags &= !(RQCF_ACT_SKIP | RQCF_REQ_SKIP);

        let mut dead = None;
        if next != prev {
            rq.nr_switches += 1;
            rq.shared.ctxt.fetch_add(1, Ordering::Relaxed);
            if voluntary {
                prev_task.nvcsw.fetch_add(1, Ordering::Relaxed);
            } else {
                prev_task.nivcsw.fetch_add(1, Ordering::Relaxed);
            }
            dead = self.context_switch(&mut rq, prev, next, prev_state);
        }
        self.unlock_with_callbacks(rq);

        if let Some(pid) = dead {
            self.tasks.write().remove(&pid);
            log::debug!("sched: task {} released", pid);
        }
    }

    /// 返回需要从全局任务表中移除的死亡任务
    fn context_switch(&self, rq: &mut Rq, prev: Pid, next: Pid, prev_state: TaskState) -> Option<Pid> {
        self.sched_info_switch(rq, prev, next);
        let next_task = rq.task(next).task.clone();
        next_task.set_on_cpu(true);
        rq.curr = next;
        rq.publish_curr();
        let prev_task = rq.task(prev).task.clone();
        prev_task.set_on_cpu(false);
        self.finish_task_switch(rq, prev, prev_state)
    }

    fn finish_task_switch(&self, rq: &mut Rq, prev: Pid, prev_state: TaskState) -> Option<Pid> {
        if !prev_state.contains(TaskState::DEAD) {
            return None;
        }
        let class = rq.task(prev).class;
        class.task_dead(self, rq, prev);
        // 离开 DL 后仍在等 0-lag 的带宽也要归还
        if class != SchedClass::Dl {
            self.task_dead_dl(rq, prev);
        }
        if let Some(st) = rq.tasks.remove(&prev) {
            st.task.set_exit_state(ExitState::Dead);
        }
        Some(prev)
    }

    /// 先让各类做均衡，再从高到低挑选
    fn pick_next_task<'a>(&'a self, mut rq: RqGuard<'a>, prev: Pid) -> (RqGuard<'a>, Pid) {
        // prev 是 idle 时也要给 fair 一次 newidle 均衡的机会
        let start = rq.task(prev).class.min(SchedClass::Fair);
        for class in SchedClass::ALL {
            if class < start {
                continue;
            }
            let (g, done) = class.balance(self, rq, prev);
            rq = g;
            if done {
                break;
            }
        }
        // 均衡期间可能释放过锁，prev 仍然是 curr
        let prev_class = rq.task(prev).class;
        prev_class.put_prev_task(self, &mut rq, prev);

        for class in SchedClass::ALL {
            if let Some(next) = class.pick_next_task(self, &mut rq) {
                return (rq, next);
            }
        }
        super::bug(format_args!("CPU{}: no runnable task, not even idle", rq.cpu));
    }

    // ---------------------------------------------------------------
    // tick 与定时器
    // ---------------------------------------------------------------

    /// 本地 tick 中断
    pub fn timer_interrupt(&self, cpu: usize, user_tick: bool) {
        if self.tick_do_timer_cpu.load(Ordering::Relaxed) == cpu {
            self.do_timer(1);
            if self.jiffies() % crate::config::HZ == 0 {
                for other in self.online_mask().without(cpu).iter() {
                    self.sched_tick_remote(other);
                }
            }
        }
        self.account_process_tick(cpu, user_tick);
        self.run_hrtimers();
        self.scheduler_tick(cpu);
    }

    fn do_timer(&self, ticks: u64) {
        let j = self.jiffies.fetch_add(ticks, Ordering::AcqRel) + ticks;
        self.loadavg.calc_global_load(j);
    }

    pub fn scheduler_tick(&self, cpu: usize) {
        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);

        let thermal = rq.shared.thermal_pressure.load(Ordering::Relaxed);
        let now = rq.clock_task;
        super::pelt::update_rq_avg(&mut rq.avg_thermal, now, thermal);

        let curr = rq.curr;
        let class = rq.task(curr).class;
        class.task_tick(self, &mut rq, curr, false);

        let (nr, unint) = (rq.nr_running, rq.nr_uninterruptible);
        let j = self.jiffies();
        self.loadavg.calc_global_load_tick(&mut rq.calc_load, j, nr, unint);
        self.unlock_with_callbacks(rq);

        self.trigger_load_balance(cpu);
    }

    /// 替 tick 已停的 CPU 做一次远程 tick
    ///
    /// 负责 do_timer 的 CPU 每秒调用一次。运行中的任务照常记账，
    /// 负载由 `calc_load_nohz_remote` 代为折叠。
    pub fn sched_tick_remote(&self, cpu: usize) {
        if !self.pcpu[cpu].nohz_tick_stopped.load(Ordering::Acquire) {
            return;
        }
        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        if !rq.curr_is_idle() {
            let curr = rq.curr;
            let class = rq.task(curr).class;
            class.task_tick(self, &mut rq, curr, false);
        }
        let (nr, unint) = (rq.nr_running, rq.nr_uninterruptible);
        let j = self.jiffies();
        self.loadavg.calc_load_nohz_remote(&mut rq.calc_load, j, nr, unint);
        self.unlock_with_callbacks(rq);
    }

    /// 执行所有到期的高精度定时器
    pub fn run_hrtimers(&self) {
        let now = self.clock.sched_clock();
        while let Some((expires, ev)) = self.timers.pop_expired(now) {
            let restart = match ev {
                TimerEvent::RtPeriod(tg) => self.sched_rt_period_timer(tg, expires, now),
                TimerEvent::CfsPeriod(tg) => self.sched_cfs_period_timer(tg, expires, now),
                TimerEvent::CfsSlack(tg) => self.sched_cfs_slack_timer(tg),
                TimerEvent::DlReplenish(pid) => self.dl_task_timer(pid),
                TimerEvent::DlInactive(pid) => self.inactive_task_timer(pid),
                TimerEvent::Hrtick(cpu) => self.hrtick(cpu),
            };
            if let HrtimerRestart::Restart(at) = restart {
                sched_bug_on!(at <= now, "sched: timer {:?} restarted in the past", ev);
                self.timers.start(ev, at);
            }
        }
    }

    /// 在当前任务时间片用完时触发一次额外的 tick
    pub(crate) fn hrtick_start(&self, rq: &mut Rq, delay: u64) {
        let at = self.clock.sched_clock() + delay.max(10_000);
        rq.hrtick_expires = Some(at);
        self.timers.start(TimerEvent::Hrtick(rq.cpu), at);
    }

    fn hrtick(&self, cpu: usize) -> HrtimerRestart {
        let mut rq = self.rq_lock(cpu);
        rq.hrtick_expires = None;
        self.update_rq_clock(&mut rq);
        let curr = rq.curr;
        let class = rq.task(curr).class;
        class.task_tick(self, &mut rq, curr, true);
        self.unlock_with_callbacks(rq);
        HrtimerRestart::NoRestart
    }

    pub(crate) fn raise_softirq(&self, cpu: usize) {
        self.softirq_pending[cpu].store(true, Ordering::Release);
    }

    /// 中断退出时处理挂起的 SCHED_SOFTIRQ
    pub fn run_softirqs(&self, cpu: usize) {
        if self.softirq_pending[cpu].swap(false, Ordering::AcqRel) {
            self.run_rebalance_domains(cpu);
        }
    }

    pub fn softirq_pending(&self, cpu: usize) -> bool {
        self.softirq_pending[cpu].load(Ordering::Acquire)
    }

    /// 利用率变化后通知 cpufreq
    pub(crate) fn cpufreq_update_util(&self, rq: &Rq, flags: u32) {
        if !self.hooks.schedutil_governor() {
            return;
        }
        let snap = rq.util_snapshot();
        let max = rq.cpu_capacity_orig;
        let util_est = self.features.has(SchedFeatures::UTIL_EST);
        let util = super::energy::effective_cpu_util(
            &snap,
            rq.cpu_util_cfs(util_est),
            max,
            super::energy::UtilKind::Frequency,
            None,
        );
        let mut flags = flags;
        if rq.shared.nr_iowait.load(Ordering::Relaxed) > 0 {
            flags |= cpufreq_flags::SCHED_CPUFREQ_IOWAIT;
        }
        self.hooks.cpufreq_update_util(rq.cpu, util, max, flags);
    }

    // ---------------------------------------------------------------
    // fork / exit
    // ---------------------------------------------------------------

    fn inherit_from(&self, parent: Option<Pid>) -> Inherit {
        let default = Inherit {
            policy: SchedPolicy::Normal,
            static_prio: nice_to_prio(0),
            normal_prio: nice_to_prio(0),
            rt_priority: 0,
            reset_on_fork: false,
            uclamp_req: [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)],
            group: ROOT_TASK_GROUP,
            depth: 0,
            cpus_mask: self.possible_mask(),
        };
        let Some(p) = parent.and_then(|pid| self.find_task(pid)) else {
            return default;
        };
        let (pi, rq) = self.task_rq_lock(&p);
        let Some(st) = rq.try_task(p.pid()) else {
            return default;
        };
        Inherit {
            policy: st.policy,
            static_prio: st.static_prio,
            normal_prio: st.normal_prio,
            rt_priority: st.rt_priority,
            reset_on_fork: st.sched_reset_on_fork,
            uclamp_req: st.uclamp_req,
            group: st.group,
            depth: st.se.depth,
            cpus_mask: pi.cpus_mask,
        }
    }

    /// 为新任务建立调度状态，任务处于 NEW 状态，尚未入队
    ///
    /// 父任务为 DL 且未设置 reset-on-fork 时失败。
    pub fn sched_fork(&self, parent: Option<Pid>, comm: &str) -> SchedResult<Pid> {
        let inh = self.inherit_from(parent);
        let mut policy = inh.policy;
        let mut static_prio = inh.static_prio;
        let mut rt_priority = inh.rt_priority;
        let mut normal_prio = inh.normal_prio;
        let mut uclamp_req = inh.uclamp_req;
        for uc in &mut uclamp_req {
            uc.active = false;
        }

        if inh.reset_on_fork {
            if policy.is_rt() || policy.is_dl() {
                policy = SchedPolicy::Normal;
                static_prio = nice_to_prio(0);
                rt_priority = 0;
            } else if static_prio < nice_to_prio(0) {
                static_prio = nice_to_prio(0);
            }
            for id in UCLAMP_IDS {
                uclamp_req[id as usize] = UclampSe::new(uclamp_none(id), false);
            }
        }
        if dl_prio(normal_prio) && !inh.reset_on_fork {
            return Err(SchedError::Busy);
        }

        let Some(pid) = self.pids.alloc() else {
            return Err(SchedError::Busy);
        };
        let cpu = self.this_cpu();
        let now = self.clock.sched_clock();
        let task = Arc::new(Task::new(pid, pid, comm, cpu, inh.cpus_mask, now));

        let mut st = SchedTask::new(task.clone(), inh.group, inh.depth);
        st.policy = policy;
        st.static_prio = static_prio;
        st.rt_priority = rt_priority;
        if inh.reset_on_fork {
            normal_prio = st.calc_normal_prio();
        }
        st.normal_prio = normal_prio;
        // 子任务不继承 PI 提升
        st.prio = normal_prio;
        st.uclamp_req = uclamp_req;
        st.set_load_weight();
        st.class = if rt_prio(st.prio) { SchedClass::Rt } else { SchedClass::Fair };
        st.rt.time_slice = self.tunables.rr_timeslice();
        st.se.avg = self.init_entity_runnable_average(&st);

        self.tasks.write().insert(pid, task);

        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        let class = st.class;
        rq.tasks.insert(pid, st);
        class.task_fork(self, &mut rq, pid);
        drop(rq);

        self.total_forks.fetch_add(1, Ordering::Relaxed);
        log::debug!("sched: fork {} ({}) on CPU{}", pid, comm, cpu);
        Ok(pid)
    }

    /// 第一次把新任务放上运行队列
    pub fn wake_up_new_task(&self, pid: Pid) {
        let Some(p) = self.find_task(pid) else {
            return;
        };
        let mut pi = p.pi_lock.lock();
        p.set_state(TaskState::RUNNING);

        let prev_cpu = p.task_cpu();
        let snap = {
            let rq = self.rq_lock(prev_cpu);
            match rq.try_task(pid) {
                Some(st) => self.task_snapshot(&rq, st),
                None => return,
            }
        };
        let (cpu, widened) = self.select_task_rq(&snap, prev_cpu, WakeFlags::FORK);
        if let Some(mask) = widened {
            pi.cpus_mask = mask;
        }
        let mut flags = EnqueueFlags::NOCLOCK | EnqueueFlags::INITIAL;
        let mut st = {
            let mut rq = self.rq_lock(prev_cpu);
            if rq.try_task(pid).is_none() {
                return;
            }
            if let Some(mask) = widened {
                self.set_cpus_allowed_common(&mut rq, pid, mask);
            }
            // 新任务不经过 migrate_task_rq，DL 带宽单独搬
            if cpu != prev_cpu && rq.task(pid).class == SchedClass::Dl {
                self.migrate_task_rq_dl(&mut rq, pid, cpu);
                flags |= EnqueueFlags::MIGRATED;
            }
            let Some(st) = rq.tasks.remove(&pid) else {
                return;
            };
            st
        };
        st.task.set_cpu(cpu);
        st.task.set_wake_cpu(cpu);
        st.recent_used_cpu = cpu;

        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        rq.tasks.insert(pid, st);
        self.post_init_entity_util_avg(&mut rq, pid);
        self.activate_task(&mut rq, pid, flags);
        self.check_preempt_curr(&mut rq, pid, WakeFlags::FORK);
        let class = rq.task(pid).class;
        class.task_woken(self, &mut rq, pid);
        drop(pi);
        self.unlock_with_callbacks(rq);
    }

    /// fork 并立即唤醒
    pub fn fork(&self, parent: Pid, comm: &str) -> SchedResult<Pid> {
        let pid = self.sched_fork(Some(parent), comm)?;
        self.wake_up_new_task(pid);
        Ok(pid)
    }

    /// 以给定属性创建一个任务并唤醒
    pub fn spawn(&self, comm: &str, attr: super::SchedAttr, cpus: Option<CpuMask>) -> SchedResult<Pid> {
        let pid = self.sched_fork(None, comm)?;
        if let Some(mask) = cpus {
            if let Err(e) = self.set_cpus_allowed_ptr(pid, mask) {
                self.abort_new_task(pid);
                return Err(e);
            }
        }
        if attr != super::SchedAttr::normal(0) {
            if let Err(e) = self.sched_setattr_nocheck(pid, &attr) {
                self.abort_new_task(pid);
                return Err(e);
            }
        }
        self.wake_up_new_task(pid);
        Ok(pid)
    }

    /// 撤销还没唤醒过的新任务
    fn abort_new_task(&self, pid: Pid) {
        if let Some(p) = self.find_task(pid) {
            let (_pi, mut rq) = self.task_rq_lock(&p);
            if rq.try_task(pid).is_some() {
                self.task_dead_dl(&mut rq, pid);
                rq.tasks.remove(&pid);
            }
            p.set_exit_state(ExitState::Dead);
        }
        self.tasks.write().remove(&pid);
    }

    /// 当前任务退出，此后不会再被调度
    pub fn do_exit(&self) {
        let cpu = self.this_cpu();
        let p = self.current();
        sched_bug_on!(p.is_idle_task(), "CPU{}: idle task exiting", cpu);
        p.set_flags(TaskFlags::EXITING);
        p.set_exit_state(ExitState::Zombie);
        p.set_current_state(TaskState::DEAD);
        self.schedule_on(cpu, false);
    }

    // ---------------------------------------------------------------
    // 亲和性
    // ---------------------------------------------------------------

    pub(crate) fn set_cpus_allowed_common(&self, rq: &mut Rq, pid: Pid, mask: CpuMask) {
        let st = rq.task_mut(pid);
        st.cpus_mask = mask;
        st.nr_cpus_allowed = mask.weight() as u32;
    }

    /// 修改 rq 内的掩码副本，调用方持有 pi_lock 并已更新其中的掩码
    pub(crate) fn do_set_cpus_allowed(&self, rq: &mut Rq, pid: Pid, mask: CpuMask) {
        let class = rq.task(pid).class;
        self.change_queued(rq, pid, |rq| class.set_cpus_allowed(self, rq, pid, mask));
    }

    pub fn set_cpus_allowed_ptr(&self, pid: Pid, mask: CpuMask) -> SchedResult<()> {
        self.__set_cpus_allowed_ptr(pid, mask, false)
    }

    /// 修改亲和性，必要时把任务迁到新掩码内
    ///
    /// 正在运行的任务交给 stopper 迁移，本函数不等待迁移完成。
    pub(crate) fn __set_cpus_allowed_ptr(&self, pid: Pid, new_mask: CpuMask, from_user: bool) -> SchedResult<()> {
        let p = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let kthread = p.flags().contains(TaskFlags::KTHREAD);
        if from_user && p.flags().contains(TaskFlags::NO_SETAFFINITY) {
            return Err(SchedError::InvalidAttr);
        }
        let valid = if kthread { self.online_mask() } else { self.active_mask() };

        let (mut pi, mut rq) = self.task_rq_lock(&p);
        if rq.try_task(pid).is_none() {
            return Err(SchedError::NoSuchTask);
        }
        if pi.cpus_mask == new_mask {
            return Ok(());
        }
        let Some(dest) = new_mask.and(valid).first() else {
            return Err(SchedError::InvalidAttr);
        };
        if rq.task(pid).class == SchedClass::Dl && !self.dl_cpuset_cpumask_can_shrink(&rq, new_mask) {
            return Err(SchedError::Busy);
        }

        pi.cpus_mask = new_mask;
        if from_user {
            pi.user_cpus_mask = Some(new_mask);
        }
        self.do_set_cpus_allowed(&mut rq, pid, new_mask);

        let cpu = p.task_cpu();
        if new_mask.test(cpu) || pi.migration_disabled > 0 {
            // 关迁移的任务在 migrate_enable 时再处理
            drop(pi);
            self.unlock_with_callbacks(rq);
            return Ok(());
        }

        if rq.curr == pid || p.on_cpu() {
            drop(pi);
            self.unlock_with_callbacks(rq);
            self.stop_one_cpu_nowait(cpu, StopWork::Migrate { pid, dest: Some(dest) });
        } else if p.on_rq() == OnRq::Queued {
            let rq = self.move_queued_task(rq, pid, dest);
            drop(pi);
            self.unlock_with_callbacks(rq);
        } else {
            // 睡眠中的任务在唤醒时按新掩码选择 CPU
            drop(pi);
            self.unlock_with_callbacks(rq);
        }
        Ok(())
    }

    /// 当前任务暂时禁止迁移，可嵌套
    pub fn migrate_disable(&self) {
        let cpu = self.this_cpu();
        let p = self.current();
        if p.is_idle_task() {
            return;
        }
        let mut pi = p.pi_lock.lock();
        pi.migration_disabled += 1;
        if pi.migration_disabled == 1 {
            let mut rq = self.rq_lock(cpu);
            if let Some(st) = rq.tasks.get_mut(&p.pid()) {
                st.migration_disabled = 1;
            }
        }
    }

    pub fn migrate_enable(&self) {
        let cpu = self.this_cpu();
        let p = self.current();
        if p.is_idle_task() {
            return;
        }
        let mut pi = p.pi_lock.lock();
        sched_bug_on!(pi.migration_disabled == 0, "sched: unbalanced migrate_enable by {}", p.pid());
        pi.migration_disabled -= 1;
        if pi.migration_disabled > 0 {
            return;
        }
        let mask = pi.cpus_mask;
        {
            let mut rq = self.rq_lock(cpu);
            if let Some(st) = rq.tasks.get_mut(&p.pid()) {
                st.migration_disabled = 0;
            }
        }
        drop(pi);
        if !mask.test(cpu) {
            self.stop_one_cpu_nowait(cpu, StopWork::Migrate { pid: p.pid(), dest: None });
        }
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("nr_cpus", &self.nr_cpus)
            .field("online", &self.online_mask())
            .field("jiffies", &self.jiffies())
            .finish()
    }
}
