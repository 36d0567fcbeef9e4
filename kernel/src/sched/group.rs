//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 任务组
//!
//! 任务组在每个 CPU 上各有一个 cfs_rq 和 rt_rq（放在 rq 里，按组号
//! 索引），并共享 RT/CFS 带宽配置。组号只增不减，销毁的组只做标记，
//! 其下标不会被复用。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use spin::Mutex;

use super::core::Scheduler;
use super::fixedpt::{to_ratio, NICE_0_LOAD, RUNTIME_INF};
use super::hrtimer::TimerEvent;
use crate::config::{CFS_BANDWIDTH_SLICE_US, SCHED_RT_PERIOD_US, SCHED_RT_RUNTIME_US};
use crate::cpumask::CpuMask;
use crate::errno::{SchedError, SchedResult};
use crate::process::Pid;

pub type GroupId = usize;

/// 根任务组
pub const ROOT_TASK_GROUP: GroupId = 0;

pub const MIN_SHARES: u64 = 2;
pub const MAX_SHARES: u64 = 1 << 18;

pub const NSEC_PER_USEC: u64 = 1000;

/// 全局 RT 周期 (ns)
pub const fn default_rt_period() -> u64 {
    SCHED_RT_PERIOD_US * NSEC_PER_USEC
}

/// 全局 RT 配额 (ns)，负数表示不限制
pub const fn default_rt_runtime() -> u64 {
    if SCHED_RT_RUNTIME_US < 0 {
        RUNTIME_INF
    } else {
        SCHED_RT_RUNTIME_US as u64 * NSEC_PER_USEC
    }
}

/// RT 带宽
#[derive(Debug, Clone, Copy)]
pub struct RtBandwidth {
    pub period: u64,
    pub runtime: u64,
    /// 周期定时器是否在运行
    pub period_active: bool,
}

impl RtBandwidth {
    pub const fn new(period: u64, runtime: u64) -> Self {
        Self { period, runtime, period_active: false }
    }
}

/// 每 CPU 的 RT 运行时间账本
///
/// 加锁顺序：rq 锁 -> `TaskGroup::rt_bandwidth` -> 任意一个 CPU 的
/// `RtRuntime`。借用运行时间时一次只持有一个 CPU 的锁。
#[derive(Debug, Clone, Copy)]
pub struct RtRuntime {
    pub rt_time: u64,
    /// 本 CPU 可用的配额，借用后可能偏离组配额
    pub rt_runtime: u64,
}

/// CFS 带宽 (`cpu.max`)
#[derive(Debug, Clone)]
pub struct CfsBandwidth {
    pub period: u64,
    pub quota: u64,
    pub burst: u64,
    /// 本周期剩余的全局运行时间
    pub runtime: u64,
    pub runtime_snap: u64,
    pub hierarchical_quota: u64,
    pub idle: bool,
    pub period_active: bool,
    pub slack_started: bool,
    pub distribute_running: bool,
    /// 有被节流的 cfs_rq 的 CPU
    pub throttled_cpus: CpuMask,
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub nr_burst: u64,
    pub throttled_time: u64,
    pub burst_time: u64,
}

/// cfs 带宽默认周期 100ms
pub const DEFAULT_CFS_PERIOD: u64 = 100_000_000;
pub const MIN_CFS_QUOTA_PERIOD: u64 = 1_000_000;
pub const MAX_CFS_QUOTA_PERIOD: u64 = 1_000_000_000;
/// 每次从全局池取的时间片
pub const CFS_BANDWIDTH_SLICE: u64 = CFS_BANDWIDTH_SLICE_US * NSEC_PER_USEC;
/// 归还的运行时间积累到此值后启动 slack 定时器
pub const MIN_CFS_RQ_RUNTIME: u64 = 1_000_000;
pub const CFS_BANDWIDTH_SLACK_PERIOD: u64 = 5_000_000;

impl CfsBandwidth {
    pub fn new() -> Self {
        Self {
            period: DEFAULT_CFS_PERIOD,
            quota: RUNTIME_INF,
            burst: 0,
            runtime: 0,
            runtime_snap: 0,
            hierarchical_quota: RUNTIME_INF,
            idle: false,
            period_active: false,
            slack_started: false,
            distribute_running: false,
            throttled_cpus: CpuMask::new(),
            nr_periods: 0,
            nr_throttled: 0,
            nr_burst: 0,
            throttled_time: 0,
            burst_time: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.quota != RUNTIME_INF
    }

    /// 周期开始时补充运行时间，允许 burst 累积
    pub fn refill_runtime(&mut self) {
        if !self.enabled() {
            return;
        }
        // 上个周期用掉的超过 quota 的部分来自 burst
        let used = self.runtime_snap.saturating_sub(self.runtime);
        if used > self.quota {
            self.nr_burst += 1;
            self.burst_time += used - self.quota;
        }
        self.runtime = self.runtime.saturating_add(self.quota).min(self.quota.saturating_add(self.burst));
        self.runtime_snap = self.runtime;
    }
}

impl Default for CfsBandwidth {
    fn default() -> Self {
        Self::new()
    }
}

/// 任务组
#[derive(Debug)]
pub struct TaskGroup {
    pub id: GroupId,
    pub name: String,
    pub parent: Option<GroupId>,
    pub depth: u32,
    pub shares: AtomicU64,
    /// 各 CPU cfs_rq 贡献的负载之和
    pub load_avg: AtomicI64,
    pub rt_bandwidth: Mutex<RtBandwidth>,
    pub rt_runtime: Vec<Mutex<RtRuntime>>,
    pub cfs_bandwidth: Mutex<CfsBandwidth>,
    pub children: Mutex<Vec<GroupId>>,
    pub dead: AtomicBool,
}

impl TaskGroup {
    pub fn new(id: GroupId, name: &str, parent: Option<&TaskGroup>, nr_cpus: usize, rt_b: RtBandwidth) -> Self {
        let rt_runtime = (0..nr_cpus)
            .map(|_| Mutex::new(RtRuntime { rt_time: 0, rt_runtime: rt_b.runtime }))
            .collect();
        Self {
            id,
            name: String::from(name),
            parent: parent.map(|p| p.id),
            depth: parent.map_or(0, |p| p.depth + 1),
            shares: AtomicU64::new(NICE_0_LOAD),
            load_avg: AtomicI64::new(0),
            rt_bandwidth: Mutex::new(rt_b),
            rt_runtime,
            cfs_bandwidth: Mutex::new(CfsBandwidth::new()),
            children: Mutex::new(Vec::new()),
            dead: AtomicBool::new(false),
        }
    }

    /// 根任务组，RT 带宽就是全局带宽
    pub fn root(nr_cpus: usize) -> Self {
        Self::new(
            ROOT_TASK_GROUP,
            "/",
            None,
            nr_cpus,
            RtBandwidth::new(default_rt_period(), default_rt_runtime()),
        )
    }

    pub fn shares(&self) -> u64 {
        self.shares.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn rt_period(&self) -> u64 {
        self.rt_bandwidth.lock().period
    }

    pub fn rt_runtime_total(&self) -> u64 {
        self.rt_bandwidth.lock().runtime
    }

    /// 组的 RT 带宽比例
    pub fn rt_ratio(&self) -> u64 {
        let b = self.rt_bandwidth.lock();
        if b.runtime == RUNTIME_INF {
            return to_ratio(b.period, b.period);
        }
        to_ratio(b.period, b.runtime)
    }
}

/// 任务组树
pub type GroupTable = Vec<Option<Arc<TaskGroup>>>;

impl Scheduler {
    /// 在 `parent` 下创建任务组
    ///
    /// 新组的 RT 配额为 0，要先分配配额才能放入 RT 任务。
    pub fn sched_create_group(&self, parent: GroupId, name: &str) -> SchedResult<GroupId> {
        let parent_tg = self.group(parent).filter(|g| !g.is_dead()).ok_or(SchedError::InvalidAttr)?;
        let rt_b = RtBandwidth::new(parent_tg.rt_period(), 0);
        let id = {
            let mut groups = self.groups.write();
            let id = groups.len();
            groups.push(Some(Arc::new(TaskGroup::new(id, name, Some(&parent_tg), self.nr_cpus(), rt_b))));
            id
        };
        let depth = parent_tg.depth;
        for cpu in 0..self.nr_cpus() {
            self.rq_lock(cpu).add_group(id, parent, depth);
        }
        parent_tg.children.lock().push(id);
        log::debug!("sched: group {} '{}' created under {}", id, name, parent);
        Ok(id)
    }

    /// 销毁空的任务组，还有任务或子组时返回 Busy
    pub fn sched_destroy_group(&self, g: GroupId) -> SchedResult<()> {
        if g == ROOT_TASK_GROUP {
            return Err(SchedError::PermissionDenied);
        }
        let tg = self.group(g).filter(|t| !t.is_dead()).ok_or(SchedError::InvalidAttr)?;
        if !tg.children.lock().is_empty() {
            return Err(SchedError::Busy);
        }
        for cpu in 0..self.nr_cpus() {
            let rq = self.rq_lock(cpu);
            if rq.tasks.values().any(|st| st.group == g) {
                return Err(SchedError::Busy);
            }
        }
        tg.dead.store(true, Ordering::Release);
        self.timers.cancel(TimerEvent::RtPeriod(g));
        self.timers.cancel(TimerEvent::CfsPeriod(g));
        self.timers.cancel(TimerEvent::CfsSlack(g));
        for cpu in 0..self.nr_cpus() {
            let mut rq = self.rq_lock(cpu);
            rq.cfs[g].on_list = false;
            rq.cfs[g].runtime_enabled = false;
        }
        if let Some(parent) = tg.parent.and_then(|p| self.group(p)) {
            parent.children.lock().retain(|&c| c != g);
        }
        log::debug!("sched: group {} destroyed", g);
        Ok(())
    }

    /// 把任务移入任务组 `g`
    pub fn sched_move_task(&self, pid: Pid, g: GroupId) -> SchedResult<()> {
        let tg = self.group(g).filter(|t| !t.is_dead()).ok_or(SchedError::InvalidAttr)?;
        let p = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let (_pi, mut rq) = self.task_rq_lock(&p);
        let (cur, is_rt) = {
            let st = rq.try_task(pid).ok_or(SchedError::NoSuchTask)?;
            (st.group, st.policy.is_rt())
        };
        if cur == g {
            return Ok(());
        }
        if !self.sched_rt_can_attach(g, is_rt) {
            return Err(SchedError::InvalidAttr);
        }
        self.update_rq_clock(&mut rq);
        self.change_queued(&mut rq, pid, |rq| self.task_change_group_fair(rq, pid, g, tg.depth));
        if rq.curr == pid {
            self.resched_curr(&mut rq);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::BootParams;
    use crate::sched::entity::EntityId;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;
    use crate::sched::SchedAttr;

    fn sched(cpus: usize) -> Scheduler {
        let clock = Arc::new(ManualClock::new(cpus));
        Scheduler::with_boot_params(ArchTopology::flat(cpus), clock, Arc::new(NoopHooks), BootParams::new())
    }

    #[test]
    fn root_group_uses_global_rt_bandwidth() {
        let g = TaskGroup::root(2);
        assert_eq!(g.rt_period(), 1_000_000_000);
        assert_eq!(g.rt_runtime_total(), 950_000_000);
        assert_eq!(g.rt_runtime[1].lock().rt_runtime, 950_000_000);
        assert_eq!(g.shares(), 1024);
    }

    #[test]
    fn cfs_refill_caps_at_quota_plus_burst() {
        let mut b = CfsBandwidth::new();
        b.quota = 10;
        b.burst = 5;
        b.refill_runtime();
        assert_eq!(b.runtime, 10);
        b.refill_runtime();
        assert_eq!(b.runtime, 15);
        b.runtime = 0;
        b.refill_runtime();
        assert_eq!(b.runtime, 10);
    }

    #[test]
    fn moved_task_queues_under_group_entity() {
        let s = sched(1);
        let g = s.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
        assert_eq!(s.group(g).map(|t| t.depth), Some(1));
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        s.sched_move_task(p, g).unwrap();
        s.with_rq(0, |rq| {
            assert_eq!(rq.task(p).group, g);
            assert_eq!(rq.cfs[g].nr_running, 1);
            assert_eq!(rq.cfs[ROOT_TASK_GROUP].h_nr_running, 1);
            assert!(rq.se(EntityId::Group(g)).on_rq);
            assert_eq!(rq.nr_running, 1);
        });
    }

    #[test]
    fn busy_group_cannot_be_destroyed() {
        let s = sched(1);
        let g = s.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
        let c = s.sched_create_group(g, "c").unwrap();
        assert_eq!(s.sched_destroy_group(g), Err(SchedError::Busy));
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        s.sched_move_task(p, c).unwrap();
        assert_eq!(s.sched_destroy_group(c), Err(SchedError::Busy));
        s.sched_move_task(p, ROOT_TASK_GROUP).unwrap();
        s.sched_destroy_group(c).unwrap();
        s.sched_destroy_group(g).unwrap();
        assert_eq!(s.sched_move_task(p, g), Err(SchedError::InvalidAttr));
        assert_eq!(s.sched_destroy_group(ROOT_TASK_GROUP), Err(SchedError::PermissionDenied));
    }
}
