//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 每 CPU 运行队列
//!
//! [`Rq`] 受 `Scheduler::rqs[cpu]` 的自旋锁保护，里面放着该 CPU 上
//! 所有任务的调度状态（包括睡眠中的）、三个调度类的子队列、时钟和
//! rq 级 PELT 平均。其他 CPU 需要无锁读取的少量字段另外放在
//! [`PerCpu`] 里，由持锁者在修改 rq 时同步写入。

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use super::energy::CpuUtilSnapshot;
use super::entity::{EntityId, SchedEntity, SchedRtEntity, SchedTask};
use super::deadline::RATIO_SHIFT;
use super::fixedpt::{LoadWeight, SCHED_CAPACITY_SCALE};
use super::group::GroupId;
use super::loadavg::RqLoad;
use super::pelt::{PeltClock, SchedAvg};
use super::root_domain::RootDomain;
use super::uclamp::RqUclamp;
use super::{bug, WakeFlags, MAX_DL_PRIO, MAX_RT_PRIO};
use crate::cpumask::CpuMask;
use crate::process::Pid;

pub type RqGuard<'a> = MutexGuard<'a, Rq>;

/// 每个 CPU 的 idle 任务都是 0 号
pub const IDLE_PID: Pid = 0;

/// 在释放 rq 锁之前要执行的均衡动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceCallback {
    PushRt,
    PullRt,
    PushDl,
    PullDl,
}

/// 时钟更新标志
pub mod clock_flags {
    /// 请求跳过下一次时钟更新
    pub const RQCF_REQ_SKIP: u8 = 0x01;
    /// 本次 schedule 中跳过时钟更新
    pub const RQCF_ACT_SKIP: u8 = 0x02;
    /// 本次持锁期间已经更新过
    pub const RQCF_UPDATED: u8 = 0x04;
}

/// `/proc/stat` 的各项时间，纳秒
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CpuTime {
    User = 0,
    Nice,
    System,
    Softirq,
    Irq,
    Idle,
    Iowait,
    Steal,
    Guest,
    GuestNice,
}

pub const NR_STATS: usize = 10;

/// 其他 CPU 无锁可读的每 CPU 状态
pub struct PerCpu {
    pub cpu: usize,
    /// `rq.nr_running` 的副本
    pub nr_running: AtomicU32,
    /// 当前任务
    pub curr_pid: AtomicU32,
    /// 当前运行的是 idle 任务
    pub curr_idle: AtomicBool,
    /// 当前任务的有效优先级
    pub curr_prio: AtomicI32,
    pub cpu_capacity: AtomicU64,
    pub cpu_capacity_orig: AtomicU64,
    /// cfs 利用率（含 util_est），供无锁的放置路径读取
    pub cfs_util: AtomicU64,
    /// 根 cfs_rq 的负载
    pub cfs_load: AtomicU64,
    /// 远程唤醒列表非空
    pub ttwu_pending: AtomicU32,
    /// 远程唤醒队列
    pub wake_list: Mutex<Vec<(Pid, WakeFlags)>>,
    pub nr_iowait: AtomicI32,
    /// cpufreq 提供的频率比例
    pub freq_scale: AtomicU64,
    pub thermal_pressure: AtomicU64,
    /// RT_PUSH_IPI 的 irq_work 已排队
    pub rto_push_queued: AtomicBool,
    pub nohz_tick_stopped: AtomicBool,
    pub cpustat: [AtomicU64; NR_STATS],
    pub ctxt: AtomicU64,
    pub nr_uninterruptible: AtomicI64,
    /// 已计入 cpustat 的中断时间
    pub irq_accounted: AtomicU64,
}

impl PerCpu {
    pub fn new(cpu: usize, capacity: u64) -> Self {
        Self {
            cpu,
            nr_running: AtomicU32::new(0),
            curr_pid: AtomicU32::new(IDLE_PID),
            curr_idle: AtomicBool::new(true),
            curr_prio: AtomicI32::new(super::MAX_PRIO),
            cpu_capacity: AtomicU64::new(capacity),
            cpu_capacity_orig: AtomicU64::new(capacity),
            cfs_util: AtomicU64::new(0),
            cfs_load: AtomicU64::new(0),
            ttwu_pending: AtomicU32::new(0),
            wake_list: Mutex::new(Vec::new()),
            nr_iowait: AtomicI32::new(0),
            freq_scale: AtomicU64::new(SCHED_CAPACITY_SCALE),
            thermal_pressure: AtomicU64::new(0),
            rto_push_queued: AtomicBool::new(false),
            nohz_tick_stopped: AtomicBool::new(false),
            cpustat: Default::default(),
            ctxt: AtomicU64::new(0),
            nr_uninterruptible: AtomicI64::new(0),
            irq_accounted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.cpu_capacity.load(Ordering::Relaxed)
    }

    pub fn capacity_orig(&self) -> u64 {
        self.cpu_capacity_orig.load(Ordering::Relaxed)
    }

    /// 没有任务在运行也没有待处理的唤醒
    pub fn idle_cpu(&self) -> bool {
        self.curr_idle.load(Ordering::Acquire)
            && self.nr_running.load(Ordering::Acquire) == 0
            && self.ttwu_pending.load(Ordering::Acquire) == 0
    }

    pub fn account(&self, idx: CpuTime, ns: u64) {
        self.cpustat[idx as usize].fetch_add(ns, Ordering::Relaxed);
    }

    pub fn stat(&self, idx: CpuTime) -> u64 {
        self.cpustat[idx as usize].load(Ordering::Relaxed)
    }
}

/// min_vruntime 的初值
///
/// 时间线按无符号 vruntime 排序，起点放在远离回绕的位置。
pub const VRUNTIME_ORIGIN: u64 = 1 << 62;

/// 迁出或出队时留待下次更新扣除的平均值
#[derive(Debug, Clone, Copy, Default)]
pub struct Removed {
    pub nr: u32,
    pub load_avg: u64,
    pub util_avg: u64,
    pub runnable_avg: u64,
}

/// fair 子队列
#[derive(Debug, Clone)]
pub struct CfsRq {
    pub tg: GroupId,
    pub load: LoadWeight,
    pub nr_running: u32,
    /// 整个层级下的任务数
    pub h_nr_running: u32,
    /// 其中 SCHED_IDLE 策略的任务数
    pub idle_h_nr_running: u32,
    pub exec_clock: u64,
    pub min_vruntime: u64,
    /// 按 vruntime 排序，不含 curr
    pub tasks_timeline: BTreeSet<(u64, EntityId)>,
    pub curr: Option<EntityId>,
    pub next: Option<EntityId>,
    pub last: Option<EntityId>,
    pub skip: Option<EntityId>,
    pub avg: SchedAvg,
    pub removed: Removed,
    /// 上次贡献到组 load_avg 的值
    pub tg_load_avg_contrib: u64,
    pub propagate: bool,
    pub prop_runnable_sum: i64,
    /// 挂在叶子 cfs_rq 列表上（有负载需要衰减）
    pub on_list: bool,
    pub runtime_enabled: bool,
    pub runtime_remaining: i64,
    pub throttled: bool,
    pub throttle_count: u32,
    pub throttled_clock: u64,
    pub throttled_clock_pelt: u64,
    pub throttled_clock_pelt_time: u64,
    pub throttled_clock_task: u64,
    pub throttled_clock_task_time: u64,
}

impl CfsRq {
    pub fn new(tg: GroupId) -> Self {
        Self {
            tg,
            load: LoadWeight::default(),
            nr_running: 0,
            h_nr_running: 0,
            idle_h_nr_running: 0,
            exec_clock: 0,
            min_vruntime: VRUNTIME_ORIGIN,
            tasks_timeline: BTreeSet::new(),
            curr: None,
            next: None,
            last: None,
            skip: None,
            avg: SchedAvg::default(),
            removed: Removed::default(),
            tg_load_avg_contrib: 0,
            propagate: false,
            prop_runnable_sum: 0,
            on_list: false,
            runtime_enabled: false,
            runtime_remaining: 0,
            throttled: false,
            throttle_count: 0,
            throttled_clock: 0,
            throttled_clock_pelt: 0,
            throttled_clock_pelt_time: 0,
            throttled_clock_task: 0,
            throttled_clock_task_time: 0,
        }
    }

    /// vruntime 最小的排队实体
    pub fn first(&self) -> Option<EntityId> {
        self.tasks_timeline.iter().next().map(|&(_, id)| id)
    }

    pub fn second(&self) -> Option<EntityId> {
        self.tasks_timeline.iter().nth(1).map(|&(_, id)| id)
    }

    pub fn last_entity(&self) -> Option<EntityId> {
        self.tasks_timeline.iter().next_back().map(|&(_, id)| id)
    }

    pub fn throttled_hierarchy(&self) -> bool {
        self.throttle_count != 0
    }
}

/// 100 个优先级链表加位图
#[derive(Debug, Clone)]
pub struct RtPrioArray {
    pub bitmap: u128,
    pub queue: Vec<VecDeque<EntityId>>,
}

impl RtPrioArray {
    pub fn new() -> Self {
        Self {
            bitmap: 0,
            queue: (0..MAX_RT_PRIO).map(|_| VecDeque::new()).collect(),
        }
    }

    /// 最高（数值最小）的非空优先级
    pub fn first_prio(&self) -> Option<i32> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as i32)
        }
    }

    pub fn push(&mut self, prio: i32, id: EntityId, head: bool) {
        let q = &mut self.queue[prio as usize];
        if head {
            q.push_front(id);
        } else {
            q.push_back(id);
        }
        self.bitmap |= 1u128 << prio;
    }

    pub fn remove(&mut self, prio: i32, id: EntityId) -> bool {
        let q = &mut self.queue[prio as usize];
        let Some(pos) = q.iter().position(|&e| e == id) else {
            return false;
        };
        q.remove(pos);
        if q.is_empty() {
            self.bitmap &= !(1u128 << prio);
        }
        true
    }

    /// 把 `id` 移到本优先级的队尾（或队首）
    pub fn requeue(&mut self, prio: i32, id: EntityId, head: bool) {
        if self.remove(prio, id) {
            self.push(prio, id, head);
        }
    }

    /// 位图与链表一致
    pub fn check(&self) -> bool {
        (0..MAX_RT_PRIO as usize).all(|p| (self.bitmap >> p) & 1 == (!self.queue[p].is_empty()) as u128)
    }
}

impl Default for RtPrioArray {
    fn default() -> Self {
        Self::new()
    }
}

/// RT 子队列
#[derive(Debug, Clone)]
pub struct RtRq {
    pub tg: GroupId,
    pub active: RtPrioArray,
    pub rt_nr_running: u32,
    pub rr_nr_running: u32,
    pub highest_prio_curr: i32,
    /// 可推送任务中最高的优先级
    pub highest_prio_next: i32,
    pub rt_nr_migratory: u32,
    pub rt_nr_total: u32,
    pub overloaded: bool,
    /// 可推送任务，键为 (prio, 序号, pid)
    pub pushable: BTreeSet<(i32, u64, Pid)>,
    /// 已计入 rq 的 nr_running
    pub rt_queued: bool,
    pub rt_throttled: bool,
    /// 被 PI 提升的实体数，不受节流
    pub rt_nr_boosted: u32,
}

impl RtRq {
    pub fn new(tg: GroupId) -> Self {
        Self {
            tg,
            active: RtPrioArray::new(),
            rt_nr_running: 0,
            rr_nr_running: 0,
            highest_prio_curr: MAX_RT_PRIO - 1,
            highest_prio_next: MAX_RT_PRIO - 1,
            rt_nr_migratory: 0,
            rt_nr_total: 0,
            overloaded: false,
            pushable: BTreeSet::new(),
            rt_queued: false,
            rt_throttled: false,
            rt_nr_boosted: 0,
        }
    }

    pub fn has_pushable_tasks(&self) -> bool {
        !self.pushable.is_empty()
    }
}

/// DL 子队列
#[derive(Debug, Clone)]
pub struct DlRq {
    /// 按绝对截止时间排序
    pub root: BTreeSet<(u64, u64, Pid)>,
    pub dl_nr_running: u32,
    pub earliest_dl_curr: u64,
    pub earliest_dl_next: u64,
    pub dl_nr_migratory: u32,
    pub overloaded: bool,
    pub pushable: BTreeSet<(u64, u64, Pid)>,
    /// 活跃（contending）任务的带宽之和
    pub running_bw: u64,
    /// 本 rq 上所有 DL 任务的带宽之和
    pub this_bw: u64,
    pub extra_bw: u64,
    /// `1 / max_bw` 的倒数，GRUB 使用
    pub bw_ratio: u64,
}

impl DlRq {
    pub fn new() -> Self {
        Self {
            root: BTreeSet::new(),
            dl_nr_running: 0,
            earliest_dl_curr: 0,
            earliest_dl_next: 0,
            dl_nr_migratory: 0,
            overloaded: false,
            pushable: BTreeSet::new(),
            running_bw: 0,
            this_bw: 0,
            extra_bw: 0,
            bw_ratio: 1 << RATIO_SHIFT,
        }
    }

    pub fn leftmost(&self) -> Option<Pid> {
        self.root.iter().next().map(|&(_, _, pid)| pid)
    }
}

impl Default for DlRq {
    fn default() -> Self {
        Self::new()
    }
}

/// 调度统计
#[derive(Debug, Clone, Copy, Default)]
pub struct RqStats {
    pub yld_count: u64,
    pub sched_count: u64,
    pub sched_goidle: u64,
    pub ttwu_count: u64,
    pub ttwu_local: u64,
    pub rq_cpu_time: u64,
    pub run_delay: u64,
    pub pcount: u64,
    /// RT 节流次数
    pub rt_throttled: u64,
}

pub struct Rq {
    pub cpu: usize,
    pub nr_running: u32,
    pub nr_uninterruptible: i64,
    pub nr_switches: u64,

    pub clock: u64,
    pub clock_task: u64,
    pub pelt: PeltClock,
    pub prev_irq_time: u64,
    pub clock_update_flags: u8,

    pub curr: Pid,
    pub idle: Pid,
    /// stop 类任务
    pub stop: Option<Pid>,

    /// 所有 task_cpu 为本 CPU 的任务
    pub tasks: BTreeMap<Pid, SchedTask>,
    /// 按任务组编号索引
    pub cfs: Vec<CfsRq>,
    pub rt: Vec<RtRq>,
    pub dl: DlRq,
    /// 任务组在本 CPU 上的实体，根组为 None
    pub group_se: Vec<Option<SchedEntity>>,
    pub group_rt_se: Vec<Option<SchedRtEntity>>,

    pub cpu_capacity: u64,
    pub cpu_capacity_orig: u64,

    pub avg_rt: SchedAvg,
    pub avg_dl: SchedAvg,
    pub avg_irq: SchedAvg,
    pub avg_thermal: SchedAvg,

    pub rd: Arc<RootDomain>,
    pub online: bool,
    pub balance_callbacks: Vec<BalanceCallback>,

    pub calc_load: RqLoad,
    pub uclamp: RqUclamp,

    pub next_balance: u64,
    pub misfit_task_load: u64,
    pub avg_idle: u64,
    pub max_idle_balance_cost: u64,
    pub idle_stamp: u64,
    pub wake_stamp: u64,
    pub wake_avg_idle: u64,
    /// 正在向外推送当前任务，防止重复触发
    pub push_busy: bool,
    pub active_balance: bool,
    pub push_cpu: usize,
    pub has_blocked_load: bool,
    pub last_blocked_load_update_tick: u64,
    /// 上次进入的 idle 状态
    pub idle_state: Option<usize>,
    pub hrtick_expires: Option<u64>,
    pub stats: RqStats,
    seq: u64,

    pub shared: Arc<PerCpu>,
}

impl Rq {
    pub fn new(cpu: usize, capacity: u64, rd: Arc<RootDomain>, shared: Arc<PerCpu>) -> Self {
        Self {
            cpu,
            nr_running: 0,
            nr_uninterruptible: 0,
            nr_switches: 0,
            clock: 0,
            clock_task: 0,
            pelt: PeltClock::default(),
            prev_irq_time: 0,
            clock_update_flags: 0,
            curr: IDLE_PID,
            idle: IDLE_PID,
            stop: None,
            tasks: BTreeMap::new(),
            cfs: alloc::vec![CfsRq::new(super::ROOT_TASK_GROUP)],
            rt: alloc::vec![RtRq::new(super::ROOT_TASK_GROUP)],
            dl: DlRq::new(),
            group_se: alloc::vec![None],
            group_rt_se: alloc::vec![None],
            cpu_capacity: capacity,
            cpu_capacity_orig: capacity,
            avg_rt: SchedAvg::default(),
            avg_dl: SchedAvg::default(),
            avg_irq: SchedAvg::default(),
            avg_thermal: SchedAvg::default(),
            rd,
            online: false,
            balance_callbacks: Vec::new(),
            calc_load: RqLoad::default(),
            uclamp: RqUclamp::default(),
            next_balance: 0,
            misfit_task_load: 0,
            avg_idle: 2 * crate::config::SCHED_MIGRATION_COST_NS,
            max_idle_balance_cost: crate::config::SCHED_MIGRATION_COST_NS,
            idle_stamp: 0,
            wake_stamp: 0,
            wake_avg_idle: 2 * crate::config::SCHED_MIGRATION_COST_NS,
            push_busy: false,
            active_balance: false,
            push_cpu: cpu,
            has_blocked_load: false,
            last_blocked_load_update_tick: 0,
            idle_state: None,
            hrtick_expires: None,
            stats: RqStats::default(),
            seq: 0,
            shared,
        }
    }

    /// 本 rq 内单调递增的序号，用作排序键的第二分量
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn try_task(&self, pid: Pid) -> Option<&SchedTask> {
        self.tasks.get(&pid)
    }

    #[track_caller]
    pub fn task(&self, pid: Pid) -> &SchedTask {
        match self.tasks.get(&pid) {
            Some(st) => st,
            None => bug(format_args!("CPU{}: task {} not on this rq", self.cpu, pid)),
        }
    }

    #[track_caller]
    pub fn task_mut(&mut self, pid: Pid) -> &mut SchedTask {
        let cpu = self.cpu;
        match self.tasks.get_mut(&pid) {
            Some(st) => st,
            None => bug(format_args!("CPU{}: task {} not on this rq", cpu, pid)),
        }
    }

    #[inline]
    pub fn curr_task(&self) -> &SchedTask {
        self.task(self.curr)
    }

    #[inline]
    pub fn curr_is_idle(&self) -> bool {
        self.curr == self.idle
    }

    #[track_caller]
    pub fn se(&self, id: EntityId) -> &SchedEntity {
        let se = match id {
            EntityId::Task(pid) => self.tasks.get(&pid).map(|st| &st.se),
            EntityId::Group(g) => self.group_se.get(g).and_then(|se| se.as_ref()),
        };
        match se {
            Some(se) => se,
            None => bug(format_args!("CPU{}: no fair entity {:?}", self.cpu, id)),
        }
    }

    #[track_caller]
    pub fn se_mut(&mut self, id: EntityId) -> &mut SchedEntity {
        let cpu = self.cpu;
        let se = match id {
            EntityId::Task(pid) => self.tasks.get_mut(&pid).map(|st| &mut st.se),
            EntityId::Group(g) => self.group_se.get_mut(g).and_then(|se| se.as_mut()),
        };
        match se {
            Some(se) => se,
            None => bug(format_args!("CPU{}: no fair entity {:?}", cpu, id)),
        }
    }

    /// 同时借出实体和它所在的 cfs_rq
    #[track_caller]
    pub fn se_and_cfs(&mut self, id: EntityId) -> (&mut SchedEntity, &mut CfsRq) {
        let cpu = self.cpu;
        let Rq { tasks, group_se, cfs, .. } = self;
        let se = match id {
            EntityId::Task(pid) => tasks.get_mut(&pid).map(|st| &mut st.se),
            EntityId::Group(g) => group_se.get_mut(g).and_then(|se| se.as_mut()),
        };
        let Some(se) = se else {
            bug(format_args!("CPU{}: no fair entity {:?}", cpu, id));
        };
        let q = &mut cfs[se.cfs_rq];
        (se, q)
    }

    #[track_caller]
    pub fn rt_se(&self, id: EntityId) -> &SchedRtEntity {
        let se = match id {
            EntityId::Task(pid) => self.tasks.get(&pid).map(|st| &st.rt),
            EntityId::Group(g) => self.group_rt_se.get(g).and_then(|se| se.as_ref()),
        };
        match se {
            Some(se) => se,
            None => bug(format_args!("CPU{}: no rt entity {:?}", self.cpu, id)),
        }
    }

    #[track_caller]
    pub fn rt_se_mut(&mut self, id: EntityId) -> &mut SchedRtEntity {
        let cpu = self.cpu;
        let se = match id {
            EntityId::Task(pid) => self.tasks.get_mut(&pid).map(|st| &mut st.rt),
            EntityId::Group(g) => self.group_rt_se.get_mut(g).and_then(|se| se.as_mut()),
        };
        match se {
            Some(se) => se,
            None => bug(format_args!("CPU{}: no rt entity {:?}", cpu, id)),
        }
    }

    /// 为新建的任务组分配子队列和组实体
    pub fn add_group(&mut self, tg: GroupId, parent: GroupId, depth: u32) {
        if self.cfs.len() <= tg {
            self.cfs.resize_with(tg + 1, || CfsRq::new(0));
            self.rt.resize_with(tg + 1, || RtRq::new(0));
            self.group_se.resize_with(tg + 1, || None);
            self.group_rt_se.resize_with(tg + 1, || None);
        }
        self.cfs[tg] = CfsRq::new(tg);
        self.rt[tg] = RtRq::new(tg);
        let mut se = SchedEntity::new(parent, Some(tg), depth);
        // 组实体初始时没有负载，以 nice 0 权重开始
        se.avg.load_avg = 0;
        self.group_se[tg] = Some(se);
        self.group_rt_se[tg] = Some(SchedRtEntity::new(parent, Some(tg)));
    }

    pub fn set_nr_running(&mut self, nr: u32) {
        self.nr_running = nr;
        self.shared.nr_running.store(nr, Ordering::Release);
    }

    /// 同步给其他 CPU 看的当前任务信息
    pub fn publish_curr(&self) {
        let prio = self.tasks.get(&self.curr).map_or(super::MAX_PRIO, |st| st.prio);
        self.shared.curr_pid.store(self.curr, Ordering::Release);
        self.shared.curr_idle.store(self.curr_is_idle(), Ordering::Release);
        self.shared.curr_prio.store(prio, Ordering::Release);
    }

    pub fn publish_capacity(&self) {
        self.shared.cpu_capacity.store(self.cpu_capacity, Ordering::Relaxed);
        self.shared.cpu_capacity_orig.store(self.cpu_capacity_orig, Ordering::Relaxed);
    }

    pub fn publish_cfs(&self, util_est: bool) {
        self.shared.cfs_util.store(self.cpu_util_cfs(util_est), Ordering::Relaxed);
        self.shared.cfs_load.store(self.cfs[0].avg.load_avg, Ordering::Relaxed);
    }

    /// 根 cfs_rq 的利用率，util_est 打开时取与 enqueued 估计的较大者
    pub fn cpu_util_cfs(&self, util_est: bool) -> u64 {
        let cfs = &self.cfs[0];
        let mut util = cfs.avg.util_avg;
        if util_est {
            util = util.max(cfs.avg.util_est.enqueued as u64);
        }
        util.min(self.cpu_capacity_orig)
    }

    pub fn cpu_load(&self) -> u64 {
        self.cfs[0].avg.load_avg
    }

    pub fn cpu_runnable(&self) -> u64 {
        self.cfs[0].avg.runnable_avg
    }

    /// 估算能耗用的快照
    pub fn util_snapshot(&self) -> CpuUtilSnapshot {
        CpuUtilSnapshot {
            cpu: self.cpu,
            util_cfs: self.cfs[0].avg.util_avg,
            util_est_enqueued: self.cfs[0].avg.util_est.enqueued as u64,
            util_rt: self.avg_rt.util_avg,
            util_dl: self.avg_dl.util_avg,
            util_irq: self.avg_irq.util_avg,
            running_bw: self.dl.running_bw,
            thermal: self.shared.thermal_pressure.load(Ordering::Relaxed),
            capacity: self.cpu_capacity,
            capacity_orig: self.cpu_capacity_orig,
            uclamp: self.uclamp,
        }
    }

    /// 各类子队列计数之和，用于一致性检查
    pub fn class_nr_running(&self) -> u32 {
        let cfs = self.cfs[0].h_nr_running;
        let rt = if self.rt[0].rt_queued { self.rt[0].rt_nr_running } else { 0 };
        let dl = self.dl.dl_nr_running;
        let stop = self.stop.map_or(0, |pid| {
            let st = self.task(pid);
            (st.task.on_rq() == crate::process::OnRq::Queued) as u32
        });
        cfs + rt + dl + stop
    }

    pub fn rt_overloaded_here(&self) -> bool {
        self.rt[0].overloaded
    }

    /// RT 子队列上最高的优先级，没有则为 `MAX_RT_PRIO`
    pub fn rt_highest_prio(&self) -> i32 {
        if self.rt[0].rt_nr_running == 0 {
            MAX_RT_PRIO
        } else {
            self.rt[0].highest_prio_curr
        }
    }

    pub fn has_dl(&self) -> bool {
        self.dl.dl_nr_running > 0
    }

    /// 有效优先级在 DL 范围内
    pub fn curr_is_dl(&self) -> bool {
        self.tasks.get(&self.curr).is_some_and(|st| st.prio < MAX_DL_PRIO)
    }

    pub fn queue_balance_callback(&mut self, cb: BalanceCallback) {
        if !self.balance_callbacks.contains(&cb) {
            self.balance_callbacks.push(cb);
        }
    }

    /// 不在任何子队列中的任务（睡眠或新建）
    pub fn sleeping_tasks(&self) -> impl Iterator<Item = &SchedTask> {
        self.tasks.values().filter(|st| st.task.on_rq() == crate::process::OnRq::None)
    }

    pub fn span_mask(&self) -> CpuMask {
        self.rd.span()
    }
}

impl core::fmt::Debug for Rq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rq")
            .field("cpu", &self.cpu)
            .field("nr_running", &self.nr_running)
            .field("curr", &self.curr)
            .field("clock", &self.clock)
            .field("cfs.h_nr_running", &self.cfs[0].h_nr_running)
            .field("rt.rt_nr_running", &self.rt[0].rt_nr_running)
            .field("dl.dl_nr_running", &self.dl.dl_nr_running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prio_array_bitmap_tracks_lists() {
        let mut a = RtPrioArray::new();
        a.push(49, EntityId::Task(1), false);
        a.push(49, EntityId::Task(2), false);
        a.push(10, EntityId::Task(3), false);
        assert_eq!(a.first_prio(), Some(10));
        assert!(a.remove(10, EntityId::Task(3)));
        assert_eq!(a.first_prio(), Some(49));
        a.requeue(49, EntityId::Task(1), false);
        assert_eq!(a.queue[49].front(), Some(&EntityId::Task(2)));
        a.push(49, EntityId::Task(4), true);
        assert_eq!(a.queue[49].front(), Some(&EntityId::Task(4)));
        assert!(!a.remove(3, EntityId::Task(4)));
        assert!(a.check());
    }

    #[test]
    fn timeline_orders_by_vruntime_then_id() {
        let mut q = CfsRq::new(0);
        q.tasks_timeline.insert((300, EntityId::Task(1)));
        q.tasks_timeline.insert((100, EntityId::Task(2)));
        q.tasks_timeline.insert((100, EntityId::Group(3)));
        assert_eq!(q.first(), Some(EntityId::Task(2)));
        assert_eq!(q.second(), Some(EntityId::Group(3)));
        assert_eq!(q.last_entity(), Some(EntityId::Task(1)));
    }

    #[test]
    fn idle_cpu_reads_shadow_state() {
        let pc = PerCpu::new(0, 1024);
        assert!(pc.idle_cpu());
        pc.ttwu_pending.store(1, Ordering::Relaxed);
        assert!(!pc.idle_cpu());
        pc.ttwu_pending.store(0, Ordering::Relaxed);
        pc.nr_running.store(1, Ordering::Relaxed);
        assert!(!pc.idle_cpu());
    }
}
