//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度实体
//!
//! [`SchedTask`] 是任务在调度器内的全部状态，存放在任务所在 CPU 的
//! rq 里，受该 rq 锁保护；跨 CPU 可见的部分（状态、on_rq、on_cpu）
//! 留在 [`Task`] 上。每个任务内嵌三类实体：fair 的 [`SchedEntity`]、
//! RT 的 [`SchedRtEntity`] 和 DL 的 [`SchedDlEntity`]，任务组在每个 CPU
//! 上也各有一个 fair/RT 实体，二者由 [`EntityId`] 统一索引。

use alloc::sync::{Arc, Weak};

use bitflags::bitflags;

use super::class::SchedClass;
use super::fixedpt::{LoadWeight, SCHED_CAPACITY_SCALE};
use super::group::{GroupId, ROOT_TASK_GROUP};
use super::pelt::SchedAvg;
use super::uclamp::{uclamp_none, UclampId, UclampSe};
use super::{prio_to_nice, DEFAULT_PRIO, MAX_DL_PRIO, MAX_PRIO, MAX_RT_PRIO};
use crate::cpumask::CpuMask;
use crate::process::{Pid, SchedPolicy, Task};

/// 任务或任务组在某个 CPU 上的实体
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityId {
    Task(Pid),
    Group(GroupId),
}

impl EntityId {
    pub fn is_task(self) -> bool {
        matches!(self, EntityId::Task(_))
    }
}

bitflags! {
    /// sched_setattr 的 flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SchedAttrFlags: u64 {
        const RESET_ON_FORK = 0x01;
        /// GRUB 回收
        const RECLAIM = 0x02;
        /// 超支时发信号
        const DL_OVERRUN = 0x04;
        const KEEP_POLICY = 0x08;
        const KEEP_PARAMS = 0x10;
        const UTIL_CLAMP_MIN = 0x20;
        const UTIL_CLAMP_MAX = 0x40;
    }
}

impl SchedAttrFlags {
    pub const KEEP_ALL: Self = Self::KEEP_POLICY.union(Self::KEEP_PARAMS);
    pub const UTIL_CLAMP: Self = Self::UTIL_CLAMP_MIN.union(Self::UTIL_CLAMP_MAX);
    /// 会保存在 DL 实体上的标志
    pub const DL_MASK: Self = Self::RECLAIM.union(Self::DL_OVERRUN);
}

/// util_min/util_max 取此值表示恢复系统默认
pub const UCLAMP_RESET: u32 = u32::MAX;

/// sched_setattr/sched_getattr 的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedAttr {
    pub policy: SchedPolicy,
    pub flags: SchedAttrFlags,
    pub nice: i32,
    pub rt_priority: u32,
    /// DL 参数，纳秒
    pub runtime: u64,
    pub deadline: u64,
    pub period: u64,
    pub util_min: u32,
    pub util_max: u32,
}

impl SchedAttr {
    pub fn normal(nice: i32) -> Self {
        Self {
            policy: SchedPolicy::Normal,
            flags: SchedAttrFlags::empty(),
            nice,
            rt_priority: 0,
            runtime: 0,
            deadline: 0,
            period: 0,
            util_min: 0,
            util_max: SCHED_CAPACITY_SCALE as u32,
        }
    }

    pub fn rt(policy: SchedPolicy, rt_priority: u32) -> Self {
        Self {
            policy,
            rt_priority,
            ..Self::normal(0)
        }
    }

    /// `period` 为 0 时与 `deadline` 相同
    pub fn deadline(runtime: u64, deadline: u64, period: u64) -> Self {
        Self {
            policy: SchedPolicy::Deadline,
            runtime,
            deadline,
            period,
            ..Self::normal(0)
        }
    }

    pub fn with_flags(mut self, flags: SchedAttrFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_uclamp(mut self, min: u32, max: u32) -> Self {
        self.flags |= SchedAttrFlags::UTIL_CLAMP;
        self.util_min = min;
        self.util_max = max;
        self
    }
}

/// 调度统计
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedStatistics {
    pub wait_start: u64,
    pub wait_max: u64,
    pub wait_count: u64,
    pub wait_sum: u64,
    pub exec_max: u64,
    pub nr_migrations_cold: u64,
    pub nr_forced_migrations: u64,
    pub nr_wakeups: u64,
    pub nr_wakeups_sync: u64,
    pub nr_wakeups_migrate: u64,
    pub nr_wakeups_local: u64,
    pub nr_wakeups_remote: u64,
}

/// fair 实体
#[derive(Debug, Clone)]
pub struct SchedEntity {
    pub load: LoadWeight,
    /// 组实体为下层 cfs_rq 的 h_nr_running，任务实体为 1
    pub runnable_weight: u64,
    pub on_rq: bool,
    pub exec_start: u64,
    pub sum_exec_runtime: u64,
    pub prev_sum_exec_runtime: u64,
    pub vruntime: u64,
    pub nr_migrations: u64,
    pub depth: u32,
    /// 所在的 cfs_rq（按任务组编号）
    pub cfs_rq: GroupId,
    /// 组实体拥有的 cfs_rq
    pub my_q: Option<GroupId>,
    pub avg: SchedAvg,
    pub statistics: SchedStatistics,
}

impl SchedEntity {
    pub fn new(cfs_rq: GroupId, my_q: Option<GroupId>, depth: u32) -> Self {
        Self {
            load: LoadWeight::nice_0(),
            runnable_weight: 1,
            on_rq: false,
            exec_start: 0,
            sum_exec_runtime: 0,
            prev_sum_exec_runtime: 0,
            vruntime: 0,
            nr_migrations: 0,
            depth,
            cfs_rq,
            my_q,
            avg: SchedAvg::default(),
            statistics: SchedStatistics::default(),
        }
    }

    /// 上层组实体
    pub fn parent(&self) -> Option<EntityId> {
        if self.cfs_rq == ROOT_TASK_GROUP {
            None
        } else {
            Some(EntityId::Group(self.cfs_rq))
        }
    }

    #[inline]
    pub fn weight(&self) -> u64 {
        self.load.weight
    }
}

/// RT 实体
#[derive(Debug, Clone)]
pub struct SchedRtEntity {
    pub timeout: u64,
    pub watchdog_stamp: u64,
    /// 剩余时间片，tick
    pub time_slice: u32,
    pub on_rq: bool,
    /// 是否挂在优先级数组中
    pub on_list: bool,
    pub rt_rq: GroupId,
    pub my_q: Option<GroupId>,
}

impl SchedRtEntity {
    pub fn new(rt_rq: GroupId, my_q: Option<GroupId>) -> Self {
        Self {
            timeout: 0,
            watchdog_stamp: 0,
            time_slice: super::RR_TIMESLICE,
            on_rq: false,
            on_list: false,
            rt_rq,
            my_q,
        }
    }

    pub fn parent(&self) -> Option<EntityId> {
        if self.rt_rq == ROOT_TASK_GROUP {
            None
        } else {
            Some(EntityId::Group(self.rt_rq))
        }
    }
}

/// DL 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlParams {
    pub dl_runtime: u64,
    pub dl_deadline: u64,
    pub dl_period: u64,
    /// runtime/period，BW_SHIFT 定点
    pub dl_bw: u64,
    /// runtime/deadline
    pub dl_density: u64,
}

impl DlParams {
    pub fn new(runtime: u64, deadline: u64, period: u64) -> Self {
        let period = if period == 0 { deadline } else { period };
        Self {
            dl_runtime: runtime,
            dl_deadline: deadline,
            dl_period: period,
            dl_bw: super::fixedpt::to_ratio(period, runtime),
            dl_density: super::fixedpt::to_ratio(deadline, runtime),
        }
    }
}

/// PI 捐赠者
///
/// 只保存弱引用和参数快照，捐赠者可以在被继承期间退出。
#[derive(Debug, Clone)]
pub struct PiDonor {
    pub pid: Pid,
    pub task: Weak<Task>,
    pub prio: i32,
    pub dl: DlParams,
}

impl PiDonor {
    pub fn alive(&self) -> bool {
        self.task.strong_count() > 0
    }
}

/// DL 实体
#[derive(Debug, Clone, Default)]
pub struct SchedDlEntity {
    pub params: DlParams,
    /// 剩余预算，可能为负
    pub runtime: i64,
    /// 绝对截止时间
    pub deadline: u64,
    pub flags: SchedAttrFlags,
    pub dl_throttled: bool,
    pub dl_yielded: bool,
    pub dl_non_contending: bool,
    pub dl_overrun: bool,
    /// 已计入 rq 的红黑树
    pub on_rq: bool,
    /// 红黑树键
    pub tree_key: Option<(u64, u64)>,
    /// 被 DL 捐赠者继承时使用其参数
    pub pi_se: Option<PiDonor>,
}

impl SchedDlEntity {
    /// 生效的参数：被继承时取捐赠者的
    pub fn pi_params(&self) -> DlParams {
        match &self.pi_se {
            Some(d) if d.alive() => d.dl,
            _ => self.params,
        }
    }

    pub fn is_boosted(&self) -> bool {
        self.pi_se.as_ref().is_some_and(|d| d.alive())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 调度器内的任务状态
#[derive(Debug, Clone)]
pub struct SchedTask {
    pub task: Arc<Task>,
    pub policy: SchedPolicy,
    pub static_prio: i32,
    pub normal_prio: i32,
    /// 有效优先级，可能被 PI 提升
    pub prio: i32,
    pub rt_priority: u32,
    pub class: SchedClass,
    pub se: SchedEntity,
    pub rt: SchedRtEntity,
    pub dl: SchedDlEntity,
    pub group: GroupId,
    /// `Task::pi_lock` 中 cpus_mask 的副本
    pub cpus_mask: CpuMask,
    pub nr_cpus_allowed: u32,
    pub migration_disabled: u32,
    pub uclamp_req: [UclampSe; 2],
    pub uclamp: [UclampSe; 2],
    pub sched_reset_on_fork: bool,
    /// rt_mutex 最高优先级等待者
    pub pi_top: Option<PiDonor>,
    pub in_iowait: bool,
    pub sched_contributes_to_load: bool,
    /// 在 pushable 列表中的键
    pub pushable: Option<(i32, u64)>,
    pub pushable_dl: Option<(u64, u64)>,
    pub last_wakee: Pid,
    pub wakee_flips: u32,
    pub wakee_flip_decay_ts: u64,
    pub recent_used_cpu: usize,
    /// sched_info：就绪等待总时长、运行次数
    pub run_delay: u64,
    pub pcount: u64,
    pub last_queued: u64,
    pub last_arrival: u64,
}

impl SchedTask {
    pub fn new(task: Arc<Task>, group: GroupId, depth: u32) -> Self {
        let cpus_mask = task.cpus_mask();
        let cpu = task.task_cpu();
        Self {
            task,
            policy: SchedPolicy::Normal,
            static_prio: DEFAULT_PRIO,
            normal_prio: DEFAULT_PRIO,
            prio: DEFAULT_PRIO,
            rt_priority: 0,
            class: SchedClass::Fair,
            se: SchedEntity::new(group, None, depth),
            rt: SchedRtEntity::new(if crate::config::RT_GROUP_SCHED { group } else { ROOT_TASK_GROUP }, None),
            dl: SchedDlEntity::default(),
            group,
            cpus_mask,
            nr_cpus_allowed: cpus_mask.weight() as u32,
            migration_disabled: 0,
            uclamp_req: [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)],
            uclamp: [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)],
            sched_reset_on_fork: false,
            pi_top: None,
            in_iowait: false,
            sched_contributes_to_load: false,
            pushable: None,
            pushable_dl: None,
            last_wakee: 0,
            wakee_flips: 0,
            wakee_flip_decay_ts: 0,
            recent_used_cpu: cpu,
            run_delay: 0,
            pcount: 0,
            last_queued: 0,
            last_arrival: 0,
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.task.pid()
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.task.task_cpu()
    }

    pub fn nice(&self) -> i32 {
        prio_to_nice(self.static_prio)
    }

    /// 不考虑 PI 的优先级
    pub fn calc_normal_prio(&self) -> i32 {
        match self.policy {
            SchedPolicy::Deadline => MAX_DL_PRIO - 1,
            SchedPolicy::Fifo | SchedPolicy::Rr => MAX_RT_PRIO - 1 - self.rt_priority as i32,
            _ => self.static_prio,
        }
    }

    /// 考虑 PI 捐赠者后的有效优先级
    pub fn calc_effective_prio(&self) -> i32 {
        let normal = self.calc_normal_prio();
        match &self.pi_top {
            Some(d) if d.alive() && d.prio < normal => d.prio,
            _ => normal,
        }
    }

    /// 按优先级选调度类
    pub fn class_for_prio(&self) -> SchedClass {
        if self.class == SchedClass::Stop || (self.class == SchedClass::Idle && self.task.is_idle_task()) {
            return self.class;
        }
        if super::dl_prio(self.prio) {
            SchedClass::Dl
        } else if super::rt_prio(self.prio) {
            SchedClass::Rt
        } else {
            SchedClass::Fair
        }
    }

    pub fn set_load_weight(&mut self) {
        self.se.load = if self.policy == SchedPolicy::Idle {
            LoadWeight::idle_prio()
        } else {
            LoadWeight::from_nice(self.nice())
        };
    }

    #[inline]
    pub fn task_util(&self) -> u64 {
        self.se.avg.util_avg
    }

    /// util_est 与 util_avg 的较大者
    pub fn task_util_est(&self, util_est: bool) -> u64 {
        if util_est {
            self.se.avg.util_avg.max(self.se.avg.util_est.value())
        } else {
            self.se.avg.util_avg
        }
    }

    #[inline]
    pub fn uclamp_eff_value(&self, id: UclampId) -> u32 {
        if self.uclamp[id as usize].active {
            self.uclamp[id as usize].value
        } else {
            self.uclamp_req[id as usize].value
        }
    }

    /// 钳制后的任务利用率
    pub fn uclamp_task_util(&self, util_est: bool) -> u64 {
        let min = self.uclamp_eff_value(UclampId::Min) as u64;
        let max = self.uclamp_eff_value(UclampId::Max) as u64;
        self.task_util_est(util_est).clamp(min, max.max(min))
    }

    pub fn is_rt_policy(&self) -> bool {
        self.policy.is_rt()
    }

    pub fn reset_uclamp(&mut self) {
        for id in super::uclamp::UCLAMP_IDS {
            if self.uclamp_req[id as usize].user_defined {
                continue;
            }
            self.uclamp_req[id as usize] = UclampSe::new(uclamp_none(id), false);
        }
    }

    /// 是否可以被迁移
    pub fn can_migrate(&self) -> bool {
        self.migration_disabled == 0 && self.nr_cpus_allowed > 1
    }
}

/// 合法的 fair 优先级
pub fn valid_fair_prio(prio: i32) -> bool {
    (MAX_RT_PRIO..MAX_PRIO).contains(&prio)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(pid: Pid) -> Arc<Task> {
        Arc::new(Task::new(pid, pid, "t", 0, CpuMask::first_n(4), 0))
    }

    #[test]
    fn prio_views() {
        let mut st = SchedTask::new(task(10), ROOT_TASK_GROUP, 0);
        assert_eq!(st.calc_normal_prio(), 120);
        st.policy = SchedPolicy::Fifo;
        st.rt_priority = 50;
        assert_eq!(st.calc_normal_prio(), 49);
        st.policy = SchedPolicy::Deadline;
        assert_eq!(st.calc_normal_prio(), -1);
        assert_eq!(st.nr_cpus_allowed, 4);
    }

    #[test]
    fn pi_donor_is_weak() {
        let donor = task(11);
        let mut st = SchedTask::new(task(12), ROOT_TASK_GROUP, 0);
        st.pi_top = Some(PiDonor {
            pid: 11,
            task: Arc::downgrade(&donor),
            prio: 10,
            dl: DlParams::default(),
        });
        assert_eq!(st.calc_effective_prio(), 10);
        drop(donor);
        assert_eq!(st.calc_effective_prio(), 120);
    }

    #[test]
    fn dl_params_default_period() {
        let p = DlParams::new(10, 100, 0);
        assert_eq!(p.dl_period, 100);
        assert_eq!(p.dl_bw, p.dl_density);
    }
}
