//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度类分发
//!
//! 五个调度类按抢占优先级排列：stop > deadline > rt > fair > idle。
//! 每个类的实现是 `Scheduler` 上的一组方法，分布在 `stop.rs`、
//! `deadline.rs`、`rt.rs`、`fair.rs`、`idle.rs` 中；这里的枚举按类
//! 把调用转发过去。

use super::core::Scheduler;
use super::rq::{Rq, RqGuard};
use super::{bug, DequeueFlags, EnqueueFlags, WakeFlags};
use crate::cpumask::CpuMask;
use crate::process::{Pid, SchedPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedClass {
    Stop,
    Dl,
    Rt,
    Fair,
    Idle,
}

/// 放置决策需要的任务信息
///
/// 放置路径不持有任务所在 rq 的锁，先在锁内拍下快照再计算。
#[derive(Debug, Clone, Copy)]
pub struct TaskSnapshot {
    pub pid: Pid,
    pub cpu: usize,
    pub class: SchedClass,
    pub policy: SchedPolicy,
    pub prio: i32,
    pub cpus_mask: CpuMask,
    pub nr_cpus_allowed: u32,
    pub migration_disabled: bool,
    pub util: u64,
    pub util_est: u64,
    pub uclamp_min: u32,
    pub uclamp_max: u32,
    pub load_avg: u64,
    /// 绝对截止时间
    pub dl_deadline: u64,
    /// 相对截止时间
    pub dl_rel_deadline: u64,
    pub dl_runtime: u64,
    pub dl_bw: u64,
    pub wakee_flips: u32,
    pub recent_used_cpu: usize,
    pub is_kthread: bool,
}

impl SchedClass {
    /// 按优先级从高到低
    pub const ALL: [SchedClass; 5] = [SchedClass::Stop, SchedClass::Dl, SchedClass::Rt, SchedClass::Fair, SchedClass::Idle];

    pub fn name(self) -> &'static str {
        match self {
            SchedClass::Stop => "stop",
            SchedClass::Dl => "dl",
            SchedClass::Rt => "rt",
            SchedClass::Fair => "fair",
            SchedClass::Idle => "idle",
        }
    }

    /// `self` 比 `other` 优先
    #[inline]
    pub fn above(self, other: SchedClass) -> bool {
        self < other
    }

    pub fn enqueue_task(self, s: &Scheduler, rq: &mut Rq, pid: Pid, flags: EnqueueFlags) {
        match self {
            SchedClass::Stop => s.enqueue_task_stop(rq, pid, flags),
            SchedClass::Dl => s.enqueue_task_dl(rq, pid, flags),
            SchedClass::Rt => s.enqueue_task_rt(rq, pid, flags),
            SchedClass::Fair => s.enqueue_task_fair(rq, pid, flags),
            SchedClass::Idle => bug(format_args!("CPU{}: enqueue of idle task {}", rq.cpu, pid)),
        }
    }

    pub fn dequeue_task(self, s: &Scheduler, rq: &mut Rq, pid: Pid, flags: DequeueFlags) {
        match self {
            SchedClass::Stop => s.dequeue_task_stop(rq, pid, flags),
            SchedClass::Dl => s.dequeue_task_dl(rq, pid, flags),
            SchedClass::Rt => s.dequeue_task_rt(rq, pid, flags),
            SchedClass::Fair => s.dequeue_task_fair(rq, pid, flags),
            SchedClass::Idle => s.dequeue_task_idle(rq, pid),
        }
    }

    pub fn yield_task(self, s: &Scheduler, rq: &mut Rq) {
        match self {
            SchedClass::Dl => s.yield_task_dl(rq),
            SchedClass::Rt => s.yield_task_rt(rq),
            SchedClass::Fair => s.yield_task_fair(rq),
            SchedClass::Stop | SchedClass::Idle => {}
        }
    }

    /// 同类任务之间的唤醒抢占检查；跨类由 `check_preempt_curr` 处理
    pub fn check_preempt_curr(self, s: &Scheduler, rq: &mut Rq, pid: Pid, wf: WakeFlags) {
        match self {
            SchedClass::Dl => s.check_preempt_curr_dl(rq, pid, wf),
            SchedClass::Rt => s.check_preempt_curr_rt(rq, pid, wf),
            SchedClass::Fair => s.check_preempt_wakeup(rq, pid, wf),
            SchedClass::Idle => s.resched_curr(rq),
            SchedClass::Stop => {}
        }
    }

    /// 只选出任务，不改变任何状态
    pub fn pick_task(self, s: &Scheduler, rq: &mut Rq) -> Option<Pid> {
        match self {
            SchedClass::Stop => s.pick_task_stop(rq),
            SchedClass::Dl => s.pick_task_dl(rq),
            SchedClass::Rt => s.pick_task_rt(rq),
            SchedClass::Fair => s.pick_task_fair(rq),
            SchedClass::Idle => Some(rq.idle),
        }
    }

    /// 选出任务并把它设为该类的当前任务
    pub fn pick_next_task(self, s: &Scheduler, rq: &mut Rq) -> Option<Pid> {
        match self {
            SchedClass::Fair => s.pick_next_task_fair(rq),
            _ => {
                let pid = self.pick_task(s, rq)?;
                self.set_next_task(s, rq, pid, true);
                Some(pid)
            }
        }
    }

    pub fn put_prev_task(self, s: &Scheduler, rq: &mut Rq, pid: Pid) {
        match self {
            SchedClass::Stop => s.put_prev_task_stop(rq, pid),
            SchedClass::Dl => s.put_prev_task_dl(rq, pid),
            SchedClass::Rt => s.put_prev_task_rt(rq, pid),
            SchedClass::Fair => s.put_prev_task_fair(rq, pid),
            SchedClass::Idle => s.put_prev_task_idle(rq, pid),
        }
    }

    pub fn set_next_task(self, s: &Scheduler, rq: &mut Rq, pid: Pid, first: bool) {
        match self {
            SchedClass::Stop => s.set_next_task_stop(rq, pid, first),
            SchedClass::Dl => s.set_next_task_dl(rq, pid, first),
            SchedClass::Rt => s.set_next_task_rt(rq, pid, first),
            SchedClass::Fair => s.set_next_task_fair(rq, pid, first),
            SchedClass::Idle => s.set_next_task_idle(rq, pid, first),
        }
    }

    pub fn task_tick(self, s: &Scheduler, rq: &mut Rq, pid: Pid, queued: bool) {
        match self {
            SchedClass::Stop => {}
            SchedClass::Dl => s.task_tick_dl(rq, pid, queued),
            SchedClass::Rt => s.task_tick_rt(rq, pid, queued),
            SchedClass::Fair => s.task_tick_fair(rq, pid, queued),
            SchedClass::Idle => {}
        }
    }

    pub fn task_fork(self, s: &Scheduler, rq: &mut Rq, pid: Pid) {
        match self {
            SchedClass::Dl => s.task_fork_dl(rq, pid),
            SchedClass::Fair => s.task_fork_fair(rq, pid),
            _ => {}
        }
    }

    pub fn task_dead(self, s: &Scheduler, rq: &mut Rq, pid: Pid) {
        match self {
            SchedClass::Dl => s.task_dead_dl(rq, pid),
            SchedClass::Fair => s.task_dead_fair(rq, pid),
            _ => {}
        }
    }

    pub fn prio_changed(self, s: &Scheduler, rq: &mut Rq, pid: Pid, oldprio: i32) {
        match self {
            SchedClass::Dl => s.prio_changed_dl(rq, pid, oldprio),
            SchedClass::Rt => s.prio_changed_rt(rq, pid, oldprio),
            SchedClass::Fair => s.prio_changed_fair(rq, pid, oldprio),
            SchedClass::Stop | SchedClass::Idle => {}
        }
    }

    pub fn switched_from(self, s: &Scheduler, rq: &mut Rq, pid: Pid) {
        match self {
            SchedClass::Dl => s.switched_from_dl(rq, pid),
            SchedClass::Rt => s.switched_from_rt(rq, pid),
            SchedClass::Fair => s.switched_from_fair(rq, pid),
            SchedClass::Stop | SchedClass::Idle => {}
        }
    }

    pub fn switched_to(self, s: &Scheduler, rq: &mut Rq, pid: Pid) {
        match self {
            SchedClass::Dl => s.switched_to_dl(rq, pid),
            SchedClass::Rt => s.switched_to_rt(rq, pid),
            SchedClass::Fair => s.switched_to_fair(rq, pid),
            SchedClass::Stop | SchedClass::Idle => {}
        }
    }

    pub fn update_curr(self, s: &Scheduler, rq: &mut Rq) {
        match self {
            SchedClass::Stop => s.update_curr_stop(rq),
            SchedClass::Dl => s.update_curr_dl(rq),
            SchedClass::Rt => s.update_curr_rt(rq),
            SchedClass::Fair => s.update_curr_fair(rq),
            SchedClass::Idle => {}
        }
    }

    /// 挑选下一个任务前的均衡，可能暂时释放 rq 锁
    ///
    /// 返回 true 表示本类或更高的类已经有任务可运行。
    pub fn balance<'a>(self, s: &'a Scheduler, rq: RqGuard<'a>, prev: Pid) -> (RqGuard<'a>, bool) {
        match self {
            SchedClass::Stop => {
                let has = s.balance_stop(&rq);
                (rq, has)
            }
            SchedClass::Dl => s.balance_dl(rq, prev),
            SchedClass::Rt => s.balance_rt(rq, prev),
            SchedClass::Fair => s.balance_fair(rq, prev),
            SchedClass::Idle => (rq, true),
        }
    }

    /// 为唤醒、fork 选择 CPU，调用方不持有任何 rq 锁
    pub fn select_task_rq(self, s: &Scheduler, p: &TaskSnapshot, prev_cpu: usize, wf: WakeFlags) -> usize {
        match self {
            SchedClass::Dl => s.select_task_rq_dl(p, prev_cpu, wf),
            SchedClass::Rt => s.select_task_rq_rt(p, prev_cpu, wf),
            SchedClass::Fair => s.select_task_rq_fair(p, prev_cpu, wf),
            SchedClass::Stop | SchedClass::Idle => p.cpu,
        }
    }

    /// 任务即将离开 `rq`，迁往 `new_cpu`
    pub fn migrate_task_rq(self, s: &Scheduler, rq: &mut Rq, pid: Pid, new_cpu: usize) {
        match self {
            SchedClass::Dl => s.migrate_task_rq_dl(rq, pid, new_cpu),
            SchedClass::Fair => s.migrate_task_rq_fair(rq, pid, new_cpu),
            _ => {}
        }
    }

    pub fn set_cpus_allowed(self, s: &Scheduler, rq: &mut Rq, pid: Pid, mask: CpuMask) {
        match self {
            SchedClass::Dl => s.set_cpus_allowed_dl(rq, pid, mask),
            _ => s.set_cpus_allowed_common(rq, pid, mask),
        }
    }

    pub fn task_woken(self, s: &Scheduler, rq: &mut Rq, pid: Pid) {
        match self {
            SchedClass::Dl => s.task_woken_dl(rq, pid),
            SchedClass::Rt => s.task_woken_rt(rq, pid),
            _ => {}
        }
    }

    pub fn rq_online(self, s: &Scheduler, rq: &mut Rq) {
        match self {
            SchedClass::Dl => s.rq_online_dl(rq),
            SchedClass::Rt => s.rq_online_rt(rq),
            SchedClass::Fair => s.rq_online_fair(rq),
            _ => {}
        }
    }

    pub fn rq_offline(self, s: &Scheduler, rq: &mut Rq) {
        match self {
            SchedClass::Dl => s.rq_offline_dl(rq),
            SchedClass::Rt => s.rq_offline_rt(rq),
            SchedClass::Fair => s.rq_offline_fair(rq),
            _ => {}
        }
    }

    /// sched_rr_get_interval 的返回值，纳秒
    pub fn get_rr_interval(self, s: &Scheduler, rq: &Rq, pid: Pid) -> u64 {
        match self {
            SchedClass::Rt => s.get_rr_interval_rt(rq, pid),
            SchedClass::Fair => s.get_rr_interval_fair(rq, pid),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_order() {
        assert!(SchedClass::Stop.above(SchedClass::Dl));
        assert!(SchedClass::Dl.above(SchedClass::Rt));
        assert!(SchedClass::Rt.above(SchedClass::Fair));
        assert!(SchedClass::Fair.above(SchedClass::Idle));
        assert!(!SchedClass::Fair.above(SchedClass::Fair));
        let names: alloc::vec::Vec<_> = SchedClass::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(names, ["stop", "dl", "rt", "fair", "idle"]);
    }
}
