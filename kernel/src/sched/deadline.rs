//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! deadline 调度类（SCHED_DEADLINE）
//!
//! 最早截止时间优先（EDF）加常量带宽服务器（CBS）。任务带有
//! `{runtime, deadline, period}`，运行时扣减预算，预算耗尽后被节流，
//! 到下一个周期起点由补充定时器放回队列。
//!
//! 带宽分三层记账：
//! - 根域 `dl_bw.total_bw`：准入控制，进入 DL 时加入，离开或退出时归还；
//! - rq 的 `this_bw`：挂在本 CPU 上的全部 DL 任务；
//! - rq 的 `running_bw`：其中活跃的部分。任务睡眠后不立即移出，
//!   等到 0-lag 时刻由 inactive 定时器移出（GRUB）。
//!
//! 负载分布与 RT 相同：同一 CPU 上有多个可迁移的 DL 任务时进入
//! dlo_mask，截止时间较晚的任务被推给空闲或截止时间更晚的 CPU。

use core::sync::atomic::{AtomicU64, Ordering};

use super::class::{SchedClass, TaskSnapshot};
use super::core::Scheduler;
use super::cpudl::dl_time_before;
use super::entity::{DlParams, SchedAttr, SchedAttrFlags, SchedTask};
use super::features::SchedFeatures;
use super::fixedpt::{cap_scale, to_ratio, BW_SHIFT, BW_UNIT, RUNTIME_INF};
use super::group::NSEC_PER_USEC;
use super::hrtimer::{HrtimerRestart, TimerEvent};
use super::pelt::update_rq_avg;
use super::root_domain::{global_dl_bw, RootDomain};
use super::rq::{BalanceCallback, Rq, RqGuard};
use super::stop::StopWork;
use super::topology::SdFlags;
use super::{dl_prio, DequeueFlags, EnqueueFlags, WakeFlags, MAX_RT_PRIO};
use crate::cpumask::CpuMask;
use crate::errno::{SchedError, SchedResult};
use crate::process::{OnRq, Pid, TaskState};
use crate::sched_bug_on;

/// GRUB 中 `bw_ratio` 的定点位数
pub const RATIO_SHIFT: u32 = 8;

/// runtime 至少 2^DL_SCALE ns
const DL_SCALE: u32 = 10;

const DL_MAX_TRIES: usize = 3;

const DL_PERIOD_MIN: u64 = 100 * NSEC_PER_USEC;
const DL_PERIOD_MAX: u64 = (1 << 22) * NSEC_PER_USEC;

/// 遍历根域时的去重代数
static DL_GENERATION: AtomicU64 = AtomicU64::new(0);

#[inline]
fn dl_task(st: &SchedTask) -> bool {
    dl_prio(st.prio)
}

/// 下一个周期的起点
fn dl_next_period(st: &SchedTask) -> u64 {
    let pi = st.dl.pi_params();
    st.dl.deadline.wrapping_sub(pi.dl_deadline).wrapping_add(pi.dl_period)
}

/// 按剩余预算跑到截止时间会不会超出预留带宽
///
/// 即 `runtime / (deadline - t) > dl_runtime / dl_deadline`，交叉相乘避免除法。
fn dl_entity_overflow(st: &SchedTask, t: u64) -> bool {
    let pi = st.dl.pi_params();
    let left = pi.dl_deadline as u128 * st.dl.runtime.max(0) as u128;
    let right = st.dl.deadline.saturating_sub(t) as u128 * pi.dl_runtime as u128;
    right < left
}

fn dl_task_fits_capacity(p: &TaskSnapshot, cap: u64) -> bool {
    cap_scale(p.dl_rel_deadline, cap) >= p.dl_runtime
}

/// 清掉 DL 参数，保留 PI 捐赠者
fn dl_clear_params(st: &mut SchedTask) {
    let pi_se = st.dl.pi_se.take();
    st.dl.reset();
    st.dl.pi_se = pi_se;
}

/// 参数合法性：`0 < runtime <= deadline <= period`，周期在允许范围内
pub fn checkparam_dl(attr: &SchedAttr) -> bool {
    if attr.deadline == 0 || attr.runtime < (1 << DL_SCALE) {
        return false;
    }
    // 最高位留给回绕比较
    if attr.deadline & (1 << 63) != 0 || attr.period & (1 << 63) != 0 {
        return false;
    }
    let period = if attr.period == 0 { attr.deadline } else { attr.period };
    if period < attr.deadline || attr.deadline < attr.runtime {
        return false;
    }
    (DL_PERIOD_MIN..=DL_PERIOD_MAX).contains(&period)
}

pub fn dl_param_changed(st: &SchedTask, attr: &SchedAttr) -> bool {
    let p = &st.dl.params;
    let period = if attr.period == 0 { attr.deadline } else { attr.period };
    p.dl_runtime != attr.runtime
        || p.dl_deadline != attr.deadline
        || p.dl_period != period
        || st.dl.flags != (attr.flags & SchedAttrFlags::DL_MASK)
}

pub fn setparam_dl(st: &mut SchedTask, attr: &SchedAttr) {
    st.dl.params = DlParams::new(attr.runtime, attr.deadline, attr.period);
    st.dl.flags = attr.flags & SchedAttrFlags::DL_MASK;
}

pub fn getparam_dl(st: &SchedTask, attr: &mut SchedAttr) {
    let p = &st.dl.params;
    attr.runtime = p.dl_runtime;
    attr.deadline = p.dl_deadline;
    attr.period = p.dl_period;
    attr.flags |= st.dl.flags;
}

impl Scheduler {
    // ---------------------------------------------------------------
    // 带宽记账
    // ---------------------------------------------------------------

    fn add_running_bw(&self, rq: &mut Rq, bw: u64) {
        rq.dl.running_bw = rq.dl.running_bw.saturating_add(bw);
        if rq.dl.running_bw > rq.dl.this_bw {
            log::warn!("CPU{}: dl running_bw {} above this_bw {}", rq.cpu, rq.dl.running_bw, rq.dl.this_bw);
        }
        self.cpufreq_update_util(rq, 0);
    }

    fn sub_running_bw(&self, rq: &mut Rq, bw: u64) {
        if rq.dl.running_bw < bw {
            log::warn!("CPU{}: dl running_bw underflow ({} < {})", rq.cpu, rq.dl.running_bw, bw);
        }
        rq.dl.running_bw = rq.dl.running_bw.saturating_sub(bw);
        self.cpufreq_update_util(rq, 0);
    }

    fn add_rq_bw(rq: &mut Rq, bw: u64) {
        rq.dl.this_bw = rq.dl.this_bw.saturating_add(bw);
    }

    fn sub_rq_bw(rq: &mut Rq, bw: u64) {
        if rq.dl.this_bw < bw {
            log::warn!("CPU{}: dl this_bw underflow ({} < {})", rq.cpu, rq.dl.this_bw, bw);
        }
        rq.dl.this_bw = rq.dl.this_bw.saturating_sub(bw);
        if rq.dl.running_bw > rq.dl.this_bw {
            log::warn!("CPU{}: dl running_bw {} above this_bw {}", rq.cpu, rq.dl.running_bw, rq.dl.this_bw);
        }
    }

    /// 睡眠中的任务换了参数，rq 上的带宽跟着换
    fn dl_change_utilization(&self, rq: &mut Rq, pid: Pid, new_bw: u64) {
        if rq.task(pid).task.on_rq() == OnRq::Queued {
            return;
        }
        let (nc, old_bw) = {
            let dl = &rq.task(pid).dl;
            (dl.dl_non_contending, dl.params.dl_bw)
        };
        if nc {
            self.sub_running_bw(rq, old_bw);
            rq.task_mut(pid).dl.dl_non_contending = false;
            self.timers.cancel(TimerEvent::DlInactive(pid));
        }
        Self::sub_rq_bw(rq, old_bw);
        Self::add_rq_bw(rq, new_bw);
    }

    /// 任务睡眠：活跃带宽保留到 0-lag 时刻
    ///
    /// 0-lag 时刻是按预留速率消耗完剩余预算的时刻，
    /// `deadline - runtime * period / dl_runtime`。已经过了就立即移出。
    fn task_non_contending(&self, rq: &mut Rq, pid: Pid) {
        let clock = rq.clock;
        let (zerolag, is_dl, dead, bw) = {
            let st = rq.task(pid);
            let dl = &st.dl;
            if dl.params.dl_runtime == 0 {
                return;
            }
            if dl.dl_non_contending {
                log::warn!("CPU{}: dl task {} already non-contending", rq.cpu, pid);
            }
            let used = dl.runtime as i128 * dl.params.dl_period as i128 / dl.params.dl_runtime as i128;
            let zerolag = dl.deadline as i128 - used - clock as i128;
            (zerolag, dl_task(st), st.task.state().contains(TaskState::DEAD), dl.params.dl_bw)
        };

        if zerolag < 0 || self.timers.is_active(TimerEvent::DlInactive(pid)) {
            if is_dl {
                self.sub_running_bw(rq, bw);
            }
            if !is_dl || dead {
                if dead {
                    Self::sub_rq_bw(rq, bw);
                }
                rq.rd.dl_bw.lock().clear(bw);
                dl_clear_params(rq.task_mut(pid));
            }
            return;
        }

        rq.task_mut(pid).dl.dl_non_contending = true;
        let at = self.sched_clock() + zerolag as u64;
        self.timers.start(TimerEvent::DlInactive(pid), at);
    }

    /// 任务重新活跃
    fn task_contending(&self, rq: &mut Rq, pid: Pid, flags: EnqueueFlags) {
        let (dl_runtime, nc, bw) = {
            let dl = &rq.task(pid).dl;
            (dl.params.dl_runtime, dl.dl_non_contending, dl.params.dl_bw)
        };
        if dl_runtime == 0 {
            return;
        }
        if flags.contains(EnqueueFlags::MIGRATED) {
            Self::add_rq_bw(rq, bw);
        }
        if nc {
            // 0-lag 之前醒来，带宽一直没移出
            rq.task_mut(pid).dl.dl_non_contending = false;
            self.timers.cancel(TimerEvent::DlInactive(pid));
        } else {
            self.add_running_bw(rq, bw);
        }
    }

    /// 根域内未分配给 DL 的带宽，按 CPU 平均
    fn dl_extra_bw(&self, rd: &RootDomain) -> u64 {
        let b = *rd.dl_bw.lock();
        let max = if b.bw == u64::MAX { BW_UNIT } else { b.bw };
        let cpus = self.dl_bw_cpus(rd).max(1) as u64;
        max.saturating_sub(b.total_bw / cpus)
    }

    /// GRUB：按不活跃和未分配的带宽折算实际消耗的预算
    fn grub_reclaim(&self, rq: &Rq, delta: u64, dl_bw: u64) -> u64 {
        let u_inact = rq.dl.this_bw.saturating_sub(rq.dl.running_bw);
        let u_act_min = (dl_bw * rq.dl.bw_ratio) >> RATIO_SHIFT;
        let extra = rq.dl.extra_bw;
        let u_act = if u_inact + extra > BW_UNIT.saturating_sub(u_act_min) {
            u_act_min
        } else {
            BW_UNIT - u_inact - extra
        };
        ((delta as u128 * u_act as u128) >> BW_SHIFT) as u64
    }

    // ---------------------------------------------------------------
    // 队列
    // ---------------------------------------------------------------

    fn inc_dl_deadline(&self, rq: &mut Rq, deadline: u64) {
        let first = rq.dl.dl_nr_running == 1;
        if first || dl_time_before(deadline, rq.dl.earliest_dl_curr) {
            rq.dl.earliest_dl_curr = deadline;
            if rq.online {
                rq.rd.cpudl.set(rq.cpu, deadline);
            }
        }
        // DL 任务在 cpupri 中占最高档，RT 推送不会选中这里
        if first && rq.online {
            rq.rd.cpupri.set(rq.cpu, MAX_RT_PRIO);
        }
    }

    fn dec_dl_deadline(&self, rq: &mut Rq) {
        if rq.dl.dl_nr_running == 0 {
            rq.dl.earliest_dl_curr = 0;
            rq.dl.earliest_dl_next = 0;
            if rq.online {
                rq.rd.cpudl.clear(rq.cpu);
                let prio = rq.rt[super::group::ROOT_TASK_GROUP].highest_prio_curr;
                rq.rd.cpupri.set(rq.cpu, prio);
            }
        } else if let Some(&(deadline, _, _)) = rq.dl.root.first() {
            rq.dl.earliest_dl_curr = deadline;
            if rq.online {
                rq.rd.cpudl.set(rq.cpu, deadline);
            }
        }
    }

    fn update_dl_migration(&self, rq: &mut Rq) {
        let want = rq.dl.dl_nr_migratory > 0 && rq.dl.dl_nr_running > 1;
        if want && !rq.dl.overloaded {
            if rq.online {
                rq.rd.dl_set_overload(rq.cpu);
            }
            rq.dl.overloaded = true;
        } else if !want && rq.dl.overloaded {
            if rq.online {
                rq.rd.dl_clear_overload(rq.cpu);
            }
            rq.dl.overloaded = false;
        }
    }

    fn inc_dl_tasks(&self, rq: &mut Rq, pid: Pid, deadline: u64) {
        rq.dl.dl_nr_running += 1;
        self.add_nr_running(rq, 1);
        self.inc_dl_deadline(rq, deadline);
        if rq.task(pid).nr_cpus_allowed > 1 {
            rq.dl.dl_nr_migratory += 1;
        }
        self.update_dl_migration(rq);
    }

    fn dec_dl_tasks(&self, rq: &mut Rq, pid: Pid) {
        sched_bug_on!(rq.dl.dl_nr_running == 0, "CPU{}: dl_nr_running underflow", rq.cpu);
        rq.dl.dl_nr_running -= 1;
        self.sub_nr_running(rq, 1);
        self.dec_dl_deadline(rq);
        if rq.task(pid).nr_cpus_allowed > 1 {
            rq.dl.dl_nr_migratory = rq.dl.dl_nr_migratory.saturating_sub(1);
        }
        self.update_dl_migration(rq);
    }

    fn __enqueue_dl_entity(&self, rq: &mut Rq, pid: Pid) {
        sched_bug_on!(rq.task(pid).dl.tree_key.is_some(), "CPU{}: dl task {} enqueued twice", rq.cpu, pid);
        let seq = rq.next_seq();
        let deadline = {
            let dl = &mut rq.task_mut(pid).dl;
            dl.tree_key = Some((dl.deadline, seq));
            dl.on_rq = true;
            dl.deadline
        };
        rq.dl.root.insert((deadline, seq, pid));
        self.inc_dl_tasks(rq, pid, deadline);
    }

    fn __dequeue_dl_entity(&self, rq: &mut Rq, pid: Pid) {
        let key = {
            let dl = &mut rq.task_mut(pid).dl;
            dl.on_rq = false;
            dl.tree_key.take()
        };
        let Some((deadline, seq)) = key else {
            return;
        };
        rq.dl.root.remove(&(deadline, seq, pid));
        self.dec_dl_tasks(rq, pid);
    }

    fn enqueue_dl_entity(&self, rq: &mut Rq, pid: Pid, flags: EnqueueFlags) {
        if flags.contains(EnqueueFlags::INITIAL) {
            // 新任务没有可沿用的 (runtime, deadline)
            self.task_contending(rq, pid, flags);
            self.setup_new_dl_entity(rq, pid);
        } else if flags.contains(EnqueueFlags::WAKEUP) {
            self.task_contending(rq, pid, flags);
            self.update_dl_entity(rq, pid);
        } else if flags.contains(EnqueueFlags::REPLENISH) {
            self.replenish_dl_entity(rq, pid);
        } else if flags.contains(EnqueueFlags::RESTORE) && dl_time_before(rq.task(pid).dl.deadline, rq.clock) {
            self.setup_new_dl_entity(rq, pid);
        }
        self.__enqueue_dl_entity(rq, pid);
    }

    fn __dequeue_task_dl(&self, rq: &mut Rq, pid: Pid) {
        self.__dequeue_dl_entity(rq, pid);
        self.dequeue_pushable_dl_task(rq, pid);
    }

    // ---------------------------------------------------------------
    // pushable 树
    // ---------------------------------------------------------------

    fn update_earliest_dl_next(rq: &mut Rq) {
        rq.dl.earliest_dl_next = rq.dl.pushable.first().map_or(0, |&(deadline, _, _)| deadline);
    }

    fn enqueue_pushable_dl_task(&self, rq: &mut Rq, pid: Pid) {
        self.dequeue_pushable_dl_task(rq, pid);
        let deadline = rq.task(pid).dl.deadline;
        let seq = rq.next_seq();
        rq.dl.pushable.insert((deadline, seq, pid));
        rq.task_mut(pid).pushable_dl = Some((deadline, seq));
        Self::update_earliest_dl_next(rq);
    }

    fn dequeue_pushable_dl_task(&self, rq: &mut Rq, pid: Pid) {
        if let Some((deadline, seq)) = rq.task_mut(pid).pushable_dl.take() {
            rq.dl.pushable.remove(&(deadline, seq, pid));
            Self::update_earliest_dl_next(rq);
        }
    }

    fn deadline_queue_push_tasks(&self, rq: &mut Rq) {
        if !rq.dl.pushable.is_empty() {
            rq.queue_balance_callback(BalanceCallback::PushDl);
        }
    }

    fn deadline_queue_pull_task(&self, rq: &mut Rq) {
        rq.queue_balance_callback(BalanceCallback::PullDl);
    }

    fn pick_next_pushable_dl_task(&self, rq: &Rq) -> Option<Pid> {
        let &(_, _, pid) = rq.dl.pushable.first()?;
        let st = rq.task(pid);
        sched_bug_on!(
            rq.curr == pid || st.nr_cpus_allowed <= 1 || st.task.on_rq() != OnRq::Queued || !dl_task(st),
            "CPU{}: bad pushable dl task {}",
            rq.cpu,
            pid
        );
        Some(pid)
    }

    /// 源 rq 上能拉到 `cpu` 的截止时间最早的任务
    fn pick_earliest_pushable_dl_task(&self, rq: &Rq, cpu: usize) -> Option<Pid> {
        rq.dl
            .pushable
            .iter()
            .map(|&(_, _, pid)| pid)
            .find(|&pid| rq.curr != pid && rq.task(pid).cpus_mask.test(cpu))
    }

    // ---------------------------------------------------------------
    // CBS
    // ---------------------------------------------------------------

    /// 从当前时刻开始一个完整的周期
    fn setup_new_dl_entity(&self, rq: &mut Rq, pid: Pid) {
        let clock = rq.clock;
        let dl = &mut rq.task_mut(pid).dl;
        if dl.is_boosted() {
            return;
        }
        dl.deadline = clock + dl.params.dl_deadline;
        dl.runtime = dl.params.dl_runtime as i64;
    }

    /// 唤醒时判断剩余的 (runtime, deadline) 还能不能用
    fn update_dl_entity(&self, rq: &mut Rq, pid: Pid) {
        let clock = rq.clock;
        let st = rq.task_mut(pid);
        let expired = dl_time_before(st.dl.deadline, clock);
        if !expired && !dl_entity_overflow(st, clock) {
            return;
        }
        let pi = st.dl.pi_params();
        // 约束截止时间：截止之前醒来时按密度缩减预算，保持截止时间不变
        if pi.dl_deadline != pi.dl_period && !expired && !st.dl.is_boosted() {
            let laxity = st.dl.deadline - clock;
            st.dl.runtime = ((st.dl.params.dl_density as u128 * laxity as u128) >> BW_SHIFT) as i64;
            return;
        }
        st.dl.deadline = clock + pi.dl_deadline;
        st.dl.runtime = pi.dl_runtime as i64;
    }

    /// 预算耗尽后补充：截止时间后推整数个周期直到预算为正
    fn replenish_dl_entity(&self, rq: &mut Rq, pid: Pid) {
        let clock = rq.clock;
        let cpu = rq.cpu;
        let st = rq.task_mut(pid);
        let pi = st.dl.pi_params();
        let dl = &mut st.dl;

        // 没有自己参数的被提升任务
        if dl.params.dl_deadline == 0 {
            dl.deadline = clock + pi.dl_deadline;
            dl.runtime = pi.dl_runtime as i64;
        }
        if dl.dl_yielded && dl.runtime > 0 {
            dl.runtime = 0;
        }
        if pi.dl_runtime == 0 {
            dl.deadline = clock + pi.dl_deadline;
            dl.runtime = 0;
        } else {
            while dl.runtime <= 0 {
                dl.deadline += pi.dl_period;
                dl.runtime += pi.dl_runtime as i64;
            }
        }
        if dl_time_before(dl.deadline, clock) {
            log::warn!("CPU{}: dl task {} lagged behind its deadline, restarting period", cpu, pid);
            dl.deadline = clock + pi.dl_deadline;
            dl.runtime = pi.dl_runtime as i64;
        }
        dl.dl_yielded = false;
        dl.dl_throttled = false;
    }

    /// 约束截止时间的任务在截止之后、下个周期之前醒来，节流到下个周期
    fn dl_check_constrained_dl(&self, rq: &mut Rq, pid: Pid) {
        let clock = rq.clock;
        let st = rq.task(pid);
        if !dl_time_before(st.dl.deadline, clock) || !dl_time_before(clock, dl_next_period(st)) {
            return;
        }
        if st.dl.is_boosted() || !self.start_dl_timer(rq, pid) {
            return;
        }
        let dl = &mut rq.task_mut(pid).dl;
        dl.dl_throttled = true;
        if dl.runtime > 0 {
            dl.runtime = 0;
        }
    }

    /// 在下个周期起点补充预算，该时刻已经过去时返回 false
    fn start_dl_timer(&self, rq: &Rq, pid: Pid) -> bool {
        let now = self.sched_clock();
        // rq 时钟可能落后于定时器时钟
        let act = dl_next_period(rq.task(pid)) as i128 + now as i128 - rq.clock as i128;
        if act < now as i128 {
            return false;
        }
        let ev = TimerEvent::DlReplenish(pid);
        if !self.timers.is_active(ev) {
            self.timers.start(ev, act as u64);
        }
        true
    }

    fn start_hrtick_dl(&self, rq: &mut Rq, pid: Pid) {
        let runtime = rq.task(pid).dl.runtime;
        if runtime > 0 {
            self.hrtick_start(rq, runtime as u64);
        }
    }

    // ---------------------------------------------------------------
    // 调度类接口
    // ---------------------------------------------------------------

    pub(crate) fn enqueue_task_dl(&self, rq: &mut Rq, pid: Pid, flags: EnqueueFlags) {
        let (boosted, normal_dl, throttled) = {
            let st = rq.task(pid);
            (st.dl.is_boosted(), dl_prio(st.normal_prio), st.dl.dl_throttled)
        };
        if boosted {
            // 被继承期间不受节流
            if throttled {
                self.timers.cancel(TimerEvent::DlReplenish(pid));
                rq.task_mut(pid).dl.dl_throttled = false;
            }
        } else if !normal_dl && flags.contains(EnqueueFlags::REPLENISH) {
            // 继承刚结束的任务马上回到原调度类，不必补充
            rq.task_mut(pid).dl.dl_throttled = false;
            return;
        }

        let (throttled, implicit) = {
            let dl = &rq.task(pid).dl;
            (dl.dl_throttled, dl.params.dl_deadline == dl.params.dl_period)
        };
        if !throttled && !implicit {
            self.dl_check_constrained_dl(rq, pid);
        }

        if rq.task(pid).task.on_rq() == OnRq::Migrating || flags.contains(EnqueueFlags::RESTORE) {
            let bw = rq.task(pid).dl.params.dl_bw;
            Self::add_rq_bw(rq, bw);
            self.add_running_bw(rq, bw);
        }

        if rq.task(pid).dl.dl_throttled && !flags.contains(EnqueueFlags::REPLENISH) {
            if flags.intersects(EnqueueFlags::WAKEUP | EnqueueFlags::INITIAL) {
                self.task_contending(rq, pid, flags);
            }
            return;
        }

        self.enqueue_dl_entity(rq, pid, flags);
        if rq.curr != pid && rq.task(pid).nr_cpus_allowed > 1 {
            self.enqueue_pushable_dl_task(rq, pid);
        }
    }

    pub(crate) fn dequeue_task_dl(&self, rq: &mut Rq, pid: Pid, flags: DequeueFlags) {
        self.update_curr_dl(rq);
        self.__dequeue_task_dl(rq, pid);
        if rq.task(pid).task.on_rq() == OnRq::Migrating || flags.contains(DequeueFlags::SAVE) {
            let bw = rq.task(pid).dl.params.dl_bw;
            self.sub_running_bw(rq, bw);
            Self::sub_rq_bw(rq, bw);
        }
        // 阻塞和退出都从活跃转为不活跃
        if flags.contains(DequeueFlags::SLEEP) {
            self.task_non_contending(rq, pid);
        }
    }

    /// 放弃本周期剩余的预算，到下个周期再运行
    pub(crate) fn yield_task_dl(&self, rq: &mut Rq) {
        let curr = rq.curr;
        rq.task_mut(curr).dl.dl_yielded = true;
        self.update_rq_clock(rq);
        self.update_curr_dl(rq);
        self.rq_clock_skip_update(rq);
    }

    pub(crate) fn check_preempt_curr_dl(&self, rq: &mut Rq, pid: Pid, _wf: WakeFlags) {
        let deadline = rq.task(pid).dl.deadline;
        let (curr_dl, curr_resched) = {
            let curr = rq.curr_task();
            (curr.dl.deadline, curr.task.need_resched())
        };
        if dl_time_before(deadline, curr_dl) {
            self.resched_curr(rq);
            return;
        }
        if deadline == curr_dl && !curr_resched {
            self.check_preempt_equal_dl(rq, pid);
        }
    }

    /// 截止时间相同：当前任务能去别处而新任务不能时才抢占
    fn check_preempt_equal_dl(&self, rq: &mut Rq, pid: Pid) {
        let curr = rq.curr_task();
        if curr.nr_cpus_allowed == 1 || rq.rd.cpudl.find(curr.dl.deadline, curr.cpus_mask, None).is_none() {
            return;
        }
        let p = rq.task(pid);
        if p.nr_cpus_allowed != 1 && rq.rd.cpudl.find(p.dl.deadline, p.cpus_mask, None).is_some() {
            return;
        }
        self.resched_curr(rq);
    }

    pub(crate) fn pick_task_dl(&self, rq: &mut Rq) -> Option<Pid> {
        rq.dl.leftmost()
    }

    pub(crate) fn set_next_task_dl(&self, rq: &mut Rq, pid: Pid, first: bool) {
        let now = rq.clock_task;
        rq.task_mut(pid).se.exec_start = now;
        self.dequeue_pushable_dl_task(rq, pid);
        if !first {
            return;
        }
        if self.features.has(SchedFeatures::HRTICK) {
            self.start_hrtick_dl(rq, pid);
        }
        if rq.curr_task().class != SchedClass::Dl {
            let now = rq.pelt.now();
            update_rq_avg(&mut rq.avg_dl, now, 0);
        }
        self.deadline_queue_push_tasks(rq);
    }

    pub(crate) fn put_prev_task_dl(&self, rq: &mut Rq, pid: Pid) {
        self.update_curr_dl(rq);
        let now = rq.pelt.now();
        update_rq_avg(&mut rq.avg_dl, now, 1);
        let st = rq.task(pid);
        if st.dl.tree_key.is_some() && st.nr_cpus_allowed > 1 {
            self.enqueue_pushable_dl_task(rq, pid);
        }
    }

    /// 扣减当前 DL 任务的预算，耗尽时节流
    pub(crate) fn update_curr_dl(&self, rq: &mut Rq) {
        let curr = rq.curr;
        {
            let st = rq.task(curr);
            if st.class != SchedClass::Dl || st.dl.tree_key.is_none() {
                return;
            }
        }
        let now = rq.clock_task;
        let delta = {
            let se = &mut rq.task_mut(curr).se;
            let delta = now.saturating_sub(se.exec_start);
            if delta > 0 {
                se.statistics.exec_max = se.statistics.exec_max.max(delta);
                se.sum_exec_runtime += delta;
                se.exec_start = now;
            }
            delta
        };
        if delta == 0 && !rq.task(curr).dl.dl_yielded {
            return;
        }

        if delta > 0 {
            let (special, reclaim, bw) = {
                let dl = &rq.task(curr).dl;
                (
                    dl.params.dl_runtime == 0 && !dl.is_boosted(),
                    dl.flags.contains(SchedAttrFlags::RECLAIM),
                    dl.params.dl_bw,
                )
            };
            if special {
                return;
            }
            let scaled = if reclaim {
                let rd = rq.rd.clone();
                rq.dl.extra_bw = self.dl_extra_bw(&rd);
                self.grub_reclaim(rq, delta, bw)
            } else {
                let freq = self.freq_scale(rq.cpu);
                cap_scale(cap_scale(delta, freq), rq.cpu_capacity_orig)
            };
            rq.task_mut(curr).dl.runtime -= scaled as i64;
        }

        let (exceeded, yielded) = {
            let dl = &rq.task(curr).dl;
            (dl.runtime <= 0, dl.dl_yielded)
        };
        if !exceeded && !yielded {
            return;
        }
        {
            let dl = &mut rq.task_mut(curr).dl;
            dl.dl_throttled = true;
            if exceeded && dl.flags.contains(SchedAttrFlags::DL_OVERRUN) {
                dl.dl_overrun = true;
            }
        }
        self.__dequeue_task_dl(rq, curr);
        let boosted = rq.task(curr).dl.is_boosted();
        if boosted || !self.start_dl_timer(rq, curr) {
            self.enqueue_task_dl(rq, curr, EnqueueFlags::REPLENISH);
        }
        if rq.dl.leftmost() != Some(curr) {
            self.resched_curr(rq);
        }
    }

    pub(crate) fn task_tick_dl(&self, rq: &mut Rq, pid: Pid, queued: bool) {
        self.update_curr_dl(rq);
        let now = rq.pelt.now();
        update_rq_avg(&mut rq.avg_dl, now, 1);
        // 补充后可能已经不是最左，那时 schedule 会为下一个任务设置 hrtick
        if self.features.has(SchedFeatures::HRTICK)
            && queued
            && rq.task(pid).dl.runtime > 0
            && rq.dl.leftmost() == Some(pid)
        {
            self.start_hrtick_dl(rq, pid);
        }
    }

    /// DL 任务不能直接 fork，子任务在 sched_fork 中已回到普通策略
    pub(crate) fn task_fork_dl(&self, _rq: &mut Rq, _pid: Pid) {}

    /// 任务退出：取消定时器，归还还挂在各层的带宽
    pub(crate) fn task_dead_dl(&self, rq: &mut Rq, pid: Pid) {
        self.timers.cancel(TimerEvent::DlReplenish(pid));
        let pending = self.timers.cancel(TimerEvent::DlInactive(pid));
        let Some(st) = rq.try_task(pid) else {
            return;
        };
        let (is_dl, nc, bw) = (dl_task(st), st.dl.dl_non_contending, st.dl.params.dl_bw);
        if is_dl {
            if nc {
                self.sub_running_bw(rq, bw);
            }
            Self::sub_rq_bw(rq, bw);
        } else if !pending {
            return;
        }
        rq.rd.dl_bw.lock().clear(bw);
        dl_clear_params(rq.task_mut(pid));
    }

    pub(crate) fn prio_changed_dl(&self, rq: &mut Rq, pid: Pid, _oldprio: i32) {
        if rq.task(pid).task.on_rq() != OnRq::Queued && rq.curr != pid {
            return;
        }
        // 不知道原来的截止时间，只能都试一下
        if !rq.dl.overloaded {
            self.deadline_queue_pull_task(rq);
        }
        let deadline = rq.task(pid).dl.deadline;
        if rq.curr == pid {
            if rq.dl.dl_nr_running > 0 && dl_time_before(rq.dl.earliest_dl_curr, deadline) {
                self.resched_curr(rq);
            }
        } else {
            let curr = rq.curr_task();
            if !dl_task(curr) || dl_time_before(deadline, curr.dl.deadline) {
                self.resched_curr(rq);
            }
        }
    }

    pub(crate) fn switched_from_dl(&self, rq: &mut Rq, pid: Pid) {
        let queued = rq.task(pid).task.on_rq() == OnRq::Queued;
        self.timers.cancel(TimerEvent::DlReplenish(pid));
        rq.task_mut(pid).dl.dl_throttled = false;

        if queued && rq.task(pid).dl.params.dl_runtime != 0 {
            self.task_non_contending(rq, pid);
        }
        if !queued {
            let (nc, bw) = {
                let dl = &rq.task(pid).dl;
                (dl.dl_non_contending, dl.params.dl_bw)
            };
            if nc {
                self.sub_running_bw(rq, bw);
            }
            Self::sub_rq_bw(rq, bw);
            // 没有 0-lag 定时器等着归还时，准入带宽立即归还
            if !self.timers.is_active(TimerEvent::DlInactive(pid)) {
                rq.rd.dl_bw.lock().clear(bw);
                dl_clear_params(rq.task_mut(pid));
            }
        }
        rq.task_mut(pid).dl.dl_non_contending = false;

        if !queued || rq.dl.dl_nr_running > 0 {
            return;
        }
        self.deadline_queue_pull_task(rq);
    }

    pub(crate) fn switched_to_dl(&self, rq: &mut Rq, pid: Pid) {
        self.timers.cancel(TimerEvent::DlInactive(pid));
        if rq.task(pid).task.on_rq() != OnRq::Queued {
            // 参数在下次唤醒时更新
            let bw = rq.task(pid).dl.params.dl_bw;
            Self::add_rq_bw(rq, bw);
            return;
        }
        if rq.curr == pid {
            let now = rq.pelt.now();
            update_rq_avg(&mut rq.avg_dl, now, 0);
            return;
        }
        if rq.task(pid).nr_cpus_allowed > 1 && rq.dl.overloaded {
            self.deadline_queue_push_tasks(rq);
        }
        if dl_task(rq.curr_task()) {
            self.check_preempt_curr_dl(rq, pid, WakeFlags::empty());
        } else {
            self.resched_curr(rq);
        }
    }

    /// 唤醒的任务不会抢占当前任务时，尝试把它推走
    pub(crate) fn task_woken_dl(&self, rq: &mut Rq, pid: Pid) {
        let p = rq.task(pid);
        let curr = rq.curr_task();
        let need_push = rq.curr != pid
            && !curr.task.need_resched()
            && p.nr_cpus_allowed > 1
            && dl_task(curr)
            && (curr.nr_cpus_allowed < 2 || !dl_time_before(p.dl.deadline, curr.dl.deadline));
        if need_push {
            self.deadline_queue_push_tasks(rq);
        }
    }

    pub(crate) fn balance_dl<'a>(&'a self, mut rq: RqGuard<'a>, prev: Pid) -> (RqGuard<'a>, bool) {
        let (on_tree, is_dl) = {
            let st = rq.task(prev);
            (st.dl.tree_key.is_some(), dl_task(st))
        };
        // prev 离开了 DL 队列，本 CPU 可能可以接收别处的任务
        if !on_tree && is_dl && rq.online {
            rq = self.pull_dl_task(rq);
        }
        let runnable = self.balance_stop(&rq) || rq.dl.dl_nr_running > 0;
        (rq, runnable)
    }

    /// 唤醒迁移：带宽从原 rq 移出，入队时由 MIGRATED 加到新 rq
    pub(crate) fn migrate_task_rq_dl(&self, rq: &mut Rq, pid: Pid, _new_cpu: usize) {
        if rq.task(pid).task.on_rq() != OnRq::None {
            return;
        }
        let (nc, bw) = {
            let dl = &rq.task(pid).dl;
            (dl.dl_non_contending, dl.params.dl_bw)
        };
        if nc {
            self.sub_running_bw(rq, bw);
            rq.task_mut(pid).dl.dl_non_contending = false;
            self.timers.cancel(TimerEvent::DlInactive(pid));
        }
        Self::sub_rq_bw(rq, bw);
    }

    /// 亲和性移出当前根域时，准入带宽随之搬到新根域
    pub(crate) fn set_cpus_allowed_dl(&self, rq: &mut Rq, pid: Pid, mask: CpuMask) {
        let src = rq.rd.clone();
        if !src.span().intersects(mask) {
            let bw = rq.task(pid).dl.params.dl_bw;
            src.dl_bw.lock().clear(bw);
            let tree = self.domain_tree();
            if let Some(dst) = mask.first_and(self.active_mask()).and_then(|cpu| tree.rd_of(cpu)) {
                dst.dl_bw.lock().add(bw);
            }
        }
        self.set_cpus_allowed_common(rq, pid, mask);
    }

    pub(crate) fn rq_online_dl(&self, rq: &mut Rq) {
        if rq.dl.overloaded {
            rq.rd.dl_set_overload(rq.cpu);
        }
        rq.rd.cpudl.set_freecpu(rq.cpu);
        if rq.dl.dl_nr_running > 0 {
            rq.rd.cpudl.set(rq.cpu, rq.dl.earliest_dl_curr);
            rq.rd.cpupri.set(rq.cpu, MAX_RT_PRIO);
        }
    }

    pub(crate) fn rq_offline_dl(&self, rq: &mut Rq) {
        if rq.dl.overloaded {
            rq.rd.dl_clear_overload(rq.cpu);
        }
        rq.rd.cpudl.clear(rq.cpu);
        rq.rd.cpudl.clear_freecpu(rq.cpu);
    }

    // ---------------------------------------------------------------
    // 放置
    // ---------------------------------------------------------------

    /// 找一个空闲或当前截止时间比 `p` 晚的 CPU，优先缓存亲近的
    fn find_later_rq(&self, rd: &RootDomain, p: &TaskSnapshot) -> Option<usize> {
        if p.nr_cpus_allowed == 1 {
            return None;
        }
        let tree = self.domain_tree();
        let later = if tree.has_asym {
            let fits = |cpu: usize| {
                let cap = self.capacity_orig_of(cpu);
                (dl_task_fits_capacity(p, cap), cap)
            };
            rd.cpudl.find(p.dl_deadline, p.cpus_mask, Some(&fits))
        } else {
            rd.cpudl.find(p.dl_deadline, p.cpus_mask, None)
        }?;

        let cpu = p.cpu;
        if later.test(cpu) {
            return Some(cpu);
        }
        let this_cpu = self.this_cpu();
        let this_ok = later.test(this_cpu);
        for id in tree.for_each_domain(cpu) {
            let sd = tree.sd(id);
            if !sd.flags.contains(SdFlags::WAKE_AFFINE) {
                continue;
            }
            if this_ok && sd.span.test(this_cpu) {
                return Some(this_cpu);
            }
            if let Some(best) = later.first_and(sd.span) {
                return Some(best);
            }
        }
        if this_ok {
            return Some(this_cpu);
        }
        later.first()
    }

    pub(crate) fn select_task_rq_dl(&self, p: &TaskSnapshot, prev_cpu: usize, wf: WakeFlags) -> usize {
        if !wf.intersects(WakeFlags::TTWU | WakeFlags::FORK) {
            return prev_cpu;
        }
        let (busy, rd) = {
            let rq = self.rq_lock(prev_cpu);
            let curr = rq.curr_task();
            // 当前 DL 任务不能走或者不会被抢占时，给新任务另找地方
            let busy = dl_task(curr)
                && (curr.nr_cpus_allowed < 2 || !dl_time_before(p.dl_deadline, curr.dl.deadline))
                && p.nr_cpus_allowed > 1;
            (busy, rq.rd.clone())
        };
        let misfit = self.domain_tree().has_asym && !dl_task_fits_capacity(p, self.capacity_orig_of(prev_cpu));
        if !busy && !misfit {
            return prev_cpu;
        }
        let Some(target) = self.find_later_rq(&rd, p) else {
            return prev_cpu;
        };
        let rq = self.rq_lock(target);
        if rq.dl.dl_nr_running == 0 || dl_time_before(p.dl_deadline, rq.dl.earliest_dl_curr) {
            target
        } else {
            prev_cpu
        }
    }

    // ---------------------------------------------------------------
    // 推送与拉取
    // ---------------------------------------------------------------

    /// 找到并锁住一个能接收 `pid` 的 rq
    ///
    /// 中间可能释放过 `rq` 的锁，返回前已确认任务仍在原处。
    pub(crate) fn find_lock_later_rq<'a>(&'a self, mut rq: RqGuard<'a>, pid: Pid) -> (RqGuard<'a>, Option<RqGuard<'a>>) {
        for _ in 0..DL_MAX_TRIES {
            let snap = self.task_snapshot(&rq, rq.task(pid));
            let rd = rq.rd.clone();
            let cpu = match self.find_later_rq(&rd, &snap) {
                Some(c) if c != rq.cpu => c,
                _ => break,
            };
            let (this, later, dropped) = self.double_lock_balance(rq, cpu);
            rq = this;
            if dropped {
                let still = rq.curr != pid
                    && rq.try_task(pid).is_some_and(|st| {
                        dl_task(st)
                            && st.migration_disabled == 0
                            && st.cpus_mask.test(cpu)
                            && st.task.on_rq() == OnRq::Queued
                    });
                if !still {
                    return (rq, None);
                }
            }
            if later.dl.dl_nr_running == 0 || dl_time_before(snap.dl_deadline, later.dl.earliest_dl_curr) {
                return (rq, Some(later));
            }
        }
        (rq, None)
    }

    /// 推走一个任务，返回是否推成功
    fn push_dl_task<'a>(&'a self, mut rq: RqGuard<'a>) -> (RqGuard<'a>, bool) {
        if !rq.dl.overloaded {
            return (rq, false);
        }
        let Some(mut next) = self.pick_next_pushable_dl_task(&rq) else {
            return (rq, false);
        };
        loop {
            if rq.task(next).migration_disabled > 0 {
                return (rq, false);
            }
            // next 比当前任务更早而当前任务可以走：让当前任务让位，之后它会被推走
            let preempt = {
                let curr = rq.curr_task();
                dl_task(curr)
                    && dl_time_before(rq.task(next).dl.deadline, curr.dl.deadline)
                    && curr.nr_cpus_allowed > 1
            };
            if preempt {
                self.resched_curr(&mut rq);
                return (rq, false);
            }

            let (r, later) = self.find_lock_later_rq(rq, next);
            rq = r;
            let Some(mut later) = later else {
                match self.pick_next_pushable_dl_task(&rq) {
                    Some(t) if t != next => {
                        next = t;
                        continue;
                    }
                    _ => return (rq, false),
                }
            };
            self.update_rq_clock(&mut rq);
            self.move_task_locked(&mut rq, &mut later, next);
            self.resched_curr(&mut later);
            drop(later);
            return (rq, true);
        }
    }

    pub(crate) fn push_dl_tasks<'a>(&'a self, mut rq: RqGuard<'a>) -> RqGuard<'a> {
        loop {
            let (r, moved) = self.push_dl_task(rq);
            rq = r;
            if !moved {
                return rq;
            }
        }
    }

    pub(crate) fn pull_dl_task<'a>(&'a self, mut this_rq: RqGuard<'a>) -> RqGuard<'a> {
        let rd = this_rq.rd.clone();
        let this_cpu = this_rq.cpu;
        if rd.dl_overloaded() == 0 {
            return this_rq;
        }

        let mut dmin: Option<u64> = None;
        let mut resched = false;
        for cpu in rd.dlo_mask() {
            if cpu == this_cpu {
                continue;
            }
            let (this, mut src, _) = self.double_lock_balance(this_rq, cpu);
            this_rq = this;
            let mut push_task = None;
            if src.dl.dl_nr_running > 1 {
                if let Some(pid) = self.pick_earliest_pushable_dl_task(&src, this_cpu) {
                    let deadline = src.task(pid).dl.deadline;
                    let earlier = dmin.map_or(true, |m| dl_time_before(deadline, m))
                        && (this_rq.dl.dl_nr_running == 0 || dl_time_before(deadline, this_rq.dl.earliest_dl_curr));
                    // 会抢占源 CPU 当前任务的，留在那边跑
                    let runs_there = {
                        let curr = src.curr_task();
                        dl_task(curr) && dl_time_before(deadline, curr.dl.deadline)
                    };
                    if earlier && !runs_there {
                        if src.task(pid).migration_disabled > 0 {
                            push_task = self.get_push_task(&mut src);
                        } else {
                            self.update_rq_clock(&mut src);
                            self.move_task_locked(&mut src, &mut this_rq, pid);
                            dmin = Some(deadline);
                            resched = true;
                        }
                    }
                }
            }
            drop(src);
            if let Some(pid) = push_task {
                drop(this_rq);
                self.stop_one_cpu_nowait(cpu, StopWork::Push { pid });
                this_rq = self.rq_lock(this_cpu);
            }
        }
        if resched {
            self.resched_curr(&mut this_rq);
        }
        this_rq
    }

    // ---------------------------------------------------------------
    // 定时器
    // ---------------------------------------------------------------

    /// 补充定时器：节流的任务拿到新预算后重新入队
    pub(crate) fn dl_task_timer(&self, pid: Pid) -> HrtimerRestart {
        let Some(p) = self.find_task(pid) else {
            return HrtimerRestart::NoRestart;
        };
        let (pi, mut rq) = self.task_rq_lock(&p);
        let armed = rq
            .try_task(pid)
            .is_some_and(|st| dl_task(st) && !st.dl.is_boosted() && st.dl.dl_throttled);
        if !armed {
            return HrtimerRestart::NoRestart;
        }
        self.update_rq_clock(&mut rq);

        // 睡眠中的任务只补充，等唤醒时再入队
        if p.on_rq() != OnRq::Queued {
            self.replenish_dl_entity(&mut rq, pid);
            return HrtimerRestart::NoRestart;
        }

        if !rq.online {
            rq = self.dl_task_offline_migration(rq, pid);
            self.update_rq_clock(&mut rq);
        }
        if rq.try_task(pid).is_none() {
            return HrtimerRestart::NoRestart;
        }

        self.enqueue_task_dl(&mut rq, pid, EnqueueFlags::REPLENISH);
        if dl_task(rq.curr_task()) {
            self.check_preempt_curr_dl(&mut rq, pid, WakeFlags::empty());
        } else {
            self.resched_curr(&mut rq);
        }
        if !rq.dl.pushable.is_empty() {
            rq = self.push_dl_task(rq).0;
        }
        drop(pi);
        self.unlock_with_callbacks(rq);
        HrtimerRestart::NoRestart
    }

    /// 所在 CPU 已下线：把节流中的任务连同带宽搬到别处
    fn dl_task_offline_migration<'a>(&'a self, rq: RqGuard<'a>, pid: Pid) -> RqGuard<'a> {
        let (mut rq, later) = self.find_lock_later_rq(rq, pid);
        let mut later = match later {
            Some(l) => l,
            None => {
                let active = self.active_mask();
                let mask = rq.task(pid).cpus_mask;
                let Some(cpu) = mask.first_and(active).or_else(|| active.first()) else {
                    return rq;
                };
                if cpu == rq.cpu {
                    return rq;
                }
                if !mask.test(cpu) {
                    log::warn!("sched: dl task {} has no usable CPU left, moving to CPU{}", pid, cpu);
                }
                let (this, other, _) = self.double_lock_balance(rq, cpu);
                rq = this;
                other
            }
        };
        if rq.try_task(pid).is_none() {
            drop(rq);
            return later;
        }
        let bw = rq.task(pid).dl.params.dl_bw;
        if !alloc::sync::Arc::ptr_eq(&rq.rd, &later.rd) {
            rq.rd.dl_bw.lock().clear(bw);
            later.rd.dl_bw.lock().add(bw);
        }
        self.move_task_locked(&mut rq, &mut later, pid);
        drop(rq);
        later
    }

    /// 0-lag 时刻到：把睡眠任务的带宽移出 running_bw
    pub(crate) fn inactive_task_timer(&self, pid: Pid) -> HrtimerRestart {
        let Some(p) = self.find_task(pid) else {
            return HrtimerRestart::NoRestart;
        };
        let (_pi, mut rq) = self.task_rq_lock(&p);
        let Some(st) = rq.try_task(pid) else {
            return HrtimerRestart::NoRestart;
        };
        let (is_dl, nc, bw) = (dl_task(st), st.dl.dl_non_contending, st.dl.params.dl_bw);
        self.update_rq_clock(&mut rq);

        if !is_dl {
            // 已离开 DL，现在才归还准入带宽
            rq.rd.dl_bw.lock().clear(bw);
            dl_clear_params(rq.task_mut(pid));
            return HrtimerRestart::NoRestart;
        }
        if nc {
            self.sub_running_bw(&mut rq, bw);
            rq.task_mut(pid).dl.dl_non_contending = false;
        }
        HrtimerRestart::NoRestart
    }

    // ---------------------------------------------------------------
    // 准入
    // ---------------------------------------------------------------

    /// 根域内活跃 CPU 数
    fn dl_bw_cpus(&self, rd: &RootDomain) -> usize {
        rd.span().and(self.active_mask()).weight()
    }

    /// 根域内活跃 CPU 的原始容量之和
    fn dl_bw_capacity(&self, rd: &RootDomain) -> u64 {
        rd.span().and(self.active_mask()).iter().map(|cpu| self.capacity_orig_of(cpu)).sum()
    }

    /// GRUB 使用的 `1 / max_bw`，RATIO_SHIFT 定点
    pub(crate) fn dl_bw_ratio(period: u64, runtime: u64) -> u64 {
        if runtime == RUNTIME_INF {
            1 << RATIO_SHIFT
        } else {
            to_ratio(runtime, period) >> (BW_SHIFT - RATIO_SHIFT)
        }
    }

    /// 每个根域恰好访问一次
    fn for_each_root_domain(&self, mut f: impl FnMut(&RootDomain)) {
        let gen = DL_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
        for cpu in 0..self.nr_cpus() {
            let rd = self.rq_lock(cpu).rd.clone();
            if rd.visit_gen.swap(gen, Ordering::AcqRel) != gen {
                f(&rd);
            }
        }
    }

    /// 准入控制：任务按 `attr` 切换策略后所在根域是否还放得下
    ///
    /// 离开 DL 不在这里归还，带宽要保留到 0-lag 时刻。
    pub(crate) fn sched_dl_overflow(&self, rq: &mut Rq, pid: Pid, attr: &SchedAttr) -> SchedResult<()> {
        let to_dl = attr.policy.is_dl();
        let new_bw = if to_dl {
            let period = if attr.period == 0 { attr.deadline } else { attr.period };
            to_ratio(period, attr.runtime)
        } else {
            0
        };
        let (was_dl, old_bw) = {
            let st = rq.task(pid);
            (st.policy.is_dl(), st.dl.params.dl_bw)
        };
        if was_dl && new_bw == old_bw {
            return Ok(());
        }

        let rd = rq.rd.clone();
        let cap = self.dl_bw_capacity(&rd);
        let mut b = rd.dl_bw.lock();
        if to_dl && !was_dl {
            if b.overflow(cap, 0, new_bw) {
                log::debug!("sched: dl admission of task {} failed, bw {} total {} cap {}", pid, new_bw, b.total_bw, cap);
                return Err(SchedError::Busy);
            }
            // 离开 DL 后还没到 0-lag 的旧带宽
            if self.timers.is_active(TimerEvent::DlInactive(pid)) {
                b.clear(old_bw);
            }
            b.add(new_bw);
        } else if to_dl && was_dl {
            if b.overflow(cap, old_bw, new_bw) {
                log::debug!("sched: dl change of task {} failed, bw {} -> {} total {}", pid, old_bw, new_bw, b.total_bw);
                return Err(SchedError::Busy);
            }
            b.clear(old_bw);
            b.add(new_bw);
            drop(b);
            self.dl_change_utilization(rq, pid, new_bw);
        }
        Ok(())
    }

    /// 新的全局比例是否还能容纳各根域已接纳的带宽
    pub(crate) fn dl_global_validate(&self, new_bw: u64) -> SchedResult<()> {
        if new_bw == u64::MAX {
            return Ok(());
        }
        let mut ret = Ok(());
        self.for_each_root_domain(|rd| {
            let cap = self.dl_bw_capacity(rd);
            let total = rd.dl_bw.lock().total_bw;
            if cap_scale(new_bw, cap) < total {
                log::debug!("sched: global dl bw {} below admitted {} in rd{}", new_bw, total, rd.id);
                ret = Err(SchedError::Busy);
            }
        });
        ret
    }

    /// 全局 RT 配额改变后更新各根域的 DL 上限和每 CPU 的 GRUB 参数
    pub(crate) fn dl_global_update(&self, new_bw: u64) {
        let ratio = Self::dl_bw_ratio(self.tunables.rt_period(), self.tunables.rt_runtime());
        self.for_each_root_domain(|rd| rd.dl_bw.lock().bw = new_bw);
        for cpu in 0..self.nr_cpus() {
            let mut rq = self.rq_lock(cpu);
            rq.dl.bw_ratio = ratio;
            let rd = rq.rd.clone();
            rq.dl.extra_bw = self.dl_extra_bw(&rd);
        }
    }

    /// 缩小到 `trial` 后根域容量仍放得下已接纳的带宽
    pub(crate) fn dl_cpuset_cpumask_can_shrink(&self, rq: &Rq, trial: CpuMask) -> bool {
        let rd = &rq.rd;
        let cap: u64 = trial
            .and(rd.span())
            .and(self.active_mask())
            .iter()
            .map(|cpu| self.capacity_orig_of(cpu))
            .sum();
        !rd.dl_bw.lock().overflow(cap, 0, 0)
    }

    /// `cpu` 下线后所在根域是否还放得下已接纳的带宽
    pub(crate) fn dl_bw_check_deactivate(&self, cpu: usize) -> SchedResult<()> {
        let rd = self.rq_lock(cpu).rd.clone();
        let mut cap = self.dl_bw_capacity(&rd);
        if rd.span().test(cpu) && self.cpu_active(cpu) {
            cap = cap.saturating_sub(self.capacity_orig_of(cpu));
        }
        let b = *rd.dl_bw.lock();
        if b.overflow(cap, 0, 0) {
            log::debug!("sched: CPU{} still needed for {} of admitted dl bw", cpu, b.total_bw);
            return Err(SchedError::Busy);
        }
        Ok(())
    }

    /// 根域重建后按任务重新累计已接纳的带宽
    pub(crate) fn dl_rebuild_rd_accounting(&self) {
        let bw = global_dl_bw(self.tunables.rt_period(), self.tunables.rt_runtime());
        self.for_each_root_domain(|rd| {
            let mut b = rd.dl_bw.lock();
            b.bw = bw;
            b.total_bw = 0;
        });
        for cpu in 0..self.nr_cpus() {
            let mut rq = self.rq_lock(cpu);
            let sum: u64 = rq.tasks.values().map(|st| st.dl.params.dl_bw).sum();
            if sum > 0 {
                rq.rd.dl_bw.lock().add(sum);
            }
            let rd = rq.rd.clone();
            rq.dl.extra_bw = self.dl_extra_bw(&rd);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::cmdline::BootParams;
    use crate::config::TICK_NSEC;
    use crate::sched::cpupri::convert_prio;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;
    use crate::sched::SchedAttr;

    const MS: u64 = 1_000_000;

    fn sched(cpus: usize) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(cpus));
        let s = Scheduler::with_boot_params(ArchTopology::flat(cpus), clock.clone(), Arc::new(NoopHooks), BootParams::new());
        (s, clock)
    }

    fn dl(runtime_ms: u64, period_ms: u64) -> SchedAttr {
        SchedAttr::deadline(runtime_ms * MS, period_ms * MS, period_ms * MS)
    }

    fn tick(s: &Scheduler, clock: &ManualClock, cpu: usize) {
        clock.advance(TICK_NSEC);
        s.timer_interrupt(cpu, false);
        s.preempt_schedule_irq(cpu);
    }

    #[test]
    fn parameters_are_checked() {
        assert!(checkparam_dl(&dl(10, 100)));
        assert!(checkparam_dl(&SchedAttr::deadline(MS, 5 * MS, 0)));
        // runtime > deadline
        assert!(!checkparam_dl(&SchedAttr::deadline(20 * MS, 10 * MS, 10 * MS)));
        // deadline > period
        assert!(!checkparam_dl(&SchedAttr::deadline(MS, 20 * MS, 10 * MS)));
        // 周期太短
        assert!(!checkparam_dl(&SchedAttr::deadline(2_000, 50_000, 50_000)));
        // runtime 太小
        assert!(!checkparam_dl(&SchedAttr::deadline(100, MS, MS)));
        assert!(!checkparam_dl(&SchedAttr::deadline(MS, 0, 0)));
    }

    #[test]
    fn bw_ratio_is_inverse_of_global_share() {
        assert_eq!(Scheduler::dl_bw_ratio(1_000_000, RUNTIME_INF), 1 << RATIO_SHIFT);
        // 95% 对应约 1.05
        let r = Scheduler::dl_bw_ratio(1_000_000, 950_000);
        assert!(r > (1 << RATIO_SHIFT) && r < (1 << RATIO_SHIFT) * 11 / 10);
    }

    #[test]
    fn admission_rejects_overcommit() {
        let (s, _) = sched(1);
        let a = s.spawn("a", dl(5, 10), None).unwrap();
        assert_eq!(s.spawn("b", dl(5, 10), None), Err(SchedError::Busy));
        s.with_rq(0, |rq| {
            assert_eq!(rq.rd.dl_bw.lock().total_bw, to_ratio(10 * MS, 5 * MS));
            assert_eq!(rq.dl.this_bw, to_ratio(10 * MS, 5 * MS));
            assert_eq!(rq.dl.dl_nr_running, 1);
        });
        assert!(s.with_task(a, |st| st.dl.params.dl_bw).is_some());
        // 小一点的仍然放得下
        assert!(s.spawn("c", dl(2, 10), None).is_ok());
    }

    #[test]
    fn earliest_deadline_runs_and_publishes_higher_band() {
        let (s, _) = sched(1);
        let late = s.spawn("late", dl(1, 20), None).unwrap();
        let early = s.spawn("early", dl(1, 10), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), early);
        s.with_rq(0, |rq| {
            assert_eq!(rq.dl.dl_nr_running, 2);
            assert_eq!(rq.rd.cpupri.cpu_pri(0), convert_prio(MAX_RT_PRIO));
            let early_dl = rq.task(early).dl.deadline;
            assert_eq!(rq.dl.earliest_dl_curr, early_dl);
            assert_eq!(rq.rd.cpudl.maximum(), Some((0, early_dl)));
            assert!(rq.task(late).dl.deadline > early_dl);
        });
    }

    #[test]
    fn new_tasks_at_clock_zero_get_their_own_deadlines() {
        let (s, _) = sched(1);
        let late = s.spawn("late", dl(1, 30), None).unwrap();
        let early = s.spawn("early", dl(1, 20), None).unwrap();
        s.with_rq(0, |rq| {
            assert_eq!(rq.clock, 0);
            assert_eq!(rq.task(late).dl.deadline, 30 * MS);
            assert_eq!(rq.task(early).dl.deadline, 20 * MS);
            assert_eq!(rq.task(early).dl.runtime, MS as i64);
        });
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), early);
    }

    #[test]
    fn throttled_until_next_period() {
        let (s, clock) = sched(1);
        let t = s.spawn("t", dl(10, 50), None).unwrap();
        let f = s.spawn("f", SchedAttr::normal(0), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), t);

        let mut ticks = 0;
        while s.curr_on(0) == t && ticks < 100 {
            tick(&s, &clock, 0);
            ticks += 1;
        }
        assert_eq!(s.curr_on(0), f);
        // 预算 10ms，多跑不超过一个 tick
        assert!(ticks as u64 * TICK_NSEC <= 10 * MS + TICK_NSEC);
        s.with_rq(0, |rq| {
            let st = rq.task(t);
            assert!(st.dl.dl_throttled);
            assert!(st.dl.runtime <= 0);
            assert_eq!(rq.dl.dl_nr_running, 0);
            // 节流中的任务仍然活跃
            assert_eq!(rq.dl.running_bw, st.dl.params.dl_bw);
        });
        assert!(s.timers.is_active(TimerEvent::DlReplenish(t)));

        let mut waited = 0;
        while s.curr_on(0) != t && waited < 100 {
            tick(&s, &clock, 0);
            waited += 1;
        }
        assert_eq!(s.curr_on(0), t);
        assert!((ticks + waited) as u64 * TICK_NSEC <= 50 * MS + TICK_NSEC);
        s.with_rq(0, |rq| {
            let st = rq.task(t);
            assert!(!st.dl.dl_throttled);
            assert!(st.dl.runtime > 0);
        });
    }

    #[test]
    fn sleeping_task_keeps_bandwidth_until_zero_lag() {
        let (s, clock) = sched(1);
        let t = s.spawn("t", dl(10, 100), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), t);
        tick(&s, &clock, 0);
        let bw = to_ratio(100 * MS, 10 * MS);

        s.block_current(TaskState::INTERRUPTIBLE);
        assert_ne!(s.curr_on(0), t);
        s.with_rq(0, |rq| {
            assert!(rq.task(t).dl.dl_non_contending);
            assert_eq!(rq.dl.running_bw, bw);
            assert_eq!(rq.dl.this_bw, bw);
        });
        assert!(s.timers.is_active(TimerEvent::DlInactive(t)));

        // 用掉一个 tick 的预算，0-lag 大约在 10 个 tick 之后
        for _ in 0..20 {
            tick(&s, &clock, 0);
        }
        s.with_rq(0, |rq| {
            assert!(!rq.task(t).dl.dl_non_contending);
            assert_eq!(rq.dl.running_bw, 0);
            assert_eq!(rq.dl.this_bw, bw);
            assert_eq!(rq.rd.dl_bw.lock().total_bw, bw);
        });

        assert!(s.wake_up_process(t));
        s.with_rq(0, |rq| assert_eq!(rq.dl.running_bw, bw));
    }

    #[test]
    fn exit_returns_all_bandwidth() {
        let (s, _) = sched(1);
        let t = s.spawn("t", dl(10, 100), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), t);
        s.do_exit();
        assert!(s.find_task(t).is_none() || s.with_task(t, |_| ()).is_none());
        s.with_rq(0, |rq| {
            assert_eq!(rq.dl.running_bw, 0);
            assert_eq!(rq.dl.this_bw, 0);
            assert_eq!(rq.rd.dl_bw.lock().total_bw, 0);
        });
        assert!(!s.timers.is_active(TimerEvent::DlInactive(t)));
    }

    #[test]
    fn later_deadline_is_pushed_to_free_cpu() {
        let (s, _) = sched(2);
        let early = s.spawn("early", dl(1, 10), None).unwrap();
        let late = s.spawn("late", dl(1, 20), None).unwrap();
        let early_cpu = s.with_task(early, |st| st.cpu()).unwrap();
        let late_cpu = s.with_task(late, |st| st.cpu()).unwrap();
        if early_cpu != late_cpu {
            // 唤醒时已经分开了
            return;
        }
        let cpu = early_cpu;
        s.with_rq(cpu, |rq| {
            assert!(rq.dl.overloaded);
            assert_eq!(rq.rd.dl_overloaded(), 1);
        });

        s.schedule_on(cpu, false);
        let other = 1 - cpu;
        assert_eq!(s.curr_on(cpu), early);
        assert_eq!(s.with_task(late, |st| st.cpu()), Some(other));
        let bw = to_ratio(20 * MS, MS);
        s.with_rq(cpu, |rq| {
            assert!(!rq.dl.overloaded);
            assert!(rq.dl.pushable.is_empty());
            assert_eq!(rq.rd.dl_overloaded(), 0);
        });
        s.with_rq(other, |rq| {
            assert_eq!(rq.dl.dl_nr_running, 1);
            assert_eq!(rq.dl.this_bw, bw);
            assert_eq!(rq.dl.running_bw, bw);
        });
    }

    #[test]
    fn yield_gives_up_rest_of_reservation() {
        let (s, _) = sched(1);
        let t = s.spawn("t", dl(10, 100), None).unwrap();
        let f = s.spawn("f", SchedAttr::normal(0), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), t);
        s.with_rq(0, |rq| s.yield_task_dl(rq));
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), f);
        s.with_rq(0, |rq| {
            let st = rq.task(t);
            assert!(st.dl.dl_throttled);
            assert!(st.dl.dl_yielded);
        });
        assert!(s.timers.is_active(TimerEvent::DlReplenish(t)));
    }
}
