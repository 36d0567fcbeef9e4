//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! CFS 带宽控制（`cpu.max`）
//!
//! 每个任务组有一个全局运行时间池，每个周期补充 `quota`。各 CPU 上的
//! cfs_rq 按 `CFS_BANDWIDTH_SLICE` 从池里取时间，本地用完又取不到时整棵
//! 子树被节流：组实体从父队列摘下，组内任务保持排队但不可见。
//!
//! 周期定时器补充运行时间后按 CPU 顺序把它分给被节流的 cfs_rq；
//! cfs_rq 变空时把多余的本地时间还回全局池，积累到一定数量由 slack
//! 定时器再分发。
//!
//! 加锁顺序：rq -> `TaskGroup::cfs_bandwidth`。分发时先释放带宽锁再逐个
//! 获取 rq 锁。

use alloc::vec::Vec;

use super::core::Scheduler;
use super::entity::EntityId;
use super::fair::UPDATE_TG;
use super::fixedpt::{to_ratio, RUNTIME_INF};
use super::group::{
    CfsBandwidth, GroupId, TaskGroup, CFS_BANDWIDTH_SLACK_PERIOD, CFS_BANDWIDTH_SLICE, MAX_CFS_QUOTA_PERIOD,
    MIN_CFS_QUOTA_PERIOD, MIN_CFS_RQ_RUNTIME, NSEC_PER_USEC, ROOT_TASK_GROUP,
};
use super::hrtimer::{hrtimer_forward, HrtimerRestart, TimerEvent};
use super::rq::Rq;
use super::{DequeueFlags, EnqueueFlags};
use crate::config::CFS_BANDWIDTH;
use crate::errno::{SchedError, SchedResult};

/// 周期定时器离到期不足这么久时不再启动 slack 定时器
const MIN_BANDWIDTH_EXPIRATION: u64 = 2_000_000;

/// quota + burst 的上限，保证换算成带宽比例时不溢出
const MAX_CFS_RUNTIME: u64 = (1 << 44) - 1;

/// 带宽统计（`cpu.stat`）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfsBandwidthStat {
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_time: u64,
    pub nr_bursts: u64,
    pub burst_time: u64,
}

/// 从全局池给本地 cfs_rq 取运行时间，使其剩余达到一个 slice
///
/// 返回后本地剩余为正表示取到了。
fn assign_runtime(b: &mut CfsBandwidth, remaining: &mut i64, target: u64) -> bool {
    let min_amount = (target as i64).saturating_sub(*remaining).max(0) as u64;
    let amount = if !b.enabled() {
        min_amount
    } else {
        let a = min_amount.min(b.runtime);
        b.runtime -= a;
        b.idle = false;
        a
    };
    *remaining += amount as i64;
    *remaining > 0
}

impl Scheduler {
    fn cfs_bandwidth_used(&self) -> bool {
        CFS_BANDWIDTH
    }

    fn cfs_group(&self, q: GroupId) -> Option<alloc::sync::Arc<TaskGroup>> {
        if q == ROOT_TASK_GROUP {
            return None;
        }
        self.group(q)
    }

    /// 周期定时器未运行时启动
    fn start_cfs_bandwidth(&self, g: GroupId, b: &mut CfsBandwidth) {
        if b.period_active {
            return;
        }
        b.period_active = true;
        let now = self.sched_clock();
        self.timers.start(TimerEvent::CfsPeriod(g), now + b.period);
    }

    /// 带宽锁下给本地 cfs_rq 取运行时间
    fn assign_cfs_rq_runtime(&self, rq: &mut Rq, q: GroupId) -> bool {
        let Some(tg) = self.cfs_group(q) else {
            return true;
        };
        let mut b = tg.cfs_bandwidth.lock();
        if b.enabled() {
            self.start_cfs_bandwidth(q, &mut b);
        }
        assign_runtime(&mut b, &mut rq.cfs[q].runtime_remaining, CFS_BANDWIDTH_SLICE)
    }

    /// 扣减本地运行时间，用完又取不到时让当前任务让出 CPU
    ///
    /// 真正的节流推迟到 put_prev_entity。
    pub(crate) fn account_cfs_rq_runtime(&self, rq: &mut Rq, q: GroupId, delta: u64) {
        if !self.cfs_bandwidth_used() || !rq.cfs[q].runtime_enabled {
            return;
        }
        rq.cfs[q].runtime_remaining -= delta as i64;
        if rq.cfs[q].runtime_remaining > 0 {
            return;
        }
        if rq.cfs[q].throttled {
            return;
        }
        if !self.assign_cfs_rq_runtime(rq, q) && rq.cfs[q].curr.is_some() {
            self.resched_curr(rq);
        }
    }

    /// 运行时间已耗尽时节流，返回 cfs_rq 是否处于节流状态
    pub(crate) fn check_cfs_rq_runtime(&self, rq: &mut Rq, q: GroupId) -> bool {
        if !self.cfs_bandwidth_used() || !rq.cfs[q].runtime_enabled {
            return false;
        }
        if rq.cfs[q].runtime_remaining > 0 || rq.cfs[q].throttled {
            return rq.cfs[q].throttled;
        }
        self.throttle_cfs_rq(rq, q)
    }

    /// 空闲 cfs_rq 上第一个实体入队时检查配额
    ///
    /// 空闲期间不扣减运行时间，入队时才发现已经用完。
    pub(crate) fn check_enqueue_throttle(&self, rq: &mut Rq, q: GroupId) {
        if !self.cfs_bandwidth_used() || !rq.cfs[q].runtime_enabled {
            return;
        }
        // 当前实体所在的 cfs_rq 由 put_prev_entity 负责
        if rq.cfs[q].curr.is_some() || rq.cfs[q].throttled {
            return;
        }
        self.account_cfs_rq_runtime(rq, q, 0);
        if rq.cfs[q].runtime_remaining <= 0 {
            self.throttle_cfs_rq(rq, q);
        }
    }

    /// cfs_rq 变空时把超出最小保留量的本地时间还回全局池
    pub(crate) fn return_cfs_rq_runtime(&self, rq: &mut Rq, q: GroupId) {
        if !self.cfs_bandwidth_used() || !rq.cfs[q].runtime_enabled || rq.cfs[q].nr_running != 0 {
            return;
        }
        let slack = rq.cfs[q].runtime_remaining - MIN_CFS_RQ_RUNTIME as i64;
        if slack <= 0 {
            return;
        }
        let Some(tg) = self.cfs_group(q) else {
            return;
        };
        {
            let mut b = tg.cfs_bandwidth.lock();
            if b.enabled() {
                b.runtime += slack as u64;
                if b.runtime > b.quota && !b.throttled_cpus.is_empty() {
                    self.start_cfs_slack_bandwidth(q, &mut b);
                }
            }
        }
        rq.cfs[q].runtime_remaining -= slack;
    }

    fn start_cfs_slack_bandwidth(&self, g: GroupId, b: &mut CfsBandwidth) {
        let now = self.sched_clock();
        // 周期定时器马上就会分发
        if let Some(exp) = self.timers.expires(TimerEvent::CfsPeriod(g)) {
            if exp.saturating_sub(now) < CFS_BANDWIDTH_SLACK_PERIOD + MIN_BANDWIDTH_EXPIRATION {
                return;
            }
        }
        if b.slack_started {
            return;
        }
        b.slack_started = true;
        self.timers.start(TimerEvent::CfsSlack(g), now + CFS_BANDWIDTH_SLACK_PERIOD);
    }

    /// `q` 及其所有后代组
    fn tg_subtree(&self, q: GroupId) -> Vec<GroupId> {
        let mut out = alloc::vec![q];
        let mut i = 0;
        while i < out.len() {
            if let Some(tg) = self.group(out[i]) {
                out.extend(tg.children.lock().iter().copied());
            }
            i += 1;
        }
        out
    }

    fn tg_throttle_down(&self, rq: &mut Rq, q: GroupId) {
        let (pelt_now, clock_task) = (rq.pelt.now(), rq.clock_task);
        for g in self.tg_subtree(q) {
            let Some(c) = rq.cfs.get_mut(g) else {
                continue;
            };
            if c.throttle_count == 0 {
                c.throttled_clock_pelt = pelt_now;
                c.throttled_clock_task = clock_task;
            }
            c.throttle_count += 1;
        }
    }

    fn tg_unthrottle_up(&self, rq: &mut Rq, q: GroupId) {
        let (pelt_now, clock_task) = (rq.pelt.now(), rq.clock_task);
        for g in self.tg_subtree(q) {
            let Some(c) = rq.cfs.get_mut(g) else {
                continue;
            };
            c.throttle_count = c.throttle_count.saturating_sub(1);
            if c.throttle_count == 0 {
                c.throttled_clock_pelt_time += pelt_now.saturating_sub(c.throttled_clock_pelt);
                c.throttled_clock_task_time += clock_task.saturating_sub(c.throttled_clock_task);
                if c.load.weight != 0 {
                    c.on_list = true;
                }
            }
        }
    }

    /// 节流：组实体逐级摘下直到遇到仍有负载的父队列
    ///
    /// 如果全局池在最后一刻有了运行时间，就取一点放弃节流并返回 false。
    fn throttle_cfs_rq(&self, rq: &mut Rq, q: GroupId) -> bool {
        let Some(tg) = self.cfs_group(q) else {
            return false;
        };
        {
            let mut b = tg.cfs_bandwidth.lock();
            // 分发过程中别的 CPU 刚好补了时间
            if assign_runtime(&mut b, &mut rq.cfs[q].runtime_remaining, 1) {
                return false;
            }
            b.throttled_cpus = b.throttled_cpus.with(rq.cpu);
        }

        self.tg_throttle_down(rq, q);

        let task_delta = rq.cfs[q].h_nr_running;
        let idle_delta = rq.cfs[q].idle_h_nr_running;
        let mut cur = Some(EntityId::Group(q));
        let mut dequeue = true;
        let mut reached_top = true;
        while let Some(e) = cur {
            if !rq.se(e).on_rq {
                reached_top = false;
                break;
            }
            let pq = rq.se(e).cfs_rq;
            if dequeue {
                self.dequeue_entity(rq, pq, e, DequeueFlags::SLEEP);
            } else {
                self.update_load_avg(rq, pq, e, UPDATE_TG);
                self.se_update_runnable(rq, e);
            }
            rq.cfs[pq].h_nr_running -= task_delta;
            rq.cfs[pq].idle_h_nr_running -= idle_delta;
            if rq.cfs[pq].load.weight != 0 {
                dequeue = false;
            }
            if rq.cfs[pq].throttled {
                reached_top = false;
                break;
            }
            cur = rq.se(e).parent();
        }
        if reached_top {
            self.sub_nr_running(rq, task_delta);
        }

        let c = &mut rq.cfs[q];
        c.throttled = true;
        c.throttled_clock = rq.clock;
        log::trace!("CPU{}: cfs_rq of group {} throttled, {} tasks", rq.cpu, q, task_delta);
        true
    }

    /// 解除节流，组实体重新挂回父队列
    pub(crate) fn unthrottle_cfs_rq(&self, rq: &mut Rq, q: GroupId) {
        let clock = rq.clock;
        if let Some(tg) = self.cfs_group(q) {
            let mut b = tg.cfs_bandwidth.lock();
            b.throttled_time += clock.saturating_sub(rq.cfs[q].throttled_clock);
            b.throttled_cpus = b.throttled_cpus.without(rq.cpu);
        }
        rq.cfs[q].throttled = false;
        self.tg_unthrottle_up(rq, q);

        if rq.cfs[q].load.weight == 0 {
            return;
        }

        let task_delta = rq.cfs[q].h_nr_running;
        let idle_delta = rq.cfs[q].idle_h_nr_running;
        let mut cur = Some(EntityId::Group(q));
        let mut enqueue = true;
        while let Some(e) = cur {
            if rq.se(e).on_rq {
                enqueue = false;
            }
            let pq = rq.se(e).cfs_rq;
            if enqueue {
                self.enqueue_entity(rq, pq, e, EnqueueFlags::WAKEUP);
            } else {
                self.update_load_avg(rq, pq, e, UPDATE_TG);
                self.se_update_runnable(rq, e);
            }
            rq.cfs[pq].h_nr_running += task_delta;
            rq.cfs[pq].idle_h_nr_running += idle_delta;
            // 上层仍被节流，计数到此为止
            if rq.cfs[pq].throttled {
                return;
            }
            cur = rq.se(e).parent();
        }
        self.add_nr_running(rq, task_delta);

        // 空闲 CPU 上有了任务
        if rq.curr_is_idle() && rq.cfs[ROOT_TASK_GROUP].nr_running > 0 {
            self.resched_curr(rq);
        }
    }

    /// 把全局池里的时间分给被节流的 cfs_rq
    fn distribute_cfs_runtime(&self, g: GroupId, tg: &TaskGroup) {
        let cpus = tg.cfs_bandwidth.lock().throttled_cpus;
        for cpu in cpus.iter() {
            let mut rq = self.rq_lock(cpu);
            if !rq.cfs.get(g).is_some_and(|c| c.throttled) {
                continue;
            }
            self.update_rq_clock(&mut rq);
            let want = 1 - rq.cfs[g].runtime_remaining.min(0);
            let got = {
                let mut b = tg.cfs_bandwidth.lock();
                let got = (want as u64).min(b.runtime);
                b.runtime -= got;
                got
            };
            if got == 0 {
                break;
            }
            rq.cfs[g].runtime_remaining += got as i64;
            if rq.cfs[g].runtime_remaining > 0 {
                self.unthrottle_cfs_rq(&mut rq, g);
            }
            self.unlock_with_callbacks(rq);
        }
    }

    /// 一个或多个周期结束，返回组是否空闲（定时器可以停下）
    fn do_sched_cfs_period_timer(&self, g: GroupId, tg: &TaskGroup, overrun: u64) -> bool {
        {
            let mut b = tg.cfs_bandwidth.lock();
            if !b.enabled() {
                return true;
            }
            let throttled = !b.throttled_cpus.is_empty();
            b.nr_periods += overrun;
            b.refill_runtime();

            if b.idle && !throttled {
                return true;
            }
            if !throttled {
                // 下一个周期仍无人使用就停下定时器
                b.idle = true;
                return false;
            }
            b.nr_throttled += overrun;
        }
        loop {
            let more = {
                let b = tg.cfs_bandwidth.lock();
                !b.throttled_cpus.is_empty() && b.runtime > 0
            };
            if !more {
                break;
            }
            let before = tg.cfs_bandwidth.lock().runtime;
            self.distribute_cfs_runtime(g, tg);
            // 剩下的节流 CPU 已被拔下或者被别处解除
            if tg.cfs_bandwidth.lock().runtime == before {
                break;
            }
        }
        tg.cfs_bandwidth.lock().idle = false;
        false
    }

    pub(crate) fn sched_cfs_period_timer(&self, g: GroupId, expires: u64, now: u64) -> HrtimerRestart {
        let Some(tg) = self.group(g).filter(|t| !t.is_dead()) else {
            return HrtimerRestart::NoRestart;
        };
        let period = tg.cfs_bandwidth.lock().period;
        let (next, overrun) = hrtimer_forward(expires, now, period);
        if self.do_sched_cfs_period_timer(g, &tg, overrun.max(1)) {
            tg.cfs_bandwidth.lock().period_active = false;
            return HrtimerRestart::NoRestart;
        }
        HrtimerRestart::Restart(next)
    }

    pub(crate) fn sched_cfs_slack_timer(&self, g: GroupId) -> HrtimerRestart {
        let Some(tg) = self.group(g) else {
            return HrtimerRestart::NoRestart;
        };
        {
            let mut b = tg.cfs_bandwidth.lock();
            b.slack_started = false;
            if !b.enabled() || b.runtime <= CFS_BANDWIDTH_SLICE {
                return HrtimerRestart::NoRestart;
            }
        }
        self.distribute_cfs_runtime(g, &tg);
        HrtimerRestart::NoRestart
    }

    /// CPU 下线：解除全部节流，留下的任务要能被迁走
    pub(crate) fn unthrottle_offline_cfs_rqs(&self, rq: &mut Rq) {
        for q in 1..rq.cfs.len() {
            if !rq.cfs[q].runtime_enabled {
                continue;
            }
            // 保证迁走之前不会再次节流
            rq.cfs[q].runtime_remaining = 1;
            rq.cfs[q].runtime_enabled = false;
            if rq.cfs[q].throttled {
                self.unthrottle_cfs_rq(rq, q);
            }
        }
    }

    /// CPU 上线：按各组当前配置打开本地带宽控制
    pub(crate) fn update_runtime_enabled(&self, rq: &mut Rq) {
        for q in 1..rq.cfs.len() {
            let Some(tg) = self.group(q).filter(|t| !t.is_dead()) else {
                continue;
            };
            let enabled = tg.cfs_bandwidth.lock().enabled();
            rq.cfs[q].runtime_enabled = enabled;
        }
    }

    // ---------------------------------------------------------------
    // 配置
    // ---------------------------------------------------------------

    /// 层级约束：子组的带宽比例不能超过最近的受限祖先
    fn cfs_schedulable(&self, g: GroupId, period: u64, quota: u64) -> SchedResult<Vec<(GroupId, u64)>> {
        let groups: Vec<_> = self.groups.read().iter().flatten().cloned().collect();
        let mut hq: Vec<Option<u64>> = Vec::new();
        let mut out = Vec::with_capacity(groups.len());
        for tg in &groups {
            let (p, q) = if tg.id == g {
                (period, quota)
            } else {
                let b = tg.cfs_bandwidth.lock();
                (b.period, b.quota)
            };
            let mut ratio = if q == RUNTIME_INF { RUNTIME_INF } else { to_ratio(p, q) };
            if tg.id != ROOT_TASK_GROUP && !tg.is_dead() {
                let parent = tg.parent.and_then(|pid| hq.get(pid).copied().flatten()).unwrap_or(RUNTIME_INF);
                if ratio == RUNTIME_INF {
                    ratio = parent;
                } else if parent != RUNTIME_INF && ratio > parent {
                    return Err(SchedError::InvalidAttr);
                }
            } else {
                ratio = RUNTIME_INF;
            }
            if hq.len() <= tg.id {
                hq.resize(tg.id + 1, None);
            }
            hq[tg.id] = Some(ratio);
            out.push((tg.id, ratio));
        }
        Ok(out)
    }

    /// 设置组的 CFS 带宽，单位 ns，`quota == RUNTIME_INF` 表示不限制
    pub fn tg_set_cfs_bandwidth(&self, g: GroupId, period: u64, quota: u64, burst: u64) -> SchedResult<()> {
        if g == ROOT_TASK_GROUP {
            return Err(SchedError::InvalidAttr);
        }
        let tg = self.group(g).filter(|t| !t.is_dead()).ok_or(SchedError::InvalidAttr)?;
        if quota < MIN_CFS_QUOTA_PERIOD || !(MIN_CFS_QUOTA_PERIOD..=MAX_CFS_QUOTA_PERIOD).contains(&period) {
            return Err(SchedError::InvalidAttr);
        }
        if quota != RUNTIME_INF && (quota > MAX_CFS_RUNTIME || burst > quota || quota + burst > MAX_CFS_RUNTIME) {
            return Err(SchedError::InvalidAttr);
        }

        let _serial = self.bandwidth_mutex.lock();
        for (id, ratio) in self.cfs_schedulable(g, period, quota)? {
            if let Some(t) = self.group(id) {
                t.cfs_bandwidth.lock().hierarchical_quota = ratio;
            }
        }

        let enabled = quota != RUNTIME_INF;
        {
            let mut b = tg.cfs_bandwidth.lock();
            b.period = period;
            b.quota = quota;
            b.burst = if enabled { burst } else { 0 };
            b.runtime = 0;
            b.runtime_snap = 0;
            b.refill_runtime();
            if enabled {
                // 新周期从现在开始
                self.timers.cancel(TimerEvent::CfsPeriod(g));
                b.period_active = false;
                self.start_cfs_bandwidth(g, &mut b);
            }
        }

        for cpu in self.online_mask().iter() {
            let mut rq = self.rq_lock(cpu);
            self.update_rq_clock(&mut rq);
            let c = &mut rq.cfs[g];
            c.runtime_enabled = enabled;
            c.runtime_remaining = 0;
            if c.throttled {
                self.unthrottle_cfs_rq(&mut rq, g);
            }
            self.unlock_with_callbacks(rq);
        }
        log::debug!("sched: group {} cfs quota {} period {} burst {}", g, quota, period, burst);
        Ok(())
    }

    /// `cpu.max` 写入：quota 为负表示不限制，单位 us
    pub fn tg_set_cfs_quota(&self, g: GroupId, quota_us: i64) -> SchedResult<()> {
        let (period, burst) = self.tg_cfs_period_burst(g)?;
        let quota = if quota_us < 0 {
            RUNTIME_INF
        } else {
            (quota_us as u64).checked_mul(NSEC_PER_USEC).ok_or(SchedError::InvalidAttr)?
        };
        self.tg_set_cfs_bandwidth(g, period, quota, burst)
    }

    pub fn tg_get_cfs_quota(&self, g: GroupId) -> SchedResult<i64> {
        let tg = self.group(g).ok_or(SchedError::InvalidAttr)?;
        let quota = tg.cfs_bandwidth.lock().quota;
        Ok(if quota == RUNTIME_INF { -1 } else { (quota / NSEC_PER_USEC) as i64 })
    }

    pub fn tg_set_cfs_period(&self, g: GroupId, period_us: u64) -> SchedResult<()> {
        let tg = self.group(g).ok_or(SchedError::InvalidAttr)?;
        let (quota, burst) = {
            let b = tg.cfs_bandwidth.lock();
            (b.quota, b.burst)
        };
        let period = period_us.checked_mul(NSEC_PER_USEC).ok_or(SchedError::InvalidAttr)?;
        self.tg_set_cfs_bandwidth(g, period, quota, burst)
    }

    pub fn tg_get_cfs_period(&self, g: GroupId) -> SchedResult<u64> {
        let tg = self.group(g).ok_or(SchedError::InvalidAttr)?;
        let period = tg.cfs_bandwidth.lock().period;
        Ok(period / NSEC_PER_USEC)
    }

    pub fn tg_set_cfs_burst(&self, g: GroupId, burst_us: u64) -> SchedResult<()> {
        let tg = self.group(g).ok_or(SchedError::InvalidAttr)?;
        let (period, quota) = {
            let b = tg.cfs_bandwidth.lock();
            (b.period, b.quota)
        };
        let burst = burst_us.checked_mul(NSEC_PER_USEC).ok_or(SchedError::InvalidAttr)?;
        self.tg_set_cfs_bandwidth(g, period, quota, burst)
    }

    fn tg_cfs_period_burst(&self, g: GroupId) -> SchedResult<(u64, u64)> {
        let tg = self.group(g).ok_or(SchedError::InvalidAttr)?;
        let b = tg.cfs_bandwidth.lock();
        Ok((b.period, b.burst))
    }

    pub fn tg_cfs_stat(&self, g: GroupId) -> SchedResult<CfsBandwidthStat> {
        let tg = self.group(g).ok_or(SchedError::InvalidAttr)?;
        let b = tg.cfs_bandwidth.lock();
        Ok(CfsBandwidthStat {
            nr_periods: b.nr_periods,
            nr_throttled: b.nr_throttled,
            throttled_time: b.throttled_time,
            nr_bursts: b.nr_burst,
            burst_time: b.burst_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::cmdline::BootParams;
    use crate::config::TICK_NSEC;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;
    use crate::sched::SchedAttr;

    const MS: u64 = 1_000_000;

    fn sched(cpus: usize) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(cpus));
        let s = Scheduler::with_boot_params(ArchTopology::flat(cpus), clock.clone(), Arc::new(NoopHooks), BootParams::new());
        (s, clock)
    }

    fn tick(s: &Scheduler, clock: &ManualClock, cpu: usize) {
        clock.advance(TICK_NSEC);
        s.timer_interrupt(cpu, false);
        s.preempt_schedule_irq(cpu);
    }

    #[test]
    fn local_pool_takes_a_slice_at_a_time() {
        let mut b = CfsBandwidth::new();
        b.quota = 20 * MS;
        b.refill_runtime();
        let mut remaining = 0;
        assert!(assign_runtime(&mut b, &mut remaining, CFS_BANDWIDTH_SLICE));
        assert_eq!(remaining, CFS_BANDWIDTH_SLICE as i64);
        assert_eq!(b.runtime, 20 * MS - CFS_BANDWIDTH_SLICE);
        // 欠账先补齐
        remaining = -(MS as i64);
        assert!(assign_runtime(&mut b, &mut remaining, CFS_BANDWIDTH_SLICE));
        assert_eq!(remaining, CFS_BANDWIDTH_SLICE as i64);
        b.runtime = 0;
        remaining = 0;
        assert!(!assign_runtime(&mut b, &mut remaining, CFS_BANDWIDTH_SLICE));
    }

    #[test]
    fn bad_bandwidth_is_rejected() {
        let (s, _) = sched(1);
        let g = s.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
        assert_eq!(s.tg_set_cfs_bandwidth(ROOT_TASK_GROUP, 100 * MS, 10 * MS, 0), Err(SchedError::InvalidAttr));
        assert_eq!(s.tg_set_cfs_bandwidth(g, 100 * MS, 1000, 0), Err(SchedError::InvalidAttr));
        assert_eq!(s.tg_set_cfs_bandwidth(g, 2_000 * MS, 10 * MS, 0), Err(SchedError::InvalidAttr));
        assert_eq!(s.tg_set_cfs_bandwidth(g, 100 * MS, 10 * MS, 20 * MS), Err(SchedError::InvalidAttr));

        s.tg_set_cfs_quota(g, 50_000).unwrap();
        assert_eq!(s.tg_get_cfs_quota(g), Ok(50_000));
        assert_eq!(s.tg_get_cfs_period(g), Ok(100_000));
        let c = s.sched_create_group(g, "c").unwrap();
        // 父组只有一半
        assert_eq!(s.tg_set_cfs_quota(c, 80_000), Err(SchedError::InvalidAttr));
        s.tg_set_cfs_quota(c, 20_000).unwrap();
        // 父组不能再降到子组之下
        assert_eq!(s.tg_set_cfs_quota(g, 10_000), Err(SchedError::InvalidAttr));
        s.tg_set_cfs_quota(g, -1).unwrap();
        assert_eq!(s.tg_get_cfs_quota(g), Ok(-1));
    }

    #[test]
    fn group_is_throttled_then_refilled() {
        let (s, clock) = sched(1);
        let g = s.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        s.sched_move_task(p, g).unwrap();
        s.tg_set_cfs_bandwidth(g, 100 * MS, 20 * MS, 0).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), p);

        let mut ran = 0;
        while s.curr_on(0) == p && ran < 50 {
            tick(&s, &clock, 0);
            ran += 1;
        }
        assert_ne!(s.curr_on(0), p);
        assert!(ran as u64 * TICK_NSEC >= 20 * MS);
        assert!(ran as u64 * TICK_NSEC <= 20 * MS + 2 * TICK_NSEC);
        s.with_rq(0, |rq| {
            assert!(rq.cfs[g].throttled);
            assert_eq!(rq.cfs[g].throttle_count, 1);
            assert_eq!(rq.nr_running, 0);
            // 任务仍然排在被节流的队列上
            assert_eq!(rq.cfs[g].nr_running, 1);
            assert!(!rq.se(EntityId::Group(g)).on_rq);
        });

        let mut waited = 0;
        while s.curr_on(0) != p && waited < 50 {
            tick(&s, &clock, 0);
            waited += 1;
        }
        assert_eq!(s.curr_on(0), p);
        assert!((ran + waited) as u64 * TICK_NSEC <= 100 * MS + 2 * TICK_NSEC);
        s.with_rq(0, |rq| {
            assert!(!rq.cfs[g].throttled);
            assert_eq!(rq.nr_running, 1);
        });
        let stat = s.tg_cfs_stat(g).unwrap();
        assert!(stat.nr_periods >= 1);
        assert_eq!(stat.nr_throttled, 1);
        assert!(stat.throttled_time > 0);
    }

    #[test]
    fn offline_cpu_drops_throttling() {
        let (s, clock) = sched(1);
        let g = s.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        s.sched_move_task(p, g).unwrap();
        s.tg_set_cfs_bandwidth(g, 100 * MS, 4 * MS, 0).unwrap();
        s.schedule_on(0, false);
        for _ in 0..4 {
            tick(&s, &clock, 0);
        }
        assert!(s.with_rq(0, |rq| rq.cfs[g].throttled));
        s.with_rq(0, |rq| {
            s.unthrottle_offline_cfs_rqs(rq);
            assert!(!rq.cfs[g].throttled);
            assert!(!rq.cfs[g].runtime_enabled);
            assert_eq!(rq.nr_running, 1);
        });
    }
}
