//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! RT 调度类（SCHED_FIFO / SCHED_RR）
//!
//! 每个 rt_rq 是一个 100 级的优先级数组。开启组调度时，组在父
//! rt_rq 中以组实体出现，组实体的优先级是其子队列的最高优先级。
//!
//! 带宽：每个任务组有 `{period, runtime}`，每 CPU 累计 `rt_time`，
//! 超出配额后该 rt_rq 被节流并从上层摘下，由周期定时器归还后重新
//! 入队。被 PI 提升的实体不受节流。
//!
//! 负载分布：可迁移的 RT 任务多于一个时本 CPU 进入 rto_mask（过载），
//! 过载 CPU 把任务推给优先级更低的 CPU；CPU 要降低优先级时从过载
//! CPU 拉取。拉取默认通过 IPI 让过载 CPU 自己推送。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::class::{SchedClass, TaskSnapshot};
use super::core::Scheduler;
use super::cpupri::CPUPRI_INVALID;
use super::entity::EntityId;
use super::features::SchedFeatures;
use super::fixedpt::{to_ratio, RUNTIME_INF};
use super::group::{GroupId, TaskGroup, NSEC_PER_USEC, ROOT_TASK_GROUP};
use super::hooks::IpiKind;
use super::hrtimer::{hrtimer_forward, HrtimerRestart, TimerEvent};
use super::pelt::update_rq_avg;
use super::root_domain::RootDomain;
use super::rq::{BalanceCallback, Rq, RqGuard};
use super::stop::StopWork;
use super::topology::SdFlags;
use super::{rt_prio, DequeueFlags, EnqueueFlags, WakeFlags, MAX_RT_PRIO};
use crate::config::{RT_GROUP_SCHED, TICK_NSEC};
use crate::errno::{SchedError, SchedResult};
use crate::process::{OnRq, Pid, SchedPolicy};
use crate::sched_bug_on;

const RT_MAX_TRIES: usize = 3;

/// 空 rt_rq 的 highest_prio 占位值
const RT_PRIO_EMPTY: i32 = MAX_RT_PRIO - 1;

/// 配额上限，防止换算成比例时溢出
const MAX_RT_RUNTIME: u64 = ((1u64 << 44) - 1) * NSEC_PER_USEC;

fn rt_se_prio(rq: &Rq, e: EntityId) -> i32 {
    match e {
        EntityId::Task(pid) => rq.task(pid).prio,
        EntityId::Group(g) => rq.rt[g].highest_prio_curr,
    }
}

fn rt_se_nr_running(rq: &Rq, e: EntityId) -> u32 {
    match e {
        EntityId::Task(_) => 1,
        EntityId::Group(g) => rq.rt[g].rt_nr_running,
    }
}

fn rt_se_rr_nr_running(rq: &Rq, e: EntityId) -> u32 {
    match e {
        EntityId::Task(pid) => (rq.task(pid).policy == SchedPolicy::Rr) as u32,
        EntityId::Group(g) => rq.rt[g].rr_nr_running,
    }
}

/// PI 提升中的实体
fn rt_se_boosted(rq: &Rq, e: EntityId) -> bool {
    match e {
        EntityId::Task(pid) => {
            let st = rq.task(pid);
            st.prio != st.normal_prio
        }
        EntityId::Group(g) => rq.rt[g].rt_nr_boosted > 0,
    }
}

fn rt_rq_throttled(rq: &Rq, q: GroupId) -> bool {
    let rt = &rq.rt[q];
    rt.rt_throttled && (!RT_GROUP_SCHED || rt.rt_nr_boosted == 0)
}

/// 从实体向上直到根 rt_rq 的实体链，自底向上
fn rt_chain(rq: &Rq, e: EntityId) -> Vec<EntityId> {
    let mut chain = Vec::new();
    let mut cur = Some(e);
    while let Some(x) = cur {
        chain.push(x);
        cur = rq.rt_se(x).parent();
    }
    chain
}

impl Scheduler {
    fn rt_bandwidth_enabled(&self) -> bool {
        self.tunables.rt_runtime() != RUNTIME_INF
    }

    /// rq 上有效的 rt_rq
    fn rt_rq_ids(&self, rq: &Rq) -> Vec<GroupId> {
        if !RT_GROUP_SCHED {
            return alloc::vec![ROOT_TASK_GROUP];
        }
        (0..rq.rt.len())
            .filter(|&g| g == ROOT_TASK_GROUP || (rq.rt[g].tg == g && rq.group_rt_se[g].is_some()))
            .collect()
    }

    // ---------------------------------------------------------------
    // 优先级数组
    // ---------------------------------------------------------------

    fn inc_rt_prio(&self, rq: &mut Rq, q: GroupId, prio: i32) {
        if prio < rq.rt[q].highest_prio_curr {
            rq.rt[q].highest_prio_curr = prio;
            if q == ROOT_TASK_GROUP && rq.online {
                Self::rt_cpupri_set(rq, prio);
            }
        }
    }

    fn dec_rt_prio(&self, rq: &mut Rq, q: GroupId, prio: i32) {
        let rt = &mut rq.rt[q];
        let prev = rt.highest_prio_curr;
        if rt.rt_nr_running > 0 {
            if prio == prev {
                rt.highest_prio_curr = rt.active.first_prio().unwrap_or(RT_PRIO_EMPTY);
            }
        } else {
            rt.highest_prio_curr = RT_PRIO_EMPTY;
        }
        let cur = rt.highest_prio_curr;
        if q == ROOT_TASK_GROUP && cur != prev && rq.online {
            Self::rt_cpupri_set(rq, cur);
        }
    }

    /// 有 DL 任务时 cpupri 保持在 DL 档位
    fn rt_cpupri_set(rq: &Rq, prio: i32) {
        if rq.dl.dl_nr_running == 0 {
            rq.rd.cpupri.set(rq.cpu, prio);
        }
    }

    fn update_rt_migration(&self, rq: &mut Rq) {
        let rt = &rq.rt[ROOT_TASK_GROUP];
        if rt.rt_nr_migratory > 0 && rt.rt_nr_total > 1 {
            if !rt.overloaded {
                if rq.online {
                    rq.rd.rt_set_overload(rq.cpu);
                }
                rq.rt[ROOT_TASK_GROUP].overloaded = true;
            }
        } else if rt.overloaded {
            if rq.online {
                rq.rd.rt_clear_overload(rq.cpu);
            }
            rq.rt[ROOT_TASK_GROUP].overloaded = false;
        }
    }

    fn inc_rt_migration(&self, rq: &mut Rq, e: EntityId) {
        let EntityId::Task(pid) = e else {
            return;
        };
        let migratory = rq.task(pid).nr_cpus_allowed > 1;
        let rt = &mut rq.rt[ROOT_TASK_GROUP];
        rt.rt_nr_total += 1;
        if migratory {
            rt.rt_nr_migratory += 1;
        }
        self.update_rt_migration(rq);
    }

    fn dec_rt_migration(&self, rq: &mut Rq, e: EntityId) {
        let EntityId::Task(pid) = e else {
            return;
        };
        let migratory = rq.task(pid).nr_cpus_allowed > 1;
        let rt = &mut rq.rt[ROOT_TASK_GROUP];
        rt.rt_nr_total = rt.rt_nr_total.saturating_sub(1);
        if migratory {
            rt.rt_nr_migratory = rt.rt_nr_migratory.saturating_sub(1);
        }
        self.update_rt_migration(rq);
    }

    fn inc_rt_tasks(&self, rq: &mut Rq, e: EntityId, q: GroupId, prio: i32) {
        let nr = rt_se_nr_running(rq, e);
        let rr = rt_se_rr_nr_running(rq, e);
        {
            let rt = &mut rq.rt[q];
            rt.rt_nr_running += nr;
            rt.rr_nr_running += rr;
        }
        self.inc_rt_prio(rq, q, prio);
        self.inc_rt_migration(rq, e);
        if rt_se_boosted(rq, e) {
            rq.rt[q].rt_nr_boosted += 1;
        }
        self.start_rt_bandwidth(q);
    }

    fn dec_rt_tasks(&self, rq: &mut Rq, e: EntityId, q: GroupId, prio: i32) {
        let nr = rt_se_nr_running(rq, e);
        let rr = rt_se_rr_nr_running(rq, e);
        sched_bug_on!(
            rq.rt[q].rt_nr_running < nr,
            "CPU{}: rt_rq {} nr_running underflow ({} < {})",
            rq.cpu,
            q,
            rq.rt[q].rt_nr_running,
            nr
        );
        {
            let rt = &mut rq.rt[q];
            rt.rt_nr_running -= nr;
            rt.rr_nr_running = rt.rr_nr_running.saturating_sub(rr);
        }
        self.dec_rt_prio(rq, q, prio);
        self.dec_rt_migration(rq, e);
        if rt_se_boosted(rq, e) {
            rq.rt[q].rt_nr_boosted = rq.rt[q].rt_nr_boosted.saturating_sub(1);
        }
    }

    fn __enqueue_rt_entity(&self, rq: &mut Rq, e: EntityId, flags: EnqueueFlags) {
        let (q, my_q, on_list) = {
            let se = rq.rt_se(e);
            (se.rt_rq, se.my_q, se.on_list)
        };
        // 被节流或已空的组不挂到数组上
        if let Some(g) = my_q {
            if rt_rq_throttled(rq, g) || rq.rt[g].rt_nr_running == 0 {
                if on_list {
                    let prio = rt_se_prio(rq, e);
                    rq.rt[q].active.remove(prio, e);
                    rq.rt_se_mut(e).on_list = false;
                }
                return;
            }
        }
        sched_bug_on!(on_list, "CPU{}: rt entity {:?} enqueued twice", rq.cpu, e);

        let prio = rt_se_prio(rq, e);
        rq.rt[q].active.push(prio, e, flags.contains(EnqueueFlags::HEAD));
        {
            let se = rq.rt_se_mut(e);
            se.on_list = true;
            se.on_rq = true;
        }
        self.inc_rt_tasks(rq, e, q, prio);
    }

    fn __dequeue_rt_entity(&self, rq: &mut Rq, e: EntityId) {
        let (q, on_list) = {
            let se = rq.rt_se(e);
            (se.rt_rq, se.on_list)
        };
        let prio = rt_se_prio(rq, e);
        if on_list {
            let found = rq.rt[q].active.remove(prio, e);
            sched_bug_on!(!found, "CPU{}: corrupted rt prio array, {:?} missing at {}", rq.cpu, e, prio);
            rq.rt_se_mut(e).on_list = false;
        }
        rq.rt_se_mut(e).on_rq = false;
        self.dec_rt_tasks(rq, e, q, prio);
    }

    /// 自顶向下摘掉整条实体链，之后再自底向上放回
    fn dequeue_rt_stack(&self, rq: &mut Rq, chain: &[EntityId]) {
        self.dequeue_top_rt_rq(rq);
        for &e in chain.iter().rev() {
            if rq.rt_se(e).on_rq {
                self.__dequeue_rt_entity(rq, e);
            }
        }
    }

    fn enqueue_rt_entity(&self, rq: &mut Rq, e: EntityId, flags: EnqueueFlags) {
        let chain = rt_chain(rq, e);
        self.dequeue_rt_stack(rq, &chain);
        for &x in &chain {
            self.__enqueue_rt_entity(rq, x, flags);
        }
        self.enqueue_top_rt_rq(rq);
    }

    fn dequeue_rt_entity(&self, rq: &mut Rq, e: EntityId) {
        let chain = rt_chain(rq, e);
        self.dequeue_rt_stack(rq, &chain);
        for &x in &chain {
            let nonempty = rq.rt_se(x).my_q.is_some_and(|g| rq.rt[g].rt_nr_running > 0);
            if nonempty {
                self.__enqueue_rt_entity(rq, x, EnqueueFlags::empty());
            }
        }
        self.enqueue_top_rt_rq(rq);
    }

    fn enqueue_top_rt_rq(&self, rq: &mut Rq) {
        if rq.rt[ROOT_TASK_GROUP].rt_queued || rt_rq_throttled(rq, ROOT_TASK_GROUP) {
            return;
        }
        let nr = rq.rt[ROOT_TASK_GROUP].rt_nr_running;
        if nr > 0 {
            self.add_nr_running(rq, nr);
            rq.rt[ROOT_TASK_GROUP].rt_queued = true;
        }
        self.cpufreq_update_util(rq, 0);
    }

    fn dequeue_top_rt_rq(&self, rq: &mut Rq) {
        if !rq.rt[ROOT_TASK_GROUP].rt_queued {
            return;
        }
        let nr = rq.rt[ROOT_TASK_GROUP].rt_nr_running;
        self.sub_nr_running(rq, nr);
        rq.rt[ROOT_TASK_GROUP].rt_queued = false;
    }

    /// 把任务移到其优先级队列的尾部（`head` 为真时移到队首）
    fn requeue_task_rt(&self, rq: &mut Rq, pid: Pid, head: bool) {
        for e in rt_chain(rq, EntityId::Task(pid)) {
            let (on_rq, q) = {
                let se = rq.rt_se(e);
                (se.on_rq, se.rt_rq)
            };
            if on_rq {
                let prio = rt_se_prio(rq, e);
                rq.rt[q].active.requeue(prio, e, head);
            }
        }
    }

    // ---------------------------------------------------------------
    // pushable 列表
    // ---------------------------------------------------------------

    fn update_highest_prio_next(rq: &mut Rq) {
        let rt = &mut rq.rt[ROOT_TASK_GROUP];
        rt.highest_prio_next = rt.pushable.first().map_or(RT_PRIO_EMPTY, |&(prio, _, _)| prio);
    }

    fn enqueue_pushable_task(&self, rq: &mut Rq, pid: Pid) {
        self.dequeue_pushable_task(rq, pid);
        let prio = rq.task(pid).prio;
        let seq = rq.next_seq();
        rq.rt[ROOT_TASK_GROUP].pushable.insert((prio, seq, pid));
        rq.task_mut(pid).pushable = Some((prio, seq));
        Self::update_highest_prio_next(rq);
    }

    fn dequeue_pushable_task(&self, rq: &mut Rq, pid: Pid) {
        if let Some((prio, seq)) = rq.task_mut(pid).pushable.take() {
            rq.rt[ROOT_TASK_GROUP].pushable.remove(&(prio, seq, pid));
            Self::update_highest_prio_next(rq);
        }
    }

    fn rt_queue_push_tasks(&self, rq: &mut Rq) {
        if rq.rt[ROOT_TASK_GROUP].has_pushable_tasks() {
            rq.queue_balance_callback(BalanceCallback::PushRt);
        }
    }

    fn rt_queue_pull_task(&self, rq: &mut Rq) {
        rq.queue_balance_callback(BalanceCallback::PullRt);
    }

    fn pick_next_pushable_task(&self, rq: &Rq) -> Option<Pid> {
        let &(_, _, pid) = rq.rt[ROOT_TASK_GROUP].pushable.first()?;
        let st = rq.task(pid);
        sched_bug_on!(
            rq.curr == pid || st.nr_cpus_allowed <= 1 || st.task.on_rq() != OnRq::Queued || st.class != SchedClass::Rt,
            "CPU{}: bad pushable rt task {}",
            rq.cpu,
            pid
        );
        Some(pid)
    }

    /// 源 rq 上能拉到 `cpu` 的最高优先级任务
    fn pick_highest_pushable_task(&self, rq: &Rq, cpu: usize) -> Option<Pid> {
        rq.rt[ROOT_TASK_GROUP]
            .pushable
            .iter()
            .map(|&(_, _, pid)| pid)
            .find(|&pid| rq.curr != pid && rq.task(pid).cpus_mask.test(cpu))
    }

    // ---------------------------------------------------------------
    // 调度类接口
    // ---------------------------------------------------------------

    pub(crate) fn enqueue_task_rt(&self, rq: &mut Rq, pid: Pid, flags: EnqueueFlags) {
        if flags.contains(EnqueueFlags::WAKEUP) {
            rq.task_mut(pid).rt.timeout = 0;
        }
        self.enqueue_rt_entity(rq, EntityId::Task(pid), flags);
        if rq.curr != pid && rq.task(pid).nr_cpus_allowed > 1 {
            self.enqueue_pushable_task(rq, pid);
        }
    }

    pub(crate) fn dequeue_task_rt(&self, rq: &mut Rq, pid: Pid, _flags: DequeueFlags) {
        self.update_curr_rt(rq);
        self.dequeue_rt_entity(rq, EntityId::Task(pid));
        self.dequeue_pushable_task(rq, pid);
    }

    pub(crate) fn yield_task_rt(&self, rq: &mut Rq) {
        let curr = rq.curr;
        self.requeue_task_rt(rq, curr, false);
    }

    pub(crate) fn check_preempt_curr_rt(&self, rq: &mut Rq, pid: Pid, _wf: WakeFlags) {
        let prio = rq.task(pid).prio;
        let curr = rq.curr_task();
        if prio < curr.prio {
            self.resched_curr(rq);
            return;
        }
        // 同优先级时，若当前任务能去别处而新任务只能在这里，让新任务先跑
        if prio == curr.prio && !curr.task.need_resched() {
            self.check_preempt_equal_prio(rq, pid);
        }
    }

    fn check_preempt_equal_prio(&self, rq: &mut Rq, pid: Pid) {
        let curr = rq.curr_task();
        if curr.nr_cpus_allowed == 1 || rq.rd.cpupri.find(curr.prio, curr.cpus_mask).is_none() {
            return;
        }
        let p = rq.task(pid);
        if p.nr_cpus_allowed != 1 && rq.rd.cpupri.find(p.prio, p.cpus_mask).is_some() {
            return;
        }
        self.requeue_task_rt(rq, pid, true);
        self.resched_curr(rq);
    }

    pub(crate) fn pick_task_rt(&self, rq: &mut Rq) -> Option<Pid> {
        if !rq.rt[ROOT_TASK_GROUP].rt_queued {
            return None;
        }
        let mut q = ROOT_TASK_GROUP;
        loop {
            let head = rq.rt[q]
                .active
                .first_prio()
                .and_then(|prio| rq.rt[q].active.queue[prio as usize].front().copied());
            match head {
                Some(EntityId::Task(pid)) => return Some(pid),
                Some(EntityId::Group(g)) => q = g,
                None => super::bug(format_args!("CPU{}: rt_rq {} queued but empty", rq.cpu, q)),
            }
        }
    }

    pub(crate) fn set_next_task_rt(&self, rq: &mut Rq, pid: Pid, first: bool) {
        let now = rq.clock_task;
        rq.task_mut(pid).se.exec_start = now;
        self.dequeue_pushable_task(rq, pid);
        if !first {
            return;
        }
        // 之前跑的不是 RT，补上一段空闲的 RT 负载
        if rq.curr_task().class != SchedClass::Rt {
            let now = rq.pelt.now();
            update_rq_avg(&mut rq.avg_rt, now, 0);
        }
        self.rt_queue_push_tasks(rq);
    }

    pub(crate) fn put_prev_task_rt(&self, rq: &mut Rq, pid: Pid) {
        self.update_curr_rt(rq);
        let now = rq.pelt.now();
        update_rq_avg(&mut rq.avg_rt, now, 1);
        let st = rq.task(pid);
        if st.rt.on_rq && st.nr_cpus_allowed > 1 {
            self.enqueue_pushable_task(rq, pid);
        }
    }

    /// 把当前 RT 任务的运行时间记到任务和各级 rt_rq 上
    pub(crate) fn update_curr_rt(&self, rq: &mut Rq) {
        let curr = rq.curr;
        if rq.task(curr).class != SchedClass::Rt {
            return;
        }
        let now = rq.clock_task;
        let delta = {
            let se = &mut rq.task_mut(curr).se;
            if now <= se.exec_start {
                return;
            }
            let delta = now - se.exec_start;
            se.statistics.exec_max = se.statistics.exec_max.max(delta);
            se.sum_exec_runtime += delta;
            se.exec_start = now;
            delta
        };

        if !self.rt_bandwidth_enabled() {
            return;
        }
        let cpu = rq.cpu;
        for e in rt_chain(rq, EntityId::Task(curr)) {
            let q = rq.rt_se(e).rt_rq;
            let Some(tg) = self.group(q) else {
                continue;
            };
            let limited = {
                let mut r = tg.rt_runtime[cpu].lock();
                if r.rt_runtime == RUNTIME_INF {
                    false
                } else {
                    r.rt_time += delta;
                    true
                }
            };
            if limited {
                if self.sched_rt_runtime_exceeded(rq, &tg) {
                    self.resched_curr(rq);
                }
                self.start_rt_bandwidth(q);
            }
        }
    }

    fn sched_rt_runtime_exceeded(&self, rq: &mut Rq, tg: &TaskGroup) -> bool {
        let q = tg.id;
        let cpu = rq.cpu;
        if rq.rt[q].rt_throttled {
            return rt_rq_throttled(rq, q);
        }
        let period = tg.rt_period();
        let runtime = tg.rt_runtime[cpu].lock().rt_runtime;
        if runtime >= period {
            return false;
        }

        self.balance_runtime(rq, tg);
        let (rt_time, runtime) = {
            let r = tg.rt_runtime[cpu].lock();
            (r.rt_time, r.rt_runtime)
        };
        if runtime == RUNTIME_INF {
            return false;
        }

        if rt_time > runtime {
            if tg.rt_runtime_total() > 0 {
                rq.rt[q].rt_throttled = true;
                if !self.rt_throttle_warned.swap(true, Ordering::Relaxed) {
                    log::warn!("sched: RT throttling activated");
                }
                rq.stats.rt_throttled += 1;
            } else {
                // 配额为 0 的组不会有 RT 任务，出现了也不节流
                tg.rt_runtime[cpu].lock().rt_time = 0;
            }
            if rt_rq_throttled(rq, q) {
                self.sched_rt_rq_dequeue(rq, q);
                return true;
            }
        }
        false
    }

    fn sched_rt_rq_enqueue(&self, rq: &mut Rq, q: GroupId) {
        if rq.rt[q].rt_nr_running == 0 {
            return;
        }
        if q == ROOT_TASK_GROUP {
            self.enqueue_top_rt_rq(rq);
        } else if rq.group_rt_se[q].as_ref().is_some_and(|se| !se.on_rq) {
            self.enqueue_rt_entity(rq, EntityId::Group(q), EnqueueFlags::empty());
        }
        if rq.rt[q].highest_prio_curr < rq.curr_task().prio {
            self.resched_curr(rq);
        }
    }

    fn sched_rt_rq_dequeue(&self, rq: &mut Rq, q: GroupId) {
        if q == ROOT_TASK_GROUP {
            self.dequeue_top_rt_rq(rq);
            self.cpufreq_update_util(rq, 0);
        } else if rq.group_rt_se[q].as_ref().is_some_and(|se| se.on_rq) {
            self.dequeue_rt_entity(rq, EntityId::Group(q));
        }
    }

    pub(crate) fn task_tick_rt(&self, rq: &mut Rq, pid: Pid, _queued: bool) {
        self.update_curr_rt(rq);
        let now = rq.pelt.now();
        update_rq_avg(&mut rq.avg_rt, now, 1);

        let j = self.jiffies();
        let rr_timeslice = self.tunables.rr_timeslice();
        {
            let st = rq.task_mut(pid);
            if st.rt.watchdog_stamp != j {
                st.rt.timeout += 1;
                st.rt.watchdog_stamp = j;
            }
            if st.policy != SchedPolicy::Rr {
                return;
            }
            st.rt.time_slice = st.rt.time_slice.saturating_sub(1);
            if st.rt.time_slice > 0 {
                return;
            }
            st.rt.time_slice = rr_timeslice;
        }

        // 同级还有别的实体时才轮转
        for e in rt_chain(rq, EntityId::Task(pid)) {
            let q = rq.rt_se(e).rt_rq;
            let prio = rt_se_prio(rq, e);
            if rq.rt[q].active.queue[prio as usize].len() > 1 {
                self.requeue_task_rt(rq, pid, false);
                self.resched_curr(rq);
                return;
            }
        }
    }

    pub(crate) fn prio_changed_rt(&self, rq: &mut Rq, pid: Pid, oldprio: i32) {
        if rq.task(pid).task.on_rq() != OnRq::Queued {
            return;
        }
        let prio = rq.task(pid).prio;
        if rq.curr == pid {
            // 优先级降低，也许有别的任务该拉过来
            if oldprio < prio {
                self.rt_queue_pull_task(rq);
            }
            if prio > rq.rt[ROOT_TASK_GROUP].highest_prio_curr {
                self.resched_curr(rq);
            }
        } else if prio < rq.curr_task().prio {
            self.resched_curr(rq);
        }
    }

    pub(crate) fn switched_from_rt(&self, rq: &mut Rq, pid: Pid) {
        if rq.task(pid).task.on_rq() != OnRq::Queued || rq.rt[ROOT_TASK_GROUP].rt_nr_running > 0 {
            return;
        }
        self.rt_queue_pull_task(rq);
    }

    pub(crate) fn switched_to_rt(&self, rq: &mut Rq, pid: Pid) {
        if rq.curr == pid {
            let now = rq.pelt.now();
            update_rq_avg(&mut rq.avg_rt, now, 0);
            return;
        }
        if rq.task(pid).task.on_rq() != OnRq::Queued {
            return;
        }
        if rq.task(pid).nr_cpus_allowed > 1 && rq.rt[ROOT_TASK_GROUP].overloaded {
            self.rt_queue_push_tasks(rq);
        }
        if self.cpu_online(rq.cpu) && rq.task(pid).prio < rq.curr_task().prio {
            self.resched_curr(rq);
        }
    }

    /// 唤醒的任务不会抢占当前任务时，尝试把它推走
    pub(crate) fn task_woken_rt(&self, rq: &mut Rq, pid: Pid) {
        let p = rq.task(pid);
        let curr = rq.curr_task();
        let need_push = rq.curr != pid
            && !curr.task.need_resched()
            && p.nr_cpus_allowed > 1
            && rt_prio(curr.prio)
            && (curr.nr_cpus_allowed < 2 || curr.prio <= p.prio);
        if need_push {
            self.rt_queue_push_tasks(rq);
        }
    }

    pub(crate) fn balance_rt<'a>(&'a self, mut rq: RqGuard<'a>, prev: Pid) -> (RqGuard<'a>, bool) {
        let (queued, prio) = {
            let st = rq.task(prev);
            (st.rt.on_rq, st.prio)
        };
        // prev 离开了 RT 队列，本 CPU 的优先级可能要降低
        if !queued && rq.online && rq.rt[ROOT_TASK_GROUP].highest_prio_curr > prio {
            rq = self.pull_rt_task(rq);
        }
        let runnable = self.balance_stop(&rq) || rq.dl.dl_nr_running > 0 || rq.rt[ROOT_TASK_GROUP].rt_queued;
        (rq, runnable)
    }

    pub(crate) fn get_rr_interval_rt(&self, rq: &Rq, pid: Pid) -> u64 {
        if rq.task(pid).policy == SchedPolicy::Rr {
            self.tunables.rr_timeslice() as u64 * TICK_NSEC
        } else {
            0
        }
    }

    pub(crate) fn rq_online_rt(&self, rq: &mut Rq) {
        if rq.rt[ROOT_TASK_GROUP].overloaded {
            rq.rd.rt_set_overload(rq.cpu);
        }
        self.__enable_runtime(rq);
        let prio = rq.rt[ROOT_TASK_GROUP].highest_prio_curr;
        Self::rt_cpupri_set(rq, prio);
    }

    pub(crate) fn rq_offline_rt(&self, rq: &mut Rq) {
        if rq.rt[ROOT_TASK_GROUP].overloaded {
            rq.rd.rt_clear_overload(rq.cpu);
        }
        self.__disable_runtime(rq);
        rq.rd.cpupri.set(rq.cpu, CPUPRI_INVALID);
    }

    // ---------------------------------------------------------------
    // 带宽
    // ---------------------------------------------------------------

    fn start_rt_bandwidth(&self, q: GroupId) {
        if !self.rt_bandwidth_enabled() {
            return;
        }
        let Some(tg) = self.group(q) else {
            return;
        };
        let period = {
            let mut b = tg.rt_bandwidth.lock();
            if b.runtime == RUNTIME_INF || b.period_active {
                return;
            }
            b.period_active = true;
            b.period
        };
        self.timers.start(TimerEvent::RtPeriod(q), self.clock.sched_clock() + period);
    }

    /// 组的 RT 周期定时器
    pub(crate) fn sched_rt_period_timer(&self, q: GroupId, expires: u64, now: u64) -> HrtimerRestart {
        let Some(tg) = self.group(q) else {
            return HrtimerRestart::NoRestart;
        };
        let period = tg.rt_period();
        let (next, overrun) = hrtimer_forward(expires, now, period);
        if overrun == 0 {
            return HrtimerRestart::Restart(next);
        }
        if self.do_sched_rt_period_timer(&tg, overrun) {
            tg.rt_bandwidth.lock().period_active = false;
            HrtimerRestart::NoRestart
        } else {
            HrtimerRestart::Restart(next)
        }
    }

    /// 返回 true 表示所有 CPU 都空闲，定时器可以停下
    fn do_sched_rt_period_timer(&self, tg: &TaskGroup, overrun: u64) -> bool {
        let q = tg.id;
        let bw_runtime = tg.rt_runtime_total();
        let share = self.features.has(SchedFeatures::RT_RUNTIME_SHARE);
        let mut idle = true;
        let mut throttled = false;

        for cpu in self.online_mask() {
            let mut rq = self.rq_lock(cpu);
            if q >= rq.rt.len() || rq.rt[q].tg != q {
                continue;
            }
            let mut enqueue = false;
            let rt_time = {
                let mut r = tg.rt_runtime[cpu].lock();
                if !share && r.rt_runtime != RUNTIME_INF {
                    r.rt_runtime = bw_runtime;
                }
                r.rt_time
            };
            let nr = rq.rt[q].rt_nr_running;
            if rt_time == 0 && nr == 0 {
                continue;
            }
            self.update_rq_clock(&mut rq);

            if rt_time > 0 {
                if rq.rt[q].rt_throttled {
                    self.balance_runtime(&rq, tg);
                }
                let mut r = tg.rt_runtime[cpu].lock();
                let runtime = r.rt_runtime;
                r.rt_time -= r.rt_time.min(overrun.saturating_mul(runtime));
                if rq.rt[q].rt_throttled && r.rt_time < runtime {
                    rq.rt[q].rt_throttled = false;
                    enqueue = true;
                }
                if r.rt_time > 0 || nr > 0 {
                    idle = false;
                }
            } else if nr > 0 {
                idle = false;
                if !rt_rq_throttled(&rq, q) {
                    enqueue = true;
                }
            }
            if rq.rt[q].rt_throttled {
                throttled = true;
            }
            if enqueue {
                self.sched_rt_rq_enqueue(&mut rq, q);
            }
            self.unlock_with_callbacks(rq);
        }

        if !throttled && (!self.rt_bandwidth_enabled() || bw_runtime == RUNTIME_INF) {
            return true;
        }
        idle
    }

    fn balance_runtime(&self, rq: &Rq, tg: &TaskGroup) {
        if !self.features.has(SchedFeatures::RT_RUNTIME_SHARE) {
            return;
        }
        let over = {
            let r = tg.rt_runtime[rq.cpu].lock();
            r.rt_time > r.rt_runtime
        };
        if over {
            self.do_balance_runtime(rq.cpu, rq.rd.span(), tg);
        }
    }

    /// 从根域内其他 CPU 借未用完的配额，最多借到一个周期
    fn do_balance_runtime(&self, cpu: usize, span: crate::cpumask::CpuMask, tg: &TaskGroup) {
        let weight = span.weight() as u64;
        if weight == 0 {
            return;
        }
        let b = tg.rt_bandwidth.lock();
        let period = b.period;
        let mut mine = tg.rt_runtime[cpu].lock().rt_runtime;
        if mine == RUNTIME_INF {
            return;
        }
        let mut gained = 0;
        for i in span {
            if i == cpu || i >= tg.rt_runtime.len() {
                continue;
            }
            let mut peer = tg.rt_runtime[i].lock();
            if peer.rt_runtime == RUNTIME_INF || peer.rt_runtime <= peer.rt_time {
                continue;
            }
            let mut diff = (peer.rt_runtime - peer.rt_time) / weight;
            if mine + diff > period {
                diff = period.saturating_sub(mine);
            }
            peer.rt_runtime -= diff;
            mine += diff;
            gained += diff;
            if mine == period {
                break;
            }
        }
        if gained > 0 {
            tg.rt_runtime[cpu].lock().rt_runtime += gained;
        }
        drop(b);
    }

    /// CPU 下线：把借来的配额还回去，之后本 CPU 不受限
    fn __disable_runtime(&self, rq: &mut Rq) {
        let cpu = rq.cpu;
        let span = rq.rd.span();
        for q in self.rt_rq_ids(rq) {
            let Some(tg) = self.group(q) else {
                continue;
            };
            {
                let b = tg.rt_bandwidth.lock();
                let own = tg.rt_runtime[cpu].lock().rt_runtime;
                if own != RUNTIME_INF && b.runtime != RUNTIME_INF && own != b.runtime {
                    let mut want = b.runtime as i64 - own as i64;
                    for i in span {
                        if i == cpu || want == 0 {
                            continue;
                        }
                        let mut peer = tg.rt_runtime[i].lock();
                        if peer.rt_runtime == RUNTIME_INF {
                            continue;
                        }
                        if want > 0 {
                            let diff = (peer.rt_runtime as i64).min(want);
                            peer.rt_runtime -= diff as u64;
                            want -= diff;
                        } else {
                            peer.rt_runtime += (-want) as u64;
                            want = 0;
                        }
                    }
                    if want != 0 {
                        log::warn!("CPU{}: rt group {} could not reclaim {} ns of runtime", cpu, q, want);
                    }
                }
                tg.rt_runtime[cpu].lock().rt_runtime = RUNTIME_INF;
            }
            rq.rt[q].rt_throttled = false;
            self.sched_rt_rq_enqueue(rq, q);
        }
    }

    fn __enable_runtime(&self, rq: &mut Rq) {
        let cpu = rq.cpu;
        for q in self.rt_rq_ids(rq) {
            let Some(tg) = self.group(q) else {
                continue;
            };
            {
                let b = tg.rt_bandwidth.lock();
                let mut r = tg.rt_runtime[cpu].lock();
                r.rt_runtime = b.runtime;
                r.rt_time = 0;
            }
            rq.rt[q].rt_throttled = false;
        }
    }

    // ---------------------------------------------------------------
    // 放置
    // ---------------------------------------------------------------

    fn rt_task_fits_capacity(&self, p: &TaskSnapshot, cpu: usize) -> bool {
        let min_cap = p.uclamp_min.min(p.uclamp_max) as u64;
        self.capacity_orig_of(cpu) >= min_cap
    }

    /// 找一个当前优先级比 `p` 低的 CPU，优先缓存亲近的
    fn find_lowest_rq(&self, rd: &RootDomain, p: &TaskSnapshot) -> Option<usize> {
        if p.nr_cpus_allowed == 1 {
            return None;
        }
        let tree = self.domain_tree();
        let lowest = if tree.has_asym {
            let fits = |cpu: usize| self.rt_task_fits_capacity(p, cpu);
            rd.cpupri.find_fitness(p.prio, p.cpus_mask, Some(&fits))
        } else {
            rd.cpupri.find(p.prio, p.cpus_mask)
        }?;

        let cpu = p.cpu;
        if lowest.test(cpu) {
            return Some(cpu);
        }
        let this_cpu = self.this_cpu();
        let this_ok = lowest.test(this_cpu);
        for id in tree.for_each_domain(cpu) {
            let sd = tree.sd(id);
            if !sd.flags.contains(SdFlags::WAKE_AFFINE) {
                continue;
            }
            if this_ok && sd.span.test(this_cpu) {
                return Some(this_cpu);
            }
            if let Some(best) = lowest.first_and(sd.span) {
                return Some(best);
            }
        }
        if this_ok {
            return Some(this_cpu);
        }
        lowest.first()
    }

    pub(crate) fn select_task_rq_rt(&self, p: &TaskSnapshot, prev_cpu: usize, wf: WakeFlags) -> usize {
        if !wf.intersects(WakeFlags::TTWU | WakeFlags::FORK) {
            return prev_cpu;
        }
        let (test, rd) = {
            let rq = self.rq_lock(prev_cpu);
            let curr = rq.curr_task();
            // 当前任务是 RT 且不能或不该被抢占时，给新任务另找地方
            let test = rt_prio(curr.prio) && (curr.nr_cpus_allowed < 2 || curr.prio <= p.prio);
            (test, rq.rd.clone())
        };
        let asym = self.domain_tree().has_asym;
        let fit = !asym || self.rt_task_fits_capacity(p, prev_cpu);
        if !test && fit {
            return prev_cpu;
        }

        let Some(target) = self.find_lowest_rq(&rd, p) else {
            return prev_cpu;
        };
        if !test && asym && !self.rt_task_fits_capacity(p, target) {
            return prev_cpu;
        }
        let highest = self.rq_lock(target).rt[ROOT_TASK_GROUP].highest_prio_curr;
        if p.prio < highest {
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
    fn find_lock_lowest_rq<'a>(&'a self, mut rq: RqGuard<'a>, pid: Pid) -> (RqGuard<'a>, Option<RqGuard<'a>>) {
        for _ in 0..RT_MAX_TRIES {
            let snap = self.task_snapshot(&rq, rq.task(pid));
            let rd = rq.rd.clone();
            let cpu = match self.find_lowest_rq(&rd, &snap) {
                Some(c) if c != rq.cpu => c,
                _ => break,
            };
            let (this, lowest, dropped) = self.double_lock_balance(rq, cpu);
            rq = this;
            if dropped {
                let still = rq.curr != pid
                    && rq.try_task(pid).is_some_and(|st| {
                        st.class == SchedClass::Rt
                            && st.migration_disabled == 0
                            && st.cpus_mask.test(cpu)
                            && st.task.on_rq() == OnRq::Queued
                    });
                if !still {
                    return (rq, None);
                }
            }
            if lowest.rt[ROOT_TASK_GROUP].highest_prio_curr > snap.prio {
                return (rq, Some(lowest));
            }
        }
        (rq, None)
    }

    /// 选出 rq 当前任务交给 stopper 推走，已有推送在进行时返回 None
    pub(crate) fn get_push_task(&self, rq: &mut Rq) -> Option<Pid> {
        let curr = rq.curr_task();
        if rq.push_busy || curr.nr_cpus_allowed == 1 || curr.migration_disabled > 0 {
            return None;
        }
        let pid = rq.curr;
        rq.push_busy = true;
        Some(pid)
    }

    /// 推走一个任务，返回是否推成功
    fn push_rt_task<'a>(&'a self, mut rq: RqGuard<'a>, pull: bool) -> (RqGuard<'a>, bool) {
        if !rq.rt[ROOT_TASK_GROUP].overloaded {
            return (rq, false);
        }
        let Some(mut next) = self.pick_next_pushable_task(&rq) else {
            return (rq, false);
        };
        loop {
            if rq.task(next).migration_disabled > 0 {
                // 不能动它，只能看看当前任务能否让位
                if !pull || rq.push_busy || rq.curr_task().class != SchedClass::Rt {
                    return (rq, false);
                }
                let snap = self.task_snapshot(&rq, rq.curr_task());
                let rd = rq.rd.clone();
                match self.find_lowest_rq(&rd, &snap) {
                    Some(c) if c != rq.cpu => {}
                    _ => return (rq, false),
                }
                if let Some(pid) = self.get_push_task(&mut rq) {
                    let cpu = rq.cpu;
                    drop(rq);
                    self.stop_one_cpu_nowait(cpu, StopWork::Push { pid });
                    rq = self.rq_lock(cpu);
                }
                return (rq, false);
            }

            if rq.task(next).prio < rq.curr_task().prio {
                self.resched_curr(&mut rq);
                return (rq, false);
            }

            let (r, lowest) = self.find_lock_lowest_rq(rq, next);
            rq = r;
            let Some(mut lowest) = lowest else {
                // 锁曾释放，重新看一下队首是否换了
                match self.pick_next_pushable_task(&rq) {
                    Some(t) if t != next => {
                        next = t;
                        continue;
                    }
                    _ => return (rq, false),
                }
            };
            self.move_task_locked(&mut rq, &mut lowest, next);
            self.resched_curr(&mut lowest);
            drop(lowest);
            return (rq, true);
        }
    }

    pub(crate) fn push_rt_tasks<'a>(&'a self, mut rq: RqGuard<'a>) -> RqGuard<'a> {
        loop {
            let (r, moved) = self.push_rt_task(rq, false);
            rq = r;
            if !moved {
                return rq;
            }
        }
    }

    pub(crate) fn pull_rt_task<'a>(&'a self, mut this_rq: RqGuard<'a>) -> RqGuard<'a> {
        let rd = this_rq.rd.clone();
        let this_cpu = this_rq.cpu;
        let count = rd.rt_overloaded();
        if count == 0 {
            return this_rq;
        }
        if count == 1 && rd.rto_mask().test(this_cpu) {
            return this_rq;
        }
        if self.features.has(SchedFeatures::RT_PUSH_IPI) {
            self.tell_cpu_to_push(&rd);
            return this_rq;
        }

        let mut resched = false;
        for cpu in rd.rto_mask() {
            if cpu == this_cpu {
                continue;
            }
            let (this, mut src, _) = self.double_lock_balance(this_rq, cpu);
            this_rq = this;
            let mut push_task = None;
            if src.rt[ROOT_TASK_GROUP].highest_prio_next < this_rq.rt[ROOT_TASK_GROUP].highest_prio_curr {
                if let Some(pid) = self.pick_highest_pushable_task(&src, this_cpu) {
                    let prio = src.task(pid).prio;
                    // 源 CPU 的当前任务更低时它自己会被抢占，不必拉
                    if prio < this_rq.rt[ROOT_TASK_GROUP].highest_prio_curr && prio >= src.curr_task().prio {
                        if src.task(pid).migration_disabled > 0 {
                            push_task = self.get_push_task(&mut src);
                        } else {
                            self.update_rq_clock(&mut src);
                            self.move_task_locked(&mut src, &mut this_rq, pid);
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

    /// 让 rto_mask 中的下一个 CPU 推送
    fn tell_cpu_to_push(&self, rd: &RootDomain) {
        rd.rto_loop_next.fetch_add(1, Ordering::Release);
        if rd
            .rto_loop_start
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let cpu = {
            let mut lk = rd.rto_lock.lock();
            if lk.rto_cpu < 0 {
                rd.rto_next_cpu_locked(&mut lk)
            } else {
                None
            }
        };
        rd.rto_loop_start.store(0, Ordering::Release);
        if let Some(cpu) = cpu {
            self.queue_rto_push(cpu);
        }
    }

    fn queue_rto_push(&self, cpu: usize) {
        if !self.pcpu[cpu].rto_push_queued.swap(true, Ordering::AcqRel) {
            self.hooks.send_ipi(cpu, IpiKind::RtPush);
        }
    }

    /// RtPush IPI 的处理：本 CPU 推送后把接力交给下一个过载 CPU
    pub fn rto_push_irq_work(&self, cpu: usize) {
        if !self.pcpu[cpu].rto_push_queued.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut rq = self.rq_lock(cpu);
        let rd = rq.rd.clone();
        if rq.rt[ROOT_TASK_GROUP].has_pushable_tasks() {
            self.update_rq_clock(&mut rq);
            loop {
                let (r, moved) = self.push_rt_task(rq, true);
                rq = r;
                if !moved {
                    break;
                }
            }
        }
        self.unlock_with_callbacks(rq);

        if let Some(next) = rd.rto_next_cpu() {
            self.queue_rto_push(next);
        }
    }

    /// stopper 上执行：把 `pid` 推到更合适的 CPU
    pub(crate) fn push_cpu_stop(&self, cpu: usize, pid: Pid) {
        let Some(p) = self.find_task(pid) else {
            self.rq_lock(cpu).push_busy = false;
            return;
        };
        let pi = p.pi_lock.lock();
        let mut rq = self.rq_lock(cpu);
        let movable = p.task_cpu() == cpu
            && rq.curr != pid
            && p.on_rq() == OnRq::Queued
            && rq.try_task(pid).is_some_and(|st| st.migration_disabled == 0);
        if movable {
            self.update_rq_clock(&mut rq);
            let class = rq.task(pid).class;
            let (r, target) = match class {
                SchedClass::Rt => self.find_lock_lowest_rq(rq, pid),
                SchedClass::Dl => self.find_lock_later_rq(rq, pid),
                _ => (rq, None),
            };
            rq = r;
            if let Some(mut dst) = target {
                if rq.try_task(pid).is_some() {
                    self.move_task_locked(&mut rq, &mut dst, pid);
                    self.resched_curr(&mut dst);
                }
            }
        }
        rq.push_busy = false;
        drop(pi);
        self.unlock_with_callbacks(rq);
    }

    // ---------------------------------------------------------------
    // 组带宽设置
    // ---------------------------------------------------------------

    fn tg_has_rt_tasks(&self, g: GroupId) -> bool {
        (0..self.nr_cpus).any(|cpu| {
            let rq = self.rq_lock(cpu);
            rq.tasks.values().any(|st| st.group == g && st.policy.is_rt())
        })
    }

    /// 检查整棵组树的 RT 带宽
    ///
    /// `target` 为待写入的 `(组, period, runtime)`；`global` 为全局
    /// `(period, runtime)`，根组以它为准。
    fn rt_schedulable(&self, target: Option<(GroupId, u64, u64)>, global: (u64, u64)) -> SchedResult<()> {
        let table: Vec<Arc<TaskGroup>> = self.groups.read().iter().flatten().cloned().collect();
        let global_ratio = to_ratio(global.0, global.1);
        let bw = |tg: &TaskGroup| -> (u64, u64) {
            match target {
                Some((id, period, runtime)) if id == tg.id => (period, runtime),
                _ if tg.id == ROOT_TASK_GROUP => global,
                _ => {
                    let b = tg.rt_bandwidth.lock();
                    (b.period, b.runtime)
                }
            }
        };

        for tg in table.iter().filter(|tg| !tg.is_dead()) {
            let (period, runtime) = bw(tg);
            if runtime != RUNTIME_INF && runtime > period {
                return Err(SchedError::InvalidAttr);
            }
            if self.rt_bandwidth_enabled() && runtime == 0 && tg.rt_runtime_total() != 0 && self.tg_has_rt_tasks(tg.id) {
                return Err(SchedError::Busy);
            }
            let total = to_ratio(period, runtime);
            if total > global_ratio {
                return Err(SchedError::InvalidAttr);
            }
            let children = tg.children.lock().clone();
            let sum: u64 = table
                .iter()
                .filter(|c| children.contains(&c.id) && !c.is_dead())
                .map(|c| {
                    let (p, r) = bw(c);
                    to_ratio(p, r)
                })
                .sum();
            if sum > total {
                return Err(SchedError::InvalidAttr);
            }
        }
        Ok(())
    }

    fn tg_set_rt_bandwidth(&self, g: GroupId, period: u64, runtime: u64) -> SchedResult<()> {
        if g == ROOT_TASK_GROUP && runtime == 0 {
            return Err(SchedError::InvalidAttr);
        }
        if period == 0 || (runtime != RUNTIME_INF && runtime > MAX_RT_RUNTIME) {
            return Err(SchedError::InvalidAttr);
        }
        let tg = self.group(g).ok_or(SchedError::NoSuchTask)?;
        let _serial = self.bandwidth_mutex.lock();
        let global = (self.tunables.rt_period(), self.tunables.rt_runtime());
        self.rt_schedulable(Some((g, period, runtime)), global)?;

        let mut b = tg.rt_bandwidth.lock();
        b.period = period;
        b.runtime = runtime;
        for r in &tg.rt_runtime {
            r.lock().rt_runtime = runtime;
        }
        log::debug!("sched: rt group {} bandwidth {}/{} ns", tg.name, runtime, period);
        Ok(())
    }

    /// 设置组的 RT 配额，负数表示不限
    pub fn tg_set_rt_runtime(&self, g: GroupId, runtime_us: i64) -> SchedResult<()> {
        let tg = self.group(g).ok_or(SchedError::NoSuchTask)?;
        let runtime = if runtime_us < 0 {
            RUNTIME_INF
        } else {
            (runtime_us as u64).saturating_mul(NSEC_PER_USEC)
        };
        self.tg_set_rt_bandwidth(g, tg.rt_period(), runtime)
    }

    pub fn tg_get_rt_runtime(&self, g: GroupId) -> SchedResult<i64> {
        let tg = self.group(g).ok_or(SchedError::NoSuchTask)?;
        let runtime = tg.rt_runtime_total();
        if runtime == RUNTIME_INF {
            return Ok(-1);
        }
        Ok((runtime / NSEC_PER_USEC) as i64)
    }

    pub fn tg_set_rt_period(&self, g: GroupId, period_us: u64) -> SchedResult<()> {
        let tg = self.group(g).ok_or(SchedError::NoSuchTask)?;
        self.tg_set_rt_bandwidth(g, period_us.saturating_mul(NSEC_PER_USEC), tg.rt_runtime_total())
    }

    pub fn tg_get_rt_period(&self, g: GroupId) -> SchedResult<u64> {
        let tg = self.group(g).ok_or(SchedError::NoSuchTask)?;
        Ok(tg.rt_period() / NSEC_PER_USEC)
    }

    /// 配额为 0 的组不接收 RT 任务
    pub fn sched_rt_can_attach(&self, g: GroupId, is_rt: bool) -> bool {
        if !RT_GROUP_SCHED || !is_rt {
            return true;
        }
        self.group(g).is_some_and(|tg| tg.rt_runtime_total() != 0)
    }

    /// 修改全局 RT 带宽前的检查
    pub(crate) fn rt_global_constraints(&self, period: u64, runtime: u64) -> SchedResult<()> {
        if runtime != RUNTIME_INF && runtime > period {
            return Err(SchedError::InvalidAttr);
        }
        if !RT_GROUP_SCHED {
            return Ok(());
        }
        let _serial = self.bandwidth_mutex.lock();
        self.rt_schedulable(None, (period, runtime))
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::cmdline::BootParams;
    use crate::sched::cpupri::convert_prio;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;
    use crate::sched::SchedAttr;

    fn sched(cpus: usize) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(cpus));
        let s = Scheduler::with_boot_params(ArchTopology::flat(cpus), clock.clone(), Arc::new(NoopHooks), BootParams::new());
        (s, clock)
    }

    fn fifo(prio: u32) -> SchedAttr {
        SchedAttr::rt(SchedPolicy::Fifo, prio)
    }

    /// 推进一个 tick 并在需要时调度
    fn tick(s: &Scheduler, clock: &ManualClock, cpu: usize) {
        clock.advance(TICK_NSEC);
        s.timer_interrupt(cpu, false);
        s.preempt_schedule_irq(cpu);
    }

    #[test]
    fn highest_priority_is_picked_and_published() {
        let (s, _) = sched(1);
        let lo = s.spawn("lo", fifo(10), None).unwrap();
        let hi = s.spawn("hi", fifo(50), None).unwrap();
        s.with_rq(0, |rq| {
            let rt = &rq.rt[ROOT_TASK_GROUP];
            assert_eq!(rt.rt_nr_running, 2);
            assert_eq!(rt.highest_prio_curr, MAX_RT_PRIO - 1 - 50);
            assert!(rt.active.check());
            assert_eq!(rq.rd.cpupri.cpu_pri(0), convert_prio(MAX_RT_PRIO - 1 - 50));
            assert_eq!(s.pick_task_rt(rq), Some(hi));

            s.deactivate_task(rq, hi, DequeueFlags::SLEEP);
            assert_eq!(rq.rt[ROOT_TASK_GROUP].highest_prio_curr, MAX_RT_PRIO - 1 - 10);
            assert_eq!(s.pick_task_rt(rq), Some(lo));
            assert!(rq.rt[ROOT_TASK_GROUP].active.check());
        });
    }

    #[test]
    fn overload_pushes_second_task_to_idle_cpu() {
        let (s, _) = sched(2);
        let lo = s.spawn("lo", fifo(10), None).unwrap();
        let hi = s.spawn("hi", fifo(50), None).unwrap();
        let lo_cpu = s.with_task(lo, |st| st.cpu()).unwrap();
        let hi_cpu = s.with_task(hi, |st| st.cpu()).unwrap();
        if lo_cpu != hi_cpu {
            // 唤醒时已经分开了
            return;
        }
        let cpu = hi_cpu;
        s.with_rq(cpu, |rq| {
            assert!(rq.rt[ROOT_TASK_GROUP].overloaded);
            assert_eq!(rq.rt[ROOT_TASK_GROUP].pushable.len(), 2);
            assert_eq!(rq.rt[ROOT_TASK_GROUP].highest_prio_next, MAX_RT_PRIO - 1 - 50);
        });

        // 切到 hi 后的均衡回调把 lo 推走
        s.schedule_on(cpu, false);
        let other = 1 - cpu;
        assert_eq!(s.curr_on(cpu), hi);
        assert_eq!(s.with_task(lo, |st| st.cpu()), Some(other));
        s.with_rq(cpu, |rq| {
            assert!(!rq.rt[ROOT_TASK_GROUP].overloaded);
            assert!(rq.rt[ROOT_TASK_GROUP].pushable.is_empty());
            assert_eq!(rq.rd.rt_overloaded(), 0);
        });
        s.with_rq(other, |rq| assert_eq!(rq.rt[ROOT_TASK_GROUP].rt_nr_running, 1));
    }

    #[test]
    fn rr_rotates_after_timeslice() {
        let (s, clock) = sched(1);
        let a = s.spawn("a", SchedAttr::rt(SchedPolicy::Rr, 20), None).unwrap();
        let b = s.spawn("b", SchedAttr::rt(SchedPolicy::Rr, 20), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), a);

        let slice = s.tunables.rr_timeslice();
        for _ in 1..slice {
            tick(&s, &clock, 0);
            assert_eq!(s.curr_on(0), a);
        }
        tick(&s, &clock, 0);
        assert_eq!(s.curr_on(0), b);
        s.with_rq(0, |rq| assert_eq!(rq.task(a).rt.time_slice, slice));
    }

    #[test]
    fn fifo_never_rotates() {
        let (s, clock) = sched(1);
        let a = s.spawn("a", fifo(20), None).unwrap();
        let _b = s.spawn("b", fifo(20), None).unwrap();
        s.schedule_on(0, false);
        for _ in 0..2 * s.tunables.rr_timeslice() {
            tick(&s, &clock, 0);
        }
        assert_eq!(s.curr_on(0), a);
        s.with_rq(0, |rq| assert_eq!(s.get_rr_interval_rt(rq, a), 0));
    }

    #[test]
    fn throttle_then_refill_on_period() {
        let (s, clock) = sched(1);
        s.sysctl_sched_rt(100_000, 50_000).unwrap();
        let p = s.spawn("hog", fifo(10), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), p);

        // 4ms 一个 tick，超过 50ms 后被节流
        for _ in 0..(60_000_000 / TICK_NSEC) {
            tick(&s, &clock, 0);
        }
        assert!(s.with_rq(0, |rq| rq.rt[ROOT_TASK_GROUP].rt_throttled));
        assert_ne!(s.curr_on(0), p);
        assert!(s.rt_throttle_warned.load(Ordering::Relaxed));
        let ran = s.with_task(p, |st| st.se.sum_exec_runtime).unwrap();
        assert!(ran >= 50_000_000 && ran <= 50_000_000 + 2 * TICK_NSEC, "ran {}", ran);

        // 下一个周期恢复
        for _ in 0..(50_000_000 / TICK_NSEC) {
            tick(&s, &clock, 0);
        }
        assert!(!s.with_rq(0, |rq| rq.rt[ROOT_TASK_GROUP].rt_throttled));
        assert_eq!(s.curr_on(0), p);
    }

    #[test]
    fn root_group_needs_runtime() {
        let (s, _) = sched(1);
        assert_eq!(s.tg_set_rt_runtime(ROOT_TASK_GROUP, 0), Err(SchedError::InvalidAttr));
        assert_eq!(s.tg_get_rt_period(ROOT_TASK_GROUP), Ok(1_000_000));
    }

    #[test]
    fn child_groups_cannot_exceed_parent() {
        if !RT_GROUP_SCHED {
            return;
        }
        let (s, _) = sched(2);
        let g = s.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
        assert_eq!(s.tg_get_rt_runtime(g), Ok(0));
        assert!(!s.sched_rt_can_attach(g, true));

        s.tg_set_rt_runtime(g, 100_000).unwrap();
        assert!(s.sched_rt_can_attach(g, true));
        let c = s.sched_create_group(g, "c").unwrap();
        assert_eq!(s.tg_set_rt_runtime(c, 200_000), Err(SchedError::InvalidAttr));
        s.tg_set_rt_runtime(c, 50_000).unwrap();
        // 子组已经占了一半，父组不能再降到其下
        assert_eq!(s.tg_set_rt_runtime(g, 40_000), Err(SchedError::InvalidAttr));
        assert_eq!(s.tg_set_rt_runtime(g, 2_000_000), Err(SchedError::InvalidAttr));
    }

    #[test]
    fn group_entity_carries_child_priority() {
        if !RT_GROUP_SCHED {
            return;
        }
        let (s, _) = sched(1);
        let g = s.sched_create_group(ROOT_TASK_GROUP, "g").unwrap();
        s.tg_set_rt_runtime(g, 500_000).unwrap();
        let p = s.spawn("p", fifo(30), None).unwrap();
        s.sched_move_task(p, g).unwrap();
        s.with_rq(0, |rq| {
            let prio = MAX_RT_PRIO - 1 - 30;
            assert_eq!(rq.rt[g].rt_nr_running, 1);
            assert_eq!(rq.rt[g].highest_prio_curr, prio);
            assert_eq!(rq.rt[ROOT_TASK_GROUP].highest_prio_curr, prio);
            assert_eq!(rq.rt[ROOT_TASK_GROUP].rt_nr_running, 1);
            assert!(rq.group_rt_se[g].as_ref().is_some_and(|se| se.on_list));
            assert_eq!(s.pick_task_rt(rq), Some(p));
        });
    }
}
