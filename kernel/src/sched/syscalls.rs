//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度相关系统调用
//!
//! 策略、优先级、亲和性的设置与查询，以及 rt_mutex 的优先级继承入口。
//! `user` 路径比内核内部调用多做权限检查；没有凭据模型，权限只看
//! 任务组带宽和根域覆盖。

use alloc::sync::Arc;

use super::class::SchedClass;
use super::core::Scheduler;
use super::deadline::{checkparam_dl, dl_param_changed, getparam_dl, setparam_dl};
use super::entity::{PiDonor, SchedAttr, SchedAttrFlags, SchedTask, UCLAMP_RESET};
use super::fixedpt::SCHED_CAPACITY_SCALE;
use super::uclamp::{uclamp_none, UclampId, UclampSe};
use super::{dl_prio, nice_to_prio, rt_prio, EnqueueFlags, MAX_NICE, MAX_USER_RT_PRIO, MIN_NICE};
use crate::config::{RT_GROUP_SCHED, UCLAMP};
use crate::cpumask::CpuMask;
use crate::errno::{SchedError, SchedResult};
use crate::process::{Pid, SchedPolicy};

/// `setpriority`/`getpriority` 的作用对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioWhich {
    Process,
}

fn valid_policy_params(attr: &SchedAttr) -> bool {
    match attr.policy {
        SchedPolicy::Fifo | SchedPolicy::Rr => (1..MAX_USER_RT_PRIO as u32).contains(&attr.rt_priority),
        SchedPolicy::Deadline => attr.rt_priority == 0 && checkparam_dl(attr),
        _ => attr.rt_priority == 0 && (MIN_NICE..=MAX_NICE).contains(&attr.nice),
    }
}

fn valid_uclamp(attr: &SchedAttr) -> SchedResult<()> {
    if !attr.flags.intersects(SchedAttrFlags::UTIL_CLAMP) {
        return Ok(());
    }
    if !UCLAMP {
        return Err(SchedError::InvalidAttr);
    }
    let scale = SCHED_CAPACITY_SCALE as u32;
    let min = attr.flags.contains(SchedAttrFlags::UTIL_CLAMP_MIN).then_some(attr.util_min);
    let max = attr.flags.contains(SchedAttrFlags::UTIL_CLAMP_MAX).then_some(attr.util_max);
    for v in [min, max].into_iter().flatten() {
        if v != UCLAMP_RESET && v > scale {
            return Err(SchedError::InvalidAttr);
        }
    }
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo != UCLAMP_RESET && hi != UCLAMP_RESET && lo > hi {
            return Err(SchedError::InvalidAttr);
        }
    }
    Ok(())
}

/// 新属性与当前状态是否一致
fn attr_unchanged(st: &SchedTask, attr: &SchedAttr) -> bool {
    if st.policy != attr.policy || attr.flags.intersects(SchedAttrFlags::UTIL_CLAMP) {
        return false;
    }
    match attr.policy {
        SchedPolicy::Deadline => !dl_param_changed(st, attr),
        SchedPolicy::Fifo | SchedPolicy::Rr => st.rt_priority == attr.rt_priority,
        _ => st.static_prio == nice_to_prio(attr.nice),
    }
}

fn setscheduler_params(st: &mut SchedTask, attr: &SchedAttr) {
    st.policy = attr.policy;
    if attr.policy.is_dl() {
        setparam_dl(st, attr);
    } else if !attr.policy.is_rt() {
        st.static_prio = nice_to_prio(attr.nice);
    }
    st.rt_priority = attr.rt_priority;
    st.normal_prio = st.calc_normal_prio();
    st.set_load_weight();
}

fn setscheduler_uclamp(st: &mut SchedTask, attr: &SchedAttr) {
    for (id, flag, v) in [
        (UclampId::Min, SchedAttrFlags::UTIL_CLAMP_MIN, attr.util_min),
        (UclampId::Max, SchedAttrFlags::UTIL_CLAMP_MAX, attr.util_max),
    ] {
        if !attr.flags.contains(flag) {
            continue;
        }
        st.uclamp_req[id as usize] = if v == UCLAMP_RESET {
            UclampSe::new(uclamp_none(id), false)
        } else {
            UclampSe::new(v, true)
        };
    }
}

/// 优先级对应的调度类，stop 和 idle 任务不变
fn class_of(st: &SchedTask, prio: i32) -> SchedClass {
    if st.class == SchedClass::Stop || st.task.is_idle_task() {
        st.class
    } else if dl_prio(prio) {
        SchedClass::Dl
    } else if rt_prio(prio) {
        SchedClass::Rt
    } else {
        SchedClass::Fair
    }
}

impl Scheduler {
    fn __sched_setscheduler(&self, pid: Pid, attr: &SchedAttr, user: bool) -> SchedResult<()> {
        let p = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let (pi, mut rq) = self.task_rq_lock(&p);
        let Some(st) = rq.try_task(pid) else {
            return Err(SchedError::NoSuchTask);
        };

        let mut attr = *attr;
        if attr.flags.contains(SchedAttrFlags::KEEP_POLICY) {
            attr.policy = st.policy;
        }
        if attr.flags.contains(SchedAttrFlags::KEEP_PARAMS) {
            attr.nice = st.nice();
            attr.rt_priority = st.rt_priority;
            if st.policy.is_dl() {
                getparam_dl(st, &mut attr);
            }
        }
        if !valid_policy_params(&attr) {
            return Err(SchedError::InvalidAttr);
        }
        valid_uclamp(&attr)?;

        // stopper 的策略不能改
        if rq.stop == Some(pid) {
            return Err(SchedError::InvalidAttr);
        }
        let reset_on_fork = if attr.flags.contains(SchedAttrFlags::KEEP_POLICY) {
            st.sched_reset_on_fork
        } else {
            attr.flags.contains(SchedAttrFlags::RESET_ON_FORK)
        };
        if attr_unchanged(st, &attr) {
            rq.task_mut(pid).sched_reset_on_fork = reset_on_fork;
            return Ok(());
        }

        if user {
            if RT_GROUP_SCHED && attr.policy.is_rt() && !self.sched_rt_can_attach(st.group, true) {
                return Err(SchedError::PermissionDenied);
            }
            // 亲和性必须覆盖整个根域
            if attr.policy.is_dl() && !rq.rd.span().is_subset(pi.cpus_mask) {
                return Err(SchedError::PermissionDenied);
            }
        }

        self.update_rq_clock(&mut rq);
        self.sched_dl_overflow(&mut rq, pid, &attr)?;

        let (prev_class, oldprio) = {
            let st = rq.task(pid);
            (st.class, st.prio)
        };
        let keep_params = attr.flags.contains(SchedAttrFlags::KEEP_PARAMS);
        self.change_queued_with(&mut rq, pid, |rq| {
            let st = rq.task_mut(pid);
            if !keep_params {
                setscheduler_params(st, &attr);
            }
            setscheduler_uclamp(st, &attr);
            st.sched_reset_on_fork = reset_on_fork;
            let prio = st.calc_effective_prio();
            st.prio = prio;
            st.class = class_of(st, prio);
            // 用户视角降低优先级的任务放到队首
            let flags = if oldprio < prio { EnqueueFlags::HEAD } else { EnqueueFlags::empty() };
            ((), flags)
        });
        self.check_class_changed(&mut rq, pid, prev_class, oldprio);
        drop(pi);
        self.unlock_with_callbacks(rq);
        Ok(())
    }

    /// 用户态的 `sched_setattr`
    pub fn sched_setattr(&self, pid: Pid, attr: &SchedAttr) -> SchedResult<()> {
        self.__sched_setscheduler(pid, attr, true)
    }

    /// 内核内部设置调度属性，不做权限检查
    pub fn sched_setattr_nocheck(&self, pid: Pid, attr: &SchedAttr) -> SchedResult<()> {
        self.__sched_setscheduler(pid, attr, false)
    }

    /// 保留 nice 值的 `sched_setscheduler`
    pub fn sched_setscheduler(&self, pid: Pid, policy: SchedPolicy, rt_priority: u32, reset_on_fork: bool) -> SchedResult<()> {
        let nice = self.sched_getattr(pid)?.nice;
        let mut attr = SchedAttr::rt(policy, rt_priority);
        attr.nice = nice;
        if reset_on_fork {
            attr.flags |= SchedAttrFlags::RESET_ON_FORK;
        }
        self.sched_setattr(pid, &attr)
    }

    /// 只改 RT 优先级
    pub fn sched_setparam(&self, pid: Pid, rt_priority: u32) -> SchedResult<()> {
        let attr = SchedAttr::rt(SchedPolicy::Normal, rt_priority).with_flags(SchedAttrFlags::KEEP_POLICY);
        let nice = self.sched_getattr(pid)?.nice;
        self.sched_setattr(pid, &SchedAttr { nice, ..attr })
    }

    pub fn sched_getattr(&self, pid: Pid) -> SchedResult<SchedAttr> {
        let p = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let (_pi, rq) = self.task_rq_lock(&p);
        let st = rq.try_task(pid).ok_or(SchedError::NoSuchTask)?;
        let mut attr = SchedAttr::normal(st.nice());
        attr.policy = st.policy;
        attr.rt_priority = st.rt_priority;
        if st.sched_reset_on_fork {
            attr.flags |= SchedAttrFlags::RESET_ON_FORK;
        }
        if st.policy.is_dl() {
            getparam_dl(st, &mut attr);
        }
        attr.util_min = st.uclamp_req[UclampId::Min as usize].value;
        attr.util_max = st.uclamp_req[UclampId::Max as usize].value;
        Ok(attr)
    }

    pub fn sched_getscheduler(&self, pid: Pid) -> SchedResult<SchedPolicy> {
        self.sched_getattr(pid).map(|a| a.policy)
    }

    pub fn sched_setaffinity(&self, pid: Pid, mask: CpuMask) -> SchedResult<()> {
        let mask = mask.and(self.possible_mask());
        if mask.is_empty() {
            return Err(SchedError::InvalidAttr);
        }
        self.__set_cpus_allowed_ptr(pid, mask, true)
    }

    /// 亲和性与活跃 CPU 的交集
    pub fn sched_getaffinity(&self, pid: Pid) -> SchedResult<CpuMask> {
        let p = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let mask = p.cpus_mask();
        Ok(mask.and(self.active_mask()))
    }

    /// 当前任务让出 CPU
    pub fn sched_yield(&self) {
        self.sched_yield_on(self.this_cpu());
    }

    pub fn sched_yield_on(&self, cpu: usize) {
        let mut rq = self.rq_lock(cpu);
        rq.stats.yld_count += 1;
        let class = rq.curr_task().class;
        class.yield_task(self, &mut rq);
        self.unlock_with_callbacks(rq);
        self.schedule_on(cpu, false);
    }

    /// 修改 nice 值，超出范围的值被忽略
    pub fn set_user_nice(&self, pid: Pid, nice: i32) {
        if !(MIN_NICE..=MAX_NICE).contains(&nice) {
            return;
        }
        let Some(p) = self.find_task(pid) else {
            return;
        };
        let (pi, mut rq) = self.task_rq_lock(&p);
        let Some((cur, policy, oldprio)) = rq.try_task(pid).map(|st| (st.nice(), st.policy, st.prio)) else {
            return;
        };
        if cur == nice || rq.stop == Some(pid) {
            return;
        }
        // RT/DL 任务只记下 static_prio，生效要等回到 fair
        if policy.is_rt() || policy.is_dl() {
            rq.task_mut(pid).static_prio = nice_to_prio(nice);
            return;
        }
        self.update_rq_clock(&mut rq);
        self.change_queued(&mut rq, pid, |rq| {
            let st = rq.task_mut(pid);
            st.static_prio = nice_to_prio(nice);
            st.set_load_weight();
            st.normal_prio = st.calc_normal_prio();
            st.prio = st.calc_effective_prio();
        });
        let class = rq.task(pid).class;
        class.prio_changed(self, &mut rq, pid, oldprio);
        drop(pi);
        self.unlock_with_callbacks(rq);
    }

    /// 当前任务的 nice 加 `inc`，返回新值
    pub fn nice(&self, inc: i32) -> i32 {
        let pid = self.curr_on(self.this_cpu());
        let cur = self.sched_getattr(pid).map(|a| a.nice).unwrap_or(0);
        let nice = (cur + inc.clamp(-40, 40)).clamp(MIN_NICE, MAX_NICE);
        self.set_user_nice(pid, nice);
        nice
    }

    /// `who` 为 0 时作用于当前任务
    pub fn setpriority(&self, which: PrioWhich, who: Pid, niceval: i32) -> SchedResult<()> {
        let PrioWhich::Process = which;
        let pid = if who == 0 { self.curr_on(self.this_cpu()) } else { who };
        if self.find_task(pid).is_none() {
            return Err(SchedError::NoSuchTask);
        }
        self.set_user_nice(pid, niceval.clamp(MIN_NICE, MAX_NICE));
        Ok(())
    }

    /// 返回 `20 - nice`，取值 1..=40
    pub fn getpriority(&self, which: PrioWhich, who: Pid) -> SchedResult<i32> {
        let PrioWhich::Process = which;
        let pid = if who == 0 { self.curr_on(self.this_cpu()) } else { who };
        Ok(20 - self.sched_getattr(pid)?.nice)
    }

    pub fn sched_get_priority_max(policy: SchedPolicy) -> u32 {
        match policy {
            SchedPolicy::Fifo | SchedPolicy::Rr => (MAX_USER_RT_PRIO - 1) as u32,
            _ => 0,
        }
    }

    pub fn sched_get_priority_min(policy: SchedPolicy) -> u32 {
        match policy {
            SchedPolicy::Fifo | SchedPolicy::Rr => 1,
            _ => 0,
        }
    }

    /// 时间片长度，纳秒；FIFO 和 DL 为 0
    pub fn sched_rr_get_interval(&self, pid: Pid) -> SchedResult<u64> {
        let p = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let (_pi, rq) = self.task_rq_lock(&p);
        let class = rq.try_task(pid).ok_or(SchedError::NoSuchTask)?.class;
        Ok(class.get_rr_interval(self, &rq, pid))
    }

    fn pi_donor(&self, pid: Pid) -> SchedResult<PiDonor> {
        let t = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let (_pi, rq) = self.task_rq_lock(&t);
        let st = rq.try_task(pid).ok_or(SchedError::NoSuchTask)?;
        Ok(PiDonor {
            pid,
            task: Arc::downgrade(&t),
            prio: st.prio,
            dl: st.dl.pi_params(),
        })
    }

    /// rt_mutex 的优先级继承
    ///
    /// `donor` 为最高优先级的等待者，`None` 表示继承结束。DL 捐赠者的
    /// 参数通过 `pi_se` 生效，被提升的任务不受节流。
    pub fn rt_mutex_setprio(&self, pid: Pid, donor: Option<Pid>) -> SchedResult<()> {
        let donor = donor.map(|d| self.pi_donor(d)).transpose()?;
        let p = self.find_task(pid).ok_or(SchedError::NoSuchTask)?;
        let (pi, mut rq) = self.task_rq_lock(&p);
        let Some(st) = rq.try_task(pid) else {
            return Err(SchedError::NoSuchTask);
        };
        if st.class == SchedClass::Stop || st.task.is_idle_task() {
            return Ok(());
        }
        let (prev_class, oldprio, normal_prio) = (st.class, st.prio, st.normal_prio);
        let prio = donor.as_ref().map_or(normal_prio, |d| d.prio.min(normal_prio));
        if prio == oldprio && !dl_prio(prio) {
            rq.task_mut(pid).pi_top = donor;
            return Ok(());
        }

        self.update_rq_clock(&mut rq);
        self.change_queued_with(&mut rq, pid, |rq| {
            let st = rq.task_mut(pid);
            let mut flags = EnqueueFlags::empty();
            if dl_prio(prio) {
                let use_donor = match &donor {
                    Some(d) if dl_prio(d.prio) => {
                        !dl_prio(st.normal_prio) || d.dl.dl_deadline < st.dl.params.dl_deadline
                    }
                    _ => false,
                };
                if use_donor {
                    st.dl.pi_se = donor.clone();
                    flags |= EnqueueFlags::REPLENISH;
                } else {
                    st.dl.pi_se = None;
                }
                st.class = SchedClass::Dl;
            } else if rt_prio(prio) {
                if dl_prio(oldprio) {
                    st.dl.pi_se = None;
                }
                if oldprio < prio {
                    flags |= EnqueueFlags::HEAD;
                }
                st.class = SchedClass::Rt;
            } else {
                if dl_prio(oldprio) {
                    st.dl.pi_se = None;
                }
                if rt_prio(oldprio) {
                    st.rt.timeout = 0;
                }
                st.class = SchedClass::Fair;
            }
            st.pi_top = donor;
            st.prio = prio;
            ((), flags)
        });
        self.check_class_changed(&mut rq, pid, prev_class, oldprio);
        drop(pi);
        self.unlock_with_callbacks(rq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::BootParams;
    use crate::config::TICK_NSEC;
    use crate::sched::fixedpt::LoadWeight;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;

    const MS: u64 = 1_000_000;

    fn sched(cpus: usize) -> Scheduler {
        let clock = Arc::new(ManualClock::new(cpus));
        Scheduler::with_boot_params(ArchTopology::flat(cpus), clock, Arc::new(NoopHooks), BootParams::new())
    }

    fn class_prio(s: &Scheduler, pid: Pid) -> (SchedClass, i32) {
        s.with_rq(s.find_task(pid).unwrap().task_cpu(), |rq| (rq.task(pid).class, rq.task(pid).prio))
    }

    #[test]
    fn setattr_then_getattr() {
        let s = sched(2);
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        s.sched_setattr(p, &SchedAttr::rt(SchedPolicy::Fifo, 10)).unwrap();
        let a = s.sched_getattr(p).unwrap();
        assert_eq!(a.policy, SchedPolicy::Fifo);
        assert_eq!(a.rt_priority, 10);
        assert_eq!(class_prio(&s, p), (SchedClass::Rt, 89));

        s.sched_setattr(p, &SchedAttr::normal(-5)).unwrap();
        assert_eq!(s.sched_getattr(p).unwrap().nice, -5);
        assert_eq!(class_prio(&s, p), (SchedClass::Fair, 115));

        s.sched_setattr(p, &SchedAttr::deadline(10 * MS, 30 * MS, 100 * MS)).unwrap();
        let a = s.sched_getattr(p).unwrap();
        assert_eq!((a.runtime, a.deadline, a.period), (10 * MS, 30 * MS, 100 * MS));
        assert_eq!(class_prio(&s, p).0, SchedClass::Dl);
    }

    #[test]
    fn bad_attributes_are_rejected() {
        let s = sched(1);
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        let e = Err(SchedError::InvalidAttr);
        assert_eq!(s.sched_setattr(p, &SchedAttr::normal(20)), e);
        assert_eq!(s.sched_setattr(p, &SchedAttr::rt(SchedPolicy::Fifo, 0)), e);
        assert_eq!(s.sched_setattr(p, &SchedAttr::rt(SchedPolicy::Rr, 100)), e);
        assert_eq!(s.sched_setattr(p, &SchedAttr::rt(SchedPolicy::Normal, 5)), e);
        assert_eq!(s.sched_setattr(p, &SchedAttr::deadline(20 * MS, 10 * MS, 30 * MS)), e);
        assert_eq!(s.sched_setattr(p, &SchedAttr::normal(0).with_uclamp(800, 200)), e);
        assert_eq!(s.sched_setattr(9999, &SchedAttr::normal(0)), Err(SchedError::NoSuchTask));

        let stopper = s.with_rq(0, |rq| rq.stop.unwrap());
        assert_eq!(s.sched_setattr(stopper, &SchedAttr::normal(0)), e);
    }

    #[test]
    fn nice_changes_weight_and_priority() {
        let s = sched(1);
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        s.set_user_nice(p, 5);
        assert_eq!(s.getpriority(PrioWhich::Process, p), Ok(15));
        s.with_rq(0, |rq| {
            assert_eq!(rq.task(p).se.load.weight, LoadWeight::from_nice(5).weight);
            assert_eq!(rq.task(p).prio, 125);
        });
        // 越界的值被忽略
        s.set_user_nice(p, 30);
        assert_eq!(s.getpriority(PrioWhich::Process, p), Ok(15));
        s.setpriority(PrioWhich::Process, p, -30).unwrap();
        assert_eq!(s.getpriority(PrioWhich::Process, p), Ok(40));
    }

    #[test]
    fn priority_ranges_and_intervals() {
        assert_eq!(Scheduler::sched_get_priority_max(SchedPolicy::Fifo), 99);
        assert_eq!(Scheduler::sched_get_priority_min(SchedPolicy::Rr), 1);
        assert_eq!(Scheduler::sched_get_priority_max(SchedPolicy::Normal), 0);
        assert_eq!(Scheduler::sched_get_priority_min(SchedPolicy::Deadline), 0);

        let s = sched(1);
        let rr = s.spawn("rr", SchedAttr::rt(SchedPolicy::Rr, 1), None).unwrap();
        let fifo = s.spawn("fifo", SchedAttr::rt(SchedPolicy::Fifo, 1), None).unwrap();
        assert_eq!(s.sched_rr_get_interval(rr), Ok(s.tunables.rr_timeslice() as u64 * TICK_NSEC));
        assert_eq!(s.sched_rr_get_interval(fifo), Ok(0));
    }

    #[test]
    fn affinity_round_trip() {
        let s = sched(4);
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        s.sched_setaffinity(p, CpuMask::from_cpus(&[1, 2])).unwrap();
        assert_eq!(s.sched_getaffinity(p), Ok(CpuMask::from_cpus(&[1, 2])));
        assert_eq!(s.sched_setaffinity(p, CpuMask::new()), Err(SchedError::InvalidAttr));
    }

    #[test]
    fn reset_on_fork_is_recorded() {
        let s = sched(1);
        let p = s.spawn("p", SchedAttr::rt(SchedPolicy::Fifo, 5), None).unwrap();
        s.sched_setscheduler(p, SchedPolicy::Fifo, 5, true).unwrap();
        assert!(s.sched_getattr(p).unwrap().flags.contains(SchedAttrFlags::RESET_ON_FORK));
        s.sched_setparam(p, 7).unwrap();
        let a = s.sched_getattr(p).unwrap();
        assert_eq!((a.policy, a.rt_priority), (SchedPolicy::Fifo, 7));
        // 只改参数时保留 reset-on-fork
        assert!(a.flags.contains(SchedAttrFlags::RESET_ON_FORK));
    }

    #[test]
    fn pi_boost_and_unboost() {
        let s = sched(2);
        let holder = s.spawn("holder", SchedAttr::normal(0), None).unwrap();
        let waiter = s.spawn("waiter", SchedAttr::rt(SchedPolicy::Fifo, 89), None).unwrap();
        s.rt_mutex_setprio(holder, Some(waiter)).unwrap();
        assert_eq!(class_prio(&s, holder), (SchedClass::Rt, 10));
        s.rt_mutex_setprio(holder, None).unwrap();
        assert_eq!(class_prio(&s, holder), (SchedClass::Fair, 120));
        // 策略本身没变
        assert_eq!(s.sched_getscheduler(holder), Ok(SchedPolicy::Normal));
    }

    #[test]
    fn dl_donor_lends_its_parameters() {
        let s = sched(2);
        let holder = s.spawn("holder", SchedAttr::rt(SchedPolicy::Fifo, 10), None).unwrap();
        let waiter = s.spawn("waiter", SchedAttr::deadline(5 * MS, 20 * MS, 50 * MS), None).unwrap();
        s.rt_mutex_setprio(holder, Some(waiter)).unwrap();
        let cpu = s.find_task(holder).unwrap().task_cpu();
        s.with_rq(cpu, |rq| {
            let st = rq.task(holder);
            assert_eq!(st.class, SchedClass::Dl);
            assert!(st.dl.is_boosted());
            assert_eq!(st.dl.pi_params().dl_runtime, 5 * MS);
        });
        s.rt_mutex_setprio(holder, None).unwrap();
        assert_eq!(class_prio(&s, holder), (SchedClass::Rt, 89));
    }
}
