//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! fair 任务的唤醒选核与负载均衡
//!
//! 选核时不持有任何 rq 锁，只读 [`PerCpu`](super::rq::PerCpu) 上发布的
//! 无锁副本。负载均衡按调度域自底向上进行：在域内找最忙的组、组内最忙
//! 的 CPU，再从它那里拉任务。idle 的 CPU 停掉 tick 后由一个被踢醒的
//! idle CPU 代为均衡（nohz idle balance）。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use super::class::{SchedClass, TaskSnapshot};
use super::core::Scheduler;
use super::energy::{compute_energy, cpu_util_next, CpuUtilSnapshot, TaskUtil};
use super::entity::{EntityId, SchedTask};
use super::fair::UPDATE_TG;
use super::features::SchedFeatures;
use super::fixedpt::{fits_capacity, SCHED_CAPACITY_SCALE};
use super::group::ROOT_TASK_GROUP;
use super::hooks::IpiKind;
use super::pelt::update_rq_avg;
use super::rq::{Rq, RqGuard};
use super::stop::StopWork;
use super::sysctl::msecs_to_jiffies;
use super::topology::{DomainId, DomainTree, SchedGroupId, SdFlags};
use super::{DequeueFlags, EnqueueFlags, WakeFlags};
use crate::config::HZ;
use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::process::{OnRq, Pid, SchedPolicy, TaskFlags};
use crate::sched_bug_on;

/// 一次均衡中最多连续迁移的任务数，超过后释放锁再继续
const NR_MIGRATE_BREAK: u32 = 32;
/// 所有任务都绑核时退避的上限（ms）
const MAX_PINNED_INTERVAL: u64 = 512;
/// 阻塞负载衰减完需要的时间（ms）
const LOAD_AVG_PERIOD_MS: u64 = 32;

pub mod nohz_flags {
    pub const BALANCE_KICK: u32 = 0x1;
    pub const STATS_KICK: u32 = 0x2;
    pub const KICK_MASK: u32 = BALANCE_KICK | STATS_KICK;
}

/// 发起均衡的 CPU 当前状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuIdleType {
    Idle,
    NotIdle,
    NewlyIdle,
}

/// 组的繁忙程度，越往后越需要被拉走任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum GroupType {
    /// 还有空闲容量
    #[default]
    HasSpare,
    /// 没有空闲容量但任务都能得到应有的时间
    FullyBusy,
    /// 有任务超出 CPU 容量
    MisfitTask,
    /// 非对称打包偏好其他 CPU
    Asym,
    /// 亲和性导致上次均衡失败
    Imbalanced,
    /// 任务多于 CPU 且容量不足
    Overloaded,
}

/// 要迁移的量按什么计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationType {
    Load,
    Util,
    Task,
    Misfit,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct LbFlags: u32 {
        const ALL_PINNED = 0x01;
        const NEED_BREAK = 0x02;
        const DST_PINNED = 0x04;
        const SOME_PINNED = 0x08;
        const ACTIVE_LB = 0x10;
    }
}

/// 均衡时读到的单个 CPU 的状态
#[derive(Debug, Clone, Copy, Default)]
struct CpuSample {
    load: u64,
    util: u64,
    runnable: u64,
    nr_running: u32,
    h_nr_running: u32,
    misfit_task_load: u64,
    idle: bool,
    capacity: u64,
    capacity_orig: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SgLbStats {
    avg_load: u64,
    group_load: u64,
    group_capacity: u64,
    group_util: u64,
    group_runnable: u64,
    sum_nr_running: u32,
    sum_h_nr_running: u32,
    idle_cpus: u32,
    group_weight: u32,
    group_type: GroupType,
    group_asym_packing: bool,
    group_misfit_task_load: u64,
}

#[derive(Debug, Default)]
struct SdLbStats {
    busiest: Option<SchedGroupId>,
    local: Option<SchedGroupId>,
    total_load: u64,
    total_capacity: u64,
    avg_load: u64,
    prefer_sibling: bool,
    busiest_stat: SgLbStats,
    local_stat: SgLbStats,
}

struct LbEnv<'t> {
    tree: &'t DomainTree,
    sd: DomainId,
    src_cpu: usize,
    dst_cpu: usize,
    new_dst_cpu: usize,
    /// 参与本次均衡的 CPU
    cpus: CpuMask,
    idle: CpuIdleType,
    imbalance: i64,
    flags: LbFlags,
    loop_: u32,
    loop_max: u32,
    migration_type: MigrationType,
}

/// nohz idle 均衡的全局状态
pub struct Nohz {
    pub idle_cpus_mask: AtomicCpuMask,
    pub nr_cpus: AtomicU32,
    /// 有 idle CPU 的阻塞负载还没衰减完
    pub has_blocked: AtomicBool,
    pub next_balance: AtomicU64,
    pub next_blocked: AtomicU64,
    /// 发给各 CPU 的踢醒请求
    kick: Vec<AtomicU32>,
    /// 被踢醒后要执行的均衡
    idle_balance: Vec<AtomicU32>,
    /// CPU 已从 LLC 的 nr_busy_cpus 中扣除
    sd_idle: Vec<AtomicBool>,
}

impl Nohz {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            idle_cpus_mask: AtomicCpuMask::new(CpuMask::new()),
            nr_cpus: AtomicU32::new(0),
            has_blocked: AtomicBool::new(false),
            next_balance: AtomicU64::new(0),
            next_blocked: AtomicU64::new(0),
            kick: (0..nr_cpus).map(|_| AtomicU32::new(0)).collect(),
            idle_balance: (0..nr_cpus).map(|_| AtomicU32::new(0)).collect(),
            sd_idle: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }
}

/// 钳制后的利用率能否放进 `capacity`
fn util_fits_cpu(util: u64, uclamp_min: u32, uclamp_max: u32, capacity: u64) -> bool {
    let util = util.max(uclamp_min as u64).min((uclamp_max as u64).max(uclamp_min as u64));
    fits_capacity(util, capacity)
}

fn task_util_of(p: &TaskSnapshot) -> TaskUtil {
    TaskUtil {
        cpu: p.cpu,
        util: p.util,
        util_est: p.util_est,
        uclamp_min: p.uclamp_min,
        uclamp_max: p.uclamp_max,
    }
}

impl Scheduler {
    // ---------------------------------------------------------------
    // 唤醒选核
    // ---------------------------------------------------------------

    /// 为 fair 任务选择 CPU
    pub(crate) fn select_task_rq_fair(&self, p: &TaskSnapshot, prev_cpu: usize, wf: WakeFlags) -> usize {
        let this_cpu = self.this_cpu();
        let sd_flag = if wf.contains(WakeFlags::TTWU) {
            SdFlags::BALANCE_WAKE
        } else if wf.contains(WakeFlags::FORK) {
            SdFlags::BALANCE_FORK
        } else if wf.contains(WakeFlags::EXEC) {
            SdFlags::BALANCE_EXEC
        } else {
            SdFlags::empty()
        };
        let mut new_cpu = prev_cpu;
        let mut want_affine = false;
        let mut sync = wf.contains(WakeFlags::SYNC);

        if wf.contains(WakeFlags::TTWU) {
            let waker_flips = self.record_wakee(this_cpu, p.pid, &mut sync);
            if let Some(cpu) = self.find_energy_efficient_cpu(p, prev_cpu) {
                return cpu;
            }
            want_affine = !self.wake_wide(p, this_cpu, waker_flips) && p.cpus_mask.test(this_cpu);
        }

        let tree = self.domain_tree();
        let mut sd = None;
        for tmp in tree.for_each_domain(this_cpu) {
            let d = tree.sd(tmp);
            // 唤醒者与 prev_cpu 同在一个 WAKE_AFFINE 域：在两者之间选
            if want_affine && d.flags.contains(SdFlags::WAKE_AFFINE) && d.span.test(prev_cpu) {
                if this_cpu != prev_cpu {
                    new_cpu = self.wake_affine(&tree, tmp, p, this_cpu, prev_cpu, sync);
                }
                sd = None;
                break;
            }
            if d.flags.contains(sd_flag) && !sd_flag.is_empty() {
                sd = Some(tmp);
            } else if !want_affine {
                break;
            }
        }

        match sd {
            Some(sd) => self.find_idlest_cpu(&tree, sd, p, this_cpu, prev_cpu),
            None if wf.contains(WakeFlags::TTWU) => self.select_idle_sibling(&tree, p, prev_cpu, new_cpu),
            None => new_cpu,
        }
    }

    /// 记录当前任务的唤醒对象，返回它的 wakee_flips
    ///
    /// 频繁切换唤醒对象说明是一对多的唤醒关系，不适合把被唤醒者拉到本地。
    fn record_wakee(&self, this_cpu: usize, wakee: Pid, sync: &mut bool) -> u32 {
        let j = self.jiffies();
        let mut rq = self.rq_lock(this_cpu);
        let curr = rq.curr;
        let Some(st) = rq.tasks.get_mut(&curr) else {
            return 0;
        };
        if st.task.flags().contains(TaskFlags::EXITING) {
            *sync = false;
        }
        if j > st.wakee_flip_decay_ts + HZ {
            st.wakee_flips >>= 1;
            st.wakee_flip_decay_ts = j;
        }
        if st.last_wakee != wakee {
            st.last_wakee = wakee;
            st.wakee_flips = st.wakee_flips.saturating_add(1);
        }
        st.wakee_flips
    }

    fn wake_wide(&self, p: &TaskSnapshot, this_cpu: usize, waker_flips: u32) -> bool {
        let factor = self.domain_tree().sd_llc_size.get(this_cpu).copied().unwrap_or(1);
        let (mut master, mut slave) = (waker_flips, p.wakee_flips);
        if master < slave {
            core::mem::swap(&mut master, &mut slave);
        }
        !(slave < factor || master < slave.saturating_mul(factor))
    }

    fn wake_affine_idle(&self, tree: &DomainTree, this_cpu: usize, prev_cpu: usize, sync: bool) -> Option<usize> {
        if self.available_idle_cpu(this_cpu) && tree.cpus_share_cache(this_cpu, prev_cpu) {
            return Some(if self.available_idle_cpu(prev_cpu) { prev_cpu } else { this_cpu });
        }
        if sync && self.nr_running_on(this_cpu) == 1 {
            return Some(this_cpu);
        }
        if self.available_idle_cpu(prev_cpu) {
            return Some(prev_cpu);
        }
        None
    }

    /// 按两边负载（考虑容量与 imbalance_pct）比较，本地更轻则选本地
    fn wake_affine_weight(&self, tree: &DomainTree, sd: DomainId, p: &TaskSnapshot, this_cpu: usize, prev_cpu: usize, sync: bool) -> Option<usize> {
        let load = |c: usize| self.pcpu[c].cfs_load.load(Ordering::Relaxed);
        let mut this_eff_load = load(this_cpu);
        if sync {
            let current_load = self.with_rq(this_cpu, |rq| rq.curr_task().se.avg.load_avg);
            if current_load > this_eff_load {
                return Some(this_cpu);
            }
            this_eff_load -= current_load;
        }
        let task_load = p.load_avg;
        this_eff_load += task_load;
        if self.features.has(SchedFeatures::WA_BIAS) {
            this_eff_load *= 100;
        }
        this_eff_load *= self.capacity_of(prev_cpu);

        let mut prev_eff_load = load(prev_cpu).saturating_sub(task_load);
        if self.features.has(SchedFeatures::WA_BIAS) {
            prev_eff_load *= 100 + (tree.sd(sd).imbalance_pct as u64 - 100) / 2;
        }
        prev_eff_load *= self.capacity_of(this_cpu);

        // 同步唤醒时打破平局，偏向本地
        if sync {
            prev_eff_load += 1;
        }
        (this_eff_load < prev_eff_load).then_some(this_cpu)
    }

    fn wake_affine(&self, tree: &DomainTree, sd: DomainId, p: &TaskSnapshot, this_cpu: usize, prev_cpu: usize, sync: bool) -> usize {
        let mut target = None;
        if self.features.has(SchedFeatures::WA_IDLE) {
            target = self.wake_affine_idle(tree, this_cpu, prev_cpu, sync);
        }
        if target.is_none() && self.features.has(SchedFeatures::WA_WEIGHT) {
            target = self.wake_affine_weight(tree, sd, p, this_cpu, prev_cpu, sync);
        }
        match target {
            Some(t) if t == this_cpu => t,
            _ => prev_cpu,
        }
    }

    fn asym_fits_capacity(&self, tree: &DomainTree, p: &TaskSnapshot, cpu: usize) -> bool {
        if tree.sd_asym_cpucapacity.get(cpu).copied().flatten().is_none() {
            return true;
        }
        util_fits_cpu(p.util.max(p.util_est), p.uclamp_min, p.uclamp_max, self.capacity_of(cpu))
    }

    fn idle_or_sched_idle(&self, cpu: usize) -> bool {
        self.available_idle_cpu(cpu) || self.sched_idle_cpu(cpu)
    }

    /// 在 target 所在 LLC 内找一个空闲 CPU
    fn select_idle_sibling(&self, tree: &DomainTree, p: &TaskSnapshot, prev: usize, target: usize) -> usize {
        if self.idle_or_sched_idle(target) && self.asym_fits_capacity(tree, p, target) {
            return target;
        }
        if prev != target
            && tree.cpus_share_cache(prev, target)
            && self.idle_or_sched_idle(prev)
            && self.asym_fits_capacity(tree, p, prev)
        {
            return prev;
        }
        let recent = p.recent_used_cpu;
        if recent != prev
            && recent != target
            && recent < self.nr_cpus
            && tree.cpus_share_cache(recent, target)
            && self.idle_or_sched_idle(recent)
            && p.cpus_mask.test(recent)
            && self.asym_fits_capacity(tree, p, recent)
        {
            return recent;
        }

        // 容量不对称时按容量挑
        if let Some(sd) = tree.sd_asym_cpucapacity.get(target).copied().flatten() {
            if let Some(cpu) = self.select_idle_capacity(tree, sd, p, target) {
                return cpu;
            }
        }

        let Some(llc) = tree.sd_llc.get(target).copied().flatten() else {
            return target;
        };
        let has_idle_core = tree.llc_shared(target).is_some_and(|s| s.has_idle_cores.load(Ordering::Relaxed));
        if has_idle_core {
            if let Some(cpu) = self.select_idle_core(tree, llc, p, target) {
                return cpu;
            }
        }
        self.select_idle_cpu(tree, llc, p, target).unwrap_or(target)
    }

    fn select_idle_capacity(&self, tree: &DomainTree, sd: DomainId, p: &TaskSnapshot, target: usize) -> Option<usize> {
        let span = tree.sd(sd).span.and(p.cpus_mask).and(self.active_mask());
        let util = p.util.max(p.util_est);
        let (mut best_cap, mut best_cpu) = (0, None);
        let mut cpu = span.next_wrap(target)?;
        let start = cpu;
        loop {
            if self.idle_or_sched_idle(cpu) {
                let cap = self.capacity_of(cpu);
                if util_fits_cpu(util, p.uclamp_min, p.uclamp_max, cap) {
                    return Some(cpu);
                }
                if cap > best_cap {
                    best_cap = cap;
                    best_cpu = Some(cpu);
                }
            }
            cpu = span.next_wrap(cpu + 1)?;
            if cpu == start {
                break;
            }
        }
        best_cpu
    }

    /// 找一个所有 SMT 兄弟都空闲的核
    fn select_idle_core(&self, tree: &DomainTree, llc: DomainId, p: &TaskSnapshot, target: usize) -> Option<usize> {
        let span = tree.sd(llc).span.and(p.cpus_mask).and(self.active_mask());
        let mut seen = CpuMask::new();
        for core in span.iter() {
            if seen.test(core) {
                continue;
            }
            let siblings = self
                .topo
                .thread_siblings
                .get(core)
                .copied()
                .unwrap_or(CpuMask::of(core));
            seen = seen.or(siblings);
            if siblings.iter().all(|c| self.available_idle_cpu(c)) {
                return siblings.and(p.cpus_mask).first();
            }
        }
        // 扫描一遍没有找到，清掉提示
        if let Some(shared) = tree.llc_shared(target) {
            shared.has_idle_cores.store(false, Ordering::Relaxed);
        }
        None
    }

    /// 从 target 之后轮转扫描 LLC；SIS_PROP 按平均空闲时间限制扫描个数
    fn select_idle_cpu(&self, tree: &DomainTree, llc: DomainId, p: &TaskSnapshot, target: usize) -> Option<usize> {
        let span = tree.sd(llc).span.and(p.cpus_mask).and(self.active_mask());
        let mut nr = u64::MAX;
        if self.features.has(SchedFeatures::SIS_PROP) {
            let span_avg = tree.sd(llc).span_weight as u64 * self.with_rq(target, |rq| rq.avg_idle) / 512;
            let avg_cost = tree.sd(llc).balance.max_newidle_lb_cost.load(Ordering::Relaxed) / 512 + 1;
            nr = (span_avg / avg_cost).max(4);
        }
        let start = span.next_wrap(target + 1)?;
        let mut cpu = start;
        loop {
            if nr == 0 {
                return None;
            }
            nr -= 1;
            if self.idle_or_sched_idle(cpu) {
                return Some(cpu);
            }
            cpu = span.next_wrap(cpu + 1)?;
            if cpu == start {
                return None;
            }
        }
    }

    /// fork/exec 时自上而下找最空闲的组和 CPU
    fn find_idlest_cpu(&self, tree: &DomainTree, sd: DomainId, p: &TaskSnapshot, this_cpu: usize, prev_cpu: usize) -> usize {
        let mut cpu = prev_cpu;
        let mut sd = Some(sd);
        while let Some(id) = sd {
            let d = tree.sd(id);
            let Some(group) = self.find_idlest_group(tree, id, p, this_cpu) else {
                sd = d.child;
                continue;
            };
            let new_cpu = self.find_idlest_group_cpu(tree.sg(group).span, p, cpu);
            if new_cpu == cpu {
                sd = d.child;
                continue;
            }
            cpu = new_cpu;
            // 换到新 CPU 的同级域里继续往下
            let weight = d.span_weight;
            sd = tree
                .for_each_domain(cpu)
                .take_while(|&x| tree.sd(x).span_weight < weight)
                .filter(|&x| tree.sd(x).flags.intersects(SdFlags::BALANCE_FORK | SdFlags::BALANCE_EXEC))
                .last();
        }
        cpu
    }

    /// 找比本地组更空闲的组，本地组就是最好的时返回 None
    fn find_idlest_group(&self, tree: &DomainTree, sd: DomainId, p: &TaskSnapshot, this_cpu: usize) -> Option<SchedGroupId> {
        let d = tree.sd(sd);
        let mut idlest: Option<(SchedGroupId, u32, u64)> = None;
        let mut local: Option<(u32, u64)> = None;
        for &g in &d.groups {
            let sg = tree.sg(g);
            let span = sg.span.and(p.cpus_mask).and(self.active_mask());
            if span.is_empty() {
                continue;
            }
            let (mut idle, mut load) = (0u32, 0u64);
            for c in sg.span.iter() {
                if self.available_idle_cpu(c) {
                    idle += 1;
                }
                load += self.pcpu[c].cfs_load.load(Ordering::Relaxed);
            }
            let cap = tree.sgc_of(g).capacity().max(1);
            let avg = load * SCHED_CAPACITY_SCALE / cap;
            if sg.span.test(this_cpu) {
                local = Some((idle, avg));
                continue;
            }
            let better = match idlest {
                None => true,
                Some((_, bi, ba)) => idle > bi || (idle == bi && avg < ba),
            };
            if better {
                idlest = Some((g, idle, avg));
            }
        }
        let (g, idle, avg) = idlest?;
        match local {
            Some((li, la)) if li > idle || (li == idle && la * (d.imbalance_pct as u64) <= avg * 100) => None,
            _ => Some(g),
        }
    }

    fn find_idlest_group_cpu(&self, span: CpuMask, p: &TaskSnapshot, this_cpu: usize) -> usize {
        let cpus = span.and(p.cpus_mask).and(self.active_mask());
        if cpus.weight() == 1 {
            return cpus.first().unwrap_or(this_cpu);
        }
        let mut least: Option<(usize, u64)> = None;
        for c in cpus.iter() {
            if self.available_idle_cpu(c) {
                return c;
            }
            let load = self.pcpu[c].cfs_load.load(Ordering::Relaxed);
            if least.map_or(true, |(_, l)| load < l) {
                least = Some((c, load));
            }
        }
        least.map_or(this_cpu, |(c, _)| c)
    }

    /// 能耗感知放置：在每个能效域里挑剩余容量最大的 CPU，比较放上去
    /// 后的整体能耗，比 prev_cpu 省 6% 以上才换
    pub(crate) fn find_energy_efficient_cpu(&self, p: &TaskSnapshot, prev_cpu: usize) -> Option<usize> {
        let tree = self.domain_tree();
        let rd = tree.rd_of(prev_cpu)?.clone();
        let pds = rd.perf_domains()?;
        if rd.is_overutilized() {
            return None;
        }
        let asym = tree.sd_asym_cpucapacity.get(prev_cpu).copied().flatten()?;
        if !tree.sd(asym).span.test(prev_cpu) {
            return None;
        }
        let tu = task_util_of(p);
        if tu.util_est_max() == 0 {
            return Some(prev_cpu);
        }

        let util_est = self.features.has(SchedFeatures::UTIL_EST);
        let online = self.online_mask();
        let snaps: Vec<CpuUtilSnapshot> = (0..self.nr_cpus).map(|c| self.with_rq(c, |rq| rq.util_snapshot())).collect();

        let mut base_energy = 0u64;
        let mut prev_delta = None;
        let mut best: Option<(usize, u64)> = None;
        for pd in pds.iter() {
            let base = compute_energy(&tu, None, pd, &snaps, online, util_est);
            base_energy += base;

            let mut max_spare: Option<(usize, u64)> = None;
            let mut has_prev = false;
            for cpu in pd.cpus.and(p.cpus_mask).and(online).iter() {
                let util = cpu_util_next(&snaps[cpu], &tu, Some(cpu), util_est);
                let cap = self.capacity_of(cpu);
                if !util_fits_cpu(util, p.uclamp_min, p.uclamp_max, cap) {
                    continue;
                }
                let spare = cap - util.min(cap);
                if cpu == prev_cpu {
                    has_prev = true;
                } else if max_spare.map_or(true, |(_, s)| spare > s) {
                    max_spare = Some((cpu, spare));
                }
            }
            if has_prev {
                let e = compute_energy(&tu, Some(prev_cpu), pd, &snaps, online, util_est);
                prev_delta = Some(e.saturating_sub(base));
            }
            if let Some((cpu, _)) = max_spare {
                let e = compute_energy(&tu, Some(cpu), pd, &snaps, online, util_est);
                let delta = e.saturating_sub(base);
                if best.map_or(true, |(_, d)| delta < d) {
                    best = Some((cpu, delta));
                }
            }
        }

        let (best_cpu, best_delta) = match (best, prev_delta) {
            (None, _) => return Some(prev_cpu),
            (Some(b), None) => return Some(b.0),
            (Some(b), Some(_)) => b,
        };
        let prev_delta = prev_delta.unwrap_or(u64::MAX);
        if prev_delta > best_delta && prev_delta - best_delta > (prev_delta + base_energy) >> 4 {
            log::trace!("eas: task {} to CPU{} saves {}", p.pid, best_cpu, prev_delta - best_delta);
            return Some(best_cpu);
        }
        Some(prev_cpu)
    }

    // ---------------------------------------------------------------
    // 容量与阻塞负载
    // ---------------------------------------------------------------

    /// 扣掉 RT/DL/IRQ/热限制之后留给 fair 的容量
    pub(crate) fn update_cpu_capacity(&self, cpu: usize) {
        let mut rq = self.rq_lock(cpu);
        let max = rq.cpu_capacity_orig;
        let used = rq.avg_rt.util_avg + rq.avg_dl.util_avg + rq.avg_thermal.load_avg;
        let irq = if self.features.has(SchedFeatures::NONTASK_CAPACITY) { rq.avg_irq.util_avg } else { 0 };
        let cap = if irq >= max || used >= max {
            1
        } else {
            ((max - used) * (max - irq) / max).max(1)
        };
        rq.cpu_capacity = cap;
        rq.publish_capacity();
    }

    /// 衰减 idle CPU 上不再更新的负载
    pub(crate) fn update_blocked_averages(&self, cpu: usize) {
        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        self.update_blocked_averages_locked(&mut rq);
        self.unlock_with_callbacks(rq);
    }

    fn update_blocked_averages_locked(&self, rq: &mut Rq) {
        let now = rq.pelt.now();
        let curr_class = rq.curr_task().class;
        let mut decayed = update_rq_avg(&mut rq.avg_rt, now, (curr_class == SchedClass::Rt) as u64);
        decayed |= update_rq_avg(&mut rq.avg_dl, now, (curr_class == SchedClass::Dl) as u64);
        let thermal = rq.shared.thermal_pressure.load(Ordering::Relaxed);
        let clock_task = rq.clock_task;
        decayed |= update_rq_avg(&mut rq.avg_thermal, clock_task, thermal);

        let mut done = rq.avg_rt.util_avg == 0 && rq.avg_dl.util_avg == 0 && rq.avg_irq.util_avg == 0;

        // 子组编号总比父组大，倒序遍历保证先子后父
        for q in (0..rq.cfs.len()).rev() {
            if !rq.cfs[q].on_list {
                continue;
            }
            let now = self.cfs_rq_clock_pelt(rq, q);
            if self.update_cfs_rq_load_avg(rq, q, now) {
                self.update_tg_load_avg(rq, q);
                if q == ROOT_TASK_GROUP {
                    decayed = true;
                }
            }
            if q != ROOT_TASK_GROUP {
                if let Some(ge) = rq.group_se.get(q).and_then(|se| se.as_ref()) {
                    let parent = ge.cfs_rq;
                    if ge.avg.last_update_time != 0 {
                        self.update_load_avg(rq, parent, EntityId::Group(q), UPDATE_TG);
                    }
                }
            }
            let a = &rq.cfs[q].avg;
            let decayed_out = a.load_avg == 0 && a.util_avg == 0 && a.runnable_avg == 0;
            if !decayed_out {
                done = false;
            } else if q != ROOT_TASK_GROUP && rq.cfs[q].nr_running == 0 {
                rq.cfs[q].on_list = false;
            }
        }

        rq.last_blocked_load_update_tick = self.jiffies();
        if done {
            rq.has_blocked_load = false;
        }
        if decayed {
            self.cpufreq_update_util(rq, 0);
        }
        rq.publish_cfs(self.features.has(SchedFeatures::UTIL_EST));
    }

    // ---------------------------------------------------------------
    // 负载均衡
    // ---------------------------------------------------------------

    fn lb_sample(&self, cpu: usize) -> CpuSample {
        let util_est = self.features.has(SchedFeatures::UTIL_EST);
        let rq = self.rq_lock(cpu);
        CpuSample {
            load: rq.cpu_load(),
            util: rq.cpu_util_cfs(util_est),
            runnable: rq.cpu_runnable(),
            nr_running: rq.nr_running,
            h_nr_running: rq.cfs[ROOT_TASK_GROUP].h_nr_running,
            misfit_task_load: rq.misfit_task_load,
            idle: rq.nr_running == 0 && rq.curr_is_idle(),
            capacity: rq.cpu_capacity,
            capacity_orig: rq.cpu_capacity_orig,
        }
    }

    fn group_is_overloaded(imbalance_pct: u64, sgs: &SgLbStats) -> bool {
        if sgs.sum_nr_running <= sgs.group_weight {
            return false;
        }
        sgs.group_capacity * 100 < sgs.group_util * imbalance_pct
            || sgs.group_capacity * imbalance_pct < sgs.group_runnable * 100
    }

    fn group_has_capacity(imbalance_pct: u64, sgs: &SgLbStats) -> bool {
        if sgs.sum_nr_running < sgs.group_weight {
            return true;
        }
        if sgs.group_capacity * imbalance_pct < sgs.group_runnable * 100 {
            return false;
        }
        sgs.group_capacity * 100 > sgs.group_util * imbalance_pct
    }

    fn group_classify(&self, env: &LbEnv<'_>, group: SchedGroupId, sgs: &SgLbStats) -> GroupType {
        let pct = env.tree.sd(env.sd).imbalance_pct as u64;
        if Self::group_is_overloaded(pct, sgs) {
            GroupType::Overloaded
        } else if env.tree.sgc_of(group).imbalance.load(Ordering::Relaxed) != 0 {
            GroupType::Imbalanced
        } else if sgs.group_asym_packing {
            GroupType::Asym
        } else if sgs.group_misfit_task_load != 0 {
            GroupType::MisfitTask
        } else if !Self::group_has_capacity(pct, sgs) {
            GroupType::FullyBusy
        } else {
            GroupType::HasSpare
        }
    }

    /// 汇总一个组的统计，返回 (统计, 有 CPU 超过一个任务, 有 CPU 超载)
    fn update_sg_lb_stats(&self, env: &LbEnv<'_>, group: SchedGroupId, local: bool) -> (SgLbStats, bool, bool) {
        let sg = env.tree.sg(group);
        let sd = env.tree.sd(env.sd);
        let mut sgs = SgLbStats::default();
        let (mut overload, mut overutilized) = (false, false);

        for cpu in sg.span.and(env.cpus).iter() {
            let s = self.lb_sample(cpu);
            sgs.group_load += s.load;
            sgs.group_util += s.util;
            sgs.group_runnable += s.runnable;
            sgs.sum_h_nr_running += s.h_nr_running;
            sgs.sum_nr_running += s.nr_running;
            if s.nr_running > 1 {
                overload = true;
            }
            if !fits_capacity(s.util, s.capacity) {
                overutilized = true;
            }
            if s.idle {
                sgs.idle_cpus += 1;
                continue;
            }
            if local {
                continue;
            }
            if sd.flags.contains(SdFlags::ASYM_CPUCAPACITY) && sgs.group_misfit_task_load < s.misfit_task_load {
                sgs.group_misfit_task_load = s.misfit_task_load;
                overload = true;
            }
        }

        if !local
            && sd.flags.contains(SdFlags::ASYM_PACKING)
            && env.idle != CpuIdleType::NotIdle
            && sgs.sum_h_nr_running > 0
            && self.topo.asym_prefer(env.dst_cpu, sg.asym_prefer_cpu)
        {
            sgs.group_asym_packing = true;
        }

        sgs.group_capacity = env.tree.sgc_of(group).capacity().max(1);
        sgs.group_weight = sg.group_weight;
        sgs.group_type = self.group_classify(env, group, &sgs);
        if matches!(sgs.group_type, GroupType::Overloaded | GroupType::FullyBusy) {
            sgs.avg_load = sgs.group_load * SCHED_CAPACITY_SCALE / sgs.group_capacity;
        }
        (sgs, overload, overutilized)
    }

    fn update_sd_pick_busiest(&self, env: &LbEnv<'_>, sds: &SdLbStats, sg: SchedGroupId, sgs: &SgLbStats) -> bool {
        if sgs.sum_h_nr_running == 0 {
            return false;
        }
        let busiest = &sds.busiest_stat;
        if sds.busiest.is_none() {
            return true;
        }
        if sgs.group_type > busiest.group_type {
            return true;
        }
        if sgs.group_type < busiest.group_type {
            return false;
        }
        match sgs.group_type {
            GroupType::Overloaded | GroupType::FullyBusy => sgs.avg_load > busiest.avg_load,
            GroupType::Imbalanced => false,
            GroupType::Asym => {
                let b = sds.busiest.map_or(0, |b| env.tree.sg(b).asym_prefer_cpu);
                self.topo.asym_prefer(b, env.tree.sg(sg).asym_prefer_cpu)
            }
            GroupType::MisfitTask => sgs.group_misfit_task_load >= busiest.group_misfit_task_load,
            GroupType::HasSpare => {
                sgs.idle_cpus < busiest.idle_cpus
                    || (sgs.idle_cpus == busiest.idle_cpus && sgs.sum_nr_running > busiest.sum_nr_running)
            }
        }
    }

    fn update_sd_lb_stats(&self, env: &LbEnv<'_>) -> SdLbStats {
        let sd = env.tree.sd(env.sd);
        let mut sds = SdLbStats {
            prefer_sibling: sd.child.is_some_and(|c| env.tree.sd(c).flags.contains(SdFlags::PREFER_SIBLING)),
            ..Default::default()
        };
        let (mut overload, mut overutilized) = (false, false);
        let j = self.jiffies();

        for &g in &sd.groups {
            let local = env.tree.sg(g).span.test(env.dst_cpu);
            if local {
                sds.local = Some(g);
                if env.idle != CpuIdleType::NewlyIdle || j >= env.tree.sgc_of(g).next_update.load(Ordering::Relaxed) {
                    if sd.child.is_none() {
                        self.update_cpu_capacity(env.dst_cpu);
                    }
                    let interval = msecs_to_jiffies(sd.balance.balance_interval.load(Ordering::Relaxed)).max(1);
                    env.tree.update_group_capacity(env.sd, &|c| self.capacity_of(c), j + interval);
                }
            }
            let (sgs, ov, ou) = self.update_sg_lb_stats(env, g, local);
            overload |= ov;
            overutilized |= ou;
            if local {
                sds.local_stat = sgs;
            } else if self.update_sd_pick_busiest(env, &sds, g, &sgs) {
                sds.busiest = Some(g);
                sds.busiest_stat = sgs;
            }
            sds.total_load += sgs.group_load;
            sds.total_capacity += sgs.group_capacity;
        }

        // 最顶层的统计覆盖整个根域
        if sd.parent.is_none() {
            if let Some(rd) = env.tree.rd_of(env.dst_cpu) {
                rd.set_overload(overload);
                if rd.eas_enabled() {
                    rd.overutilized.store(overutilized, Ordering::Relaxed);
                }
            }
        } else if overutilized {
            if let Some(rd) = env.tree.rd_of(env.dst_cpu) {
                if rd.eas_enabled() {
                    rd.overutilized.store(true, Ordering::Relaxed);
                }
            }
        }
        sds
    }

    fn calculate_imbalance(&self, env: &mut LbEnv<'_>, sds: &mut SdLbStats) {
        let local = sds.local_stat;
        let busiest = sds.busiest_stat;

        match busiest.group_type {
            GroupType::MisfitTask => {
                env.migration_type = MigrationType::Misfit;
                env.imbalance = 1;
                return;
            }
            GroupType::Asym | GroupType::Imbalanced => {
                env.migration_type = MigrationType::Task;
                env.imbalance = 1;
                return;
            }
            _ => {}
        }

        if local.group_type == GroupType::HasSpare {
            if busiest.group_type == GroupType::Overloaded {
                // 用本地的空闲容量去填
                env.migration_type = MigrationType::Util;
                env.imbalance = local.group_capacity.max(local.group_util) as i64 - local.group_util as i64;
                if env.idle != CpuIdleType::NotIdle && env.imbalance == 0 {
                    env.migration_type = MigrationType::Task;
                    env.imbalance = 1;
                }
                return;
            }
            if busiest.group_weight == 1 || sds.prefer_sibling {
                env.migration_type = MigrationType::Task;
                let nr_diff = busiest.sum_nr_running as i64 - local.sum_nr_running as i64;
                env.imbalance = (nr_diff >> 1).max(0);
            } else {
                env.migration_type = MigrationType::Task;
                env.imbalance = ((local.idle_cpus as i64 - busiest.idle_cpus as i64) >> 1).max(0);
            }
            if env.imbalance == 0 && busiest.sum_h_nr_running > 1 && local.sum_nr_running == 0 {
                env.imbalance = 1;
            }
            return;
        }

        if local.group_type < GroupType::Overloaded {
            sds.local_stat.avg_load = local.group_load * SCHED_CAPACITY_SCALE / local.group_capacity.max(1);
            sds.avg_load = sds.total_load * SCHED_CAPACITY_SCALE / sds.total_capacity.max(1);
            if sds.local_stat.avg_load >= busiest.avg_load {
                env.imbalance = 0;
                return;
            }
        }

        env.migration_type = MigrationType::Load;
        let local_avg = sds.local_stat.avg_load;
        let up = busiest.avg_load.saturating_sub(sds.avg_load) * busiest.group_capacity;
        let down = sds.avg_load.saturating_sub(local_avg) * local.group_capacity;
        env.imbalance = (up.min(down) / SCHED_CAPACITY_SCALE) as i64;
    }

    /// 找域内最忙且值得拉的组，计算要迁移的量
    fn find_busiest_group(&self, env: &mut LbEnv<'_>) -> Option<SchedGroupId> {
        let mut sds = self.update_sd_lb_stats(env);

        if let Some(rd) = env.tree.rd_of(env.dst_cpu) {
            if rd.eas_enabled() && !rd.is_overutilized() {
                return None;
            }
        }
        let busiest_g = sds.busiest?;
        let local = sds.local_stat;
        let busiest = sds.busiest_stat;
        if busiest.sum_nr_running == 0 {
            return None;
        }

        let force = matches!(busiest.group_type, GroupType::MisfitTask | GroupType::Asym | GroupType::Imbalanced);
        if !force {
            if local.group_type > busiest.group_type {
                return None;
            }
            let pct = env.tree.sd(env.sd).imbalance_pct as u64;
            let mut forced = false;
            if local.group_type == GroupType::Overloaded {
                if local.avg_load >= busiest.avg_load {
                    return None;
                }
                sds.avg_load = sds.total_load * SCHED_CAPACITY_SCALE / sds.total_capacity.max(1);
                if local.avg_load >= sds.avg_load {
                    return None;
                }
                if 100 * busiest.avg_load <= pct * local.avg_load {
                    return None;
                }
            } else if sds.prefer_sibling
                && local.group_type == GroupType::HasSpare
                && busiest.sum_nr_running > local.sum_nr_running + 1
            {
                forced = true;
            }
            if !forced && busiest.group_type != GroupType::Overloaded {
                if env.idle == CpuIdleType::NotIdle {
                    return None;
                }
                if busiest.group_weight > 1 && local.idle_cpus <= busiest.idle_cpus + 1 {
                    return None;
                }
                if busiest.sum_h_nr_running == 1 {
                    return None;
                }
            }
        }

        self.calculate_imbalance(env, &mut sds);
        (env.imbalance > 0).then_some(busiest_g)
    }

    fn find_busiest_queue(&self, env: &LbEnv<'_>, group: SchedGroupId) -> Option<(usize, CpuSample)> {
        let span = env.tree.sg(group).span.and(env.cpus);
        let mut best: Option<(usize, CpuSample, u64)> = None;
        for cpu in span.iter() {
            let s = self.lb_sample(cpu);
            if s.h_nr_running == 0 {
                continue;
            }
            let key = match env.migration_type {
                MigrationType::Load => {
                    // 单个大任务且本身容量充足时不必拆
                    let pct = env.tree.sd(env.sd).imbalance_pct as u64;
                    let reduced = s.capacity * pct < s.capacity_orig * 100;
                    if s.nr_running == 1 && s.load > env.imbalance as u64 && !reduced {
                        continue;
                    }
                    s.load * SCHED_CAPACITY_SCALE / s.capacity.max(1)
                }
                MigrationType::Util => {
                    if s.nr_running <= 1 {
                        continue;
                    }
                    s.util
                }
                MigrationType::Task => s.nr_running as u64,
                MigrationType::Misfit => s.misfit_task_load,
            };
            if key == 0 && env.migration_type == MigrationType::Misfit {
                continue;
            }
            if best.map_or(true, |(_, _, k)| key > k) {
                best = Some((cpu, s, key));
            }
        }
        best.map(|(c, s, _)| (c, s))
    }

    /// 只有组内第一个空闲 CPU（或指定的均衡 CPU）在本层做均衡
    fn should_we_balance(&self, env: &LbEnv<'_>) -> bool {
        if env.idle == CpuIdleType::NewlyIdle {
            return true;
        }
        let sd = env.tree.sd(env.sd);
        let Some(&local) = sd.groups.iter().find(|&&g| env.tree.sg(g).span.test(env.dst_cpu)) else {
            return false;
        };
        let sg = env.tree.sg(local);
        match sg.balance_mask.and(env.cpus).iter().find(|&c| self.idle_cpu(c)) {
            Some(c) => c == env.dst_cpu,
            None => sg.balance_cpu() == env.dst_cpu,
        }
    }

    fn task_hot(&self, rq: &Rq, st: &SchedTask, env: &LbEnv<'_>) -> bool {
        if st.policy == SchedPolicy::Idle {
            return false;
        }
        let q = &rq.cfs[st.se.cfs_rq];
        let id = EntityId::Task(st.pid());
        if q.nr_running > 1 && (q.next == Some(id) || q.last == Some(id)) && env.tree.sd(env.sd).flags.contains(SdFlags::SHARE_PKG_RESOURCES) {
            return true;
        }
        let cost = self.tunables.migration_cost();
        if cost == 0 {
            return false;
        }
        (rq.clock_task as i64 - st.se.exec_start as i64) < cost as i64
    }

    fn can_migrate_task(&self, rq: &Rq, st: &SchedTask, env: &mut LbEnv<'_>) -> bool {
        if rq.cfs[st.se.cfs_rq].throttled_hierarchy() {
            return false;
        }
        if !st.cpus_mask.test(env.dst_cpu) || st.migration_disabled > 0 {
            env.flags |= LbFlags::SOME_PINNED;
            if env.idle == CpuIdleType::NewlyIdle || env.flags.intersects(LbFlags::DST_PINNED | LbFlags::ACTIVE_LB) || st.migration_disabled > 0 {
                return false;
            }
            // 本地组里有别的 CPU 可以接
            let sd = env.tree.sd(env.sd);
            if let Some(&local) = sd.groups.first() {
                let cand = env.tree.sg(local).span.and(env.cpus).and(st.cpus_mask).without(env.dst_cpu);
                if let Some(c) = cand.first() {
                    env.flags |= LbFlags::DST_PINNED;
                    env.new_dst_cpu = c;
                }
            }
            return false;
        }
        env.flags.remove(LbFlags::ALL_PINNED);

        if rq.curr == st.pid() || st.task.on_cpu() {
            return false;
        }
        if env.flags.contains(LbFlags::ACTIVE_LB) {
            return true;
        }
        let sd = env.tree.sd(env.sd);
        !self.task_hot(rq, st, env) || sd.balance.nr_balance_failed.load(Ordering::Relaxed) > sd.cache_nice_tries
    }

    /// 从 busiest 上摘下要迁走的任务；调用方持有 busiest 的锁
    fn detach_tasks(&self, rq: &mut Rq, env: &mut LbEnv<'_>) -> Vec<SchedTask> {
        let mut detached = Vec::new();
        if env.imbalance <= 0 || rq.nr_running <= 1 {
            return detached;
        }
        // 最久没运行过的任务先走
        let mut cands: Vec<(u64, Pid)> = rq
            .tasks
            .values()
            .filter(|st| st.class == SchedClass::Fair && st.task.on_rq() == OnRq::Queued)
            .map(|st| (st.se.exec_start, st.pid()))
            .collect();
        cands.sort_unstable();

        let util_est = self.features.has(SchedFeatures::UTIL_EST);
        for (_, pid) in cands {
            if rq.nr_running <= 1 {
                break;
            }
            env.loop_ += 1;
            if env.loop_ > env.loop_max {
                break;
            }
            if env.loop_ % NR_MIGRATE_BREAK == 0 {
                env.flags |= LbFlags::NEED_BREAK;
                break;
            }
            let st = rq.task(pid);
            if !self.can_migrate_task(rq, st, env) {
                continue;
            }
            match env.migration_type {
                MigrationType::Load => {
                    let load = self.task_h_load(rq, pid).max(1);
                    let failed = env.tree.sd(env.sd).balance.nr_balance_failed.load(Ordering::Relaxed);
                    if self.features.has(SchedFeatures::LB_MIN) && load < 16 && failed == 0 {
                        continue;
                    }
                    if (load / 2) as i64 > env.imbalance && failed <= env.tree.sd(env.sd).cache_nice_tries {
                        continue;
                    }
                    env.imbalance -= load as i64;
                }
                MigrationType::Util => {
                    let util = st.task_util_est(util_est);
                    if util as i64 > env.imbalance {
                        continue;
                    }
                    env.imbalance -= util as i64;
                }
                MigrationType::Task => env.imbalance -= 1,
                MigrationType::Misfit => {
                    if util_fits_cpu(st.task_util_est(util_est), 0, u32::MAX, self.capacity_of(env.src_cpu)) {
                        continue;
                    }
                    env.imbalance = 0;
                }
            }

            self.deactivate_task(rq, pid, DequeueFlags::NOCLOCK);
            detached.push(self.detach_task_rq(rq, pid, env.dst_cpu));

            // newidle 只拉一个，尽快回去运行
            if env.idle == CpuIdleType::NewlyIdle {
                break;
            }
            if env.imbalance <= 0 {
                break;
            }
        }
        detached
    }

    fn attach_tasks(&self, cpu: usize, tasks: Vec<SchedTask>) {
        if tasks.is_empty() {
            return;
        }
        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        for st in tasks {
            let pid = st.pid();
            self.attach_task_rq(&mut rq, st);
            self.activate_task(&mut rq, pid, EnqueueFlags::NOCLOCK);
            self.check_preempt_curr(&mut rq, pid, WakeFlags::empty());
        }
        self.unlock_with_callbacks(rq);
    }

    fn need_active_balance(&self, env: &LbEnv<'_>, src: &CpuSample) -> bool {
        if env.migration_type == MigrationType::Misfit {
            return true;
        }
        let sd = env.tree.sd(env.sd);
        if env.idle != CpuIdleType::NotIdle
            && sd.flags.contains(SdFlags::ASYM_PACKING)
            && self.topo.asym_prefer(env.dst_cpu, env.src_cpu)
        {
            return true;
        }
        // 源 CPU 容量被 RT/IRQ 占掉太多，把唯一的 fair 任务推到本地
        if env.idle != CpuIdleType::NotIdle
            && src.h_nr_running == 1
            && src.capacity * (sd.imbalance_pct as u64) < src.capacity_orig * 100
            && src.capacity * (sd.imbalance_pct as u64) < self.capacity_of(env.dst_cpu) * 100
        {
            return true;
        }
        sd.balance.nr_balance_failed.load(Ordering::Relaxed) > sd.cache_nice_tries + 2
    }

    /// 在 `sd` 内为 `this_cpu` 做一次均衡，返回迁入的任务数
    fn load_balance(&self, tree: &DomainTree, this_cpu: usize, sd: DomainId, idle: CpuIdleType, continue_balancing: &mut bool) -> u32 {
        let d = tree.sd(sd);
        let mut env = LbEnv {
            tree,
            sd,
            src_cpu: this_cpu,
            dst_cpu: this_cpu,
            new_dst_cpu: this_cpu,
            cpus: self.active_mask().and(d.span),
            idle,
            imbalance: 0,
            flags: LbFlags::empty(),
            loop_: 0,
            loop_max: 0,
            migration_type: MigrationType::Load,
        };
        d.balance.lb_count.fetch_add(1, Ordering::Relaxed);

        if !self.should_we_balance(&env) {
            *continue_balancing = false;
            return 0;
        }

        let mut ld_moved = 0u32;
        let mut busiest_sample = CpuSample::default();
        let mut all_pinned = false;
        let mut passes = 0;
        loop {
            passes += 1;
            let Some(group) = self.find_busiest_group(&mut env) else {
                break;
            };
            let Some((busiest, sample)) = self.find_busiest_queue(&env, group) else {
                break;
            };
            sched_bug_on!(busiest == env.dst_cpu, "CPU{}: balancing against itself", busiest);
            d.balance.lb_imbalance.fetch_add(env.imbalance.max(0) as u64, Ordering::Relaxed);
            busiest_sample = sample;
            env.src_cpu = busiest;
            env.flags.insert(LbFlags::ALL_PINNED);
            env.loop_ = 0;
            env.loop_max = self.tunables.nr_migrate().min(sample.nr_running);

            if sample.nr_running > 1 {
                loop {
                    let tasks = {
                        let mut rq = self.rq_lock(busiest);
                        self.update_rq_clock(&mut rq);
                        let tasks = self.detach_tasks(&mut rq, &mut env);
                        self.unlock_with_callbacks(rq);
                        tasks
                    };
                    ld_moved += tasks.len() as u32;
                    self.attach_tasks(env.dst_cpu, tasks);
                    if env.flags.contains(LbFlags::NEED_BREAK) && env.loop_ < env.loop_max {
                        env.flags.remove(LbFlags::NEED_BREAK);
                        continue;
                    }
                    break;
                }

                // 本地 CPU 接不了，换本地组里的另一个 CPU 再试
                if env.flags.contains(LbFlags::DST_PINNED) && env.imbalance > 0 && env.new_dst_cpu != env.dst_cpu {
                    env.cpus.clear(env.dst_cpu);
                    env.dst_cpu = env.new_dst_cpu;
                    env.flags.remove(LbFlags::DST_PINNED);
                    env.loop_ = 0;
                    if passes < 8 {
                        continue;
                    }
                }

                // 父层本地组记下因亲和性没能均衡
                if let Some(parent) = d.parent {
                    if env.flags.contains(LbFlags::SOME_PINNED) && env.imbalance > 0 {
                        if let Some(&g) = tree.sd(parent).groups.first() {
                            tree.sgc_of(g).imbalance.store(1, Ordering::Relaxed);
                        }
                    }
                }

                // 所有任务都绑在 busiest 上，换一个 CPU 再找
                if env.flags.contains(LbFlags::ALL_PINNED) {
                    env.cpus.clear(busiest);
                    if !env.cpus.and(d.span).without(env.dst_cpu).is_empty() && passes < 8 {
                        env.loop_ = 0;
                        continue;
                    }
                    all_pinned = true;
                }
            }
            break;
        }

        if env.imbalance <= 0 && ld_moved == 0 && env.src_cpu == this_cpu {
            // out_balanced
            if let Some(&g) = d.groups.first() {
                let sgc = tree.sgc_of(g);
                if sgc.imbalance.load(Ordering::Relaxed) != 0 {
                    sgc.imbalance.store(0, Ordering::Relaxed);
                }
            }
            d.balance.nr_balance_failed.store(0, Ordering::Relaxed);
            self.lb_backoff(d, all_pinned, idle);
            return 0;
        }

        if all_pinned {
            self.lb_backoff(d, true, idle);
            return 0;
        }

        let mut active = false;
        if ld_moved == 0 {
            d.balance.lb_failed.fetch_add(1, Ordering::Relaxed);
            if idle != CpuIdleType::NewlyIdle {
                d.balance.nr_balance_failed.fetch_add(1, Ordering::Relaxed);
            }
            if self.need_active_balance(&env, &busiest_sample) {
                active = self.kick_active_balance(env.src_cpu, this_cpu);
                if active {
                    d.balance.alb_pushed.fetch_add(1, Ordering::Relaxed);
                }
                // 主动均衡已经发起，下次不必再急着重试
                d.balance.nr_balance_failed.store(d.cache_nice_tries + 1, Ordering::Relaxed);
            }
        } else {
            d.balance.nr_balance_failed.store(0, Ordering::Relaxed);
            log::debug!("CPU{}: pulled {} task(s) from CPU{} at {}", this_cpu, ld_moved, env.src_cpu, d.name);
        }
        if !active {
            d.balance.balance_interval.store(d.min_interval, Ordering::Relaxed);
        }
        ld_moved
    }

    /// 均衡失败后的退避，newidle 不影响周期均衡的间隔
    fn lb_backoff(&self, d: &super::topology::SchedDomain, all_pinned: bool, idle: CpuIdleType) {
        if idle == CpuIdleType::NewlyIdle {
            return;
        }
        let cur = d.balance.balance_interval.load(Ordering::Relaxed);
        if (all_pinned && cur < MAX_PINNED_INTERVAL) || cur < d.max_interval {
            d.balance.balance_interval.store((cur * 2).max(1), Ordering::Relaxed);
        }
    }

    /// 让 busiest 上的 stopper 把正在运行的任务推过来
    fn kick_active_balance(&self, busiest: usize, this_cpu: usize) -> bool {
        let start = {
            let mut rq = self.rq_lock(busiest);
            let curr = rq.curr;
            if !rq.curr_task().cpus_mask.test(this_cpu) || rq.task(curr).class != SchedClass::Fair {
                return false;
            }
            if rq.active_balance {
                false
            } else {
                rq.active_balance = true;
                rq.push_cpu = this_cpu;
                true
            }
        };
        if start {
            if !self.stop_one_cpu_nowait(busiest, StopWork::ActiveBalance { target: this_cpu }) {
                self.rq_lock(busiest).active_balance = false;
                return false;
            }
        }
        start
    }

    /// stopper 在 `cpu` 上执行：把一个 fair 任务推到 `target`
    pub(crate) fn active_load_balance_cpu_stop(&self, cpu: usize, target: usize) {
        let tree = self.domain_tree();
        let moved = {
            let mut rq = self.rq_lock(cpu);
            let ok = rq.active_balance && self.cpu_active(target) && cpu != target && rq.nr_running > 1;
            let mut moved = None;
            if ok {
                let sd = tree.for_each_domain(target).find(|&d| tree.sd(d).span.test(cpu));
                if let Some(sd) = sd {
                    self.update_rq_clock(&mut rq);
                    let mut env = LbEnv {
                        tree: &tree,
                        sd,
                        src_cpu: cpu,
                        dst_cpu: target,
                        new_dst_cpu: target,
                        cpus: self.active_mask(),
                        idle: CpuIdleType::Idle,
                        imbalance: 1,
                        flags: LbFlags::ACTIVE_LB,
                        loop_: 0,
                        loop_max: 1,
                        migration_type: MigrationType::Task,
                    };
                    let pids: Vec<Pid> = rq
                        .tasks
                        .values()
                        .filter(|st| st.class == SchedClass::Fair && st.task.on_rq() == OnRq::Queued)
                        .map(|st| st.pid())
                        .collect();
                    for pid in pids {
                        if self.can_migrate_task(&rq, rq.task(pid), &mut env) {
                            self.deactivate_task(&mut rq, pid, DequeueFlags::NOCLOCK);
                            moved = Some(self.detach_task_rq(&mut rq, pid, target));
                            break;
                        }
                    }
                }
            }
            rq.active_balance = false;
            self.unlock_with_callbacks(rq);
            moved
        };
        if let Some(st) = moved {
            log::debug!("CPU{}: active balance pushed task {} to CPU{}", cpu, st.pid(), target);
            self.attach_tasks(target, alloc::vec![st]);
        }
    }

    fn get_sd_balance_interval(&self, d: &super::topology::SchedDomain, busy: bool) -> u64 {
        let mut interval = d.balance.balance_interval.load(Ordering::Relaxed);
        if busy {
            interval *= d.busy_factor as u64;
        }
        let max = (HZ * self.online_mask().weight() as u64 / 10).max(1);
        msecs_to_jiffies(interval).clamp(1, max)
    }

    /// 周期均衡：逐层检查是否到了均衡时间
    pub(crate) fn rebalance_domains(&self, cpu: usize, idle: CpuIdleType) {
        let tree = self.domain_tree();
        let j = self.jiffies();
        let mut idle = idle;
        let mut busy = idle == CpuIdleType::NotIdle;
        let mut next_balance = j + 60 * HZ;
        let mut update_next = false;
        let mut continue_balancing = true;

        for sd in tree.for_each_domain(cpu) {
            let d = tree.sd(sd);
            // newidle 开销每秒衰减约 1%
            let mut need_decay = false;
            if j > d.balance.last_decay_max_lb_cost.load(Ordering::Relaxed) + HZ {
                let c = d.balance.max_newidle_lb_cost.load(Ordering::Relaxed);
                d.balance.max_newidle_lb_cost.store(c * 253 / 256, Ordering::Relaxed);
                d.balance.last_decay_max_lb_cost.store(j, Ordering::Relaxed);
                need_decay = true;
            }
            if !continue_balancing {
                if need_decay {
                    continue;
                }
                break;
            }

            let mut interval = self.get_sd_balance_interval(d, busy);
            let serialize = d.flags.contains(SdFlags::SERIALIZE);
            let mut skip = false;
            if serialize && self.balancing.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
                skip = true;
            }
            if !skip {
                let last = d.balance.last_balance.load(Ordering::Relaxed);
                if j >= last + interval {
                    if self.load_balance(&tree, cpu, sd, idle, &mut continue_balancing) > 0 {
                        idle = if self.idle_cpu(cpu) { CpuIdleType::Idle } else { CpuIdleType::NotIdle };
                        busy = idle != CpuIdleType::Idle;
                    }
                    d.balance.last_balance.store(j, Ordering::Relaxed);
                    interval = self.get_sd_balance_interval(d, busy);
                }
                if serialize {
                    self.balancing.store(false, Ordering::Release);
                }
            }
            let nb = d.balance.last_balance.load(Ordering::Relaxed) + interval;
            if nb < next_balance {
                next_balance = nb;
                update_next = true;
            }
        }
        if update_next {
            self.rq_lock(cpu).next_balance = next_balance;
        }
    }

    /// 即将进入 idle 时尝试从别处拉一个任务
    ///
    /// 期间释放本 rq 的锁。返回是否拉到了任务。
    pub(crate) fn newidle_balance<'a>(&'a self, mut rq: RqGuard<'a>) -> (RqGuard<'a>, bool) {
        let cpu = rq.cpu;
        self.update_misfit_status(&mut rq, None);
        if !self.cpu_active(cpu) {
            return (rq, false);
        }
        rq.idle_stamp = rq.clock;

        let tree = self.domain_tree();
        let base = tree.base.get(cpu).copied().flatten();
        let j = self.jiffies();
        let skip = rq.avg_idle < self.tunables.migration_cost() || !rq.rd.overload.load(Ordering::Relaxed) || base.is_none();
        if skip {
            if let Some(b) = base {
                let nb = tree.sd(b).balance.last_balance.load(Ordering::Relaxed) + self.get_sd_balance_interval(tree.sd(b), false);
                if nb < rq.next_balance || rq.next_balance < j {
                    rq.next_balance = nb;
                }
            }
            return (rq, false);
        }
        let avg_idle = rq.avg_idle;
        drop(rq);

        self.update_blocked_averages(cpu);
        let mut pulled = 0;
        let mut curr_cost = 0u64;
        let mut continue_balancing = true;
        for sd in tree.for_each_domain(cpu) {
            let d = tree.sd(sd);
            if avg_idle < curr_cost + d.balance.max_newidle_lb_cost.load(Ordering::Relaxed) {
                break;
            }
            if d.flags.contains(SdFlags::BALANCE_NEWIDLE) {
                let t0 = self.sched_clock();
                pulled = self.load_balance(&tree, cpu, sd, CpuIdleType::NewlyIdle, &mut continue_balancing);
                let cost = self.sched_clock().saturating_sub(t0);
                if cost > d.balance.max_newidle_lb_cost.load(Ordering::Relaxed) {
                    d.balance.max_newidle_lb_cost.store(cost, Ordering::Relaxed);
                }
                curr_cost += cost;
            }
            // 拉到了任务或者有别的任务被唤醒过来
            if pulled > 0 || self.nr_running_on(cpu) > 0 || self.pcpu[cpu].ttwu_pending.load(Ordering::Acquire) != 0 {
                break;
            }
        }

        let mut rq = self.rq_lock(cpu);
        if curr_cost > rq.max_idle_balance_cost {
            rq.max_idle_balance_cost = curr_cost;
        }
        let got = pulled > 0 || rq.nr_running > 0;
        if got {
            rq.idle_stamp = 0;
        }
        (rq, got)
    }

    /// fair 类在挑选前的均衡：本 CPU 没有可运行任务时做 newidle 均衡
    pub(crate) fn balance_fair<'a>(&'a self, rq: RqGuard<'a>, _prev: Pid) -> (RqGuard<'a>, bool) {
        if rq.nr_running > 0 {
            return (rq, true);
        }
        self.newidle_balance(rq)
    }

    // ---------------------------------------------------------------
    // nohz
    // ---------------------------------------------------------------

    fn set_cpu_sd_state_idle(&self, cpu: usize) {
        if self.nohz.sd_idle[cpu].swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.domain_tree().llc_shared(cpu) {
            let _ = shared.nr_busy_cpus.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        }
    }

    fn set_cpu_sd_state_busy(&self, cpu: usize) {
        if !self.nohz.sd_idle[cpu].swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.domain_tree().llc_shared(cpu) {
            shared.nr_busy_cpus.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 停 tick 进入 idle：加入 nohz 集合，由别的 CPU 代为均衡
    pub(crate) fn nohz_balance_enter_idle(&self, cpu: usize) {
        if !self.cpu_active(cpu) || self.domain_tree().base.get(cpu).copied().flatten().is_none() {
            return;
        }
        self.rq_lock(cpu).has_blocked_load = true;
        self.nohz.has_blocked.store(true, Ordering::Release);
        if self.nohz.idle_cpus_mask.set_cpu(cpu, Ordering::AcqRel) {
            return;
        }
        self.nohz.nr_cpus.fetch_add(1, Ordering::AcqRel);
        self.set_cpu_sd_state_idle(cpu);
    }

    pub(crate) fn nohz_balance_exit_idle(&self, cpu: usize) {
        if self.nohz.idle_cpus_mask.clear_cpu(cpu, Ordering::AcqRel) {
            self.nohz.nr_cpus.fetch_sub(1, Ordering::AcqRel);
        }
        self.set_cpu_sd_state_busy(cpu);
    }

    /// 选一个 nohz idle CPU 代为均衡并发 IPI 踢醒它
    fn kick_ilb(&self, this_cpu: usize, flags: u32) {
        if flags & nohz_flags::BALANCE_KICK != 0 {
            self.nohz.next_balance.store(self.jiffies() + 1, Ordering::Relaxed);
        }
        let idle = self.nohz.idle_cpus_mask.load(Ordering::Acquire).and(self.active_mask());
        let Some(ilb) = idle.iter().find(|&c| c != this_cpu && self.idle_cpu(c)) else {
            return;
        };
        let old = self.nohz.kick[ilb].fetch_or(flags, Ordering::AcqRel);
        if old & nohz_flags::KICK_MASK != 0 {
            return;
        }
        log::trace!("CPU{}: kick CPU{} for nohz balance ({:#x})", this_cpu, ilb, flags);
        self.hooks.send_ipi(ilb, IpiKind::NohzKick);
    }

    fn nohz_balancer_kick(&self, cpu: usize) {
        let nohz = &self.nohz;
        if nohz.nr_cpus.load(Ordering::Acquire) == 0 {
            return;
        }
        let j = self.jiffies();
        let mut flags = 0;
        if nohz.has_blocked.load(Ordering::Acquire) && j >= nohz.next_blocked.load(Ordering::Relaxed) {
            flags = nohz_flags::STATS_KICK;
        }
        if j < nohz.next_balance.load(Ordering::Relaxed) {
            if flags != 0 {
                self.kick_ilb(cpu, flags);
            }
            return;
        }

        let (nr_running, misfit) = {
            let rq = self.rq_lock(cpu);
            (rq.nr_running, rq.misfit_task_load)
        };
        let kick = nohz_flags::BALANCE_KICK | nohz_flags::STATS_KICK;
        let tree = self.domain_tree();
        if nr_running >= 2 {
            flags = kick;
        } else if misfit != 0 && tree.sd_asym_cpucapacity.get(cpu).copied().flatten().is_some() {
            // 有更大的 idle 核可以接 misfit 任务
            let sd = tree.sd_asym_cpucapacity[cpu].map(|s| tree.sd(s).span).unwrap_or_default();
            let my_cap = self.capacity_orig_of(cpu);
            if sd.iter().any(|c| c != cpu && self.idle_cpu(c) && self.capacity_orig_of(c) > my_cap) {
                flags = kick;
            }
        } else if tree.llc_shared(cpu).is_some_and(|s| s.nr_busy_cpus.load(Ordering::Relaxed) > 1) && nr_running >= 1 {
            flags = kick;
        }
        if flags != 0 {
            self.kick_ilb(cpu, flags);
        }
    }

    /// IPI 中检查是否被踢醒做 nohz 均衡，是则应触发均衡软中断
    pub(crate) fn nohz_kick_pending(&self, cpu: usize) -> bool {
        let flags = self.nohz.kick[cpu].swap(0, Ordering::AcqRel) & nohz_flags::KICK_MASK;
        if flags == 0 {
            return false;
        }
        if !self.idle_cpu(cpu) || self.need_resched(cpu) {
            return false;
        }
        self.nohz.idle_balance[cpu].store(flags, Ordering::Release);
        true
    }

    /// 替所有 nohz idle CPU 更新阻塞负载、做周期均衡
    fn nohz_idle_balance(&self, this_cpu: usize, idle: CpuIdleType) -> bool {
        let flags = self.nohz.idle_balance[this_cpu].swap(0, Ordering::AcqRel);
        if flags == 0 {
            return false;
        }
        if idle != CpuIdleType::Idle {
            return false;
        }

        let j = self.jiffies();
        let mut next_balance = j + 60 * HZ;
        let mut update_next = false;
        let stats = flags & nohz_flags::STATS_KICK != 0;
        let mut has_blocked_load = stats;
        if stats {
            self.nohz.has_blocked.store(false, Ordering::Release);
        }

        let mask = self.nohz.idle_cpus_mask.load(Ordering::Acquire);
        let mut aborted = false;
        for balance_cpu in mask.iter() {
            if balance_cpu == this_cpu || !self.idle_cpu(balance_cpu) {
                continue;
            }
            // 本 CPU 有活要干，剩下的交给下次
            if self.need_resched(this_cpu) {
                has_blocked_load = true;
                aborted = true;
                break;
            }
            if stats {
                self.update_blocked_averages(balance_cpu);
                has_blocked_load |= self.rq_lock(balance_cpu).has_blocked_load;
            }
            let nb = self.rq_lock(balance_cpu).next_balance;
            if flags & nohz_flags::BALANCE_KICK != 0 && j >= nb {
                self.rebalance_domains(balance_cpu, CpuIdleType::Idle);
            }
            let nb = self.rq_lock(balance_cpu).next_balance;
            if nb < next_balance {
                next_balance = nb;
                update_next = true;
            }
        }

        if !aborted {
            if stats {
                self.nohz.next_blocked.store(j + msecs_to_jiffies(LOAD_AVG_PERIOD_MS), Ordering::Relaxed);
                self.update_blocked_averages(this_cpu);
                has_blocked_load |= self.rq_lock(this_cpu).has_blocked_load;
            }
            if flags & nohz_flags::BALANCE_KICK != 0 {
                self.rebalance_domains(this_cpu, CpuIdleType::Idle);
            }
            if update_next {
                self.nohz.next_balance.store(next_balance, Ordering::Relaxed);
            }
        }
        if has_blocked_load {
            self.nohz.has_blocked.store(true, Ordering::Release);
        }
        true
    }

    /// SCHED_SOFTIRQ 处理
    pub(crate) fn run_rebalance_domains(&self, cpu: usize) {
        let idle = if self.idle_cpu(cpu) { CpuIdleType::Idle } else { CpuIdleType::NotIdle };
        if self.nohz_idle_balance(cpu, idle) {
            return;
        }
        self.update_blocked_averages(cpu);
        self.rebalance_domains(cpu, idle);
    }

    /// tick 中检查是否需要均衡
    pub(crate) fn trigger_load_balance(&self, cpu: usize) {
        if !self.cpu_active(cpu) || self.domain_tree().base.get(cpu).copied().flatten().is_none() {
            return;
        }
        if self.jiffies() >= self.rq_lock(cpu).next_balance {
            self.raise_softirq(cpu);
        }
        self.nohz_balancer_kick(cpu);
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::cmdline::BootParams;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;

    fn sgs(nr: u32, weight: u32, cap: u64, util: u64, runnable: u64) -> SgLbStats {
        SgLbStats {
            sum_nr_running: nr,
            group_weight: weight,
            group_capacity: cap,
            group_util: util,
            group_runnable: runnable,
            ..Default::default()
        }
    }

    #[test]
    fn overload_needs_more_tasks_than_cpus() {
        assert!(!Scheduler::group_is_overloaded(117, &sgs(2, 2, 2048, 2048, 2048)));
        assert!(Scheduler::group_is_overloaded(117, &sgs(3, 2, 2048, 2048, 3072)));
        assert!(Scheduler::group_has_capacity(117, &sgs(1, 2, 2048, 1024, 1024)));
        assert!(!Scheduler::group_has_capacity(117, &sgs(2, 2, 2048, 2000, 2048)));
    }

    #[test]
    fn group_type_orders_by_urgency() {
        assert!(GroupType::Overloaded > GroupType::Imbalanced);
        assert!(GroupType::MisfitTask > GroupType::FullyBusy);
        assert!(GroupType::HasSpare < GroupType::FullyBusy);
    }

    #[test]
    fn uclamp_max_lets_big_util_fit() {
        assert!(!util_fits_cpu(900, 0, 1024, 512));
        assert!(util_fits_cpu(900, 0, 300, 512));
        assert!(!util_fits_cpu(10, 600, 1024, 512));
    }

    #[test]
    fn nohz_enter_and_exit_track_busy_count() {
        let s = Scheduler::with_boot_params(ArchTopology::smt(1, 2), Arc::new(ManualClock::new(2)), Arc::new(NoopHooks), BootParams::new());
        let busy = |s: &Scheduler| s.domain_tree().llc_shared(0).map(|sh| sh.nr_busy_cpus.load(Ordering::Relaxed));
        let before = busy(&s);
        s.nohz_balance_enter_idle(1);
        assert_eq!(s.nohz.nr_cpus.load(Ordering::Relaxed), 1);
        assert!(s.nohz.idle_cpus_mask.load(Ordering::Relaxed).test(1));
        s.nohz_balance_enter_idle(1);
        assert_eq!(s.nohz.nr_cpus.load(Ordering::Relaxed), 1);
        s.nohz_balance_exit_idle(1);
        assert_eq!(s.nohz.nr_cpus.load(Ordering::Relaxed), 0);
        assert_eq!(busy(&s), before);
    }

    #[test]
    fn kick_without_idle_cpus_is_a_noop() {
        let s = Scheduler::with_boot_params(ArchTopology::flat(2), Arc::new(ManualClock::new(2)), Arc::new(NoopHooks), BootParams::new());
        s.nohz_balancer_kick(0);
        assert_eq!(s.nohz.kick[1].load(Ordering::Relaxed), 0);
        assert!(!s.nohz_kick_pending(1));
    }
}
