//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 能耗模型与能耗估算
//!
//! 每个能效域（一组同频 CPU）有一张按频率升序的性能状态表，
//! `cost = power * fmax / freq`。估算一个放置方案的能耗时，先算出
//! 域内每个 CPU 的有效利用率，再用最忙的 CPU 决定频率、用利用率之和
//! 决定功耗。

use alloc::vec::Vec;

use super::fixedpt::{BW_SHIFT, SCHED_CAPACITY_SCALE};
use super::topology::{ArchTopology, EmDomain};
use super::uclamp::RqUclamp;
use crate::cpumask::CpuMask;

/// 复杂度上限：能效域数 * (CPU 数 + 性能状态总数)
pub const EM_MAX_COMPLEXITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfState {
    /// kHz
    pub frequency: u64,
    /// mW
    pub power: u64,
    pub cost: u64,
}

/// 一个能效域
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfDomain {
    pub cpus: CpuMask,
    pub table: Vec<PerfState>,
    /// 域内 CPU 的 arch 容量
    pub scale_cpu: u64,
}

impl PerfDomain {
    pub fn from_em(em: &EmDomain, scale_cpu: u64) -> Option<Self> {
        let fmax = em.states.last()?.0;
        let table = em
            .states
            .iter()
            .map(|&(frequency, power)| PerfState {
                frequency,
                power,
                cost: if frequency == 0 { 0 } else { fmax * power / frequency },
            })
            .collect();
        Some(Self { cpus: em.cpus, table, scale_cpu })
    }

    pub fn nr_perf_states(&self) -> usize {
        self.table.len()
    }
}

/// 留出 25% 余量
#[inline]
pub const fn map_util_perf(util: u64) -> u64 {
    util + (util >> 2)
}

#[inline]
pub const fn map_util_freq(util: u64, freq: u64, cap: u64) -> u64 {
    freq * util / cap
}

/// 估算一个能效域的能耗
///
/// `max_util` 选择性能状态，`sum_util` 决定在该状态下的能耗，
/// `allowed_cpu_cap` 是扣除热压后允许的最大容量。
pub fn em_cpu_energy(pd: &PerfDomain, max_util: u64, sum_util: u64, allowed_cpu_cap: u64) -> u64 {
    let Some(last) = pd.table.last() else {
        return 0;
    };
    if sum_util == 0 {
        return 0;
    }
    let scale_cpu = pd.scale_cpu.max(1);
    let max_util = map_util_perf(max_util).min(allowed_cpu_cap);
    let freq = map_util_freq(max_util, last.frequency, scale_cpu);
    let ps = pd.table.iter().find(|ps| ps.frequency >= freq).unwrap_or(last);
    ps.cost * sum_util / scale_cpu
}

/// 启用能耗感知调度的前提
pub struct EasCheck {
    pub energy_aware: bool,
    pub has_asym: bool,
    pub smt_active: bool,
    pub schedutil: bool,
    pub freq_invariant: bool,
}

/// 构建根域的能效域列表，条件不满足时返回 `None`
pub fn build_perf_domains(topo: &ArchTopology, cpu_map: CpuMask, check: &EasCheck) -> Option<Vec<PerfDomain>> {
    if !check.energy_aware {
        return None;
    }
    if !check.has_asym {
        log::info!("rd {}: CPUs do not have asymmetric capacities", cpu_map);
        return None;
    }
    if check.smt_active {
        log::warn!("rd {}: Disabling EAS, SMT is not supported", cpu_map);
        return None;
    }
    if !check.freq_invariant {
        log::warn!("rd {}: Disabling EAS: frequency-invariant load tracking not supported", cpu_map);
        return None;
    }

    let mut pds: Vec<PerfDomain> = Vec::new();
    let mut nr_ps = 0;
    for cpu in cpu_map {
        if pds.iter().any(|pd| pd.cpus.test(cpu)) {
            continue;
        }
        if !check.schedutil {
            log::warn!("rd {}: Disabling EAS, schedutil is mandatory", cpu_map);
            return None;
        }
        let Some(em) = topo.energy_model.iter().find(|em| em.cpus.test(cpu)) else {
            log::info!("sched: no EM found for CPU{}", cpu);
            return None;
        };
        let pd = PerfDomain::from_em(em, topo.cpu_capacity[cpu])?;
        nr_ps += pd.nr_perf_states();
        pds.push(pd);
    }

    if pds.len() * (nr_ps + cpu_map.weight()) > EM_MAX_COMPLEXITY {
        log::warn!("rd {}: Disabling EAS, EM complexity is too high", cpu_map);
        return None;
    }
    if pds.is_empty() {
        return None;
    }
    for pd in &pds {
        log::debug!("sched: perf domain {} with {} states", pd.cpus, pd.nr_perf_states());
    }
    Some(pds)
}

/// 估算能耗时读取的单个 CPU 状态
#[derive(Debug, Clone, Copy)]
pub struct CpuUtilSnapshot {
    pub cpu: usize,
    pub util_cfs: u64,
    pub util_est_enqueued: u64,
    pub util_rt: u64,
    pub util_dl: u64,
    pub util_irq: u64,
    /// DL running_bw，BW_SHIFT 定点
    pub running_bw: u64,
    pub thermal: u64,
    pub capacity: u64,
    pub capacity_orig: u64,
    pub uclamp: RqUclamp,
}

impl CpuUtilSnapshot {
    pub fn cpu_bw_dl(&self) -> u64 {
        (self.running_bw * SCHED_CAPACITY_SCALE) >> BW_SHIFT
    }
}

/// 参与估算的任务
#[derive(Debug, Clone, Copy)]
pub struct TaskUtil {
    pub cpu: usize,
    pub util: u64,
    /// `max(ewma, enqueued)`
    pub util_est: u64,
    pub uclamp_min: u32,
    pub uclamp_max: u32,
}

impl TaskUtil {
    pub fn util_est_max(&self) -> u64 {
        self.util.max(self.util_est)
    }

    pub fn clamps(&self) -> (u32, u32) {
        (self.uclamp_min, self.uclamp_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilKind {
    /// 能耗估算，计入 DL 实际利用率
    Energy,
    /// 调频，计入 DL 带宽与 uclamp
    Frequency,
}

/// 把 CFS 利用率与 RT/DL/IRQ 合成 CPU 的有效利用率
pub fn effective_cpu_util(s: &CpuUtilSnapshot, util_cfs: u64, max: u64, kind: UtilKind, p: Option<&TaskUtil>) -> u64 {
    let irq = s.util_irq;
    if irq >= max {
        return max;
    }

    let mut util = util_cfs + s.util_rt;
    if kind == UtilKind::Frequency {
        util = s.uclamp.util_with(util, p.map(|t| t.clamps()));
    }

    let dl_util = s.util_dl;
    if util + dl_util >= max {
        return max;
    }
    if kind == UtilKind::Energy {
        util += dl_util;
    }

    // irq 时间不计入任务时钟，按剩余容量缩放后再加回
    util = util * (max - irq) / max;
    util += irq;

    if kind == UtilKind::Frequency {
        util += s.cpu_bw_dl();
    }
    util.min(max)
}

/// 假设任务 `p` 迁到 `dst_cpu` 后 `cpu` 的 CFS 利用率
pub fn cpu_util_next(s: &CpuUtilSnapshot, p: &TaskUtil, dst_cpu: Option<usize>, util_est: bool) -> u64 {
    let cpu = s.cpu;
    let mut util = s.util_cfs;
    let to_here = dst_cpu == Some(cpu);
    if p.cpu == cpu && !to_here {
        util = util.saturating_sub(p.util);
    } else if p.cpu != cpu && to_here {
        util += p.util;
    }

    if util_est {
        let mut est = s.util_est_enqueued;
        if to_here {
            est += p.util_est;
        }
        util = util.max(est);
    }
    util.min(s.capacity_orig)
}

/// 任务放到 `dst_cpu`（`None` 表示不放入）时能效域 `pd` 的能耗
pub fn compute_energy(
    p: &TaskUtil,
    dst_cpu: Option<usize>,
    pd: &PerfDomain,
    snaps: &[CpuUtilSnapshot],
    online: CpuMask,
    util_est: bool,
) -> u64 {
    let Some(first) = pd.cpus.first() else {
        return 0;
    };
    let cpu_cap = pd.scale_cpu;
    let allowed_cap = cpu_cap.saturating_sub(snaps.get(first).map_or(0, |s| s.thermal));

    let mut max_util = 0;
    let mut sum_util = 0;
    for cpu in pd.cpus.and(online) {
        let Some(s) = snaps.get(cpu) else {
            continue;
        };
        let util_freq = cpu_util_next(s, p, dst_cpu, util_est);
        let mut util_running = util_freq;
        let mut tsk = None;
        if dst_cpu == Some(cpu) {
            tsk = Some(p);
            util_running = cpu_util_next(s, p, None, util_est) + p.util_est_max();
        }

        let cpu_util = effective_cpu_util(s, util_running, cpu_cap, UtilKind::Energy, None);
        sum_util += cpu_util.min(allowed_cap);

        let cpu_util = effective_cpu_util(s, util_freq, cpu_cap, UtilKind::Frequency, tsk);
        max_util = max_util.max(cpu_util.min(allowed_cap));
    }
    em_cpu_energy(pd, max_util, sum_util, allowed_cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn little() -> PerfDomain {
        PerfDomain::from_em(
            &EmDomain { cpus: CpuMask::from_cpus(&[0, 1]), states: alloc::vec![(500, 50), (1000, 150)] },
            438,
        )
        .unwrap()
    }

    #[test]
    fn costs_are_relative_to_fmax() {
        let pd = little();
        assert_eq!(pd.table[0].cost, 100);
        assert_eq!(pd.table[1].cost, 150);
    }

    #[test]
    fn energy_picks_lowest_sufficient_state() {
        let pd = little();
        // 100 * 1.25 = 125 -> freq 285 -> 第一档
        assert_eq!(em_cpu_energy(&pd, 100, 100, 438), 100 * 100 / 438);
        // 300 * 1.25 = 375 -> freq 856 -> 第二档
        assert_eq!(em_cpu_energy(&pd, 300, 300, 438), 150 * 300 / 438);
        assert_eq!(em_cpu_energy(&pd, 300, 0, 438), 0);
    }

    #[test]
    fn complexity_and_conditions() {
        let topo = ArchTopology::big_little(2, 438, &[(500, 50), (1000, 150)], 2, 1024, &[(1000, 400), (2000, 1200)]);
        let ok = EasCheck { energy_aware: true, has_asym: true, smt_active: false, schedutil: true, freq_invariant: true };
        let pds = build_perf_domains(&topo, CpuMask::first_n(4), &ok).unwrap();
        assert_eq!(pds.len(), 2);
        assert_eq!(pds[1].scale_cpu, 1024);
        let no_sugov = EasCheck { schedutil: false, ..ok };
        assert!(build_perf_domains(&topo, CpuMask::first_n(4), &no_sugov).is_none());
        let smt = EasCheck { smt_active: true, schedutil: true, ..no_sugov };
        assert!(build_perf_domains(&topo, CpuMask::first_n(4), &smt).is_none());
    }

    #[test]
    fn effective_util_scales_irq() {
        let s = CpuUtilSnapshot {
            cpu: 0,
            util_cfs: 0,
            util_est_enqueued: 0,
            util_rt: 100,
            util_dl: 50,
            util_irq: 256,
            running_bw: 0,
            thermal: 0,
            capacity: 1024,
            capacity_orig: 1024,
            uclamp: RqUclamp::default(),
        };
        // (200 + 100 + 50) * 768 / 1024 + 256
        assert_eq!(effective_cpu_util(&s, 200, 1024, UtilKind::Energy, None), 518);
        // FREQUENCY 不计 DL 利用率：(300) * 0.75 + 256
        assert_eq!(effective_cpu_util(&s, 200, 1024, UtilKind::Frequency, None), 481);
    }
}
