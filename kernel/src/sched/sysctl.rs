//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器运行时参数 (`/proc/sys/kernel/sched_*`)
//!
//! fair 的三个粒度参数按在线 CPU 数取对数放大（最多按 8 个 CPU 计），
//! 写入时保存未放大的值，CPU 上下线后重新计算。

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use super::core::Scheduler;
use super::fixedpt::{to_ratio, RUNTIME_INF, SCHED_CAPACITY_SCALE};
use super::group::{NSEC_PER_USEC, ROOT_TASK_GROUP};
use super::root_domain::global_dl_bw;
use super::RR_TIMESLICE;
use crate::config::{
    HZ, SCHED_ENERGY_AWARE, SCHED_LATENCY_NS, SCHED_MIGRATION_COST_NS, SCHED_MIN_GRANULARITY_NS,
    SCHED_NR_MIGRATE, SCHED_RR_TIMESLICE_MS, SCHED_RT_PERIOD_US, SCHED_RT_RUNTIME_US, SCHED_WAKEUP_GRANULARITY_NS,
};
use crate::errno::{SchedError, SchedResult};

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// 粒度参数的合法范围
const MIN_SCHED_GRANULARITY: u64 = 100_000;
const MAX_SCHED_GRANULARITY: u64 = NSEC_PER_SEC;

pub fn msecs_to_jiffies(ms: u64) -> u64 {
    (ms * HZ).div_ceil(1000)
}

/// 放大系数：1 + ilog2(min(cpus, 8))
pub fn sysctl_factor(online_cpus: usize) -> u64 {
    let cpus = online_cpus.clamp(1, 8) as u64;
    1 + cpus.ilog2() as u64
}

pub struct Tunables {
    normalized_latency: AtomicU64,
    normalized_min_granularity: AtomicU64,
    normalized_wakeup_granularity: AtomicU64,
    latency: AtomicU64,
    min_granularity: AtomicU64,
    wakeup_granularity: AtomicU64,
    pub migration_cost: AtomicU64,
    pub nr_migrate: AtomicU32,
    pub rt_period_us: AtomicU64,
    pub rt_runtime_us: AtomicI64,
    /// RR 时间片，tick
    pub rr_timeslice: AtomicU32,
    pub energy_aware: AtomicBool,
    pub uclamp_util_min: AtomicU32,
    pub uclamp_util_max: AtomicU32,
    pub child_runs_first: AtomicBool,
    factor: AtomicU64,
}

impl Tunables {
    pub fn new(online_cpus: usize) -> Self {
        let rr = if SCHED_RR_TIMESLICE_MS == 0 {
            RR_TIMESLICE
        } else {
            msecs_to_jiffies(SCHED_RR_TIMESLICE_MS).max(1) as u32
        };
        let t = Self {
            normalized_latency: AtomicU64::new(SCHED_LATENCY_NS),
            normalized_min_granularity: AtomicU64::new(SCHED_MIN_GRANULARITY_NS),
            normalized_wakeup_granularity: AtomicU64::new(SCHED_WAKEUP_GRANULARITY_NS),
            latency: AtomicU64::new(SCHED_LATENCY_NS),
            min_granularity: AtomicU64::new(SCHED_MIN_GRANULARITY_NS),
            wakeup_granularity: AtomicU64::new(SCHED_WAKEUP_GRANULARITY_NS),
            migration_cost: AtomicU64::new(SCHED_MIGRATION_COST_NS),
            nr_migrate: AtomicU32::new(SCHED_NR_MIGRATE),
            rt_period_us: AtomicU64::new(SCHED_RT_PERIOD_US),
            rt_runtime_us: AtomicI64::new(SCHED_RT_RUNTIME_US),
            rr_timeslice: AtomicU32::new(rr),
            energy_aware: AtomicBool::new(SCHED_ENERGY_AWARE),
            uclamp_util_min: AtomicU32::new(SCHED_CAPACITY_SCALE as u32),
            uclamp_util_max: AtomicU32::new(SCHED_CAPACITY_SCALE as u32),
            child_runs_first: AtomicBool::new(false),
            factor: AtomicU64::new(1),
        };
        t.update_factor(online_cpus);
        t
    }

    /// 在线 CPU 数变化后重新放大
    pub fn update_factor(&self, online_cpus: usize) {
        let f = sysctl_factor(online_cpus);
        self.factor.store(f, Ordering::Relaxed);
        self.latency.store(f * self.normalized_latency.load(Ordering::Relaxed), Ordering::Relaxed);
        self.min_granularity
            .store(f * self.normalized_min_granularity.load(Ordering::Relaxed), Ordering::Relaxed);
        self.wakeup_granularity
            .store(f * self.normalized_wakeup_granularity.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    #[inline]
    pub fn latency(&self) -> u64 {
        self.latency.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn min_granularity(&self) -> u64 {
        self.min_granularity.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn wakeup_granularity(&self) -> u64 {
        self.wakeup_granularity.load(Ordering::Relaxed)
    }

    /// 一个调度周期内最多容纳的任务数
    pub fn nr_latency(&self) -> u64 {
        (self.latency() / self.min_granularity().max(1)).max(1)
    }

    #[inline]
    pub fn migration_cost(&self) -> u64 {
        self.migration_cost.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nr_migrate(&self) -> u32 {
        self.nr_migrate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rr_timeslice(&self) -> u32 {
        self.rr_timeslice.load(Ordering::Relaxed)
    }

    /// 全局 RT 周期 (ns)
    pub fn rt_period(&self) -> u64 {
        self.rt_period_us.load(Ordering::Relaxed) * NSEC_PER_USEC
    }

    /// 全局 RT 配额 (ns)，不限制时为 `RUNTIME_INF`
    pub fn rt_runtime(&self) -> u64 {
        let us = self.rt_runtime_us.load(Ordering::Relaxed);
        if us < 0 {
            RUNTIME_INF
        } else {
            us as u64 * NSEC_PER_USEC
        }
    }

    pub fn uclamp_defaults(&self) -> [u32; 2] {
        [
            self.uclamp_util_min.load(Ordering::Relaxed),
            self.uclamp_util_max.load(Ordering::Relaxed),
        ]
    }

    pub fn energy_aware(&self) -> bool {
        self.energy_aware.load(Ordering::Relaxed)
    }

    fn set_granularity(&self, normalized: &AtomicU64, scaled: &AtomicU64, ns: u64) {
        normalized.store(ns, Ordering::Relaxed);
        scaled.store(ns * self.factor.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl Scheduler {
    pub fn sysctl_sched_latency(&self, ns: u64) -> SchedResult<()> {
        if !(MIN_SCHED_GRANULARITY..=MAX_SCHED_GRANULARITY).contains(&ns) {
            return Err(SchedError::InvalidAttr);
        }
        let t = &self.tunables;
        t.set_granularity(&t.normalized_latency, &t.latency, ns);
        Ok(())
    }

    pub fn sysctl_sched_min_granularity(&self, ns: u64) -> SchedResult<()> {
        if !(MIN_SCHED_GRANULARITY..=MAX_SCHED_GRANULARITY).contains(&ns) {
            return Err(SchedError::InvalidAttr);
        }
        let t = &self.tunables;
        t.set_granularity(&t.normalized_min_granularity, &t.min_granularity, ns);
        Ok(())
    }

    pub fn sysctl_sched_wakeup_granularity(&self, ns: u64) -> SchedResult<()> {
        if ns > MAX_SCHED_GRANULARITY {
            return Err(SchedError::InvalidAttr);
        }
        let t = &self.tunables;
        t.set_granularity(&t.normalized_wakeup_granularity, &t.wakeup_granularity, ns);
        Ok(())
    }

    /// `sched_rr_timeslice_ms`，不大于 0 时恢复默认
    pub fn sysctl_sched_rr_timeslice(&self, ms: i64) {
        let ticks = if ms <= 0 {
            RR_TIMESLICE
        } else {
            msecs_to_jiffies(ms as u64).max(1) as u32
        };
        self.tunables.rr_timeslice.store(ticks, Ordering::Relaxed);
    }

    /// 同时修改 `sched_rt_period_us` 和 `sched_rt_runtime_us`
    ///
    /// 新的全局比例必须容得下所有任务组的 RT 配额和已准入的 DL 带宽，
    /// 否则保持原值不变。
    pub fn sysctl_sched_rt(&self, period_us: u64, runtime_us: i64) -> SchedResult<()> {
        if period_us == 0 || runtime_us < -1 {
            return Err(SchedError::InvalidAttr);
        }
        if runtime_us >= 0 && runtime_us as u64 > period_us {
            return Err(SchedError::InvalidAttr);
        }
        // 乘上 NSEC_PER_USEC 后不能溢出
        if period_us.checked_mul(NSEC_PER_USEC).is_none() {
            return Err(SchedError::InvalidAttr);
        }
        let period = period_us * NSEC_PER_USEC;
        let runtime = if runtime_us < 0 { RUNTIME_INF } else { runtime_us as u64 * NSEC_PER_USEC };

        self.rt_global_constraints(period, runtime)?;
        let new_bw = global_dl_bw(period, runtime);
        self.dl_global_validate(new_bw)?;

        self.tunables.rt_period_us.store(period_us, Ordering::Relaxed);
        self.tunables.rt_runtime_us.store(runtime_us, Ordering::Relaxed);

        // 根组的 RT 带宽就是全局带宽
        if let Some(root) = self.group(ROOT_TASK_GROUP) {
            {
                let mut b = root.rt_bandwidth.lock();
                b.period = period;
                b.runtime = runtime;
            }
            for rt in &root.rt_runtime {
                rt.lock().rt_runtime = runtime;
            }
        }
        self.dl_global_update(new_bw);
        log::info!("sched: rt bandwidth {}us/{}us", runtime_us, period_us);
        Ok(())
    }

    /// `sched_energy_aware`：切换后重建根域以重新评估 EAS
    pub fn sysctl_sched_energy_aware(&self, on: bool) {
        if self.tunables.energy_aware.swap(on, Ordering::Relaxed) != on {
            self.rebuild_sched_domains();
        }
    }

    /// `sched_util_clamp_min` / `sched_util_clamp_max`
    pub fn sysctl_sched_uclamp(&self, min: u32, max: u32) -> SchedResult<()> {
        let scale = SCHED_CAPACITY_SCALE as u32;
        if min > max || max > scale {
            return Err(SchedError::InvalidAttr);
        }
        self.tunables.uclamp_util_min.store(min, Ordering::Relaxed);
        self.tunables.uclamp_util_max.store(max, Ordering::Relaxed);
        Ok(())
    }

    /// 全局 RT 比例，任务组配额检查使用
    pub fn global_rt_ratio(&self) -> u64 {
        let runtime = self.tunables.rt_runtime();
        let period = self.tunables.rt_period();
        if runtime == RUNTIME_INF {
            return to_ratio(period, period);
        }
        to_ratio(period, runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_is_logarithmic_and_capped() {
        assert_eq!(sysctl_factor(1), 1);
        assert_eq!(sysctl_factor(2), 2);
        assert_eq!(sysctl_factor(4), 3);
        assert_eq!(sysctl_factor(64), 4);
    }

    #[test]
    fn granularity_scales_with_cpus() {
        let t = Tunables::new(4);
        assert_eq!(t.latency(), 3 * SCHED_LATENCY_NS);
        assert_eq!(t.min_granularity(), 3 * SCHED_MIN_GRANULARITY_NS);
        assert_eq!(t.nr_latency(), SCHED_LATENCY_NS / SCHED_MIN_GRANULARITY_NS);
        t.update_factor(1);
        assert_eq!(t.latency(), SCHED_LATENCY_NS);
    }

    #[test]
    fn rr_timeslice_in_ticks() {
        let t = Tunables::new(1);
        assert_eq!(t.rr_timeslice() as u64, msecs_to_jiffies(SCHED_RR_TIMESLICE_MS));
        assert_eq!(msecs_to_jiffies(100), HZ / 10);
        assert_eq!(t.rt_period(), 1_000_000_000);
        assert_eq!(t.rt_runtime(), 950_000_000);
    }
}
