//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! PELT (Per-Entity Load Tracking)
//!
//! 以 1024ns ≈ 1us 为单位、1024us ≈ 1ms 为周期的几何衰减平均：
//!
//! ```text
//!   sum = sum * y^p + contrib,  y^32 = 0.5
//!   avg = sum / (LOAD_AVG_MAX - 1024 + period_contrib)
//! ```
//!
//! 本模块只处理 [`SchedAvg`] 本身的累加和发布；实体与 cfs_rq 之间的
//! attach/detach/propagate 在 `fair.rs` 中完成。

use super::fixedpt::{
    accumulate_pelt_segments, cap_scale, decay_load, LOAD_AVG_MAX, SCHED_CAPACITY_SCALE,
    SCHED_CAPACITY_SHIFT,
};

/// util_est.enqueued 的最高位：自上次出队以来 util_avg 没有更新
pub const UTIL_AVG_UNCHANGED: u32 = 0x8000_0000;
/// EWMA 权重 1/4
pub const UTIL_EST_WEIGHT_SHIFT: u32 = 2;
/// 变化小于 1% 时不更新 EWMA
pub const UTIL_EST_MARGIN: i64 = (SCHED_CAPACITY_SCALE / 100) as i64;

/// 利用率估计：最近一次出队时的 util_avg 与其 EWMA
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtilEst {
    pub enqueued: u32,
    pub ewma: u32,
}

impl UtilEst {
    /// 估计值，不含 UNCHANGED 标志
    pub fn value(&self) -> u64 {
        ((self.enqueued & !UTIL_AVG_UNCHANGED).max(self.ewma)) as u64
    }

    pub fn enqueued_value(&self) -> u64 {
        (self.enqueued & !UTIL_AVG_UNCHANGED) as u64
    }

    /// 任务睡眠出队时更新
    ///
    /// `fastup` 时 util 上升立即采纳；util 超过 CPU 原始容量说明任务
    /// 受 CPU 限制，此时不更新 EWMA。
    pub fn update(&mut self, task_util: u64, capacity_orig: u64, fastup: bool) {
        if self.enqueued & UTIL_AVG_UNCHANGED != 0 {
            return;
        }

        let last_enqueued = self.enqueued as i64;
        let mut ue = *self;
        ue.enqueued = task_util as u32;

        if fastup && ue.ewma < ue.enqueued {
            ue.ewma = ue.enqueued;
            ue.enqueued |= UTIL_AVG_UNCHANGED;
            *self = ue;
            return;
        }

        let last_ewma_diff = ue.enqueued as i64 - ue.ewma as i64;
        let last_enqueued_diff = last_enqueued - ue.enqueued as i64;

        if last_ewma_diff.abs() < UTIL_EST_MARGIN {
            if last_enqueued_diff.abs() >= UTIL_EST_MARGIN {
                ue.enqueued |= UTIL_AVG_UNCHANGED;
                *self = ue;
            }
            return;
        }

        if task_util > capacity_orig {
            return;
        }

        // ewma = 3/4 * ewma + 1/4 * enqueued
        let mut ewma = (ue.ewma as i64) << UTIL_EST_WEIGHT_SHIFT;
        ewma += last_ewma_diff;
        ewma >>= UTIL_EST_WEIGHT_SHIFT;
        ue.ewma = ewma as u32;
        ue.enqueued |= UTIL_AVG_UNCHANGED;
        *self = ue;
    }
}

/// 负载/可运行/利用率平均
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedAvg {
    pub last_update_time: u64,
    pub load_sum: u64,
    pub runnable_sum: u64,
    pub util_sum: u64,
    /// 当前周期内已累计的部分，∈ [0, 1023]
    pub period_contrib: u32,
    pub load_avg: u64,
    pub runnable_avg: u64,
    pub util_avg: u64,
    pub util_est: UtilEst,
}

/// `LOAD_AVG_MAX - 1024 + period_contrib`
#[inline]
pub fn pelt_divider(sa: &SchedAvg) -> u64 {
    LOAD_AVG_MAX as u64 - 1024 + sa.period_contrib as u64
}

impl SchedAvg {
    /// 新任务的初始值：按满负载开始，util 由 `post_init_entity_util_avg` 设定
    pub fn new_task(weight: u64) -> Self {
        Self {
            load_avg: weight,
            ..Default::default()
        }
    }

    /// 累加 `delta`（us）内的贡献，返回跨过的周期数
    fn accumulate_sum(&mut self, mut delta: u64, load: u64, runnable: u64, running: bool) -> u64 {
        let mut contrib = delta as u32;

        delta += self.period_contrib as u64;
        let periods = delta / 1024;

        if periods != 0 {
            self.load_sum = decay_load(self.load_sum, periods);
            self.runnable_sum = decay_load(self.runnable_sum, periods);
            self.util_sum = decay_load(self.util_sum, periods);

            delta %= 1024;
            if load != 0 {
                // 只有 load 不为 0 时才需要计算贡献
                contrib = accumulate_pelt_segments(periods, 1024 - self.period_contrib, delta as u32);
            }
        }
        self.period_contrib = delta as u32;

        if load != 0 {
            self.load_sum += load * contrib as u64;
        }
        if runnable != 0 {
            self.runnable_sum += (runnable * contrib as u64) << SCHED_CAPACITY_SHIFT;
        }
        if running {
            self.util_sum += (contrib as u64) << SCHED_CAPACITY_SHIFT;
        }

        periods
    }

    /// 把和更新到 `now`；跨过周期边界时返回 true，此时应调用 [`Self::update_avg`]
    ///
    /// `load` 为 0 时 runnable/running 也视为 0（实体刚出队）。
    pub fn update_sum(&mut self, now: u64, load: u64, mut runnable: u64, mut running: bool) -> bool {
        if now < self.last_update_time {
            // 时钟回退（如迁移后换了 rq），重新对齐；0 留给“未挂接”
            self.last_update_time = now.max(1);
            return false;
        }

        // ns -> ~us
        let delta = (now - self.last_update_time) >> 10;
        if delta == 0 {
            return false;
        }

        self.last_update_time += delta << 10;

        if load == 0 {
            runnable = 0;
            running = false;
        }

        self.accumulate_sum(delta, load, runnable, running) != 0
    }

    /// 发布平均值：`load_avg = load * load_sum / divider`
    pub fn update_avg(&mut self, load: u64) {
        let divider = pelt_divider(self);
        self.load_avg = load * self.load_sum / divider;
        self.runnable_avg = self.runnable_sum / divider;
        self.util_avg = self.util_sum / divider;
    }

    /// 由 avg 反推 sum，用于 attach 或直接设定 util
    pub fn sync_sums_from_avg(&mut self, weight: u64) {
        let divider = pelt_divider(self);
        self.util_sum = self.util_avg * divider;
        self.runnable_sum = self.runnable_avg * divider;
        self.load_sum = if weight != 0 { self.load_avg * divider / weight } else { 0 };
    }
}

/// 更新只按 running 计权的 rq 级平均（rt/dl/thermal），返回是否发布
pub fn update_rq_avg(sa: &mut SchedAvg, now: u64, running: u64) -> bool {
    if sa.update_sum(now, running, running, running != 0) {
        sa.update_avg(1);
        true
    } else {
        false
    }
}

/// IRQ 时间的平均
///
/// IRQ 时间不走 clock_task，这里先把 rq 时钟回退 `running` 累加一段
/// 空闲，再在 `now` 累加一段运行。
pub fn update_irq_avg(sa: &mut SchedAvg, clock: u64, running: u64, cpu_scale: u64, freq_scale: u64) -> bool {
    let running = cap_scale(cap_scale(running, freq_scale), cpu_scale);
    let mut ret = sa.update_sum(clock.saturating_sub(running), 0, 0, false);
    ret |= sa.update_sum(clock, 1, 1, true);
    if ret {
        sa.update_avg(1);
    }
    ret
}

/// rq 级 PELT 时钟
///
/// 非 idle 时按 CPU 容量和频率缩放；idle 时与 clock_task 同步，
/// 若此时利用率已饱和，把差值记入 `lost_idle_time`。
#[derive(Debug, Clone, Copy, Default)]
pub struct PeltClock {
    pub clock_pelt: u64,
    pub lost_idle_time: u64,
}

impl PeltClock {
    pub fn advance(&mut self, delta: u64, cpu_scale: u64, freq_scale: u64) {
        let delta = cap_scale(delta, cpu_scale);
        let delta = cap_scale(delta, freq_scale);
        self.clock_pelt += delta;
    }

    /// idle 时同步到 `clock_task`
    ///
    /// `util_sum_total` 是 cfs+rt+dl 的 util_sum 之和。
    pub fn sync_idle(&mut self, clock_task: u64, util_sum_total: u64) {
        let divider = ((LOAD_AVG_MAX as u64 - 1024) << SCHED_CAPACITY_SHIFT) - LOAD_AVG_MAX as u64;
        if util_sum_total >= divider {
            self.lost_idle_time += clock_task.saturating_sub(self.clock_pelt);
        }
        self.clock_pelt = clock_task;
    }

    /// 供 PELT 使用的时钟
    pub fn now(&self) -> u64 {
        self.clock_pelt.saturating_sub(self.lost_idle_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;
    /// 一个 PELT 周期（1024us）的纳秒数
    const PERIOD_NS: u64 = 1 << 20;

    #[test]
    fn converges_after_five_half_lives() {
        let mut sa = SchedAvg::default();
        let mut t = 0;
        while t < 160 * MS {
            t += MS;
            if sa.update_sum(t, 1, 1, true) {
                sa.update_avg(1024);
            }
        }
        let err = (sa.load_avg as i64 - 1024).abs() as f64 / 1024.0;
        assert!(err < 0.05, "load_avg={}", sa.load_avg);
        assert!(sa.util_avg > 970, "util_avg={}", sa.util_avg);
    }

    #[test]
    fn attached_at_time_zero_keeps_tracking() {
        let mut sa = SchedAvg {
            last_update_time: 1,
            util_avg: 512,
            ..SchedAvg::default()
        };
        sa.sync_sums_from_avg(1024);
        assert!(!sa.update_sum(0, 1, 1, true));
        assert_ne!(sa.last_update_time, 0);

        let mut t = 0;
        while t < 200 * MS {
            t += MS;
            if sa.update_sum(t, 1, 1, true) {
                sa.update_avg(1024);
            }
        }
        assert!(sa.util_avg > 970, "util_avg={}", sa.util_avg);
    }

    #[test]
    fn decays_by_half_after_32_periods_idle() {
        let mut sa = SchedAvg::default();
        let mut t = 400 * PERIOD_NS;
        sa.update_sum(t, 1, 1, true);
        sa.update_avg(1024);
        let before = sa.util_avg;
        assert!(before >= 1000);
        for _ in 0..32 {
            t += PERIOD_NS;
            if sa.update_sum(t, 0, 0, false) {
                sa.update_avg(1);
            }
        }
        let half = before / 2;
        assert!((sa.util_avg as i64 - half as i64).abs() <= 2, "{} vs {}", sa.util_avg, half);
    }

    #[test]
    fn sub_period_updates_only_accumulate() {
        let mut sa = SchedAvg::default();
        assert!(!sa.update_sum(500 * 1024, 1024, 1, true));
        assert_eq!(sa.period_contrib, 500);
        assert!(sa.update_sum(2000 * 1024, 1024, 1, true));
        assert_eq!(sa.period_contrib, 2000 - 1024);
    }

    #[test]
    fn util_est_ewma() {
        let mut ue = UtilEst::default();
        ue.update(400, 1024, false);
        // 0 -> 400 的 1/4
        assert_eq!(ue.ewma, 100);
        assert_eq!(ue.enqueued_value(), 400);
        assert_eq!(ue.value(), 400);
        // 未清除 UNCHANGED 时不再更新
        ue.update(800, 1024, false);
        assert_eq!(ue.ewma, 100);
        ue.enqueued &= !UTIL_AVG_UNCHANGED;
        ue.update(800, 1024, true);
        assert_eq!(ue.ewma, 800);
    }

    #[test]
    fn pelt_clock_scales_and_tracks_lost_idle() {
        let mut c = PeltClock::default();
        c.advance(1024, 512, 1024);
        assert_eq!(c.clock_pelt, 512);
        c.sync_idle(2048, u64::MAX);
        assert_eq!(c.lost_idle_time, 2048 - 512);
        assert_eq!(c.now(), 2048 - (2048 - 512));
        c.sync_idle(4096, 0);
        assert_eq!(c.lost_idle_time, 1536);
    }
}
