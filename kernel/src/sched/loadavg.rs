//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 全局负载平均 (/proc/loadavg)
//!
//! 每 `LOAD_FREQ` 个 jiffies 采样一次活跃任务数
//! `nr_running + nr_uninterruptible`，按指数衰减更新 1/5/15 分钟平均：
//!
//! ```text
//!   a1 = a0 * e + a * (1 - e)
//!   an = a0 * e^n + a * (1 - e^n)
//! ```
//!
//! 各 CPU 在自己的 tick 中把活跃数的变化折叠进 `calc_load_tasks`。
//! 进入 nohz 的 CPU 没有 tick，它们的变化先折叠进双缓冲的
//! `calc_load_nohz[idx]`，由采样点统一读取：窗口开始之后进入 idle 的
//! CPU 写入下一个 idx，不会和本窗口混在一起。

use core::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};

use super::fixedpt::fixed_power_int;
use crate::config::HZ;

/// 小数位数
pub const FSHIFT: u32 = 11;
/// 1.0 的定点表示
pub const FIXED_1: u64 = 1 << FSHIFT;
/// 采样间隔：5 秒加一个 tick
pub const LOAD_FREQ: u64 = 5 * HZ + 1;
/// 1/exp(5sec/1min)
pub const EXP_1: u64 = 1884;
/// 1/exp(5sec/5min)
pub const EXP_5: u64 = 2014;
/// 1/exp(5sec/15min)
pub const EXP_15: u64 = 2037;

const EXP: [u64; 3] = [EXP_1, EXP_5, EXP_15];

/// 采样点之后再等待的 tick 数，留给各 CPU 折叠
const SAMPLE_SLACK: u64 = 10;

/// jiffies 比较，容忍回绕
#[inline]
pub fn time_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

#[inline]
pub fn time_after_eq(a: u64, b: u64) -> bool {
    !time_before(a, b)
}

/// a1 = a0 * e + a * (1 - e)
pub fn calc_load(load: u64, exp: u64, active: u64) -> u64 {
    let mut newload = load * exp + active * (FIXED_1 - exp);
    if active >= load {
        newload += FIXED_1 - 1;
    }
    newload / FIXED_1
}

/// an = a0 * e^n + a * (1 - e^n)，e^n 以 O(log n) 计算
pub fn calc_load_n(load: u64, exp: u64, active: u64, n: u64) -> u64 {
    calc_load(load, fixed_power_int(exp, FSHIFT, n), active)
}

#[inline]
pub fn load_int(x: u64) -> u64 {
    x >> FSHIFT
}

#[inline]
pub fn load_frac(x: u64) -> u64 {
    load_int((x & (FIXED_1 - 1)) * 100)
}

/// 每个 rq 上的采样状态，受 rq 锁保护
#[derive(Debug, Clone, Copy, Default)]
pub struct RqLoad {
    /// 本 rq 下一次折叠的 jiffies
    pub calc_load_update: u64,
    /// 上次折叠时的活跃数
    pub calc_load_active: i64,
}

impl RqLoad {
    /// 计算活跃数的变化并记住新值
    ///
    /// `adjust` 用于 CPU 下线时扣掉迁移线程本身。
    pub fn fold_active(&mut self, nr_running: u32, nr_uninterruptible: i64, adjust: i64) -> i64 {
        let nr_active = nr_running as i64 - adjust + nr_uninterruptible;
        let mut delta = 0;
        if nr_active != self.calc_load_active {
            delta = nr_active - self.calc_load_active;
            self.calc_load_active = nr_active;
        }
        delta
    }
}

/// 全局负载平均状态
pub struct LoadAvg {
    avenrun: [AtomicU64; 3],
    calc_load_update: AtomicU64,
    calc_load_tasks: AtomicI64,
    calc_load_nohz: [AtomicI64; 2],
    calc_load_idx: AtomicU64,
}

impl LoadAvg {
    pub const fn new() -> Self {
        Self {
            avenrun: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            calc_load_update: AtomicU64::new(0),
            calc_load_tasks: AtomicI64::new(0),
            calc_load_nohz: [AtomicI64::new(0), AtomicI64::new(0)],
            calc_load_idx: AtomicU64::new(0),
        }
    }

    /// 启动时设置第一个采样点，返回供各 rq 使用的初值
    pub fn init(&self, jiffies: u64) -> RqLoad {
        let first = jiffies + LOAD_FREQ;
        self.calc_load_update.store(first, Ordering::Relaxed);
        RqLoad {
            calc_load_update: first,
            calc_load_active: 0,
        }
    }

    pub fn calc_load_update(&self) -> u64 {
        self.calc_load_update.load(Ordering::Acquire)
    }

    pub fn calc_load_tasks(&self) -> i64 {
        self.calc_load_tasks.load(Ordering::Relaxed)
    }

    /// avenrun 原始定点值
    pub fn avenrun(&self) -> [u64; 3] {
        [
            self.avenrun[0].load(Ordering::Relaxed),
            self.avenrun[1].load(Ordering::Relaxed),
            self.avenrun[2].load(Ordering::Relaxed),
        ]
    }

    /// `get_avenrun`：加上舍入偏移后左移
    pub fn get_avenrun(&self, offset: u64, shift: u32) -> [u64; 3] {
        let a = self.avenrun();
        [
            (a[0] + offset) << shift,
            (a[1] + offset) << shift,
            (a[2] + offset) << shift,
        ]
    }

    fn add_tasks(&self, delta: i64) {
        if delta != 0 {
            self.calc_load_tasks.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// CPU tick 中调用：到达本 rq 的折叠点时折叠活跃数
    pub fn calc_global_load_tick(&self, rql: &mut RqLoad, jiffies: u64, nr_running: u32, nr_unint: i64) {
        if time_before(jiffies, rql.calc_load_update) {
            return;
        }
        let delta = rql.fold_active(nr_running, nr_unint, 0);
        self.add_tasks(delta);
        rql.calc_load_update += LOAD_FREQ;
    }

    fn write_idx(&self, jiffies: u64) -> usize {
        let mut idx = self.calc_load_idx.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        // 已经越过采样点但还没被读取，写到下一个缓冲
        if !time_before(jiffies, self.calc_load_update()) {
            idx += 1;
        }
        (idx & 1) as usize
    }

    fn read_idx(&self) -> usize {
        (self.calc_load_idx.load(Ordering::Relaxed) & 1) as usize
    }

    fn nohz_fold(&self, rql: &mut RqLoad, jiffies: u64, nr_running: u32, nr_unint: i64) {
        let delta = rql.fold_active(nr_running, nr_unint, 0);
        if delta != 0 {
            let idx = self.write_idx(jiffies);
            self.calc_load_nohz[idx].fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// 本 CPU 停止 tick 前调用
    pub fn calc_load_nohz_start(&self, rql: &mut RqLoad, jiffies: u64, nr_running: u32, nr_unint: i64) {
        self.nohz_fold(rql, jiffies, nr_running, nr_unint);
    }

    /// 代替 nohz_full CPU 折叠
    pub fn calc_load_nohz_remote(&self, rql: &mut RqLoad, jiffies: u64, nr_running: u32, nr_unint: i64) {
        self.nohz_fold(rql, jiffies, nr_running, nr_unint);
    }

    /// tick 恢复时把本 rq 的折叠点对齐到全局窗口
    pub fn calc_load_nohz_stop(&self, rql: &mut RqLoad, jiffies: u64) {
        if time_before(jiffies, rql.calc_load_update) {
            return;
        }
        rql.calc_load_update = self.calc_load_update();
        if time_before(jiffies, rql.calc_load_update) {
            return;
        }
        // 本窗口已经被 nohz 缓冲记过了，跳到下一个
        rql.calc_load_update += LOAD_FREQ;
    }

    /// CPU 下线时把剩余活跃数交出，`adjust` 为 1 扣除执行下线的线程
    pub fn calc_load_migrate(&self, rql: &mut RqLoad, nr_running: u32, nr_unint: i64) {
        let delta = rql.fold_active(nr_running, nr_unint, 1);
        self.add_tasks(delta);
    }

    fn nohz_read(&self) -> i64 {
        let idx = self.read_idx();
        if self.calc_load_nohz[idx].load(Ordering::Relaxed) != 0 {
            self.calc_load_nohz[idx].swap(0, Ordering::Relaxed)
        } else {
            0
        }
    }

    fn active(&self) -> u64 {
        let active = self.calc_load_tasks();
        if active > 0 {
            active as u64 * FIXED_1
        } else {
            0
        }
    }

    /// 补齐整个系统都处于 nohz 时漏掉的窗口，并翻转 nohz 缓冲
    fn calc_global_nohz(&self, jiffies: u64) {
        let sample_window = self.calc_load_update();
        if !time_before(jiffies, sample_window + SAMPLE_SLACK) {
            let delta = jiffies - sample_window - SAMPLE_SLACK;
            let n = 1 + delta / LOAD_FREQ;
            let active = self.active();
            for (avg, exp) in self.avenrun.iter().zip(EXP) {
                let v = calc_load_n(avg.load(Ordering::Relaxed), exp, active, n);
                avg.store(v, Ordering::Relaxed);
            }
            self.calc_load_update.store(sample_window + n * LOAD_FREQ, Ordering::Release);
        }

        fence(Ordering::Release);
        self.calc_load_idx.fetch_add(1, Ordering::Relaxed);
    }

    /// 由负责 do_timer 的 CPU 每个 tick 调用，返回是否完成了一次采样
    pub fn calc_global_load(&self, jiffies: u64) -> bool {
        let sample_window = self.calc_load_update();
        if time_before(jiffies, sample_window + SAMPLE_SLACK) {
            return false;
        }

        let delta = self.nohz_read();
        self.add_tasks(delta);

        let active = self.active();
        for (avg, exp) in self.avenrun.iter().zip(EXP) {
            let v = calc_load(avg.load(Ordering::Relaxed), exp, active);
            avg.store(v, Ordering::Relaxed);
        }

        self.calc_load_update.store(sample_window + LOAD_FREQ, Ordering::Release);

        self.calc_global_nohz(jiffies);
        true
    }
}

impl Default for LoadAvg {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 驱动 `windows` 个采样窗口，每个窗口的活跃数恒为 `nr`
    fn drive(la: &LoadAvg, rql: &mut RqLoad, jiffies: &mut u64, windows: u64, nr: u32) {
        for _ in 0..windows * LOAD_FREQ {
            *jiffies += 1;
            la.calc_global_load_tick(rql, *jiffies, nr, 0);
            la.calc_global_load(*jiffies);
        }
    }

    #[test]
    fn calc_load_rounds_up_when_rising() {
        assert_eq!(calc_load(0, EXP_1, 4 * FIXED_1), 656);
        assert_eq!(calc_load(FIXED_1, EXP_1, 0), 1884);
        assert_eq!(calc_load_n(FIXED_1, EXP_1, FIXED_1, 7), FIXED_1);
    }

    #[test]
    fn four_busy_then_idle() {
        let la = LoadAvg::new();
        let mut jiffies = 0;
        let mut rql = la.init(jiffies);

        // 第一个采样点在 LOAD_FREQ + 10，5 分钟内采到 59 次
        drive(&la, &mut rql, &mut jiffies, 60, 4);
        let a = la.avenrun();
        assert!(a[0] >= 7 * FIXED_1 / 2, "1min={}", a[0]);
        assert_eq!(a, [8138, 5157, 2254]);

        drive(&la, &mut rql, &mut jiffies, 12, 0);
        assert_eq!(la.avenrun(), [3247, 4326, 2150]);

        // 第 12 个空闲采样
        drive(&la, &mut rql, &mut jiffies, 1, 0);
        let b = la.avenrun();
        assert!(b[0] <= 3 * FIXED_1 / 2, "1min={}", b[0]);
        assert_eq!(b, [2986, 4254, 2138]);
    }

    #[test]
    fn catch_up_after_missed_windows() {
        let la = LoadAvg::new();
        let mut jiffies = 0;
        let mut rql = la.init(jiffies);
        drive(&la, &mut rql, &mut jiffies, 60, 4);
        let old = la.avenrun();

        // 活跃数降到 2 后采样被推迟 3 个窗口
        let fold_at = rql.calc_load_update;
        la.calc_global_load_tick(&mut rql, fold_at, 2, 0);
        assert_eq!(la.calc_load_tasks(), 2);
        let window = la.calc_load_update();
        let k = 3;
        assert!(la.calc_global_load(window + SAMPLE_SLACK + k * LOAD_FREQ));
        let got = la.avenrun();

        for i in 0..3 {
            let expect = calc_load_n(old[i], EXP[i], 2 * FIXED_1, k + 1);
            assert!((got[i] as i64 - expect as i64).abs() <= 1, "{} {} {}", i, got[i], expect);
        }
        assert_eq!(la.calc_load_update(), window + (k + 1) * LOAD_FREQ);
    }

    #[test]
    fn nohz_fold_lands_in_next_window_after_sample_point() {
        let la = LoadAvg::new();
        let rql0 = la.init(0);
        let mut a = rql0;
        let mut b = rql0;
        let window = la.calc_load_update();

        // 采样点之前进入 idle：计入当前缓冲
        la.calc_load_nohz_start(&mut a, window - 1, 3, 0);
        // 采样点之后进入 idle：计入下一个缓冲
        la.calc_load_nohz_start(&mut b, window + 1, 5, 0);

        assert!(la.calc_global_load(window + SAMPLE_SLACK));
        assert_eq!(la.calc_load_tasks(), 3);

        let window2 = la.calc_load_update();
        assert!(la.calc_global_load(window2 + SAMPLE_SLACK));
        assert_eq!(la.calc_load_tasks(), 8);
    }

    #[test]
    fn nohz_stop_resyncs_rq_window() {
        let la = LoadAvg::new();
        let mut rql = la.init(0);
        let window = la.calc_load_update();
        la.calc_global_load(window + SAMPLE_SLACK + 3 * LOAD_FREQ);
        la.calc_load_nohz_stop(&mut rql, window + SAMPLE_SLACK + 3 * LOAD_FREQ + 1);
        assert_eq!(rql.calc_load_update, la.calc_load_update());
    }

    #[test]
    fn migrate_adjusts_for_stopper() {
        let la = LoadAvg::new();
        let mut rql = la.init(0);
        la.calc_load_migrate(&mut rql, 3, 1);
        assert_eq!(la.calc_load_tasks(), 3);
    }

    #[test]
    fn fraction_formatting() {
        let x = 3 * FIXED_1 + FIXED_1 / 4;
        assert_eq!(load_int(x), 3);
        assert_eq!(load_frac(x), 25);
    }
}
