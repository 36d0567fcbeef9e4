//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 定点数基础
//!
//! 容量刻度、nice 权重表、PELT 衰减表以及 loadavg 用到的定点幂运算。

/// 容量/利用率的定点小数位数
pub const SCHED_FIXEDPOINT_SHIFT: u32 = 10;
pub const SCHED_FIXEDPOINT_SCALE: u64 = 1 << SCHED_FIXEDPOINT_SHIFT;

pub const SCHED_CAPACITY_SHIFT: u32 = SCHED_FIXEDPOINT_SHIFT;
/// 最快 CPU 的容量
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

/// nice 0 的权重
pub const NICE_0_LOAD: u64 = 1 << SCHED_FIXEDPOINT_SHIFT;

pub const WMULT_CONST: u32 = !0u32;
pub const WMULT_SHIFT: u32 = 32;

/// PELT 半衰期（周期数）
pub const LOAD_AVG_PERIOD: u32 = 32;
/// PELT 几何级数的上界：1024 * Σ y^n
pub const LOAD_AVG_MAX: u32 = 47742;

/// `y^n * 2^32`，y = 2^(-1/32)，n ∈ [0, 31]
pub const RUNNABLE_AVG_YN_INV: [u32; 32] = [
    0xffffffff, 0xfa83b2da, 0xf5257d14, 0xefe4b99a, 0xeac0c6e6, 0xe5b906e6,
    0xe0ccdeeb, 0xdbfbb796, 0xd744fcc9, 0xd2a81d91, 0xce248c14, 0xc9b9bd85,
    0xc5672a10, 0xc12c4cc9, 0xbd08a39e, 0xb8fbaf46, 0xb504f333, 0xb123f581,
    0xad583ee9, 0xa9a15ab4, 0xa5fed6a9, 0xa2704302, 0x9ef5325f, 0x9b8d39b9,
    0x9837f050, 0x94f4efa8, 0x91c3d373, 0x8ea4398a, 0x8b95c1e3, 0x88980e80,
    0x85aac367, 0x82cd8698,
];

/// `Σ_{i=1..n} 1024 * y^i`，n ∈ [0, LOAD_AVG_PERIOD]
pub const RUNNABLE_AVG_YN_SUM: [u32; LOAD_AVG_PERIOD as usize + 1] = [
    0, 1002, 1982, 2941, 3880, 4798, 5697, 6576, 7437, 8279, 9103,
    9909, 10698, 11470, 12226, 12966, 13690, 14398, 15091, 15769, 16433,
    17082, 17718, 18340, 18949, 19545, 20128, 20698, 21256, 21802, 22336,
    22859, 23371,
];

/// nice -20..19 到权重，相邻两级相差约 1.25 倍
pub const SCHED_PRIO_TO_WEIGHT: [u32; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291,
    /* -15 */ 29154, 23254, 18705, 14949, 11916,
    /* -10 */ 9548, 7620, 6100, 4904, 3906,
    /*  -5 */ 3121, 2501, 1991, 1586, 1277,
    /*   0 */ 1024, 820, 655, 526, 423,
    /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45,
    /*  15 */ 36, 29, 23, 18, 15,
];

/// `2^32 / weight`
pub const SCHED_PRIO_TO_WMULT: [u32; 40] = [
    /* -20 */ 48388, 59856, 76040, 92818, 118348,
    /* -15 */ 147320, 184698, 229616, 287308, 360437,
    /* -10 */ 449829, 563644, 704093, 875809, 1099582,
    /*  -5 */ 1376151, 1717300, 2157191, 2708050, 3363326,
    /*   0 */ 4194304, 5237765, 6557202, 8165337, 10153587,
    /*   5 */ 12820798, 15790321, 19976592, 24970740, 31350126,
    /*  10 */ 39045157, 49367440, 61356676, 76695844, 95443717,
    /*  15 */ 119304647, 148102320, 186737708, 238609294, 286331153,
];

/// SCHED_IDLE 策略任务的权重
pub const WEIGHT_IDLEPRIO: u64 = 3;
pub const WMULT_IDLEPRIO: u32 = 1431655765;

/// 带逆权重缓存的负载权重
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadWeight {
    pub weight: u64,
    pub inv_weight: u32,
}

impl LoadWeight {
    pub const fn new(weight: u64) -> Self {
        Self { weight, inv_weight: 0 }
    }

    /// nice 0 权重
    pub const fn nice_0() -> Self {
        Self { weight: NICE_0_LOAD, inv_weight: SCHED_PRIO_TO_WMULT[20] }
    }

    /// 由 nice 值查表
    pub fn from_nice(nice: i32) -> Self {
        let idx = (nice.clamp(-20, 19) + 20) as usize;
        Self {
            weight: SCHED_PRIO_TO_WEIGHT[idx] as u64,
            inv_weight: SCHED_PRIO_TO_WMULT[idx],
        }
    }

    pub const fn idle_prio() -> Self {
        Self { weight: WEIGHT_IDLEPRIO, inv_weight: WMULT_IDLEPRIO }
    }

    pub fn add(&mut self, inc: u64) {
        self.weight += inc;
        self.inv_weight = 0;
    }

    pub fn sub(&mut self, dec: u64) {
        self.weight = self.weight.saturating_sub(dec);
        self.inv_weight = 0;
    }

    pub fn set(&mut self, w: u64) {
        self.weight = w;
        self.inv_weight = 0;
    }

    fn update_inv_weight(&mut self) {
        if self.inv_weight != 0 {
            return;
        }
        let w = self.weight;
        self.inv_weight = if w >= WMULT_CONST as u64 {
            1
        } else if w == 0 {
            WMULT_CONST
        } else {
            (WMULT_CONST as u64 / w) as u32
        };
    }
}

#[inline]
pub fn mul_u64_u32_shr(a: u64, mul: u32, shift: u32) -> u64 {
    ((a as u128 * mul as u128) >> shift) as u64
}

/// `delta_exec * weight / lw.weight`，用乘法和移位代替除法
pub fn calc_delta(delta_exec: u64, weight: u64, lw: &mut LoadWeight) -> u64 {
    let mut fact = weight;
    let mut shift = WMULT_SHIFT;

    lw.update_inv_weight();

    while fact >> 32 != 0 {
        fact >>= 1;
        shift -= 1;
    }

    let mut fact = fact * lw.inv_weight as u64;

    while fact >> 32 != 0 {
        fact >>= 1;
        shift -= 1;
    }

    mul_u64_u32_shr(delta_exec, fact as u32, shift)
}

/// 按容量缩放：`v * scale / SCHED_CAPACITY_SCALE`
#[inline]
pub const fn cap_scale(v: u64, scale: u64) -> u64 {
    (v * scale) >> SCHED_CAPACITY_SHIFT
}

/// `cap * 1.2 < max`：给利用率留 20% 余量
#[inline]
pub const fn fits_capacity(cap: u64, max: u64) -> bool {
    cap * 1280 < max * 1024
}

/// `val * y^n`
pub fn decay_load(mut val: u64, n: u64) -> u64 {
    if n > LOAD_AVG_PERIOD as u64 * 63 {
        return 0;
    }

    let mut local_n = n as u32;

    // y^32 = 1/2，整半衰期直接移位
    if local_n >= LOAD_AVG_PERIOD {
        val >>= local_n / LOAD_AVG_PERIOD;
        local_n %= LOAD_AVG_PERIOD;
    }

    mul_u64_u32_shr(val, RUNNABLE_AVG_YN_INV[local_n as usize], 32)
}

/// `1024 * Σ_{i=1..n-1} y^i`，即跨过 n 个周期边界时中间完整周期的贡献
pub fn pelt_periods_contrib(periods: u64) -> u64 {
    if periods == 0 {
        return 0;
    }
    let full = periods - 1;
    if full <= LOAD_AVG_PERIOD as u64 {
        RUNNABLE_AVG_YN_SUM[full as usize] as u64
    } else {
        LOAD_AVG_MAX as u64 - decay_load(LOAD_AVG_MAX as u64, periods) - 1024
    }
}

/// 把一段跨 `periods` 个周期的时间拆成三段累加：
///
/// ```text
///            d1          d2           d3
///            ^           ^            ^
///            |           |            |
///          |<->|<----------------->|<--->|
///  ... |---x---|------| ... |------|-----x (now)
/// ```
///
/// `d1 * y^p + 1024 * Σ_{n=1..p-1} y^n + d3`
pub fn accumulate_pelt_segments(periods: u64, d1: u32, d3: u32) -> u32 {
    let c1 = decay_load(d1 as u64, periods);
    let c2 = pelt_periods_contrib(periods);
    (c1 + c2) as u32 + d3
}

/// `x^n`，x 是 `frac_bits` 位小数的定点数，O(log n)
pub fn fixed_power_int(mut x: u64, frac_bits: u32, mut n: u64) -> u64 {
    let one = 1u64 << frac_bits;
    let mut result = one;

    if n != 0 {
        loop {
            if n & 1 != 0 {
                result *= x;
                result += 1 << (frac_bits - 1);
                result >>= frac_bits;
            }
            n >>= 1;
            if n == 0 {
                break;
            }
            x *= x;
            x += 1 << (frac_bits - 1);
            x >>= frac_bits;
        }
    }

    result
}

/// 向上取整除法
#[inline]
pub const fn div_round_up(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// `runtime / period` 的 2^20 定点比例，`RUNTIME_INF` 表示不限
pub const BW_SHIFT: u32 = 20;
pub const BW_UNIT: u64 = 1 << BW_SHIFT;
pub const RUNTIME_INF: u64 = u64::MAX;

pub fn to_ratio(period: u64, runtime: u64) -> u64 {
    if runtime == RUNTIME_INF {
        return BW_UNIT;
    }
    if period == 0 {
        return 0;
    }
    ((runtime as u128) << BW_SHIFT).checked_div(period as u128).unwrap_or(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_life_is_32_periods() {
        assert_eq!(decay_load(1 << 20, 32), (1 << 19) - 1);
        assert_eq!(decay_load(1 << 20, 64), (1 << 18) - 1);
        assert_eq!(decay_load(12345, 0), 12345 * 0xffffffffu64 >> 32);
        assert_eq!(decay_load(u64::MAX, 32 * 64), 0);
    }

    #[test]
    fn yn_sum_matches_closed_form() {
        // 表和 LOAD_AVG_MAX 闭式在舍入误差内一致
        for p in 2..=33u64 {
            let table = pelt_periods_contrib(p) as i64;
            let closed = LOAD_AVG_MAX as i64 - decay_load(LOAD_AVG_MAX as u64, p) as i64 - 1024;
            assert!((table - closed).abs() <= 16, "p={} {} vs {}", p, table, closed);
        }
    }

    #[test]
    fn nice_weights() {
        assert_eq!(LoadWeight::from_nice(0).weight, 1024);
        assert!(LoadWeight::from_nice(-1).weight > LoadWeight::from_nice(0).weight);
        assert_eq!(LoadWeight::from_nice(99).weight, 15);
        for i in 0..40 {
            let w = SCHED_PRIO_TO_WEIGHT[i] as u64;
            let inv = SCHED_PRIO_TO_WMULT[i] as u64;
            let prod = w * inv;
            assert!((prod as i64 - (1i64 << 32)).abs() < (w as i64) * 2);
        }
    }

    #[test]
    fn calc_delta_scales_by_weight() {
        let mut lw = LoadWeight::from_nice(0);
        assert_eq!(calc_delta(1_000_000, NICE_0_LOAD, &mut lw), 1_000_000);
        let mut heavy = LoadWeight::new(2048);
        let d = calc_delta(1_000_000, NICE_0_LOAD, &mut heavy);
        assert!((499_990..=500_010).contains(&d));
    }

    #[test]
    fn fixed_power() {
        // 1884/2048 的 0 次和 1 次幂
        assert_eq!(fixed_power_int(1884, 11, 0), 2048);
        assert_eq!(fixed_power_int(1884, 11, 1), 1884);
        // 0.5^2 = 0.25
        assert_eq!(fixed_power_int(1024, 11, 2), 512);
    }

    #[test]
    fn ratios() {
        assert_eq!(to_ratio(1_000_000, 500_000), BW_UNIT / 2);
        assert_eq!(to_ratio(0, 5), 0);
        assert_eq!(to_ratio(10, RUNTIME_INF), BW_UNIT);
        assert!(fits_capacity(300, 438));
        assert!(!fits_capacity(700, 438));
    }
}
