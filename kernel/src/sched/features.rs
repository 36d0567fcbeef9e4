//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器特性开关
//!
//! 运行时可以通过 `set`/`clear` 切换，读取无锁。

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedFeatures: u32 {
        /// 睡眠补偿减半
        const GENTLE_FAIR_SLEEPERS = 1 << 0;
        /// 新任务从下一个 slice 开始计算 vruntime
        const START_DEBIT = 1 << 1;
        const WAKEUP_PREEMPTION = 1 << 2;
        /// RT pull 通过 IPI 轮转完成，避免锁风暴
        const RT_PUSH_IPI = 1 << 3;
        /// RT 带宽允许在 root domain 内借用
        const RT_RUNTIME_SHARE = 1 << 4;
        /// 远程唤醒走 wake list
        const TTWU_QUEUE = 1 << 5;
        const UTIL_EST = 1 << 6;
        const UTIL_EST_FASTUP = 1 << 7;
        const LB_MIN = 1 << 8;
        const HRTICK = 1 << 9;
        /// 从 CPU 容量中扣除 RT/DL/IRQ 占用
        const NONTASK_CAPACITY = 1 << 10;
        const SIS_PROP = 1 << 11;
        const WA_IDLE = 1 << 12;
        const WA_WEIGHT = 1 << 13;
        const WA_BIAS = 1 << 14;
        const LAST_BUDDY = 1 << 15;
        const NEXT_BUDDY = 1 << 16;
    }
}

impl SchedFeatures {
    pub fn defaults() -> Self {
        let mut f = Self::GENTLE_FAIR_SLEEPERS
            | Self::START_DEBIT
            | Self::WAKEUP_PREEMPTION
            | Self::RT_PUSH_IPI
            | Self::TTWU_QUEUE
            | Self::NONTASK_CAPACITY
            | Self::SIS_PROP
            | Self::WA_IDLE
            | Self::WA_WEIGHT
            | Self::WA_BIAS
            | Self::LAST_BUDDY;
        if crate::config::UTIL_EST {
            f |= Self::UTIL_EST | Self::UTIL_EST_FASTUP;
        }
        f
    }
}

/// 运行时特性集合
pub struct Features(AtomicU32);

impl Features {
    pub fn new(init: SchedFeatures) -> Self {
        Self(AtomicU32::new(init.bits()))
    }

    pub fn get(&self) -> SchedFeatures {
        SchedFeatures::from_bits_truncate(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn has(&self, f: SchedFeatures) -> bool {
        self.get().contains(f)
    }

    pub fn set(&self, f: SchedFeatures) {
        self.0.fetch_or(f.bits(), Ordering::Relaxed);
    }

    pub fn clear(&self, f: SchedFeatures) {
        self.0.fetch_and(!f.bits(), Ordering::Relaxed);
    }

    /// `NAME` 打开，`NO_NAME` 关闭
    pub fn write(&self, s: &str) -> bool {
        let s = s.trim();
        let (name, on) = match s.strip_prefix("NO_") {
            Some(n) => (n, false),
            None => (s, true),
        };
        match SchedFeatures::from_name(name) {
            Some(f) => {
                if on {
                    self.set(f)
                } else {
                    self.clear(f)
                }
                log::info!("sched: feature {} {}", name, if on { "on" } else { "off" });
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_by_name() {
        let f = Features::new(SchedFeatures::defaults());
        assert!(f.has(SchedFeatures::TTWU_QUEUE));
        assert!(f.write("NO_TTWU_QUEUE"));
        assert!(!f.has(SchedFeatures::TTWU_QUEUE));
        assert!(f.write("RT_RUNTIME_SHARE"));
        assert!(f.has(SchedFeatures::RT_RUNTIME_SHARE));
        assert!(!f.write("NO_SUCH_THING"));
    }
}
