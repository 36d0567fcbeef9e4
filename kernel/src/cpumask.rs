//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! CPU 位图
//!
//! 调度器中所有 CPU 集合（调度域 span、cpupri 各优先级掩码、
//! 根域 rto_mask 等）都用 [`CpuMask`] 表示。位图只有一个字，
//! 所以可以按值复制，也可以放进 [`AtomicCpuMask`] 做无锁读写。

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// 位图能容纳的最大 CPU 数
pub const NR_CPUMASK_BITS: usize = 64;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// CPU 0..n 全部置位
    pub const fn first_n(n: usize) -> Self {
        if n >= NR_CPUMASK_BITS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    pub const fn of(cpu: usize) -> Self {
        Self(1u64 << cpu)
    }

    pub fn from_cpus(cpus: &[usize]) -> Self {
        cpus.iter().fold(Self::new(), |m, &c| m.with(c))
    }

    #[inline]
    pub fn set(&mut self, cpu: usize) {
        self.0 |= 1u64 << cpu;
    }

    #[inline]
    pub fn clear(&mut self, cpu: usize) {
        self.0 &= !(1u64 << cpu);
    }

    #[inline]
    pub const fn test(self, cpu: usize) -> bool {
        cpu < NR_CPUMASK_BITS && self.0 & (1u64 << cpu) != 0
    }

    pub fn with(mut self, cpu: usize) -> Self {
        self.set(cpu);
        self
    }

    pub fn without(mut self, cpu: usize) -> Self {
        self.clear(cpu);
        self
    }

    #[inline]
    pub const fn weight(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn andnot(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn last(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros() as usize)
        }
    }

    /// 严格大于 `cpu` 的下一个置位 CPU
    pub fn next(self, cpu: usize) -> Option<usize> {
        if cpu + 1 >= NR_CPUMASK_BITS {
            return None;
        }
        Self(self.0 & (u64::MAX << (cpu + 1))).first()
    }

    /// 从 `start` 开始回绕查找第一个置位 CPU（含 `start`）
    pub fn next_wrap(self, start: usize) -> Option<usize> {
        let hi = Self(self.0 & (u64::MAX.checked_shl(start as u32).unwrap_or(0)));
        hi.first().or_else(|| self.first())
    }

    /// 两个掩码交集中的第一个 CPU
    pub fn first_and(self, other: Self) -> Option<usize> {
        self.and(other).first()
    }

    pub fn iter(self) -> CpuMaskIter {
        CpuMaskIter(self.0)
    }
}

pub struct CpuMaskIter(u64);

impl Iterator for CpuMaskIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(cpu)
    }
}

impl IntoIterator for CpuMask {
    type Item = usize;
    type IntoIter = CpuMaskIter;

    fn into_iter(self) -> CpuMaskIter {
        self.iter()
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |m, c| m.with(c))
    }
}

/// cpulist 格式，如 `0-3,6`
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cur = self.first();
        while let Some(start) = cur {
            let mut end = start;
            while self.test(end + 1) {
                end += 1;
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if end == start {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
            cur = self.next(end);
        }
        Ok(())
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({})", self)
    }
}

/// 可无锁读取的 CPU 位图
///
/// 置位/清位都是单条原子 RMW，调用方按需要选择内存序。
#[derive(Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new(mask: CpuMask) -> Self {
        Self(AtomicU64::new(mask.0))
    }

    pub fn load(&self, order: Ordering) -> CpuMask {
        CpuMask(self.0.load(order))
    }

    pub fn store(&self, mask: CpuMask, order: Ordering) {
        self.0.store(mask.0, order)
    }

    /// 置位并返回旧值中该位是否已置位
    pub fn set_cpu(&self, cpu: usize, order: Ordering) -> bool {
        self.0.fetch_or(1u64 << cpu, order) & (1u64 << cpu) != 0
    }

    /// 清位并返回旧值中该位是否已置位
    pub fn clear_cpu(&self, cpu: usize, order: Ordering) -> bool {
        self.0.fetch_and(!(1u64 << cpu), order) & (1u64 << cpu) != 0
    }

    pub fn test_cpu(&self, cpu: usize, order: Ordering) -> bool {
        self.load(order).test(cpu)
    }
}

impl fmt::Debug for AtomicCpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

/// 解析 cpulist 字符串（`0-3,6,8-9`）
///
/// 超出 `nr_cpus` 或格式错误返回 `None`。
pub fn parse_cpulist(s: &str, nr_cpus: usize) -> Option<CpuMask> {
    let mut mask = CpuMask::new();
    let s = s.trim();
    if s.is_empty() {
        return Some(mask);
    }
    for part in s.split(',') {
        let part = part.trim();
        let (lo, hi) = match part.split_once('-') {
            Some((a, b)) => (a.trim().parse::<usize>().ok()?, b.trim().parse::<usize>().ok()?),
            None => {
                let v = part.parse::<usize>().ok()?;
                (v, v)
            }
        };
        if lo > hi || hi >= nr_cpus.min(NR_CPUMASK_BITS) {
            return None;
        }
        for cpu in lo..=hi {
            mask.set(cpu);
        }
    }
    Some(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn iterate_and_search() {
        let m = CpuMask::from_cpus(&[1, 3, 4, 9]);
        assert_eq!(m.weight(), 4);
        assert_eq!(m.iter().collect::<alloc::vec::Vec<_>>(), [1, 3, 4, 9]);
        assert_eq!(m.first(), Some(1));
        assert_eq!(m.last(), Some(9));
        assert_eq!(m.next(4), Some(9));
        assert_eq!(m.next(9), None);
        assert_eq!(m.next_wrap(5), Some(9));
        assert_eq!(m.next_wrap(10), Some(1));
    }

    #[test]
    fn cpulist_format_and_parse() {
        let m = parse_cpulist("0-3,6,8-9", 16).unwrap();
        assert_eq!(format!("{}", m), "0-3,6,8-9");
        assert!(parse_cpulist("4-2", 8).is_none());
        assert!(parse_cpulist("0-8", 8).is_none());
        assert!(parse_cpulist("x", 8).is_none());
        assert_eq!(parse_cpulist("", 8), Some(CpuMask::new()));
    }

    #[test]
    fn atomic_mask_reports_previous_bit() {
        let a = AtomicCpuMask::new(CpuMask::new());
        assert!(!a.set_cpu(2, Ordering::AcqRel));
        assert!(a.set_cpu(2, Ordering::AcqRel));
        assert!(a.clear_cpu(2, Ordering::AcqRel));
        assert!(a.load(Ordering::Acquire).is_empty());
    }
}
