//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! CPU 优先级映射
//!
//! 每个 CPU 按其上最高 RT 优先级落在 101 个优先级带之一：
//!
//! ```text
//!   -1          INVALID (CPU 不在线)
//!    0          NORMAL  (运行 fair/idle)
//!    1 ..  99   RT 优先级 1..99
//!  100          HIGHER
//! ```
//!
//! 每个带维护一个 CPU 掩码和计数。写者只有 `set`；读者不加锁，
//! 先读计数再读掩码。写入顺序保证并发的加入者在删除者的计数
//! 下降之前已经可见。

use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicI32, AtomicU32, Ordering};

use super::MAX_RT_PRIO;
use crate::cpumask::{AtomicCpuMask, CpuMask};

pub const CPUPRI_NR_PRIORITIES: usize = MAX_RT_PRIO as usize + 1;
pub const CPUPRI_INVALID: i32 = -1;
pub const CPUPRI_NORMAL: i32 = 0;
pub const CPUPRI_HIGHER: i32 = MAX_RT_PRIO;

/// 任务 prio 转为优先级带
///
/// 0..=98 映射到 99..=1；99 是 fair 的占位值，映射到 NORMAL。
pub fn convert_prio(prio: i32) -> i32 {
    match prio {
        CPUPRI_INVALID => CPUPRI_INVALID,
        0..=98 => MAX_RT_PRIO - 1 - prio,
        99 => CPUPRI_NORMAL,
        MAX_RT_PRIO => CPUPRI_HIGHER,
        // fair 优先级 (>= 100) 不会出现在 RT 路径上，按 NORMAL 处理
        _ if prio > MAX_RT_PRIO => CPUPRI_NORMAL,
        _ => CPUPRI_HIGHER,
    }
}

struct CpupriVec {
    count: AtomicU32,
    mask: AtomicCpuMask,
}

pub struct Cpupri {
    pri_to_cpu: Vec<CpupriVec>,
    cpu_to_pri: Vec<AtomicI32>,
}

impl Cpupri {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            pri_to_cpu: (0..CPUPRI_NR_PRIORITIES)
                .map(|_| CpupriVec {
                    count: AtomicU32::new(0),
                    mask: AtomicCpuMask::default(),
                })
                .collect(),
            cpu_to_pri: (0..nr_cpus).map(|_| AtomicI32::new(CPUPRI_INVALID)).collect(),
        }
    }

    /// CPU 当前所在的优先级带
    pub fn cpu_pri(&self, cpu: usize) -> i32 {
        self.cpu_to_pri[cpu].load(Ordering::Relaxed)
    }

    pub fn count(&self, pri: usize) -> u32 {
        self.pri_to_cpu[pri].count.load(Ordering::Acquire)
    }

    pub fn mask(&self, pri: usize) -> CpuMask {
        self.pri_to_cpu[pri].mask.load(Ordering::Acquire)
    }

    /// 更新 CPU 的优先级，`newpri` 为任务 prio 或 [`CPUPRI_INVALID`]
    ///
    /// 调用者持有该 CPU 的 rq 锁，所以同一 CPU 不会并发调用。
    pub fn set(&self, cpu: usize, newpri: i32) {
        let newpri = convert_prio(newpri);
        let oldpri = self.cpu_to_pri[cpu].load(Ordering::Relaxed);
        if newpri == oldpri {
            return;
        }

        if newpri != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[newpri as usize];
            vec.mask.set_cpu(cpu, Ordering::Relaxed);
            // 先置位再加计数
            fence(Ordering::SeqCst);
            vec.count.fetch_add(1, Ordering::Relaxed);
        }
        if oldpri != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[oldpri as usize];
            fence(Ordering::SeqCst);
            vec.count.fetch_sub(1, Ordering::Relaxed);
            // 先减计数再清位
            fence(Ordering::SeqCst);
            vec.mask.clear_cpu(cpu, Ordering::Relaxed);
        }

        self.cpu_to_pri[cpu].store(newpri, Ordering::Relaxed);
    }

    fn find_at(&self, idx: usize, cpus_allowed: CpuMask) -> Option<CpuMask> {
        let vec = &self.pri_to_cpu[idx];
        let cnt = vec.count.load(Ordering::Relaxed);
        // 与 set 中的屏障配对：看到计数后一定能看到掩码
        fence(Ordering::Acquire);
        if cnt == 0 {
            return None;
        }
        let mask = vec.mask.load(Ordering::Relaxed).and(cpus_allowed);
        if mask.is_empty() {
            return None;
        }
        Some(mask)
    }

    /// 查找优先级严格低于 `task_prio` 的 CPU 集合
    pub fn find(&self, task_prio: i32, cpus_allowed: CpuMask) -> Option<CpuMask> {
        self.find_fitness(task_prio, cpus_allowed, None)
    }

    /// 带容量适配检查的查找
    ///
    /// 从最低的优先级带开始；某带中没有满足 `fitness` 的 CPU 就继续
    /// 向上找，全部失败后忽略 `fitness` 重试一次。
    pub fn find_fitness(
        &self,
        task_prio: i32,
        cpus_allowed: CpuMask,
        fitness: Option<&dyn Fn(usize) -> bool>,
    ) -> Option<CpuMask> {
        let task_pri = convert_prio(task_prio);
        if task_pri <= 0 {
            return None;
        }

        for idx in 0..task_pri as usize {
            let Some(mut mask) = self.find_at(idx, cpus_allowed) else {
                continue;
            };
            let Some(fit) = fitness else {
                return Some(mask);
            };
            for cpu in mask {
                if !fit(cpu) {
                    mask.clear(cpu);
                }
            }
            if mask.is_empty() {
                continue;
            }
            return Some(mask);
        }

        // 异构系统上没有合适容量的 CPU 时退回到只看优先级
        if fitness.is_some() {
            return self.find(task_prio, cpus_allowed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prio_bands() {
        assert_eq!(convert_prio(CPUPRI_INVALID), CPUPRI_INVALID);
        assert_eq!(convert_prio(0), 99);
        assert_eq!(convert_prio(98), 1);
        assert_eq!(convert_prio(99), CPUPRI_NORMAL);
        assert_eq!(convert_prio(MAX_RT_PRIO), CPUPRI_HIGHER);
    }

    #[test]
    fn count_matches_mask() {
        let cp = Cpupri::new(4);
        cp.set(0, 99);
        cp.set(1, 99);
        cp.set(2, 30);
        cp.set(3, 99);
        cp.set(1, 60);
        cp.set(3, CPUPRI_INVALID);
        for pri in 0..CPUPRI_NR_PRIORITIES {
            assert_eq!(cp.count(pri) as usize, cp.mask(pri).weight(), "band {}", pri);
        }
        assert_eq!(cp.cpu_pri(2), 69);
        assert_eq!(cp.mask(CPUPRI_NORMAL as usize), CpuMask::of(0));
    }

    #[test]
    fn finds_lowest_band_below_task() {
        let cp = Cpupri::new(4);
        cp.set(0, 69); // rt_priority 30
        cp.set(1, 99);
        cp.set(2, 99);
        cp.set(3, 50); // rt_priority 49
        // rt_priority 40 的任务
        assert_eq!(cp.find(59, CpuMask::first_n(4)), Some(CpuMask::from_cpus(&[1, 2])));
        assert_eq!(cp.find(59, CpuMask::from_cpus(&[0, 3])), Some(CpuMask::of(0)));
        assert_eq!(cp.find(59, CpuMask::of(3)), None);
        assert_eq!(cp.find(20, CpuMask::of(3)), Some(CpuMask::of(3)));
    }

    #[test]
    fn fitness_falls_back() {
        let cp = Cpupri::new(4);
        for cpu in 0..4 {
            cp.set(cpu, 99);
        }
        let only_big = |cpu: usize| cpu >= 2;
        assert_eq!(
            cp.find_fitness(10, CpuMask::first_n(4), Some(&only_big)),
            Some(CpuMask::from_cpus(&[2, 3]))
        );
        let none = |_cpu: usize| false;
        assert_eq!(cp.find_fitness(10, CpuMask::of(1), Some(&none)), Some(CpuMask::of(1)));
    }
}
