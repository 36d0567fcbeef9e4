//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 根域
//!
//! 一个 cpuset 分区内所有 CPU 共享的调度状态：RT 过载掩码、DL 带宽池、
//! cpudl 堆、cpupri 映射以及能效域列表。持有 rq 锁时可以直接读写，
//! 字段都是原子量或自带锁。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use super::cpudl::Cpudl;
use super::cpupri::Cpupri;
use super::energy::PerfDomain;
use super::fixedpt::{cap_scale, to_ratio, RUNTIME_INF};
use super::group::{default_rt_period, default_rt_runtime};
use crate::cpumask::{AtomicCpuMask, CpuMask};

static NEXT_RD_ID: AtomicUsize = AtomicUsize::new(0);

/// 分区的 DL 带宽池
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlBw {
    /// 单 CPU 可预留的比例，`u64::MAX` 表示不限制
    pub bw: u64,
    pub total_bw: u64,
}

impl DlBw {
    pub fn new() -> Self {
        Self { bw: global_dl_bw(default_rt_period(), default_rt_runtime()), total_bw: 0 }
    }

    /// 在容量 `cap` 下用 `new_bw` 替换 `old_bw` 是否超额
    pub fn overflow(&self, cap: u64, old_bw: u64, new_bw: u64) -> bool {
        self.bw != u64::MAX && cap_scale(self.bw, cap) < (self.total_bw + new_bw).saturating_sub(old_bw)
    }

    pub fn clear(&mut self, bw: u64) {
        self.total_bw = self.total_bw.saturating_sub(bw);
    }

    pub fn add(&mut self, bw: u64) {
        self.total_bw += bw;
    }
}

impl Default for DlBw {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 RT 配额换算出的 DL 可用比例
pub fn global_dl_bw(period: u64, runtime: u64) -> u64 {
    if runtime == RUNTIME_INF {
        u64::MAX
    } else {
        to_ratio(period, runtime)
    }
}

/// RT_PUSH_IPI 的轮转状态
#[derive(Debug, Clone, Copy)]
pub struct RtoLoop {
    /// 正在被 IPI 访问的过载 CPU，-1 表示没有进行中的轮转
    pub rto_cpu: i32,
    pub rto_loop: i32,
}

pub struct RootDomain {
    pub id: usize,
    pub span: AtomicCpuMask,
    pub online: AtomicCpuMask,
    /// 有 CPU 上可运行任务多于一个
    pub overload: AtomicBool,
    /// 有 CPU 利用率超过容量，此时不走能耗路径
    pub overutilized: AtomicBool,
    pub dlo_count: AtomicU32,
    pub dlo_mask: AtomicCpuMask,
    pub dl_bw: Mutex<DlBw>,
    pub cpudl: Cpudl,
    /// DL 带宽重新统计时的访问代数
    pub visit_gen: AtomicU64,
    pub rto_mask: AtomicCpuMask,
    pub rto_count: AtomicU32,
    pub rto_lock: Mutex<RtoLoop>,
    pub rto_loop_next: AtomicI32,
    pub rto_loop_start: AtomicI32,
    pub cpupri: Cpupri,
    pub max_cpu_capacity: AtomicU64,
    pub pd: RwLock<Option<Arc<Vec<PerfDomain>>>>,
}

impl RootDomain {
    pub fn new(nr_cpus: usize) -> Self {
        let id = NEXT_RD_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("sched: root domain {} created", id);
        Self {
            id,
            span: AtomicCpuMask::default(),
            online: AtomicCpuMask::default(),
            overload: AtomicBool::new(false),
            overutilized: AtomicBool::new(false),
            dlo_count: AtomicU32::new(0),
            dlo_mask: AtomicCpuMask::default(),
            dl_bw: Mutex::new(DlBw::new()),
            cpudl: Cpudl::new(nr_cpus),
            visit_gen: AtomicU64::new(0),
            rto_mask: AtomicCpuMask::default(),
            rto_count: AtomicU32::new(0),
            rto_lock: Mutex::new(RtoLoop { rto_cpu: -1, rto_loop: 0 }),
            rto_loop_next: AtomicI32::new(0),
            rto_loop_start: AtomicI32::new(0),
            cpupri: Cpupri::new(nr_cpus),
            max_cpu_capacity: AtomicU64::new(0),
            pd: RwLock::new(None),
        }
    }

    pub fn span(&self) -> CpuMask {
        self.span.load(Ordering::Acquire)
    }

    pub fn online(&self) -> CpuMask {
        self.online.load(Ordering::Acquire)
    }

    // RT 过载：先置掩码再加计数，与 rt_overloaded() 中的读取配对
    pub fn rt_set_overload(&self, cpu: usize) {
        self.rto_mask.set_cpu(cpu, Ordering::Release);
        self.rto_count.fetch_add(1, Ordering::Release);
    }

    pub fn rt_clear_overload(&self, cpu: usize) {
        self.rto_count.fetch_sub(1, Ordering::Release);
        self.rto_mask.clear_cpu(cpu, Ordering::Release);
    }

    pub fn rt_overloaded(&self) -> u32 {
        self.rto_count.load(Ordering::Acquire)
    }

    pub fn rto_mask(&self) -> CpuMask {
        self.rto_mask.load(Ordering::Acquire)
    }

    pub fn dl_set_overload(&self, cpu: usize) {
        self.dlo_mask.set_cpu(cpu, Ordering::Release);
        self.dlo_count.fetch_add(1, Ordering::Release);
    }

    pub fn dl_clear_overload(&self, cpu: usize) {
        self.dlo_count.fetch_sub(1, Ordering::Release);
        self.dlo_mask.clear_cpu(cpu, Ordering::Release);
    }

    pub fn dl_overloaded(&self) -> u32 {
        self.dlo_count.load(Ordering::Acquire)
    }

    pub fn dlo_mask(&self) -> CpuMask {
        self.dlo_mask.load(Ordering::Acquire)
    }

    pub fn set_overload(&self, v: bool) {
        if self.overload.load(Ordering::Relaxed) != v {
            self.overload.store(v, Ordering::Relaxed);
        }
    }

    pub fn is_overutilized(&self) -> bool {
        self.overutilized.load(Ordering::Relaxed)
    }

    pub fn perf_domains(&self) -> Option<Arc<Vec<PerfDomain>>> {
        self.pd.read().clone()
    }

    /// 能耗感知调度是否在本根域生效
    pub fn eas_enabled(&self) -> bool {
        self.pd.read().is_some()
    }

    /// RT_PUSH_IPI 轮转：返回下一个需要推送的过载 CPU
    ///
    /// 一圈走完时如果期间又有新的过载通知（`rto_loop_next` 变化），
    /// 从头再走一圈。
    pub fn rto_next_cpu(&self) -> Option<usize> {
        let mut lk = self.rto_lock.lock();
        self.rto_next_cpu_locked(&mut lk)
    }

    pub fn rto_next_cpu_locked(&self, lk: &mut RtoLoop) -> Option<usize> {
        loop {
            let mask = self.rto_mask();
            let cpu = if lk.rto_cpu < 0 { mask.first() } else { mask.next(lk.rto_cpu as usize) };
            if let Some(cpu) = cpu {
                lk.rto_cpu = cpu as i32;
                return Some(cpu);
            }
            lk.rto_cpu = -1;
            let next = self.rto_loop_next.load(Ordering::Acquire);
            if lk.rto_loop == next {
                return None;
            }
            lk.rto_loop = next;
        }
    }
}

impl core::fmt::Debug for RootDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RootDomain")
            .field("id", &self.id)
            .field("span", &self.span())
            .field("online", &self.online())
            .field("rto_mask", &self.rto_mask())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dl_overflow_check() {
        let mut b = DlBw { bw: to_ratio(100, 50), total_bw: 0 };
        // 两个 CPU 的容量，各 50% 可预留
        let cap = 2 * 1024;
        b.add(to_ratio(100, 60));
        assert!(!b.overflow(cap, 0, to_ratio(100, 40)));
        assert!(b.overflow(cap, 0, to_ratio(100, 41)));
        assert!(!b.overflow(cap, to_ratio(100, 60), to_ratio(100, 100)));
        let unlimited = DlBw { bw: u64::MAX, total_bw: 0 };
        assert!(!unlimited.overflow(1024, 0, u64::MAX / 2));
    }

    #[test]
    fn rt_overload_mask_and_count() {
        let rd = RootDomain::new(4);
        rd.rt_set_overload(1);
        rd.rt_set_overload(3);
        assert_eq!(rd.rt_overloaded(), 2);
        assert_eq!(rd.rto_mask(), CpuMask::from_cpus(&[1, 3]));
        rd.rt_clear_overload(1);
        assert_eq!(rd.rt_overloaded(), 1);
        assert_eq!(rd.rto_mask(), CpuMask::of(3));
    }

    #[test]
    fn rto_loop_visits_each_overloaded_cpu_once() {
        let rd = RootDomain::new(4);
        rd.rt_set_overload(0);
        rd.rt_set_overload(2);
        rd.rt_set_overload(3);
        rd.rto_loop_next.fetch_add(1, Ordering::Release);
        let mut seen = alloc::vec::Vec::new();
        while let Some(cpu) = rd.rto_next_cpu() {
            seen.push(cpu);
        }
        // 第一圈结束时发现新的通知，于是再走一圈
        assert_eq!(seen, [0, 2, 3, 0, 2, 3]);
        assert_eq!(rd.rto_lock.lock().rto_cpu, -1);
    }
}
