//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! DL 的 CPU 截止时间堆
//!
//! 以 CPU 上最早的 DL 截止时间为键的最大堆：堆顶是截止时间最晚的
//! CPU，也就是新 DL 任务最容易抢占的 CPU。没有 DL 任务的 CPU 记在
//! `free_cpus` 中。

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::cpumask::{AtomicCpuMask, CpuMask};

const IDX_INVALID: usize = usize::MAX;

/// 截止时间比较，容忍回绕
#[inline]
pub fn dl_time_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

#[derive(Debug, Clone, Copy)]
struct Item {
    dl: u64,
    cpu: usize,
}

struct Heap {
    elements: Vec<Item>,
    /// cpu -> 在堆中的下标
    idx: Vec<usize>,
}

pub struct Cpudl {
    heap: Mutex<Heap>,
    free_cpus: AtomicCpuMask,
}

impl Heap {
    fn parent(i: usize) -> usize {
        (i - 1) >> 1
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.elements.swap(a, b);
        let ca = self.elements[a].cpu;
        let cb = self.elements[b].cpu;
        self.idx[ca] = a;
        self.idx[cb] = b;
    }

    fn heapify_down(&mut self, mut i: usize) {
        let size = self.elements.len();
        loop {
            let l = 2 * i + 1;
            let r = l + 1;
            let mut largest = i;
            if l < size && dl_time_before(self.elements[largest].dl, self.elements[l].dl) {
                largest = l;
            }
            if r < size && dl_time_before(self.elements[largest].dl, self.elements[r].dl) {
                largest = r;
            }
            if largest == i {
                break;
            }
            self.swap(i, largest);
            i = largest;
        }
    }

    fn heapify_up(&mut self, mut i: usize) {
        while i > 0 {
            let p = Self::parent(i);
            if dl_time_before(self.elements[i].dl, self.elements[p].dl)
                || self.elements[i].dl == self.elements[p].dl
            {
                break;
            }
            self.swap(i, p);
            i = p;
        }
    }

    fn heapify(&mut self, i: usize) {
        if i > 0 && dl_time_before(self.elements[Self::parent(i)].dl, self.elements[i].dl) {
            self.heapify_up(i);
        } else {
            self.heapify_down(i);
        }
    }
}

impl Cpudl {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            heap: Mutex::new(Heap {
                elements: Vec::with_capacity(nr_cpus),
                idx: alloc::vec![IDX_INVALID; nr_cpus],
            }),
            free_cpus: AtomicCpuMask::default(),
        }
    }

    pub fn free_cpus(&self) -> CpuMask {
        self.free_cpus.load(Ordering::Acquire)
    }

    /// 堆顶：截止时间最晚的 CPU
    pub fn maximum(&self) -> Option<(usize, u64)> {
        let h = self.heap.lock();
        h.elements.first().map(|e| (e.cpu, e.dl))
    }

    /// 记录 `cpu` 上最早的截止时间
    pub fn set(&self, cpu: usize, dl: u64) {
        let mut h = self.heap.lock();
        let old_idx = h.idx[cpu];
        if old_idx == IDX_INVALID {
            let new_idx = h.elements.len();
            h.elements.push(Item { dl, cpu });
            h.idx[cpu] = new_idx;
            h.heapify_up(new_idx);
            self.free_cpus.clear_cpu(cpu, Ordering::Release);
        } else {
            h.elements[old_idx].dl = dl;
            h.heapify(old_idx);
        }
    }

    /// `cpu` 上不再有 DL 任务
    pub fn clear(&self, cpu: usize) {
        let mut h = self.heap.lock();
        let old_idx = h.idx[cpu];
        if old_idx != IDX_INVALID {
            let last = h.elements.len() - 1;
            h.swap(old_idx, last);
            h.elements.pop();
            h.idx[cpu] = IDX_INVALID;
            if old_idx < h.elements.len() {
                h.heapify(old_idx);
            }
        }
        self.free_cpus.set_cpu(cpu, Ordering::Release);
    }

    /// CPU 上线
    pub fn set_freecpu(&self, cpu: usize) {
        self.free_cpus.set_cpu(cpu, Ordering::Release);
    }

    /// CPU 下线
    pub fn clear_freecpu(&self, cpu: usize) {
        self.free_cpus.clear_cpu(cpu, Ordering::Release);
    }

    /// 查找可以放置截止时间为 `deadline` 的任务的 CPU
    ///
    /// 优先空闲 CPU；`fits` 给出时只保留容量合适的 CPU，一个都没有
    /// 则返回容量最大的那个。否则看堆顶是否允许且能被抢占。
    pub fn find(
        &self,
        deadline: u64,
        cpus_allowed: CpuMask,
        fits: Option<&dyn Fn(usize) -> (bool, u64)>,
    ) -> Option<CpuMask> {
        let free = self.free_cpus().and(cpus_allowed);
        if !free.is_empty() {
            let Some(fits) = fits else {
                return Some(free);
            };
            let mut max_cap = 0;
            let mut max_cpu = None;
            let mut later = free;
            for cpu in free {
                let (ok, cap) = fits(cpu);
                if !ok {
                    later.clear(cpu);
                    if cap > max_cap || max_cpu.is_none() {
                        max_cap = cap;
                        max_cpu = Some(cpu);
                    }
                }
            }
            if later.is_empty() {
                if let Some(cpu) = max_cpu {
                    later.set(cpu);
                }
            }
            return Some(later);
        }

        let (best, dl) = self.maximum()?;
        if cpus_allowed.test(best) && dl_time_before(deadline, dl) {
            return Some(CpuMask::of(best));
        }
        None
    }

    #[cfg(test)]
    fn check(&self) {
        let h = self.heap.lock();
        for i in 1..h.elements.len() {
            let p = Heap::parent(i);
            assert!(!dl_time_before(h.elements[p].dl, h.elements[i].dl));
        }
        for (i, e) in h.elements.iter().enumerate() {
            assert_eq!(h.idx[e.cpu], i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_keeps_latest_on_top() {
        let cd = Cpudl::new(6);
        for cpu in 0..6 {
            cd.set_freecpu(cpu);
        }
        cd.set(0, 500);
        cd.set(1, 900);
        cd.set(2, 100);
        cd.set(3, 700);
        cd.check();
        assert_eq!(cd.maximum(), Some((1, 900)));
        cd.set(1, 50);
        cd.check();
        assert_eq!(cd.maximum(), Some((3, 700)));
        cd.clear(3);
        cd.check();
        assert_eq!(cd.maximum(), Some((0, 500)));
        assert_eq!(cd.free_cpus(), CpuMask::from_cpus(&[3, 4, 5]));
    }

    #[test]
    fn find_prefers_free_then_latest() {
        let cd = Cpudl::new(2);
        cd.set_freecpu(0);
        cd.set_freecpu(1);
        cd.set(0, 1000);
        assert_eq!(cd.find(2000, CpuMask::first_n(2), None), Some(CpuMask::of(1)));
        cd.set(1, 800);
        assert_eq!(cd.find(900, CpuMask::first_n(2), None), Some(CpuMask::of(0)));
        assert_eq!(cd.find(1200, CpuMask::first_n(2), None), None);
        assert_eq!(cd.find(900, CpuMask::of(1), None), None);
    }
}
