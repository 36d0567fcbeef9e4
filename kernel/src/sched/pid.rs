//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! PID 管理
//!
//! - PID 0: swapper/idle，每个 CPU 一个，不进入全局任务表
//! - PID 1: init
//! - 其余按递增顺序分配，`last_pid` 导出到 /proc/loadavg

use core::sync::atomic::{AtomicU32, Ordering};

pub const PID_MAX_LIMIT: u32 = 4194304; // 4M (默认 32768，最大可到 4M)

pub const PID_SWAPPER: u32 = 0; // idle 进程
pub const PID_INIT: u32 = 1; // init 进程

pub struct PidAllocator {
    next: AtomicU32,
}

impl PidAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(PID_INIT),
        }
    }

    pub fn alloc(&self) -> Option<u32> {
        let pid = self.next.fetch_add(1, Ordering::Relaxed);
        if pid >= PID_MAX_LIMIT {
            // 分配到上限后停止，不回绕
            self.next.store(PID_MAX_LIMIT, Ordering::Relaxed);
            None
        } else {
            Some(pid)
        }
    }

    /// 最近一次分配的 pid
    pub fn last_pid(&self) -> u32 {
        self.next.load(Ordering::Relaxed).saturating_sub(1)
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_init() {
        let pids = PidAllocator::new();
        assert_eq!(pids.last_pid(), 0);
        assert_eq!(pids.alloc(), Some(PID_INIT));
        assert_eq!(pids.alloc(), Some(2));
        assert_eq!(pids.last_pid(), 2);
    }
}
