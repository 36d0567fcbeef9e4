//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器
//!
//! 组成：
//! - 调度类: stop > deadline > rt > fair > idle，见 [`class`]
//! - 运行队列: 每个 CPU 一个 [`rq::Rq`]
//! - 调度入口: `Scheduler::schedule()` -> pick_next_task -> context_switch
//! - 负载跟踪: [`pelt`]，全局负载: [`loadavg`]
//! - 拓扑: [`topology`] 构建 sched domain，[`root_domain`] 管理分区共享状态
//!
//! 所有状态都挂在一个 [`Scheduler`] 实例上，per-CPU 数据是按 CPU 号
//! 索引的数组。

pub mod bandwidth;
pub mod class;
pub mod core;
pub mod cpudl;
pub mod cpupri;
pub mod deadline;
pub mod energy;
pub mod entity;
pub mod fair;
pub mod fair_lb;
pub mod features;
pub mod fixedpt;
pub mod group;
pub mod hooks;
pub mod hotplug;
pub mod hrtimer;
pub mod idle;
pub mod loadavg;
pub mod pelt;
pub mod pid;
pub mod root_domain;
pub mod rq;
pub mod rt;
pub mod stats;
pub mod stop;
pub mod syscalls;
pub mod sysctl;
pub mod topology;
pub mod uclamp;

pub use self::core::Scheduler;
pub use class::SchedClass;
pub use entity::SchedAttr;
pub use group::{GroupId, ROOT_TASK_GROUP};
pub use hooks::{ClockSource, CpuidleDriver, IdleGovernor, IpiKind, ManualClock, NoopHooks, SchedHooks};
pub use topology::ArchTopology;

use bitflags::bitflags;

pub const MAX_NICE: i32 = 19;
pub const MIN_NICE: i32 = -20;
pub const NICE_WIDTH: i32 = MAX_NICE - MIN_NICE + 1;

/// 0..=98 为 RT 优先级，数值越小越高
pub const MAX_RT_PRIO: i32 = 100;
pub const MAX_USER_RT_PRIO: i32 = 100;
pub const MAX_PRIO: i32 = MAX_RT_PRIO + NICE_WIDTH;
pub const DEFAULT_PRIO: i32 = MAX_RT_PRIO + NICE_WIDTH / 2;
/// DL 任务的 prio 为 -1
pub const MAX_DL_PRIO: i32 = 0;

#[inline]
pub const fn nice_to_prio(nice: i32) -> i32 {
    nice + DEFAULT_PRIO
}

#[inline]
pub const fn prio_to_nice(prio: i32) -> i32 {
    prio - DEFAULT_PRIO
}

#[inline]
pub const fn dl_prio(prio: i32) -> bool {
    prio < MAX_DL_PRIO
}

#[inline]
pub const fn rt_prio(prio: i32) -> bool {
    prio < MAX_RT_PRIO
}

/// RR 默认时间片，单位 tick
pub const RR_TIMESLICE: u32 = (100 * crate::config::HZ / 1000) as u32;

bitflags! {
    /// 唤醒标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WakeFlags: u32 {
        const EXEC = 0x02;
        const FORK = 0x04;
        const TTWU = 0x08;
        /// 唤醒者马上要睡眠
        const SYNC = 0x10;
        const MIGRATED = 0x20;
        /// 唤醒时任务仍在某个 CPU 上完成切换
        const ON_CPU = 0x40;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnqueueFlags: u32 {
        const WAKEUP = 0x01;
        const RESTORE = 0x02;
        const MOVE = 0x04;
        const NOCLOCK = 0x08;
        const HEAD = 0x10;
        const REPLENISH = 0x20;
        const MIGRATED = 0x40;
        const INITIAL = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DequeueFlags: u32 {
        const SLEEP = 0x01;
        /// 临时出队，之后以 RESTORE 重新入队
        const SAVE = 0x02;
        const MOVE = 0x04;
        const NOCLOCK = 0x08;
    }
}

impl DequeueFlags {
    /// SAVE/MOVE 出队对应的入队标志
    pub fn restore(self) -> EnqueueFlags {
        let mut f = EnqueueFlags::empty();
        if self.contains(Self::SAVE) {
            f |= EnqueueFlags::RESTORE;
        }
        if self.contains(Self::MOVE) {
            f |= EnqueueFlags::MOVE;
        }
        if self.contains(Self::NOCLOCK) {
            f |= EnqueueFlags::NOCLOCK;
        }
        f
    }
}

/// 不可恢复的内部错误：记录后 panic，由 panic 处理打印现场并停机
#[track_caller]
#[cold]
pub fn bug(args: ::core::fmt::Arguments<'_>) -> ! {
    log::error!("sched: BUG: {}", args);
    panic!("sched: BUG: {}", args);
}

/// 条件成立时调用 [`bug`]
#[macro_export]
macro_rules! sched_bug_on {
    ($cond:expr) => {
        if $cond {
            $crate::sched::bug(format_args!("{}", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            $crate::sched::bug(format_args!($($arg)+));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prio_layout() {
        assert_eq!(MAX_PRIO, 140);
        assert_eq!(DEFAULT_PRIO, 120);
        assert_eq!(nice_to_prio(-20), 100);
        assert_eq!(prio_to_nice(139), 19);
        assert!(dl_prio(-1) && !dl_prio(0));
        assert!(rt_prio(99) && !rt_prio(100));
        assert_eq!(RR_TIMESLICE as u64, crate::config::HZ / 10);
    }

    #[test]
    #[should_panic(expected = "sched: BUG")]
    fn bug_panics() {
        sched_bug_on!(1 + 1 == 2, "corrupted prio array at {}", 3);
    }
}
