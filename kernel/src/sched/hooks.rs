//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器对外部子系统的接口
//!
//! 时钟、IPI、RCU、cpufreq、cpuidle 都不属于调度核心，平台通过这里的
//! trait 把它们接进来。所有方法都有空实现，平台只需覆盖用得到的部分。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 发往其他 CPU 的 IPI 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    /// 重新调度（同时处理远程唤醒队列）
    Reschedule,
    /// 触发 RT push 的 irq_work
    RtPush,
    /// nohz idle balance
    NohzKick,
    /// 函数调用
    CallFunction,
}

/// cpufreq 更新原因
pub mod cpufreq_flags {
    pub const SCHED_CPUFREQ_IOWAIT: u32 = 1 << 0;
}

/// 单调时钟
pub trait ClockSource: Send + Sync {
    /// 纳秒级单调时间
    fn sched_clock(&self) -> u64;

    /// 截至目前该 CPU 在硬/软中断中花费的总时间
    fn irq_time(&self, _cpu: usize) -> u64 {
        0
    }
}

/// 测试和早期启动用的手动时钟
pub struct ManualClock {
    now: AtomicU64,
    irq: Vec<AtomicU64>,
}

impl ManualClock {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            now: AtomicU64::new(0),
            irq: (0..nr_cpus).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) -> u64 {
        self.now.fetch_add(ns, Ordering::SeqCst) + ns
    }

    pub fn add_irq_time(&self, cpu: usize, ns: u64) {
        if let Some(t) = self.irq.get(cpu) {
            t.fetch_add(ns, Ordering::SeqCst);
        }
    }
}

impl ClockSource for ManualClock {
    fn sched_clock(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn irq_time(&self, cpu: usize) -> u64 {
        self.irq.get(cpu).map_or(0, |t| t.load(Ordering::SeqCst))
    }
}

/// 平台回调
pub trait SchedHooks: Send + Sync {
    /// 当前执行的 CPU
    fn this_cpu_id(&self) -> usize {
        0
    }

    fn send_ipi(&self, _cpu: usize, _kind: IpiKind) {}

    /// 利用率变化通知 cpufreq 调速器
    fn cpufreq_update_util(&self, _cpu: usize, _util: u64, _max: u64, _flags: u32) {}

    /// 当前调速器是否为 schedutil
    fn schedutil_governor(&self) -> bool {
        true
    }

    /// 平台是否支持频率不变性
    fn freq_invariant(&self) -> bool {
        true
    }

    fn rcu_note_context_switch(&self, _cpu: usize, _preempt: bool) {}

    fn rcu_qs(&self, _cpu: usize) {}

    fn rcu_idle_enter(&self, _cpu: usize) {}

    fn rcu_idle_exit(&self, _cpu: usize) {}

    fn rcu_irq_enter(&self, _cpu: usize) {}

    fn rcu_irq_exit(&self, _cpu: usize) {}

    fn rcu_nmi_enter(&self, _cpu: usize) {}

    fn rcu_nmi_exit(&self, _cpu: usize) {}

    /// 处理挂起的 smp_call_function 请求
    fn smp_call_pending(&self, _cpu: usize) {}

    /// tick broadcast 即将到期，idle 时只能轮询
    fn tick_broadcast_imminent(&self, _cpu: usize) -> bool {
        false
    }

    /// 系统正在进入 suspend-to-idle
    fn system_suspending(&self) -> bool {
        false
    }

    /// 没有 cpuidle 驱动时的默认 idle，通常是一条 wfi
    fn arch_cpu_idle(&self, _cpu: usize) {}
}

/// 全部使用默认实现
pub struct NoopHooks;

impl SchedHooks for NoopHooks {}

/// 当前执行 CPU 可以被修改的回调，供单线程驱动多个 CPU 的场合使用
#[derive(Default)]
pub struct CpuLocalHooks {
    cpu: AtomicUsize,
}

impl CpuLocalHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switch_to(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }
}

impl SchedHooks for CpuLocalHooks {
    fn this_cpu_id(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }
}

/// cpuidle 状态描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleState {
    pub exit_latency_ns: u64,
    pub target_residency_ns: u64,
    /// 该状态会停掉本地 timer，需要 broadcast
    pub timer_stop: bool,
}

/// cpuidle 驱动
pub trait CpuidleDriver: Send + Sync {
    fn states(&self) -> &[IdleState];

    /// 进入给定状态，返回实际驻留时间
    fn enter_idle_state(&self, cpu: usize, index: usize) -> u64;
}

/// cpuidle 调速器
pub trait IdleGovernor: Send + Sync {
    /// 选择状态，返回状态号和是否需要停 tick
    fn select(&self, cpu: usize, states: &[IdleState], latency_limit_ns: u64) -> (usize, bool);

    fn reflect(&self, _cpu: usize, _index: usize, _residency_ns: u64) {}
}
