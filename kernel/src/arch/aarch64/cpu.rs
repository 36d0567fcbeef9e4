//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! CPU 寄存器访问
//!
//! 只在真正的 aarch64 目标上编译；主机测试用 [`hooks`](crate::sched::hooks) 里的模拟实现。

use core::arch::asm;

use crate::sched::hooks::{IpiKind, SchedHooks};

/// 当前核心号，取 MPIDR_EL1.Aff0
#[inline]
pub fn core_id() -> usize {
    let mpidr: u64;
    unsafe {
        asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack, pure));
    }
    (mpidr & 0xff) as usize
}

#[inline]
pub fn read_esr_el1() -> u64 {
    let esr: u64;
    unsafe {
        asm!("mrs {}, esr_el1", out(reg) esr, options(nomem, nostack));
    }
    esr
}

#[inline]
pub fn read_far_el1() -> u64 {
    let far: u64;
    unsafe {
        asm!("mrs {}, far_el1", out(reg) far, options(nomem, nostack));
    }
    far
}

/// 读取虚拟计数器
#[inline]
pub fn read_counter() -> u64 {
    let cnt: u64;
    unsafe {
        asm!("mrs {}, cntvct_el0", out(reg) cnt, options(nomem, nostack));
    }
    cnt
}

#[inline]
pub fn counter_freq() -> u64 {
    let freq: u64;
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack, pure));
    }
    freq
}

/// 等待中断
#[inline]
pub fn wfi() {
    unsafe {
        asm!("wfi", options(nomem, nostack));
    }
}

/// IPI 发送函数，由中断控制器驱动注册
pub type IpiSender = fn(cpu: usize, kind: IpiKind);

/// 真实硬件上的调度回调：CPU 号来自 MPIDR，默认 idle 执行 wfi
pub struct ArmCpuHooks {
    send: IpiSender,
}

impl ArmCpuHooks {
    pub const fn new(send: IpiSender) -> Self {
        Self { send }
    }
}

impl SchedHooks for ArmCpuHooks {
    fn this_cpu_id(&self) -> usize {
        core_id()
    }

    fn send_ipi(&self, cpu: usize, kind: IpiKind) {
        (self.send)(cpu, kind);
    }

    fn arch_cpu_idle(&self, _cpu: usize) {
        wfi();
    }
}
