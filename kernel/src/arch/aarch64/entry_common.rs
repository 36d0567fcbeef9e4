//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 异常进出的状态记录
//!
//! 每次进入或退出异常都要成对地维护三样东西：lockdep 视角的硬中断开关、
//! RCU 是否在观察本 CPU、以及 preempt_count 里的中断嵌套计数。
//! NMI 与调试异常走单独的一组入口，它们可以打断任何上下文，只保存和恢复，
//! 从不调度。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::sched::hooks::SchedHooks;
use crate::sched::Scheduler;

pub const PREEMPT_MASK: u32 = 0x0000_00ff;
pub const SOFTIRQ_MASK: u32 = 0x0000_ff00;
pub const HARDIRQ_MASK: u32 = 0x000f_0000;
pub const NMI_MASK: u32 = 0x00f0_0000;

pub const PREEMPT_OFFSET: u32 = 1;
pub const SOFTIRQ_OFFSET: u32 = 1 << 8;
pub const HARDIRQ_OFFSET: u32 = 1 << 16;
pub const NMI_OFFSET: u32 = 1 << 20;

/// PSTATE.{D,A,I,F}
pub const PSR_F_BIT: u64 = 1 << 6;
pub const PSR_I_BIT: u64 = 1 << 7;
pub const PSR_A_BIT: u64 = 1 << 8;
pub const PSR_D_BIT: u64 = 1 << 9;
pub const PSR_DAIF_MASK: u64 = PSR_D_BIT | PSR_A_BIT | PSR_I_BIT | PSR_F_BIT;
pub const PSR_MODE_MASK: u64 = 0xf;
pub const PSR_MODE_EL0T: u64 = 0x0;
pub const PSR_MODE_EL1H: u64 = 0x5;

/// 异常时保存的寄存器现场
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PtRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl PtRegs {
    pub fn user_mode(&self) -> bool {
        self.pstate & PSR_MODE_MASK == PSR_MODE_EL0T
    }

    /// 被打断的上下文是否开着 IRQ
    pub fn interrupts_enabled(&self) -> bool {
        self.pstate & PSR_I_BIT == 0
    }

    /// DAIF 全部清零，才允许在中断返回时抢占
    pub fn daif_clear(&self) -> bool {
        self.pstate & PSR_DAIF_MASK == 0
    }
}

/// 进入内核态异常时记下的状态，退出时原样交回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqEntryState {
    /// 入口处替 RCU 打开了观察，出口要关掉
    pub exit_rcu: bool,
    /// 入口之前 lockdep 认为硬中断是开着的
    pub lockdep: bool,
}

/// 单个 CPU 的入口状态
pub struct CpuEntry {
    preempt_count: AtomicU32,
    hardirqs_enabled: AtomicBool,
    rcu_watching: AtomicBool,
    /// 正在使用 IRQ 栈的嵌套层数
    irq_stack_depth: AtomicU32,
    /// 异步 MTE tag 检查失败累积的 TFSR_EL1
    mte_tfsr: AtomicU64,
    mte_faults: AtomicU64,
}

impl CpuEntry {
    fn new() -> Self {
        Self {
            preempt_count: AtomicU32::new(0),
            hardirqs_enabled: AtomicBool::new(true),
            rcu_watching: AtomicBool::new(true),
            irq_stack_depth: AtomicU32::new(0),
            mte_tfsr: AtomicU64::new(0),
            mte_faults: AtomicU64::new(0),
        }
    }
}

/// 所有 CPU 的入口状态
pub struct EntryState {
    cpus: Vec<CpuEntry>,
}

impl EntryState {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpus: (0..nr_cpus).map(|_| CpuEntry::new()).collect(),
        }
    }

    fn cpu(&self, cpu: usize) -> &CpuEntry {
        &self.cpus[cpu]
    }

    pub fn preempt_count(&self, cpu: usize) -> u32 {
        self.cpu(cpu).preempt_count.load(Ordering::Relaxed)
    }

    fn preempt_count_add(&self, cpu: usize, val: u32) {
        self.cpu(cpu).preempt_count.fetch_add(val, Ordering::Relaxed);
    }

    fn preempt_count_sub(&self, cpu: usize, val: u32) {
        let old = self.cpu(cpu).preempt_count.fetch_sub(val, Ordering::Relaxed);
        crate::sched_bug_on!(old < val, "entry: CPU{} preempt_count underflow ({:#x} - {:#x})", cpu, old, val);
    }

    pub fn preempt_disable(&self, cpu: usize) {
        self.preempt_count_add(cpu, PREEMPT_OFFSET);
    }

    pub fn preempt_enable_no_resched(&self, cpu: usize) {
        self.preempt_count_sub(cpu, PREEMPT_OFFSET);
    }

    /// 关抢占区结束时检查是否欠着一次调度
    pub fn preempt_enable(&self, sched: &Scheduler, cpu: usize) {
        self.preempt_count_sub(cpu, PREEMPT_OFFSET);
        if self.preempt_count(cpu) == 0 && sched.need_resched(cpu) {
            sched.schedule_on(cpu, true);
        }
    }

    pub fn in_nmi(&self, cpu: usize) -> bool {
        self.preempt_count(cpu) & NMI_MASK != 0
    }

    pub fn in_hardirq(&self, cpu: usize) -> bool {
        self.preempt_count(cpu) & HARDIRQ_MASK != 0
    }

    pub fn in_interrupt(&self, cpu: usize) -> bool {
        self.preempt_count(cpu) & (NMI_MASK | HARDIRQ_MASK | SOFTIRQ_MASK) != 0
    }

    pub fn lockdep_hardirqs_enabled(&self, cpu: usize) -> bool {
        self.cpu(cpu).hardirqs_enabled.load(Ordering::Relaxed)
    }

    fn lockdep_hardirqs_off(&self, cpu: usize) {
        self.cpu(cpu).hardirqs_enabled.store(false, Ordering::Relaxed);
    }

    fn lockdep_hardirqs_on(&self, cpu: usize) {
        self.cpu(cpu).hardirqs_enabled.store(true, Ordering::Relaxed);
    }

    pub fn rcu_is_watching(&self, cpu: usize) -> bool {
        self.cpu(cpu).rcu_watching.load(Ordering::Relaxed)
    }

    /// idle 循环告诉入口代码 RCU 已经停止观察本 CPU
    pub fn rcu_idle_enter(&self, hooks: &dyn SchedHooks, cpu: usize) {
        hooks.rcu_idle_enter(cpu);
        self.cpu(cpu).rcu_watching.store(false, Ordering::Relaxed);
    }

    pub fn rcu_idle_exit(&self, hooks: &dyn SchedHooks, cpu: usize) {
        self.cpu(cpu).rcu_watching.store(true, Ordering::Relaxed);
        hooks.rcu_idle_exit(cpu);
    }

    /// 硬件报告了一次异步 tag 检查失败
    pub fn mte_record_async_fault(&self, cpu: usize, tfsr: u64) {
        self.cpu(cpu).mte_tfsr.fetch_or(tfsr, Ordering::Relaxed);
    }

    pub fn mte_faults(&self, cpu: usize) -> u64 {
        self.cpu(cpu).mte_faults.load(Ordering::Relaxed)
    }

    fn mte_check_tfsr(&self, cpu: usize) {
        let tfsr = self.cpu(cpu).mte_tfsr.swap(0, Ordering::Relaxed);
        if tfsr != 0 {
            self.cpu(cpu).mte_faults.fetch_add(1, Ordering::Relaxed);
            log::error!("entry: CPU{} asynchronous tag check fault, TFSR_EL1={:#x}", cpu, tfsr);
        }
    }

    // -----------------------------------------------------------------
    // 内核态
    // -----------------------------------------------------------------

    /// 内核态异常入口
    ///
    /// 如果打断的是 RCU 不观察的区域（例如 idle），由这里打开观察。
    pub fn enter_from_kernel_mode(&self, hooks: &dyn SchedHooks, cpu: usize) -> IrqEntryState {
        let lockdep = self.lockdep_hardirqs_enabled(cpu);
        let exit_rcu = if self.rcu_is_watching(cpu) {
            false
        } else {
            hooks.rcu_irq_enter(cpu);
            self.cpu(cpu).rcu_watching.store(true, Ordering::Relaxed);
            true
        };
        self.lockdep_hardirqs_off(cpu);
        self.mte_check_tfsr(cpu);
        IrqEntryState { exit_rcu, lockdep }
    }

    pub fn exit_to_kernel_mode(&self, hooks: &dyn SchedHooks, cpu: usize, regs: &PtRegs, state: IrqEntryState) {
        self.mte_check_tfsr(cpu);
        if state.exit_rcu {
            hooks.rcu_irq_exit(cpu);
            self.cpu(cpu).rcu_watching.store(false, Ordering::Relaxed);
        }
        if regs.interrupts_enabled() {
            self.lockdep_hardirqs_on(cpu);
        }
    }

    // -----------------------------------------------------------------
    // 用户态
    // -----------------------------------------------------------------

    pub fn enter_from_user_mode(&self, cpu: usize) {
        self.lockdep_hardirqs_off(cpu);
        self.cpu(cpu).rcu_watching.store(true, Ordering::Relaxed);
    }

    /// 回到用户态之前处理掉所有欠着的调度
    pub fn exit_to_user_mode(&self, sched: &Scheduler, cpu: usize) {
        while sched.need_resched(cpu) {
            sched.schedule_on(cpu, false);
        }
        self.mte_check_tfsr(cpu);
        self.lockdep_hardirqs_on(cpu);
    }

    // -----------------------------------------------------------------
    // NMI 与调试异常
    // -----------------------------------------------------------------

    /// NMI 入口，返回进入前 lockdep 的硬中断状态
    pub fn arm64_enter_nmi(&self, hooks: &dyn SchedHooks, cpu: usize) -> bool {
        let lockdep = self.lockdep_hardirqs_enabled(cpu);
        self.preempt_count_add(cpu, NMI_OFFSET + HARDIRQ_OFFSET);
        self.lockdep_hardirqs_off(cpu);
        hooks.rcu_nmi_enter(cpu);
        lockdep
    }

    pub fn arm64_exit_nmi(&self, hooks: &dyn SchedHooks, cpu: usize, lockdep: bool) {
        hooks.rcu_nmi_exit(cpu);
        if lockdep {
            self.lockdep_hardirqs_on(cpu);
        }
        self.preempt_count_sub(cpu, NMI_OFFSET + HARDIRQ_OFFSET);
    }

    /// 内核态调试异常，和 NMI 一样不能假设 RCU 在观察
    pub fn arm64_enter_el1_dbg(&self, hooks: &dyn SchedHooks, cpu: usize) -> bool {
        let lockdep = self.lockdep_hardirqs_enabled(cpu);
        self.lockdep_hardirqs_off(cpu);
        hooks.rcu_nmi_enter(cpu);
        lockdep
    }

    pub fn arm64_exit_el1_dbg(&self, hooks: &dyn SchedHooks, cpu: usize, lockdep: bool) {
        hooks.rcu_nmi_exit(cpu);
        if lockdep {
            self.lockdep_hardirqs_on(cpu);
        }
    }

    // -----------------------------------------------------------------
    // 中断上下文
    // -----------------------------------------------------------------

    pub fn irq_enter_rcu(&self, cpu: usize) {
        self.preempt_count_add(cpu, HARDIRQ_OFFSET);
    }

    /// 离开硬中断；最外层退出时执行挂起的软中断
    pub fn irq_exit_rcu(&self, sched: &Scheduler, cpu: usize) {
        self.preempt_count_sub(cpu, HARDIRQ_OFFSET);
        if !self.in_interrupt(cpu) && sched.softirq_pending(cpu) {
            self.preempt_count_add(cpu, SOFTIRQ_OFFSET);
            sched.run_softirqs(cpu);
            self.preempt_count_sub(cpu, SOFTIRQ_OFFSET);
        }
    }

    /// 当前是否在线程栈上（还没有切到 IRQ 栈）
    pub fn on_thread_stack(&self, cpu: usize) -> bool {
        self.cpu(cpu).irq_stack_depth.load(Ordering::Relaxed) == 0
    }

    /// 在 IRQ 栈上执行 `f`；已经在 IRQ 栈上时直接执行
    pub fn call_on_irq_stack<R>(&self, cpu: usize, f: impl FnOnce() -> R) -> R {
        let depth = &self.cpu(cpu).irq_stack_depth;
        depth.fetch_add(1, Ordering::Relaxed);
        let r = f();
        depth.fetch_sub(1, Ordering::Relaxed);
        r
    }

    /// 内核态 IRQ 返回时的抢占点
    ///
    /// 只有抢占计数为零、被打断的上下文 DAIF 全清、且不是 NMI 返回时才调度。
    pub fn arm64_preempt_schedule_irq(&self, sched: &Scheduler, cpu: usize, regs: &PtRegs) -> bool {
        if self.preempt_count(cpu) != 0 || !regs.daif_clear() || self.in_nmi(cpu) {
            return false;
        }
        if !sched.need_resched(cpu) {
            return false;
        }
        sched.preempt_schedule_irq(cpu);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::hooks::NoopHooks;

    #[test]
    fn nmi_nests_inside_hardirq() {
        let e = EntryState::new(1);
        let hooks = NoopHooks;
        e.irq_enter_rcu(0);
        assert!(e.in_hardirq(0));
        assert!(!e.in_nmi(0));
        let lockdep = e.arm64_enter_nmi(&hooks, 0);
        assert!(e.in_nmi(0));
        assert_eq!(e.preempt_count(0), 2 * HARDIRQ_OFFSET + NMI_OFFSET);
        e.arm64_exit_nmi(&hooks, 0, lockdep);
        assert!(!e.in_nmi(0));
        assert_eq!(e.preempt_count(0), HARDIRQ_OFFSET);
    }

    #[test]
    fn kernel_entry_from_idle_turns_rcu_on_and_back_off() {
        let e = EntryState::new(1);
        let hooks = NoopHooks;
        e.rcu_idle_enter(&hooks, 0);
        assert!(!e.rcu_is_watching(0));

        let st = e.enter_from_kernel_mode(&hooks, 0);
        assert!(st.exit_rcu);
        assert!(e.rcu_is_watching(0));
        assert!(!e.lockdep_hardirqs_enabled(0));

        let regs = PtRegs { pstate: PSR_MODE_EL1H, ..PtRegs::default() };
        e.exit_to_kernel_mode(&hooks, 0, &regs, st);
        assert!(!e.rcu_is_watching(0));
        assert!(e.lockdep_hardirqs_enabled(0));
    }

    #[test]
    fn masked_context_keeps_lockdep_off() {
        let e = EntryState::new(1);
        let hooks = NoopHooks;
        let st = e.enter_from_kernel_mode(&hooks, 0);
        assert!(!st.exit_rcu);
        let regs = PtRegs { pstate: PSR_MODE_EL1H | PSR_I_BIT, ..PtRegs::default() };
        e.exit_to_kernel_mode(&hooks, 0, &regs, st);
        assert!(!e.lockdep_hardirqs_enabled(0));
    }

    #[test]
    fn async_tag_fault_is_reported_once() {
        let e = EntryState::new(1);
        e.mte_record_async_fault(0, 1);
        let st = e.enter_from_kernel_mode(&NoopHooks, 0);
        assert_eq!(e.mte_faults(0), 1);
        let regs = PtRegs::default();
        e.exit_to_kernel_mode(&NoopHooks, 0, &regs, st);
        assert_eq!(e.mte_faults(0), 1);
    }

    #[test]
    fn irq_stack_is_entered_once() {
        let e = EntryState::new(1);
        assert!(e.on_thread_stack(0));
        let nested = e.call_on_irq_stack(0, || {
            assert!(!e.on_thread_stack(0));
            e.call_on_irq_stack(0, || e.on_thread_stack(0))
        });
        assert!(!nested);
        assert!(e.on_thread_stack(0));
    }

    #[test]
    #[should_panic(expected = "preempt_count underflow")]
    fn unbalanced_preempt_enable_is_fatal() {
        let e = EntryState::new(1);
        e.preempt_enable_no_resched(0);
    }
}
