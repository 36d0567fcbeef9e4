//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! ARMv8 异常分发
//!
//! 向量表把异常交到这里的 `el{0,1}*_handler`，它们按 ESR_EL1.EC 分发到具体处理函数，
//! 并用 [`entry_common`](super::entry_common) 的入口/出口包起来：
//! - 同步异常：系统调用、数据/指令中止、FP/SVE、调试、对齐、PAC、BTI、未定义指令
//! - IRQ/FIQ：切到 IRQ 栈，交给中断控制器；时钟中断驱动调度 tick，IPI 驱动远程唤醒
//! - SError 与内核态调试异常走 NMI 路径，从不调度
//!
//! 内存管理、信号投递等都不在调度核心里，平台通过 [`TrapHandlers`] 接入。

use core::fmt;

use super::entry_common::{EntryState, PtRegs};
use super::syscall::sched_syscall;
use crate::errno::Errno;
use crate::sched::hooks::{IpiKind, SchedHooks};
use crate::sched::Scheduler;

/// ESR_EL1.EC 异常类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Unknown,
    Wfx,
    FpAccess,
    Bti,
    Svc64,
    SysReg,
    SveAccess,
    Pac,
    InstrAbortLow,
    InstrAbortCur,
    PcAlign,
    DataAbortLow,
    DataAbortCur,
    SpAlign,
    FpException,
    SError,
    BreakpointLow,
    BreakpointCur,
    SoftStepLow,
    SoftStepCur,
    WatchpointLow,
    WatchpointCur,
    Brk64,
    Other(u8),
}

impl ExceptionClass {
    pub const ESR_EC_SHIFT: u64 = 26;
    pub const ESR_EC_MASK: u64 = 0x3f;

    pub fn from_esr(esr: u64) -> Self {
        let ec = ((esr >> Self::ESR_EC_SHIFT) & Self::ESR_EC_MASK) as u8;
        match ec {
            0x00 => ExceptionClass::Unknown,
            0x01 => ExceptionClass::Wfx,
            0x07 => ExceptionClass::FpAccess,
            0x0d => ExceptionClass::Bti,
            0x15 => ExceptionClass::Svc64,
            0x18 => ExceptionClass::SysReg,
            0x19 => ExceptionClass::SveAccess,
            0x1c => ExceptionClass::Pac,
            0x20 => ExceptionClass::InstrAbortLow,
            0x21 => ExceptionClass::InstrAbortCur,
            0x22 => ExceptionClass::PcAlign,
            0x24 => ExceptionClass::DataAbortLow,
            0x25 => ExceptionClass::DataAbortCur,
            0x26 => ExceptionClass::SpAlign,
            0x2c => ExceptionClass::FpException,
            0x2f => ExceptionClass::SError,
            0x30 => ExceptionClass::BreakpointLow,
            0x31 => ExceptionClass::BreakpointCur,
            0x32 => ExceptionClass::SoftStepLow,
            0x33 => ExceptionClass::SoftStepCur,
            0x34 => ExceptionClass::WatchpointLow,
            0x35 => ExceptionClass::WatchpointCur,
            0x3c => ExceptionClass::Brk64,
            other => ExceptionClass::Other(other),
        }
    }

    pub fn is_debug(&self) -> bool {
        matches!(
            self,
            ExceptionClass::BreakpointLow
                | ExceptionClass::BreakpointCur
                | ExceptionClass::SoftStepLow
                | ExceptionClass::SoftStepCur
                | ExceptionClass::WatchpointLow
                | ExceptionClass::WatchpointCur
                | ExceptionClass::Brk64
        )
    }
}

impl fmt::Display for ExceptionClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExceptionClass::Other(ec) => write!(f, "EC {:#04x}", ec),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// 向量表里的 16 个入口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    El1tSync,
    El1tIrq,
    El1tFiq,
    El1tError,
    El1hSync,
    El1hIrq,
    El1hFiq,
    El1hError,
    El0tSync64,
    El0tIrq64,
    El0tFiq64,
    El0tError64,
    El0tSync32,
    El0tIrq32,
    El0tFiq32,
    El0tError32,
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 中断控制器应答出来的中断源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    /// 本地 tick 定时器
    Timer,
    Ipi(IpiKind),
    Device(u32),
    Spurious,
}

/// 中断控制器
pub trait IrqChip: Send + Sync {
    /// 应答最高优先级的挂起中断
    fn ack(&self, cpu: usize) -> IrqSource;

    fn eoi(&self, _cpu: usize, _src: IrqSource) {}

    fn handle_device_irq(&self, _cpu: usize, _irq: u32) {}
}

/// 调度核心之外的异常处理
///
/// 默认实现只记录日志；需要 `force_sig` 的地方由平台覆盖。
pub trait TrapHandlers: Send + Sync {
    /// 调度之外的系统调用，返回值写回 x0
    fn do_syscall(&self, _cpu: usize, _regs: &mut PtRegs) -> i64 {
        Errno::FunctionNotImplemented.as_neg_i32() as i64
    }

    fn do_mem_abort(&self, _far: u64, esr: u64, regs: &mut PtRegs) {
        log::warn!("trap: unhandled abort esr={:#x} pc={:#x}", esr, regs.pc);
    }

    fn do_fpsimd_acc(&self, _esr: u64, _regs: &mut PtRegs) {}

    fn do_fpsimd_exc(&self, esr: u64, regs: &mut PtRegs) {
        log::warn!("trap: FP exception esr={:#x} pc={:#x}", esr, regs.pc);
    }

    fn do_sve_acc(&self, _esr: u64, _regs: &mut PtRegs) {}

    fn do_debug_exception(&self, _far: u64, esr: u64, regs: &mut PtRegs) {
        log::debug!("trap: debug exception esr={:#x} pc={:#x}", esr, regs.pc);
    }

    fn do_sp_pc_abort(&self, far: u64, esr: u64, regs: &mut PtRegs) {
        log::warn!("trap: SP/PC alignment fault far={:#x} esr={:#x} pc={:#x}", far, esr, regs.pc);
    }

    fn do_ptrauth_fault(&self, esr: u64, regs: &mut PtRegs) {
        log::warn!("trap: pointer authentication failure esr={:#x} pc={:#x}", esr, regs.pc);
    }

    fn do_bti(&self, regs: &mut PtRegs) {
        log::warn!("trap: BTI violation pc={:#x}", regs.pc);
    }

    fn do_undefinstr(&self, esr: u64, regs: &mut PtRegs) {
        log::warn!("trap: undefined instruction esr={:#x} pc={:#x}", esr, regs.pc);
    }

    fn do_serror(&self, esr: u64, regs: &mut PtRegs) {
        log::error!("trap: SError esr={:#x} pc={:#x}", esr, regs.pc);
    }
}

/// 只用默认处理的平台
pub struct DefaultTraps;

impl TrapHandlers for DefaultTraps {}

/// 异常分发器
pub struct Exceptions<'a> {
    sched: &'a Scheduler,
    hooks: &'a dyn SchedHooks,
    entry: &'a EntryState,
    chip: &'a dyn IrqChip,
    traps: &'a dyn TrapHandlers,
}

impl<'a> Exceptions<'a> {
    pub fn new(
        sched: &'a Scheduler,
        hooks: &'a dyn SchedHooks,
        entry: &'a EntryState,
        chip: &'a dyn IrqChip,
        traps: &'a dyn TrapHandlers,
    ) -> Self {
        Self { sched, hooks, entry, chip, traps }
    }

    pub fn entry(&self) -> &EntryState {
        self.entry
    }

    // -----------------------------------------------------------------
    // 中断
    // -----------------------------------------------------------------

    fn handle_irq_source(&self, cpu: usize, user: bool) {
        let src = self.chip.ack(cpu);
        match src {
            IrqSource::Spurious => return,
            IrqSource::Timer => self.sched.timer_interrupt(cpu, user),
            IrqSource::Ipi(IpiKind::Reschedule) | IrqSource::Ipi(IpiKind::NohzKick) => self.sched.scheduler_ipi(cpu),
            IrqSource::Ipi(IpiKind::RtPush) => self.sched.rto_push_irq_work(cpu),
            IrqSource::Ipi(IpiKind::CallFunction) => self.hooks.smp_call_pending(cpu),
            IrqSource::Device(irq) => self.chip.handle_device_irq(cpu, irq),
        }
        self.chip.eoi(cpu, src);
    }

    /// 中断处理主体：计入硬中断上下文，必要时切到 IRQ 栈
    fn do_interrupt_handler(&self, cpu: usize, user: bool) {
        self.entry.irq_enter_rcu(cpu);
        if self.entry.on_thread_stack(cpu) {
            self.entry.call_on_irq_stack(cpu, || self.handle_irq_source(cpu, user));
        } else {
            self.handle_irq_source(cpu, user);
        }
        self.entry.irq_exit_rcu(self.sched, cpu);
    }

    /// 内核态 IRQ/FIQ
    pub fn el1_interrupt(&self, cpu: usize, regs: &mut PtRegs) {
        let state = self.entry.enter_from_kernel_mode(self.hooks, cpu);
        self.do_interrupt_handler(cpu, false);
        self.entry.arm64_preempt_schedule_irq(self.sched, cpu, regs);
        self.entry.exit_to_kernel_mode(self.hooks, cpu, regs, state);
    }

    /// 用户态 IRQ/FIQ
    pub fn el0_interrupt(&self, cpu: usize, regs: &mut PtRegs) {
        self.entry.enter_from_user_mode(cpu);
        self.do_interrupt_handler(cpu, true);
        self.entry.exit_to_user_mode(self.sched, cpu);
    }

    // -----------------------------------------------------------------
    // 同步异常
    // -----------------------------------------------------------------

    pub fn el1h_64_sync_handler(&self, cpu: usize, regs: &mut PtRegs, esr: u64, far: u64) {
        let ec = ExceptionClass::from_esr(esr);
        if ec.is_debug() {
            let lockdep = self.entry.arm64_enter_el1_dbg(self.hooks, cpu);
            self.traps.do_debug_exception(far, esr, regs);
            self.entry.arm64_exit_el1_dbg(self.hooks, cpu, lockdep);
            return;
        }
        let state = self.entry.enter_from_kernel_mode(self.hooks, cpu);
        match ec {
            ExceptionClass::DataAbortCur | ExceptionClass::InstrAbortCur => self.traps.do_mem_abort(far, esr, regs),
            ExceptionClass::SpAlign | ExceptionClass::PcAlign => self.traps.do_sp_pc_abort(far, esr, regs),
            ExceptionClass::SysReg | ExceptionClass::Unknown => self.traps.do_undefinstr(esr, regs),
            ExceptionClass::FpAccess | ExceptionClass::SveAccess => self.traps.do_fpsimd_acc(esr, regs),
            ExceptionClass::Bti => self.traps.do_bti(regs),
            ExceptionClass::Pac => self.traps.do_ptrauth_fault(esr, regs),
            _ => __panic_unhandled(Vector::El1hSync, esr, regs),
        }
        self.entry.exit_to_kernel_mode(self.hooks, cpu, regs, state);
    }

    pub fn el0t_64_sync_handler(&self, cpu: usize, regs: &mut PtRegs, esr: u64, far: u64) {
        self.entry.enter_from_user_mode(cpu);
        match ExceptionClass::from_esr(esr) {
            ExceptionClass::Svc64 => {
                let ret = match sched_syscall(self.sched, cpu, regs) {
                    Some(r) => r,
                    None => self.traps.do_syscall(cpu, regs),
                };
                regs.regs[0] = ret as u64;
            }
            ExceptionClass::DataAbortLow | ExceptionClass::InstrAbortLow => self.traps.do_mem_abort(far, esr, regs),
            ExceptionClass::FpAccess => self.traps.do_fpsimd_acc(esr, regs),
            ExceptionClass::SveAccess => self.traps.do_sve_acc(esr, regs),
            ExceptionClass::FpException => self.traps.do_fpsimd_exc(esr, regs),
            ExceptionClass::SpAlign | ExceptionClass::PcAlign => self.traps.do_sp_pc_abort(far, esr, regs),
            ExceptionClass::Pac => self.traps.do_ptrauth_fault(esr, regs),
            ExceptionClass::Bti => self.traps.do_bti(regs),
            ec if ec.is_debug() => self.traps.do_debug_exception(far, esr, regs),
            _ => self.traps.do_undefinstr(esr, regs),
        }
        self.entry.exit_to_user_mode(self.sched, cpu);
    }

    pub fn el1h_64_irq_handler(&self, cpu: usize, regs: &mut PtRegs) {
        self.el1_interrupt(cpu, regs);
    }

    pub fn el1h_64_fiq_handler(&self, cpu: usize, regs: &mut PtRegs) {
        self.el1_interrupt(cpu, regs);
    }

    pub fn el0t_64_irq_handler(&self, cpu: usize, regs: &mut PtRegs) {
        self.el0_interrupt(cpu, regs);
    }

    pub fn el0t_64_fiq_handler(&self, cpu: usize, regs: &mut PtRegs) {
        self.el0_interrupt(cpu, regs);
    }

    /// SError 无论从哪一级进入都按 NMI 处理
    pub fn el1h_64_error_handler(&self, cpu: usize, regs: &mut PtRegs, esr: u64) {
        let lockdep = self.entry.arm64_enter_nmi(self.hooks, cpu);
        self.traps.do_serror(esr, regs);
        self.entry.arm64_exit_nmi(self.hooks, cpu, lockdep);
    }

    pub fn el0t_64_error_handler(&self, cpu: usize, regs: &mut PtRegs, esr: u64) {
        self.entry.enter_from_user_mode(cpu);
        let lockdep = self.entry.arm64_enter_nmi(self.hooks, cpu);
        self.traps.do_serror(esr, regs);
        self.entry.arm64_exit_nmi(self.hooks, cpu, lockdep);
        self.entry.exit_to_user_mode(self.sched, cpu);
    }

    /// 不应该发生的向量（EL1t、AArch32）
    pub fn unhandled(&self, vector: Vector, regs: &PtRegs, esr: u64) -> ! {
        __panic_unhandled(vector, esr, regs)
    }
}

/// 打印寄存器现场后停机
pub fn __panic_unhandled(vector: Vector, esr: u64, regs: &PtRegs) -> ! {
    log::error!(
        "trap: unhandled {} exception, ESR {:#010x} -- {}",
        vector,
        esr,
        ExceptionClass::from_esr(esr)
    );
    log::error!("pc : {:#018x} sp : {:#018x} pstate : {:#010x}", regs.pc, regs.sp, regs.pstate);
    for (i, pair) in regs.regs.chunks(2).enumerate() {
        match pair {
            [a, b] => log::error!("x{:<2}: {:#018x} x{:<2}: {:#018x}", 2 * i, a, 2 * i + 1, b),
            [a] => log::error!("x{:<2}: {:#018x}", 2 * i, a),
            _ => {}
        }
    }
    crate::sched::bug(format_args!("unhandled exception on {}", vector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::entry_common::{HARDIRQ_OFFSET, PSR_I_BIT, PSR_MODE_EL1H};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use crate::cmdline::BootParams;
    use crate::config::TICK_NSEC;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;
    use crate::sched::SchedAttr;
    use spin::Mutex;

    /// 按顺序吐出预先排好的中断源
    struct ScriptedChip {
        queue: Mutex<Vec<IrqSource>>,
        eoi: Mutex<Vec<IrqSource>>,
    }

    impl ScriptedChip {
        fn new(srcs: &[IrqSource]) -> Self {
            let mut q = srcs.to_vec();
            q.reverse();
            Self { queue: Mutex::new(q), eoi: Mutex::new(Vec::new()) }
        }
    }

    impl IrqChip for ScriptedChip {
        fn ack(&self, _cpu: usize) -> IrqSource {
            self.queue.lock().pop().unwrap_or(IrqSource::Spurious)
        }

        fn eoi(&self, _cpu: usize, src: IrqSource) {
            self.eoi.lock().push(src);
        }
    }

    fn sched(clock: &Arc<ManualClock>) -> Scheduler {
        Scheduler::with_boot_params(ArchTopology::flat(1), clock.clone(), Arc::new(NoopHooks), BootParams::new())
    }

    fn kernel_regs() -> PtRegs {
        PtRegs { pstate: PSR_MODE_EL1H, ..PtRegs::default() }
    }

    #[test]
    fn esr_classes() {
        assert_eq!(ExceptionClass::from_esr(0x15 << 26), ExceptionClass::Svc64);
        assert_eq!(ExceptionClass::from_esr((0x25 << 26) | 0x7), ExceptionClass::DataAbortCur);
        assert_eq!(ExceptionClass::from_esr(0x3f << 26), ExceptionClass::Other(0x3f));
        assert!(ExceptionClass::from_esr(0x3c << 26).is_debug());
    }

    #[test]
    fn timer_irq_ticks_and_preempts_on_kernel_exit() {
        let clock = Arc::new(ManualClock::new(1));
        let s = sched(&clock);
        let a = s.spawn("a", SchedAttr::normal(0), None).unwrap();
        let b = s.spawn("b", SchedAttr::normal(0), None).unwrap();
        s.schedule_on(0, false);
        let first = s.curr_on(0);
        assert!(first == a || first == b);

        let entry = EntryState::new(1);
        let chip = ScriptedChip::new(&[]);
        let hooks = NoopHooks;
        let exc = Exceptions::new(&s, &hooks, &entry, &chip, &DefaultTraps);

        // 跑满一个调度周期，tick 会要求切换
        for _ in 0..(30_000_000 / TICK_NSEC) {
            clock.advance(TICK_NSEC);
            chip.queue.lock().push(IrqSource::Timer);
            let mut regs = kernel_regs();
            exc.el1h_64_irq_handler(0, &mut regs);
            if s.curr_on(0) != first {
                break;
            }
        }
        assert_ne!(s.curr_on(0), first);
        assert_eq!(entry.preempt_count(0), 0);
        assert!(chip.eoi.lock().iter().all(|e| *e == IrqSource::Timer));
    }

    #[test]
    fn masked_kernel_context_is_not_preempted() {
        let clock = Arc::new(ManualClock::new(1));
        let s = sched(&clock);
        let _a = s.spawn("a", SchedAttr::normal(0), None).unwrap();
        let entry = EntryState::new(1);
        let chip = ScriptedChip::new(&[IrqSource::Ipi(IpiKind::Reschedule)]);
        let hooks = NoopHooks;
        let exc = Exceptions::new(&s, &hooks, &entry, &chip, &DefaultTraps);

        // idle 在跑，新任务已经让它 need_resched
        assert!(s.need_resched(0));
        let mut regs = PtRegs { pstate: PSR_MODE_EL1H | PSR_I_BIT, ..PtRegs::default() };
        exc.el1h_64_irq_handler(0, &mut regs);
        assert_eq!(s.curr_on(0), crate::sched::rq::IDLE_PID);

        let mut regs = kernel_regs();
        chip.queue.lock().push(IrqSource::Spurious);
        exc.el1h_64_irq_handler(0, &mut regs);
        assert_ne!(s.curr_on(0), crate::sched::rq::IDLE_PID);
    }

    #[test]
    fn nmi_path_never_schedules() {
        let clock = Arc::new(ManualClock::new(1));
        let s = sched(&clock);
        let _a = s.spawn("a", SchedAttr::normal(0), None).unwrap();
        let entry = EntryState::new(1);
        let chip = ScriptedChip::new(&[]);
        let hooks = NoopHooks;
        let exc = Exceptions::new(&s, &hooks, &entry, &chip, &DefaultTraps);

        let mut regs = kernel_regs();
        exc.el1h_64_error_handler(0, &mut regs, 0x2f << 26);
        assert_eq!(s.curr_on(0), crate::sched::rq::IDLE_PID);
        assert_eq!(entry.preempt_count(0), 0);
    }

    #[test]
    fn svc_from_user_returns_in_x0() {
        let clock = Arc::new(ManualClock::new(1));
        let s = sched(&clock);
        let entry = EntryState::new(1);
        let chip = ScriptedChip::new(&[]);
        let hooks = NoopHooks;
        let exc = Exceptions::new(&s, &hooks, &entry, &chip, &DefaultTraps);

        let mut regs = PtRegs::default();
        regs.regs[8] = 125;
        regs.regs[0] = 1;
        exc.el0t_64_sync_handler(0, &mut regs, 0x15 << 26, 0);
        assert_eq!(regs.regs[0], 99);

        regs.regs[8] = 64;
        exc.el0t_64_sync_handler(0, &mut regs, 0x15 << 26, 0);
        assert_eq!(regs.regs[0] as i64, -38);
    }

    #[test]
    fn hardirq_count_is_held_during_the_handler() {
        struct Probe<'a>(&'a EntryState, Mutex<u32>);
        impl IrqChip for Probe<'_> {
            fn ack(&self, cpu: usize) -> IrqSource {
                *self.1.lock() = self.0.preempt_count(cpu);
                IrqSource::Device(42)
            }
        }
        let clock = Arc::new(ManualClock::new(1));
        let s = sched(&clock);
        let entry = EntryState::new(1);
        let probe = Probe(&entry, Mutex::new(0));
        let hooks = NoopHooks;
        let exc = Exceptions::new(&s, &hooks, &entry, &probe, &DefaultTraps);
        let mut regs = PtRegs::default();
        exc.el0t_64_irq_handler(0, &mut regs);
        assert_eq!(*probe.1.lock(), HARDIRQ_OFFSET);
        assert_eq!(entry.preempt_count(0), 0);
    }

    #[test]
    #[should_panic(expected = "unhandled exception")]
    fn unknown_kernel_sync_is_fatal() {
        let clock = Arc::new(ManualClock::new(1));
        let s = sched(&clock);
        let entry = EntryState::new(1);
        let chip = ScriptedChip::new(&[]);
        let hooks = NoopHooks;
        let exc = Exceptions::new(&s, &hooks, &entry, &chip, &DefaultTraps);
        let mut regs = kernel_regs();
        exc.el1h_64_sync_handler(0, &mut regs, 0x15 << 26, 0);
    }
}
