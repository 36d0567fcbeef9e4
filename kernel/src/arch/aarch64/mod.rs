//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! ARMv8 异常入口胶水
//!
//! 汇编向量表保存现场后调用这里导出的 `el*_handler` 符号，
//! 它们取出本 CPU 号和 ESR/FAR，交给已安装的 [`Exceptions`]。

pub mod entry_common;
pub mod syscall;
pub mod trap;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod cpu;

pub use entry_common::{EntryState, IrqEntryState, PtRegs};
pub use trap::{DefaultTraps, ExceptionClass, Exceptions, IrqChip, IrqSource, TrapHandlers, Vector};

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod vectors {
    use super::cpu::{core_id, read_esr_el1, read_far_el1};
    use super::{Exceptions, PtRegs, Vector};
    use spin::Once;

    static EXCEPTIONS: Once<Exceptions<'static>> = Once::new();

    /// 安装异常分发器，只有第一次调用生效
    pub fn install(exc: Exceptions<'static>) {
        EXCEPTIONS.call_once(|| exc);
    }

    fn exceptions(vector: Vector, regs: &PtRegs) -> &'static Exceptions<'static> {
        match EXCEPTIONS.get() {
            Some(e) => e,
            None => super::trap::__panic_unhandled(vector, read_esr_el1(), regs),
        }
    }

    #[no_mangle]
    extern "C" fn el1h_64_sync_handler(regs: &mut PtRegs) {
        let esr = read_esr_el1();
        let far = read_far_el1();
        exceptions(Vector::El1hSync, regs).el1h_64_sync_handler(core_id(), regs, esr, far);
    }

    #[no_mangle]
    extern "C" fn el1h_64_irq_handler(regs: &mut PtRegs) {
        exceptions(Vector::El1hIrq, regs).el1h_64_irq_handler(core_id(), regs);
    }

    #[no_mangle]
    extern "C" fn el1h_64_fiq_handler(regs: &mut PtRegs) {
        exceptions(Vector::El1hFiq, regs).el1h_64_fiq_handler(core_id(), regs);
    }

    #[no_mangle]
    extern "C" fn el1h_64_error_handler(regs: &mut PtRegs) {
        let esr = read_esr_el1();
        exceptions(Vector::El1hError, regs).el1h_64_error_handler(core_id(), regs, esr);
    }

    #[no_mangle]
    extern "C" fn el0t_64_sync_handler(regs: &mut PtRegs) {
        let esr = read_esr_el1();
        let far = read_far_el1();
        exceptions(Vector::El0tSync64, regs).el0t_64_sync_handler(core_id(), regs, esr, far);
    }

    #[no_mangle]
    extern "C" fn el0t_64_irq_handler(regs: &mut PtRegs) {
        exceptions(Vector::El0tIrq64, regs).el0t_64_irq_handler(core_id(), regs);
    }

    #[no_mangle]
    extern "C" fn el0t_64_fiq_handler(regs: &mut PtRegs) {
        exceptions(Vector::El0tFiq64, regs).el0t_64_fiq_handler(core_id(), regs);
    }

    #[no_mangle]
    extern "C" fn el0t_64_error_handler(regs: &mut PtRegs) {
        let esr = read_esr_el1();
        exceptions(Vector::El0tError64, regs).el0t_64_error_handler(core_id(), regs, esr);
    }

    /// EL1t 与 AArch32 向量不应该被触发
    #[no_mangle]
    extern "C" fn bad_mode_handler(regs: &mut PtRegs, vector: u64) -> ! {
        let v = match vector {
            0 => Vector::El1tSync,
            1 => Vector::El1tIrq,
            2 => Vector::El1tFiq,
            3 => Vector::El1tError,
            12 => Vector::El0tSync32,
            13 => Vector::El0tIrq32,
            14 => Vector::El0tFiq32,
            _ => Vector::El0tError32,
        };
        super::trap::__panic_unhandled(v, read_esr_el1(), regs)
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use vectors::install;
