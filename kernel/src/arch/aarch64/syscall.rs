//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! ARMv8 调度类系统调用分发
//!
//! SVC #0 进入后系统调用号在 x8，参数在 x0-x5，返回值写回 x0。
//! 这里只处理参数全是标量的调度调用；需要拷贝用户内存的调用
//! （sched_setattr 等）交给平台的 [`TrapHandlers::do_syscall`](super::trap::TrapHandlers)。

use super::entry_common::PtRegs;
use crate::errno::Errno;
use crate::process::{Pid, SchedPolicy};
use crate::sched::syscalls::PrioWhich;
use crate::sched::Scheduler;

/// aarch64 通用系统调用号（仅调度相关部分）
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyscallNo {
    SchedSetparam = 118,
    SchedSetscheduler = 119,
    SchedGetscheduler = 120,
    SchedGetparam = 121,
    SchedSetaffinity = 122,
    SchedGetaffinity = 123,
    SchedYield = 124,
    SchedGetPriorityMax = 125,
    SchedGetPriorityMin = 126,
    SchedRrGetInterval = 127,
    Setpriority = 140,
    Getpriority = 141,
    SchedSetattr = 274,
    SchedGetattr = 275,
}

impl SyscallNo {
    pub fn from_u64(nr: u64) -> Option<Self> {
        Some(match nr {
            118 => SyscallNo::SchedSetparam,
            119 => SyscallNo::SchedSetscheduler,
            120 => SyscallNo::SchedGetscheduler,
            121 => SyscallNo::SchedGetparam,
            122 => SyscallNo::SchedSetaffinity,
            123 => SyscallNo::SchedGetaffinity,
            124 => SyscallNo::SchedYield,
            125 => SyscallNo::SchedGetPriorityMax,
            126 => SyscallNo::SchedGetPriorityMin,
            127 => SyscallNo::SchedRrGetInterval,
            140 => SyscallNo::Setpriority,
            141 => SyscallNo::Getpriority,
            274 => SyscallNo::SchedSetattr,
            275 => SyscallNo::SchedGetattr,
            _ => return None,
        })
    }
}

const PRIO_PROCESS: u64 = 0;

fn neg(e: Errno) -> i64 {
    e.as_neg_i32() as i64
}

/// pid 参数为 0 表示调用者自己
fn target(sched: &Scheduler, cpu: usize, pid: u64) -> Pid {
    if pid == 0 {
        sched.curr_on(cpu)
    } else {
        pid as Pid
    }
}

/// 处理标量参数的调度系统调用
///
/// 返回 `None` 表示这个调用不在这里处理。
pub fn sched_syscall(sched: &Scheduler, cpu: usize, regs: &PtRegs) -> Option<i64> {
    let nr = SyscallNo::from_u64(regs.regs[8])?;
    let a = &regs.regs;
    let ret = match nr {
        SyscallNo::SchedYield => {
            sched.sched_yield_on(cpu);
            0
        }
        SyscallNo::SchedGetPriorityMax | SyscallNo::SchedGetPriorityMin => match SchedPolicy::from_u32(a[0] as u32) {
            Some(policy) if nr == SyscallNo::SchedGetPriorityMax => Scheduler::sched_get_priority_max(policy) as i64,
            Some(policy) => Scheduler::sched_get_priority_min(policy) as i64,
            None => neg(Errno::InvalidArgument),
        },
        SyscallNo::SchedGetscheduler => match sched.sched_getscheduler(target(sched, cpu, a[0])) {
            Ok(policy) => policy as i64,
            Err(e) => neg(e.to_errno()),
        },
        SyscallNo::Setpriority | SyscallNo::Getpriority => {
            if a[0] != PRIO_PROCESS {
                return Some(neg(Errno::InvalidArgument));
            }
            let who = target(sched, cpu, a[1]);
            let r = if nr == SyscallNo::Setpriority {
                sched.setpriority(PrioWhich::Process, who, a[2] as i64 as i32).map(|_| 0)
            } else {
                sched.getpriority(PrioWhich::Process, who).map(i64::from)
            };
            r.unwrap_or_else(|e| neg(e.to_errno()))
        }
        _ => return None,
    };
    Some(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use crate::cmdline::BootParams;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;

    fn single_cpu() -> Scheduler {
        Scheduler::with_boot_params(ArchTopology::flat(1), Arc::new(ManualClock::new(1)), Arc::new(NoopHooks), BootParams::new())
    }

    fn call(sched: &Scheduler, nr: SyscallNo, args: &[u64]) -> Option<i64> {
        let mut regs = PtRegs::default();
        regs.regs[8] = nr as u64;
        regs.regs[..args.len()].copy_from_slice(args);
        sched_syscall(sched, 0, &regs)
    }

    #[test]
    fn priority_range_by_number() {
        let s = single_cpu();
        assert_eq!(call(&s, SyscallNo::SchedGetPriorityMax, &[SchedPolicy::Fifo as u64]), Some(99));
        assert_eq!(call(&s, SyscallNo::SchedGetPriorityMin, &[SchedPolicy::Rr as u64]), Some(1));
        assert_eq!(call(&s, SyscallNo::SchedGetPriorityMax, &[SchedPolicy::Normal as u64]), Some(0));
        assert_eq!(call(&s, SyscallNo::SchedGetPriorityMax, &[42]), Some(-22));
    }

    #[test]
    fn nice_by_number() {
        let s = single_cpu();
        let pid = s
            .spawn("worker", crate::sched::SchedAttr::normal(0), None)
            .expect("spawn");
        assert_eq!(call(&s, SyscallNo::Setpriority, &[PRIO_PROCESS, pid as u64, 5]), Some(0));
        assert_eq!(call(&s, SyscallNo::Getpriority, &[PRIO_PROCESS, pid as u64]), Some(15));
        assert_eq!(call(&s, SyscallNo::Getpriority, &[1, pid as u64]), Some(-22));
        assert_eq!(call(&s, SyscallNo::Getpriority, &[PRIO_PROCESS, 9999]), Some(-3));
    }

    #[test]
    fn pointer_calls_are_left_to_the_platform() {
        let s = single_cpu();
        assert_eq!(call(&s, SyscallNo::SchedSetattr, &[0, 0, 0]), None);
        let mut regs = PtRegs::default();
        regs.regs[8] = 64;
        assert_eq!(sched_syscall(&s, 0, &regs), None);
    }
}
