//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 任务控制块 (Task Control Block)
//!
//! [`Task`] 是跨 CPU 共享的任务句柄，只保存可以无锁访问的状态：
//! 运行状态字、所在 CPU、`on_rq`/`on_cpu`、thread-info 标志，以及受
//! `pi_lock` 保护的 CPU 亲和性。各调度类的实体（fair/rt/dl）和优先级
//! 属于运行队列，见 `sched::entity::SchedTask`，只能在持有所在 rq 锁时访问。

use crate::cpumask::CpuMask;
use alloc::string::String;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

pub type Pid = u32;

bitflags::bitflags! {
    /// 任务运行状态 (`__state`)
    ///
    /// `RUNNING` 是空集，其余状态可以组合（如 `KILLABLE`）。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskState: u32 {
        /// 可中断睡眠
        const INTERRUPTIBLE   = 0x0001;
        /// 不可中断睡眠
        const UNINTERRUPTIBLE = 0x0002;
        /// 被信号停止
        const STOPPED         = 0x0004;
        /// 被 ptrace 跟踪停止
        const TRACED          = 0x0008;
        const PARKED          = 0x0040;
        const DEAD            = 0x0080;
        const WAKEKILL        = 0x0100;
        /// 唤醒中：select_task_rq 与入队之间
        const WAKING          = 0x0200;
        /// 不计入 loadavg 的不可中断睡眠
        const NOLOAD          = 0x0400;
        /// 刚 fork，尚未 wake_up_new_task
        const NEW             = 0x0800;
        /// 等待 rtlock
        const RTLOCK_WAIT     = 0x1000;
    }
}

impl TaskState {
    pub const RUNNING: Self = Self::empty();
    pub const KILLABLE: Self = Self::WAKEKILL.union(Self::UNINTERRUPTIBLE);
    pub const IDLE: Self = Self::UNINTERRUPTIBLE.union(Self::NOLOAD);
    /// `wake_up_process` 可以唤醒的状态
    pub const NORMAL: Self = Self::INTERRUPTIBLE.union(Self::UNINTERRUPTIBLE);

    pub fn is_running(self) -> bool {
        self.is_empty()
    }

    /// 睡眠时是否计入 nr_uninterruptible
    pub fn contributes_to_load(self) -> bool {
        self.contains(Self::UNINTERRUPTIBLE) && !self.contains(Self::NOLOAD)
    }

    /// `/proc` 中的单字母状态
    pub fn as_char(self) -> char {
        if self.is_running() {
            'R'
        } else if self.contains(Self::INTERRUPTIBLE) {
            'S'
        } else if self.contains(Self::UNINTERRUPTIBLE) {
            if self.contains(Self::NOLOAD) { 'I' } else { 'D' }
        } else if self.contains(Self::STOPPED) {
            'T'
        } else if self.contains(Self::TRACED) {
            't'
        } else if self.contains(Self::DEAD) {
            'X'
        } else {
            'P'
        }
    }
}

/// 退出状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitState {
    None = 0,
    /// 已退出，等待父进程回收
    Zombie = 1,
    /// 已回收
    Dead = 2,
}

impl ExitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ExitState::Zombie,
            2 => ExitState::Dead,
            _ => ExitState::None,
        }
    }
}

/// 调度策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SchedPolicy {
    /// 普通分时调度 (SCHED_NORMAL)
    Normal = 0,

    /// FIFO 实时调度 (SCHED_FIFO)
    Fifo = 1,

    /// RR 实时调度 (SCHED_RR)
    Rr = 2,

    /// 批处理调度 (SCHED_BATCH)
    Batch = 3,

    /// 空闲调度 (SCHED_IDLE)
    Idle = 5,

    /// 截止期调度 (SCHED_DEADLINE)
    Deadline = 6,
}

impl SchedPolicy {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => SchedPolicy::Normal,
            1 => SchedPolicy::Fifo,
            2 => SchedPolicy::Rr,
            3 => SchedPolicy::Batch,
            5 => SchedPolicy::Idle,
            6 => SchedPolicy::Deadline,
            _ => return None,
        })
    }

    pub fn is_rt(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }

    pub fn is_dl(self) -> bool {
        self == SchedPolicy::Deadline
    }

    /// 由 fair 类调度的策略
    pub fn is_fair(self) -> bool {
        matches!(self, SchedPolicy::Normal | SchedPolicy::Batch | SchedPolicy::Idle)
    }
}

bitflags::bitflags! {
    /// 任务标志 (PF_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// 每 CPU idle 任务
        const IDLE            = 0x0000_0002;
        /// 正在退出
        const EXITING         = 0x0000_0004;
        /// 内核线程
        const KTHREAD         = 0x0020_0000;
        /// 不允许修改亲和性
        const NO_SETAFFINITY  = 0x0400_0000;
    }
}

bitflags::bitflags! {
    /// thread_info 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        const SIGPENDING      = 1 << 0;
        const NEED_RESCHED    = 1 << 1;
        const NOTIFY_RESUME   = 1 << 2;
        /// idle 任务正在轮询 NEED_RESCHED，不需要 IPI
        const POLLING_NRFLAG  = 1 << 3;
    }
}

/// `on_rq` 取值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OnRq {
    None = 0,
    Queued = 1,
    /// 正在迁移，观察者必须等待或推迟
    Migrating = 2,
}

impl OnRq {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => OnRq::Queued,
            2 => OnRq::Migrating,
            _ => OnRq::None,
        }
    }
}

/// 受 `pi_lock` 保护的亲和性状态
#[derive(Debug, Clone, Copy)]
pub struct Affinity {
    pub cpus_mask: CpuMask,
    /// 用户通过 sched_setaffinity 请求的掩码
    pub user_cpus_mask: Option<CpuMask>,
    /// migrate_disable 嵌套深度
    pub migration_disabled: u32,
}

impl Affinity {
    pub fn nr_cpus_allowed(&self) -> u32 {
        self.cpus_mask.weight() as u32
    }
}

/// 任务句柄
pub struct Task {
    pid: Pid,
    tgid: Pid,
    comm: String,

    /// 任务状态 (volatile, 多核可见)
    state: AtomicU32,
    exit_state: AtomicU8,
    flags: AtomicU32,
    thread_flags: AtomicU32,

    /// 所在 CPU；只有同时持有新旧两个 rq 锁时才修改
    cpu: AtomicUsize,
    /// 远程唤醒的目标 CPU
    wake_cpu: AtomicUsize,
    on_rq: AtomicU8,
    on_cpu: AtomicBool,
    /// 通过 wake list 唤醒（目标 CPU 处理）
    sched_remote_wakeup: AtomicBool,

    /// 保护亲和性；加锁顺序 pi_lock -> rq lock
    pub pi_lock: Mutex<Affinity>,

    /// 自愿/非自愿上下文切换次数
    pub nvcsw: AtomicU64,
    pub nivcsw: AtomicU64,
    /// 按 tick 采样的用户态/内核态时间，纳秒
    pub utime: AtomicU64,
    pub stime: AtomicU64,

    start_time: u64,
}

impl Task {
    pub fn new(pid: Pid, tgid: Pid, comm: &str, cpu: usize, cpus_mask: CpuMask, start_time: u64) -> Self {
        Self {
            pid,
            tgid,
            comm: String::from(comm),
            state: AtomicU32::new(TaskState::NEW.bits()),
            exit_state: AtomicU8::new(ExitState::None as u8),
            flags: AtomicU32::new(0),
            thread_flags: AtomicU32::new(0),
            cpu: AtomicUsize::new(cpu),
            wake_cpu: AtomicUsize::new(cpu),
            on_rq: AtomicU8::new(OnRq::None as u8),
            on_cpu: AtomicBool::new(false),
            sched_remote_wakeup: AtomicBool::new(false),
            pi_lock: Mutex::new(Affinity {
                cpus_mask,
                user_cpus_mask: None,
                migration_disabled: 0,
            }),
            nvcsw: AtomicU64::new(0),
            nivcsw: AtomicU64::new(0),
            utime: AtomicU64::new(0),
            stime: AtomicU64::new(0),
            start_time,
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn tgid(&self) -> Pid {
        self.tgid
    }

    pub fn comm(&self) -> &str {
        &self.comm
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    /// 设置状态，不带屏障（唤醒者侧或持有 rq 锁时使用）
    #[inline]
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    /// `set_current_state`：写状态后带全屏障，使随后的条件检查
    /// 不会被重排到睡眠之前
    #[inline]
    pub fn set_current_state(&self, state: TaskState) {
        self.state.store(state.bits(), Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// 若当前状态与 `mask` 有交集则切换到 `new`，返回旧状态
    pub fn cmpxchg_state(&self, mask: TaskState, new: TaskState) -> Result<TaskState, TaskState> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let st = TaskState::from_bits_retain(cur);
            if !st.intersects(mask) {
                return Err(st);
            }
            match self.state.compare_exchange_weak(cur, new.bits(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(st),
                Err(v) => cur = v,
            }
        }
    }

    pub fn exit_state(&self) -> ExitState {
        ExitState::from_u8(self.exit_state.load(Ordering::Acquire))
    }

    pub fn set_exit_state(&self, s: ExitState) {
        self.exit_state.store(s as u8, Ordering::Release);
    }

    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, f: TaskFlags) {
        self.flags.fetch_or(f.bits(), Ordering::Relaxed);
    }

    pub fn is_idle_task(&self) -> bool {
        self.flags().contains(TaskFlags::IDLE)
    }

    #[inline]
    pub fn task_cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub fn wake_cpu(&self) -> usize {
        self.wake_cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wake_cpu(&self, cpu: usize) {
        self.wake_cpu.store(cpu, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_rq(&self) -> OnRq {
        OnRq::from_u8(self.on_rq.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_on_rq(&self, v: OnRq) {
        self.on_rq.store(v as u8, Ordering::Release);
    }

    #[inline]
    pub fn on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    /// 上下文切换时由 release 写入，远程唤醒方用 acquire 读取
    #[inline]
    pub(crate) fn set_on_cpu(&self, v: bool) {
        self.on_cpu.store(v, Ordering::Release);
    }

    pub(crate) fn set_remote_wakeup(&self, v: bool) {
        self.sched_remote_wakeup.store(v, Ordering::Release);
    }

    pub fn remote_wakeup(&self) -> bool {
        self.sched_remote_wakeup.load(Ordering::Acquire)
    }

    #[inline]
    pub fn thread_flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.thread_flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn need_resched(&self) -> bool {
        self.thread_flags().contains(ThreadFlags::NEED_RESCHED)
    }

    /// 置 NEED_RESCHED，返回之前是否在轮询（轮询中无需 IPI）
    pub(crate) fn set_need_resched_polling(&self) -> bool {
        let old = ThreadFlags::from_bits_retain(
            self.thread_flags.fetch_or(ThreadFlags::NEED_RESCHED.bits(), Ordering::AcqRel),
        );
        old.contains(ThreadFlags::POLLING_NRFLAG)
    }

    pub(crate) fn clear_need_resched(&self) {
        self.thread_flags.fetch_and(!ThreadFlags::NEED_RESCHED.bits(), Ordering::AcqRel);
    }

    pub(crate) fn set_polling(&self, on: bool) {
        if on {
            self.thread_flags.fetch_or(ThreadFlags::POLLING_NRFLAG.bits(), Ordering::AcqRel);
        } else {
            self.thread_flags.fetch_and(!ThreadFlags::POLLING_NRFLAG.bits(), Ordering::AcqRel);
        }
    }

    pub fn set_sigpending(&self, on: bool) {
        if on {
            self.thread_flags.fetch_or(ThreadFlags::SIGPENDING.bits(), Ordering::AcqRel);
        } else {
            self.thread_flags.fetch_and(!ThreadFlags::SIGPENDING.bits(), Ordering::AcqRel);
        }
    }

    pub fn cpus_mask(&self) -> CpuMask {
        self.pi_lock.lock().cpus_mask
    }

    pub fn is_migration_disabled(&self) -> bool {
        self.pi_lock.lock().migration_disabled > 0
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("comm", &self.comm)
            .field("state", &self.state())
            .field("cpu", &self.task_cpu())
            .field("on_rq", &self.on_rq())
            .field("on_cpu", &self.on_cpu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let t = Task::new(7, 7, "t", 0, CpuMask::first_n(2), 0);
        assert_eq!(t.state(), TaskState::NEW);
        t.set_current_state(TaskState::INTERRUPTIBLE);
        assert_eq!(t.cmpxchg_state(TaskState::NORMAL, TaskState::WAKING), Ok(TaskState::INTERRUPTIBLE));
        assert!(t.cmpxchg_state(TaskState::NORMAL, TaskState::RUNNING).is_err());
        assert_eq!(TaskState::IDLE.as_char(), 'I');
        assert!(TaskState::UNINTERRUPTIBLE.contributes_to_load());
        assert!(!TaskState::IDLE.contributes_to_load());
    }

    #[test]
    fn resched_and_polling() {
        let t = Task::new(1, 1, "t", 0, CpuMask::of(0), 0);
        assert!(!t.set_need_resched_polling());
        t.clear_need_resched();
        t.set_polling(true);
        assert!(t.set_need_resched_polling());
        assert!(t.need_resched());
    }

    #[test]
    fn policy_decode() {
        assert_eq!(SchedPolicy::from_u32(6), Some(SchedPolicy::Deadline));
        assert_eq!(SchedPolicy::from_u32(4), None);
        assert!(SchedPolicy::Batch.is_fair());
        assert!(SchedPolicy::Rr.is_rt());
    }
}
