//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 标准错误代码定义
//!
//! 调度器只在系统调用边界把内部错误转换成负的 errno：
//! ```rust,ignore
//! use crate::errno::Errno;
//!
//! return Err(SchedError::InvalidAttr.to_errno().as_neg_i32());
//! ```

use core::fmt;

/// 标准错误代码
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    /// Operation not permitted (EPERM, 1)
    OperationNotPermitted = 1,

    /// No such process (ESRCH, 3)
    NoSuchProcess = 3,

    /// Try again (EAGAIN, 11)
    TryAgain = 11,

    /// Out of memory (ENOMEM, 12)
    OutOfMemory = 12,

    /// Bad address (EFAULT, 14)
    BadAddress = 14,

    /// Device or resource busy (EBUSY, 16)
    DeviceOrResourceBusy = 16,

    /// Invalid argument (EINVAL, 22)
    InvalidArgument = 22,

    /// Result too large (ERANGE, 34)
    ResultTooLarge = 34,

    /// Function not implemented (ENOSYS, 38)
    FunctionNotImplemented = 38,
}

impl Errno {
    /// 获取错误代码的正数值（用于比较）
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// 获取错误代码的负数值（用于系统调用返回）
    #[inline]
    pub const fn as_neg_i32(self) -> i32 {
        -(self as i32)
    }

    /// 获取错误代码的负数值（u64，用于系统调用返回）
    #[inline]
    pub const fn as_neg_u64(self) -> u64 {
        (-(self as i32)) as u64
    }
}

/// 常用的错误代码常量
pub mod constants {
    pub const EPERM: i32 = 1;
    pub const ESRCH: i32 = 3;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ERANGE: i32 = 34;
    pub const ENOSYS: i32 = 38;
}

/// 调度器内部错误
///
/// 配置错误和带宽耗尽返回给调用者；迁移失败只在调度器内部使用，
/// 最终退化为“留在原 CPU”，不会出现在系统调用返回值中。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// sched_attr 非法：优先级越界、周期为 0、runtime > deadline ...
    InvalidAttr,
    /// 权限不足（如修改 stop/idle 任务、迁移禁用中的亲和性变更）
    PermissionDenied,
    /// 任务不存在或已退出
    NoSuchTask,
    /// DL 准入控制失败，或带宽配置会超出上级/全局额度
    Busy,
    /// 目标 rq 加锁后不再合适，重试次数用完
    TransientMigration,
}

impl SchedError {
    pub const fn to_errno(self) -> Errno {
        match self {
            SchedError::InvalidAttr => Errno::InvalidArgument,
            SchedError::PermissionDenied => Errno::OperationNotPermitted,
            SchedError::NoSuchTask => Errno::NoSuchProcess,
            SchedError::Busy => Errno::DeviceOrResourceBusy,
            SchedError::TransientMigration => Errno::TryAgain,
        }
    }
}

impl From<SchedError> for Errno {
    fn from(e: SchedError) -> Self {
        e.to_errno()
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedError::InvalidAttr => "invalid scheduling attributes",
            SchedError::PermissionDenied => "operation not permitted",
            SchedError::NoSuchTask => "no such task",
            SchedError::Busy => "bandwidth exhausted",
            SchedError::TransientMigration => "migration target changed",
        };
        f.write_str(s)
    }
}

pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(Errno::InvalidArgument.as_i32(), 22);
        assert_eq!(Errno::DeviceOrResourceBusy.as_neg_i32(), -16);
        assert_eq!(constants::EINVAL, 22);
    }

    #[test]
    fn test_sched_error_mapping() {
        assert_eq!(SchedError::InvalidAttr.to_errno().as_neg_i32(), -constants::EINVAL);
        assert_eq!(SchedError::Busy.to_errno().as_i32(), constants::EBUSY);
        assert_eq!(Errno::from(SchedError::NoSuchTask), Errno::NoSuchProcess);
        assert_eq!(SchedError::PermissionDenied.to_errno().as_i32(), constants::EPERM);
    }
}
