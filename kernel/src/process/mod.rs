//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 进程模型
//!
//! 调度器只需要任务句柄本身：状态、策略枚举和跨 CPU 可见的标志。

pub mod task;

pub use task::{ExitState, OnRq, Pid, SchedPolicy, Task, TaskFlags, TaskState, ThreadFlags};
