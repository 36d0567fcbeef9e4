//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Rux 调度器核心
//!
//! 多调度类、每 CPU 运行队列的 SMP 调度器：
//! - 调度类: stop > deadline > rt > fair > idle
//! - PELT 负载跟踪、全局 loadavg
//! - RT 带宽控制与 push/pull 迁移、cpupri
//! - 调度域拓扑、根域、能耗感知调度
//! - idle 循环与 aarch64 异常入口胶水

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod print;

pub mod arch;
pub mod cmdline;
pub mod config;
pub mod cpumask;
pub mod errno;
pub mod logger;
pub mod process;
pub mod sched;

#[cfg(test)]
mod tests;
