//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 架构相关代码
//!
//! 调度核心只依赖异常入口胶水。入口逻辑本身与寄存器访问分开，
//! 寄存器访问只在 aarch64 裸机目标上编译，其余部分在主机上也能测试。

#[cfg(feature = "aarch64")]
pub mod aarch64;
