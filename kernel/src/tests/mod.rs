//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 端到端场景测试
//!
//! 每个文件一个主题，共用 [`sim`] 里的确定性模拟器：手动时钟、固定拓扑，
//! 由测试逐 CPU 驱动 tick、IPI 和上下文切换。

mod sim;

mod eas_placement;
mod fair_share;
mod invariants;
mod loadavg;
mod rr_preempt;
mod rt_bandwidth;
mod rt_placement;
