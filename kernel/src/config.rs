//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 构建期配置
//!
//! 常量由 build.rs 从 Kernel.toml 生成

include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// 每个时钟滴答的纳秒数
pub const TICK_NSEC: u64 = 1_000_000_000 / HZ;

const _: () = assert!(MAX_CPUS <= crate::cpumask::NR_CPUMASK_BITS);
