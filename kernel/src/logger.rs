//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内核日志
//!
//! 实现 `log::Log`，把 `log` 宏的输出送到控制台。
//! 级别来自 Kernel.toml 的 `[debug] log_level`，可被 `loglevel=` 启动参数覆盖。

use crate::config;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        println!("[{}] {}: {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// 字符串到日志级别
pub fn level_from_str(s: &str) -> LevelFilter {
    match s {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// 控制台 loglevel 数字 (0-8) 到日志级别
pub fn level_from_console(n: u32) -> LevelFilter {
    match n {
        0 => LevelFilter::Off,
        1..=3 => LevelFilter::Error,
        4 => LevelFilter::Warn,
        5 | 6 => LevelFilter::Info,
        7 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// 安装内核日志器
///
/// 重复调用是安全的，只有第一次会注册。
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    let level = match crate::cmdline::boot_params().loglevel {
        Some(n) => level_from_console(n),
        None if cfg!(feature = "debug_log") => LevelFilter::Trace,
        None => level_from_str(config::LOG_LEVEL),
    };
    set_level(level);
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_levels() {
        assert_eq!(level_from_console(0), LevelFilter::Off);
        assert_eq!(level_from_console(4), LevelFilter::Warn);
        assert_eq!(level_from_console(7), LevelFilter::Debug);
        assert_eq!(level_from_str("bogus"), LevelFilter::Info);
    }
}
