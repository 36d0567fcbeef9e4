//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 控制台输出
//!
//! `print!`/`println!` 通过 [`Console`] 写入当前注册的控制台后端。
//! 平台初始化时用 [`set_console_sink`] 注册 UART 等输出函数；
//! 没有注册时输出被丢弃（单元测试中转到标准输出）。

use core::fmt;
use spin::RwLock;

/// 控制台后端：逐段写出已格式化的字符串
pub type ConsoleSink = fn(&str);

static CONSOLE_SINK: RwLock<Option<ConsoleSink>> = RwLock::new(None);

/// 注册控制台后端
pub fn set_console_sink(sink: ConsoleSink) {
    *CONSOLE_SINK.write() = Some(sink);
}

/// 注销控制台后端
pub fn clear_console_sink() {
    *CONSOLE_SINK.write() = None;
}

pub struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match *CONSOLE_SINK.read() {
            Some(sink) => sink(s),
            None => fallback_write(s),
        }
        Ok(())
    }
}

#[cfg(test)]
fn fallback_write(s: &str) {
    std::print!("{}", s);
}

#[cfg(not(test))]
fn fallback_write(_s: &str) {}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = write!(&mut $crate::print::Console, $($arg)*);
    });
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ({
        let mut _console = $crate::print::Console;
        let _ = ::core::fmt::Write::write_fmt(&mut _console, ::core::format_args!($($arg)*)).ok();
        let _ = ::core::fmt::Write::write_str(&mut _console, "\n").ok();
    });
}
