//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内核命令行参数解析模块
//!
//! 调度器关心的启动参数：
//! - `nohlt` / `hlt`: 强制 / 允许 idle 轮询
//! - `relax_domain_level=N`: 放宽唤醒/新空闲均衡的调度域层级
//! - `isolcpus=[domain,]<cpulist>`: 从调度域中隔离 CPU
//! - `loglevel=N`: 控制台日志级别
//! - `sched_energy_aware=0|1`
//! - `sched_rt_runtime_us=N`

use crate::config::MAX_CPUS;
use crate::cpumask::{parse_cpulist, CpuMask};
use alloc::string::String;
use alloc::vec::Vec;
use spin::RwLock;

/// 全局命令行参数存储
static CMDLINE_STRING: RwLock<Option<String>> = RwLock::new(None);
static BOOT_PARAMS: RwLock<BootParams> = RwLock::new(BootParams::new());

/// 命令行参数最大长度
const MAX_CMDLINE_LEN: usize = 2048;

/// 解析后的调度相关启动参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootParams {
    /// `Some(true)` 对应 `nohlt`，`Some(false)` 对应 `hlt`
    pub force_idle_poll: Option<bool>,
    pub relax_domain_level: Option<i32>,
    /// isolcpus 指定的 CPU（只支持 domain 隔离）
    pub isolcpus: CpuMask,
    pub loglevel: Option<u32>,
    pub sched_energy_aware: Option<bool>,
    pub sched_rt_runtime_us: Option<i64>,
}

impl BootParams {
    pub const fn new() -> Self {
        Self {
            force_idle_poll: None,
            relax_domain_level: None,
            isolcpus: CpuMask::new(),
            loglevel: None,
            sched_energy_aware: None,
            sched_rt_runtime_us: None,
        }
    }

    /// 解析命令行；无法识别或格式错误的参数被忽略
    pub fn parse(cmdline: &str) -> Self {
        let mut p = Self::new();
        for token in cmdline.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            match (key, value) {
                ("nohlt", None) => p.force_idle_poll = Some(true),
                ("hlt", None) => p.force_idle_poll = Some(false),
                ("relax_domain_level", Some(v)) => {
                    p.relax_domain_level = v.parse::<i32>().ok().filter(|l| *l >= -1);
                }
                ("isolcpus", Some(v)) => {
                    if let Some(mask) = parse_isolcpus(v) {
                        p.isolcpus = mask;
                    } else {
                        log::warn!("cmdline: bad isolcpus={}", v);
                    }
                }
                ("loglevel", Some(v)) => p.loglevel = v.parse::<u32>().ok(),
                ("sched_energy_aware", Some(v)) => {
                    p.sched_energy_aware = match v {
                        "0" => Some(false),
                        "1" => Some(true),
                        _ => None,
                    };
                }
                ("sched_rt_runtime_us", Some(v)) => {
                    p.sched_rt_runtime_us = v.parse::<i64>().ok().filter(|r| *r >= -1);
                }
                _ => {}
            }
        }
        p
    }
}

impl Default for BootParams {
    fn default() -> Self {
        Self::new()
    }
}

/// `isolcpus=` 的值：可选的 `domain,` 前缀加 cpulist
///
/// 其他隔离类型（如 `nohz`）不属于调度域，直接跳过前缀。
fn parse_isolcpus(v: &str) -> Option<CpuMask> {
    let mut rest = v;
    loop {
        match rest.split_once(',') {
            Some((flag, tail)) if flag.chars().all(|c| c.is_ascii_alphabetic() || c == '_') => {
                rest = tail;
            }
            _ => break,
        }
    }
    parse_cpulist(rest, MAX_CPUS)
}

/// 初始化命令行参数
pub fn init(cmdline: &str) {
    let mut s = String::from(cmdline);
    if s.len() > MAX_CMDLINE_LEN {
        let mut end = MAX_CMDLINE_LEN;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    *BOOT_PARAMS.write() = BootParams::parse(&s);
    *CMDLINE_STRING.write() = Some(s);
    log::info!("cmdline: {:?}", *BOOT_PARAMS.read());
}

/// 获取命令行参数字符串
pub fn get_cmdline() -> Option<String> {
    CMDLINE_STRING.read().clone()
}

/// 已解析的启动参数
pub fn boot_params() -> BootParams {
    BOOT_PARAMS.read().clone()
}

/// 解析命令行参数，获取指定键的值
pub fn get_param(key: &str) -> Option<String> {
    let cmdline = get_cmdline()?;
    cmdline
        .split_whitespace()
        .filter_map(|t| t.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| String::from(v))
}

/// 检查参数是否存在（布尔标志）
pub fn has_param(key: &str) -> bool {
    match get_cmdline() {
        Some(c) => c.split_whitespace().any(|t| t == key),
        None => false,
    }
}

/// 获取所有 key=value 参数
pub fn get_all_params() -> Vec<(String, String)> {
    let Some(cmdline) = get_cmdline() else {
        return Vec::new();
    };
    cmdline
        .split_whitespace()
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (String::from(k), String::from(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_idle_poll() {
        assert_eq!(BootParams::parse("nohlt").force_idle_poll, Some(true));
        assert_eq!(BootParams::parse("quiet hlt").force_idle_poll, Some(false));
        assert_eq!(BootParams::parse("quiet").force_idle_poll, None);
    }

    #[test]
    fn test_parse_domain_params() {
        let p = BootParams::parse("relax_domain_level=2 isolcpus=domain,2-3 loglevel=7");
        assert_eq!(p.relax_domain_level, Some(2));
        assert_eq!(p.isolcpus, CpuMask::from_cpus(&[2, 3]));
        assert_eq!(p.loglevel, Some(7));

        let p = BootParams::parse("relax_domain_level=-5 isolcpus=1,3");
        assert_eq!(p.relax_domain_level, None);
        assert_eq!(p.isolcpus, CpuMask::from_cpus(&[1, 3]));
    }

    #[test]
    fn test_parse_sched_knobs() {
        let p = BootParams::parse("sched_energy_aware=0 sched_rt_runtime_us=-1");
        assert_eq!(p.sched_energy_aware, Some(false));
        assert_eq!(p.sched_rt_runtime_us, Some(-1));
        assert_eq!(BootParams::parse("sched_energy_aware=2").sched_energy_aware, None);
    }

    #[test]
    fn test_global_params() {
        init("root=/dev/vda nohlt relax_domain_level=1");
        assert_eq!(get_param("root").as_deref(), Some("/dev/vda"));
        assert!(has_param("nohlt"));
        assert_eq!(get_all_params().len(), 2);
        assert_eq!(boot_params().relax_domain_level, Some(1));
    }
}
