//! Rux 调度器构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml（或 menuconfig 生成的 build/.config）
//! 2. 生成调度器配置常量到 OUT_DIR/config.rs

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KernelConfig {
    general: General,
    smp: Smp,
    sched: Sched,
    debug: Debug,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct General {
    name: String,
    version: String,
}

impl Default for General {
    fn default() -> Self {
        Self { name: "Rux".into(), version: "0.1.0".into() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Smp {
    max_cpus: u64,
}

impl Default for Smp {
    fn default() -> Self {
        Self { max_cpus: 8 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Sched {
    hz: u64,
    rt_period_us: u64,
    rt_runtime_us: i64,
    rr_timeslice_ms: u64,
    latency_ns: u64,
    min_granularity_ns: u64,
    wakeup_granularity_ns: u64,
    migration_cost_ns: u64,
    nr_migrate: u64,
    cfs_bandwidth_slice_us: u64,
    energy_aware: bool,
    rt_group_sched: bool,
    fair_group_sched: bool,
    cfs_bandwidth: bool,
    util_est: bool,
    uclamp: bool,
}

impl Default for Sched {
    fn default() -> Self {
        Self {
            hz: 250,
            rt_period_us: 1_000_000,
            rt_runtime_us: 950_000,
            rr_timeslice_ms: 100,
            latency_ns: 6_000_000,
            min_granularity_ns: 750_000,
            wakeup_granularity_ns: 1_000_000,
            migration_cost_ns: 500_000,
            nr_migrate: 32,
            cfs_bandwidth_slice_us: 5_000,
            energy_aware: true,
            rt_group_sched: true,
            fair_group_sched: true,
            cfs_bandwidth: true,
            util_est: true,
            uclamp: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Debug {
    log_level: String,
}

impl Default for Debug {
    fn default() -> Self {
        Self { log_level: "info".into() }
    }
}

/// 解析 build/.config 文件（简单 section_key=value 格式）
fn parse_dot_config(content: &str) -> toml::Value {
    let mut sections: HashMap<String, toml::map::Map<String, toml::Value>> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        // 跳过注释和空行
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();

        // 分割 section_key（使用第一个下划线分割）
        let Some((section, config_key)) = key.split_once('_') else {
            continue;
        };

        let parsed_value = if value == "true" || value == "y" {
            toml::Value::Boolean(true)
        } else if value == "false" || value == "n" {
            toml::Value::Boolean(false)
        } else if let Ok(int_val) = value.parse::<i64>() {
            toml::Value::Integer(int_val)
        } else {
            toml::Value::String(value.trim_matches('"').to_string())
        };

        sections
            .entry(section.to_lowercase())
            .or_default()
            .insert(config_key.to_lowercase(), parsed_value);
    }

    let mut root_map = toml::map::Map::new();
    for (section_name, section_data) in sections {
        root_map.insert(section_name, toml::Value::Table(section_data));
    }
    toml::Value::Table(root_map)
}

fn load_config() -> KernelConfig {
    // 优先使用 build/.config（menuconfig 生成的配置）
    if let Ok(content) = fs::read_to_string("../build/.config") {
        println!("cargo:warning=Using build/.config configuration");
        return parse_dot_config(&content).try_into().unwrap_or_else(|e| {
            println!("cargo:warning=build/.config 解析失败，使用默认配置: {}", e);
            KernelConfig::default()
        });
    }

    match fs::read_to_string("../Kernel.toml") {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            println!("cargo:warning=Kernel.toml 解析失败，使用默认配置: {}", e);
            KernelConfig::default()
        }),
        Err(_) => KernelConfig::default(),
    }
}

fn generate_config_code(config: &KernelConfig) -> String {
    let max_cpus = config.smp.max_cpus.clamp(1, 64);
    let hz = config.sched.hz.clamp(100, 1000);
    let s = &config.sched;

    format!(
        r#"// Rux 调度器配置（自动生成）
//
// 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

/// 内核名称
pub const KERNEL_NAME: &str = "{name}";

/// 内核版本
pub const KERNEL_VERSION: &str = "{version}";

/// 最大CPU数量
pub const MAX_CPUS: usize = {max_cpus};

/// 时钟中断频率
pub const HZ: u64 = {hz};

/// RT 带宽周期 (us)
pub const SCHED_RT_PERIOD_US: u64 = {rt_period};

/// RT 带宽配额 (us)，-1 表示不限制
pub const SCHED_RT_RUNTIME_US: i64 = {rt_runtime};

/// SCHED_RR 时间片 (ms)
pub const SCHED_RR_TIMESLICE_MS: u64 = {rr};

/// CFS 调度延迟 (ns)
pub const SCHED_LATENCY_NS: u64 = {lat};

/// CFS 最小粒度 (ns)
pub const SCHED_MIN_GRANULARITY_NS: u64 = {mingran};

/// CFS 唤醒抢占粒度 (ns)
pub const SCHED_WAKEUP_GRANULARITY_NS: u64 = {wakegran};

/// 任务迁移代价 (ns)
pub const SCHED_MIGRATION_COST_NS: u64 = {migcost};

/// 一次负载均衡最多迁移的任务数
pub const SCHED_NR_MIGRATE: u32 = {nrmig};

/// CFS 带宽每次下发的运行时间片 (us)
pub const CFS_BANDWIDTH_SLICE_US: u64 = {slice};

/// 能耗感知调度默认开关
pub const SCHED_ENERGY_AWARE: bool = {eas};

/// RT 组调度
pub const RT_GROUP_SCHED: bool = {rtg};

/// CFS 组调度
pub const FAIR_GROUP_SCHED: bool = {fairg};

/// CFS 带宽控制
pub const CFS_BANDWIDTH: bool = {cfsb};

/// util_est 默认开关
pub const UTIL_EST: bool = {utilest};

/// uclamp 支持
pub const UCLAMP: bool = {uclamp};

/// 默认日志级别
pub const LOG_LEVEL: &str = "{log_level}";
"#,
        name = config.general.name,
        version = config.general.version,
        max_cpus = max_cpus,
        hz = hz,
        rt_period = s.rt_period_us.max(1),
        rt_runtime = s.rt_runtime_us,
        rr = s.rr_timeslice_ms.max(1),
        lat = s.latency_ns,
        mingran = s.min_granularity_ns,
        wakegran = s.wakeup_granularity_ns,
        migcost = s.migration_cost_ns,
        nrmig = s.nr_migrate,
        slice = s.cfs_bandwidth_slice_us,
        eas = s.energy_aware,
        rtg = s.rt_group_sched,
        fairg = s.fair_group_sched,
        cfsb = s.cfs_bandwidth,
        utilest = s.util_est,
        uclamp = s.uclamp,
        log_level = config.debug.log_level,
    )
}

fn main() {
    println!("cargo:rerun-if-changed=../Kernel.toml");
    println!("cargo:rerun-if-changed=../build/.config");
    println!("cargo:rerun-if-changed=build.rs");

    let config = load_config();

    println!("cargo:rustc-env=CARGO_KERNEL_NAME={}", config.general.name);
    println!("cargo:rustc-env=CARGO_KERNEL_VERSION={}", config.general.version);
    println!("cargo:rustc-env=RUX_LOG_LEVEL={}", config.debug.log_level);

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR 未设置"));
    let config_file = out_dir.join("config.rs");
    let code = generate_config_code(&config);

    // 只有内容变化时才写入，避免每次编译都更新文件时间戳
    let existing = fs::read_to_string(&config_file).unwrap_or_default();
    if existing != code {
        fs::write(&config_file, code).expect("写入配置文件失败");
    }
}
