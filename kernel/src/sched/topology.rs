//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度域拓扑
//!
//! 每个 CPU 有一条从叶子到根的调度域链：SMT -> MC -> DIE -> NODE ->
//! NUMA...。每层调度域的 span 是该层拓扑掩码与 cpu_map 的交集，
//! 再被切分为若干调度组，组是负载均衡比较的单位。
//!
//! 调度域、调度组和组容量都放在 [`DomainTree`] 的数组里，父子关系
//! 和组链表用下标表示。整棵树构建完成后以 `Arc` 发布，读者只需克隆
//! 指针，不加锁；重建时旧树在最后一个读者释放后回收。

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use super::fixedpt::SCHED_CAPACITY_SCALE;
use super::root_domain::RootDomain;
use crate::cpumask::CpuMask;

bitflags! {
    /// 调度域标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SdFlags: u32 {
        const BALANCE_NEWIDLE = 1 << 0;
        const BALANCE_EXEC = 1 << 1;
        const BALANCE_FORK = 1 << 2;
        const BALANCE_WAKE = 1 << 3;
        const WAKE_AFFINE = 1 << 4;
        /// 域内 CPU 容量不同
        const ASYM_CPUCAPACITY = 1 << 5;
        /// 域内包含了所有容量等级
        const ASYM_CPUCAPACITY_FULL = 1 << 6;
        /// 共享 CPU 容量（SMT）
        const SHARE_CPUCAPACITY = 1 << 7;
        /// 共享缓存（LLC）
        const SHARE_PKG_RESOURCES = 1 << 8;
        /// 全局只允许一个 CPU 在该层均衡
        const SERIALIZE = 1 << 9;
        const ASYM_PACKING = 1 << 10;
        const PREFER_SIBLING = 1 << 11;
        /// 组之间有重叠（NUMA）
        const OVERLAP = 1 << 12;
        const NUMA = 1 << 13;
    }
}

impl SdFlags {
    /// 至少需要两个组才有意义的标志
    pub const DEGENERATE_GROUPS_MASK: Self = Self::all().difference(Self::WAKE_AFFINE);
}

/// 超过此距离的 NUMA 层不做 fork/exec 均衡和唤醒亲和
pub const NODE_RECLAIM_DISTANCE: u32 = 30;
/// 本地节点距离
pub const LOCAL_DISTANCE: u32 = 10;

/// 一个能效域（cpufreq 策略组）的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmDomain {
    pub cpus: CpuMask,
    /// (频率 kHz, 功耗 mW)，按频率升序
    pub states: Vec<(u64, u64)>,
}

/// 平台提供的拓扑信息
#[derive(Debug, Clone)]
pub struct ArchTopology {
    pub nr_cpus: usize,
    /// `arch_scale_cpu_capacity`
    pub cpu_capacity: Vec<u64>,
    pub thread_siblings: Vec<CpuMask>,
    pub core_siblings: Vec<CpuMask>,
    pub cpu_node: Vec<usize>,
    /// node_distance[a][b]
    pub node_distance: Vec<Vec<u32>>,
    /// ASYM_PACKING 优先级，数值大者优先
    pub asym_prio: Option<Vec<i32>>,
    pub energy_model: Vec<EmDomain>,
}

impl ArchTopology {
    /// 一个 cluster，对称容量
    pub fn flat(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            cpu_capacity: vec![SCHED_CAPACITY_SCALE; nr_cpus],
            thread_siblings: (0..nr_cpus).map(CpuMask::of).collect(),
            core_siblings: vec![CpuMask::first_n(nr_cpus); nr_cpus],
            cpu_node: vec![0; nr_cpus],
            node_distance: vec![vec![LOCAL_DISTANCE]],
            asym_prio: None,
            energy_model: Vec::new(),
        }
    }

    /// 每个核 `threads` 个超线程，所有核共享 LLC
    pub fn smt(nr_cores: usize, threads: usize) -> Self {
        let nr_cpus = nr_cores * threads;
        let mut t = Self::flat(nr_cpus);
        for cpu in 0..nr_cpus {
            let first = cpu / threads * threads;
            t.thread_siblings[cpu] = CpuMask::from_bits(CpuMask::first_n(threads).bits() << first);
        }
        t
    }

    /// `little` 个小核 + `big` 个大核，两个 cluster，各自一个能效域
    pub fn big_little(
        little: usize,
        little_cap: u64,
        little_states: &[(u64, u64)],
        big: usize,
        big_cap: u64,
        big_states: &[(u64, u64)],
    ) -> Self {
        let nr_cpus = little + big;
        let little_mask = CpuMask::first_n(little);
        let big_mask = CpuMask::first_n(nr_cpus).andnot(little_mask);
        let mut t = Self::flat(nr_cpus);
        for cpu in 0..nr_cpus {
            let little_cpu = cpu < little;
            t.cpu_capacity[cpu] = if little_cpu { little_cap } else { big_cap };
            t.core_siblings[cpu] = if little_cpu { little_mask } else { big_mask };
        }
        t.energy_model = vec![
            EmDomain { cpus: little_mask, states: little_states.to_vec() },
            EmDomain { cpus: big_mask, states: big_states.to_vec() },
        ];
        t
    }

    /// `nodes` 个节点，每节点 `per_node` 个 CPU，`distance` 为节点距离矩阵
    pub fn numa(nodes: usize, per_node: usize, distance: Vec<Vec<u32>>) -> Self {
        let nr_cpus = nodes * per_node;
        let mut t = Self::flat(nr_cpus);
        for cpu in 0..nr_cpus {
            let node = cpu / per_node;
            t.cpu_node[cpu] = node;
            t.core_siblings[cpu] = CpuMask::from_bits(CpuMask::first_n(per_node).bits() << (node * per_node));
        }
        t.node_distance = distance;
        t
    }

    pub fn nr_nodes(&self) -> usize {
        self.node_distance.len()
    }

    pub fn node_cpus(&self, node: usize) -> CpuMask {
        (0..self.nr_cpus).filter(|&c| self.cpu_node[c] == node).collect()
    }

    pub fn distance(&self, a: usize, b: usize) -> u32 {
        self.node_distance
            .get(a)
            .and_then(|r| r.get(b))
            .copied()
            .unwrap_or(LOCAL_DISTANCE)
    }

    /// `a` 的 asym packing 优先级高于 `b`
    pub fn asym_prefer(&self, a: usize, b: usize) -> bool {
        match &self.asym_prio {
            Some(p) => p[a] > p[b],
            None => false,
        }
    }

    pub fn smt_present(&self) -> bool {
        self.thread_siblings.iter().any(|m| m.weight() > 1)
    }

    /// 按容量把 CPU 分组，容量降序
    pub fn asym_cap_list(&self) -> Vec<(u64, CpuMask)> {
        let mut by_cap: BTreeMap<u64, CpuMask> = BTreeMap::new();
        for cpu in 0..self.nr_cpus {
            by_cap.entry(self.cpu_capacity[cpu]).or_default().set(cpu);
        }
        by_cap.into_iter().rev().collect()
    }
}

/// 一层拓扑
#[derive(Debug, Clone)]
pub struct TopologyLevel {
    pub name: &'static str,
    pub flags: SdFlags,
    pub overlap: bool,
    /// NUMA 层对应的距离下标
    pub numa_level: Option<usize>,
    /// 每个 CPU 在该层的掩码
    pub masks: Vec<CpuMask>,
}

/// 按 ArchTopology 生成拓扑层：SMT、MC、DIE，多节点时再加 NODE 和各 NUMA 层
pub fn topology_levels(topo: &ArchTopology) -> (Vec<TopologyLevel>, Vec<u32>) {
    let n = topo.nr_cpus;
    let node_masks: Vec<CpuMask> = (0..topo.nr_nodes()).map(|nd| topo.node_cpus(nd)).collect();
    let node_of = |cpu: usize| node_masks.get(topo.cpu_node[cpu]).copied().unwrap_or_default();

    let mut levels = vec![
        TopologyLevel {
            name: "SMT",
            flags: SdFlags::SHARE_CPUCAPACITY | SdFlags::SHARE_PKG_RESOURCES,
            overlap: false,
            numa_level: None,
            masks: topo.thread_siblings.clone(),
        },
        TopologyLevel {
            name: "MC",
            flags: SdFlags::SHARE_PKG_RESOURCES,
            overlap: false,
            numa_level: None,
            masks: topo.core_siblings.clone(),
        },
        TopologyLevel {
            name: "DIE",
            flags: SdFlags::empty(),
            overlap: false,
            numa_level: None,
            masks: (0..n).map(node_of).collect(),
        },
    ];

    let mut distances: Vec<u32> = topo.node_distance.iter().flatten().copied().collect();
    distances.sort_unstable();
    distances.dedup();

    if topo.nr_nodes() > 1 {
        for (j, &dist) in distances.iter().enumerate() {
            let masks = (0..n)
                .map(|cpu| {
                    let node = topo.cpu_node[cpu];
                    (0..topo.nr_nodes())
                        .filter(|&other| topo.distance(node, other) <= dist)
                        .fold(CpuMask::new(), |m, other| m.or(node_masks[other]))
                })
                .collect();
            levels.push(TopologyLevel {
                name: if j == 0 { "NODE" } else { "NUMA" },
                flags: if j == 0 { SdFlags::empty() } else { SdFlags::NUMA },
                overlap: j != 0,
                numa_level: Some(j),
                masks,
            });
        }
    }
    (levels, distances)
}

pub type DomainId = usize;
pub type SchedGroupId = usize;

/// 均衡状态，多个 CPU 可能同时读写
#[derive(Debug, Default)]
pub struct DomainBalance {
    pub last_balance: AtomicU64,
    pub balance_interval: AtomicU64,
    pub nr_balance_failed: AtomicU32,
    pub max_newidle_lb_cost: AtomicU64,
    pub last_decay_max_lb_cost: AtomicU64,
    pub lb_count: AtomicU64,
    pub lb_failed: AtomicU64,
    pub lb_imbalance: AtomicU64,
    pub alb_pushed: AtomicU64,
}

/// LLC 内共享的状态
#[derive(Debug, Default)]
pub struct SchedDomainShared {
    pub nr_busy_cpus: AtomicU32,
    pub has_idle_cores: core::sync::atomic::AtomicBool,
}

#[derive(Debug)]
pub struct SchedDomain {
    pub cpu: usize,
    pub name: &'static str,
    /// 在 topology_levels 中的下标
    pub tl: usize,
    pub level: u32,
    pub span: CpuMask,
    pub span_weight: u32,
    pub flags: SdFlags,
    pub imbalance_pct: u32,
    pub cache_nice_tries: u32,
    pub busy_factor: u32,
    pub min_interval: u64,
    pub max_interval: u64,
    pub parent: Option<DomainId>,
    pub child: Option<DomainId>,
    /// 组链表，第一个是包含本 CPU 的本地组
    pub groups: Vec<SchedGroupId>,
    pub shared: Option<usize>,
    pub balance: DomainBalance,
}

#[derive(Debug)]
pub struct SchedGroup {
    pub span: CpuMask,
    /// span 中真正在本层做均衡的 CPU
    pub balance_mask: CpuMask,
    pub group_weight: u32,
    pub sgc: usize,
    pub asym_prefer_cpu: usize,
    /// 子域的标志
    pub flags: SdFlags,
}

impl SchedGroup {
    pub fn balance_cpu(&self) -> usize {
        self.balance_mask.first().unwrap_or(0)
    }
}

/// 组容量，同一层 balance_mask 首 CPU 相同的组共享
#[derive(Debug)]
pub struct SchedGroupCapacity {
    pub capacity: AtomicU64,
    pub min_capacity: AtomicU64,
    pub max_capacity: AtomicU64,
    pub next_update: AtomicU64,
    /// 亲和性导致无法均衡
    pub imbalance: AtomicI32,
    pub nr_ref: AtomicU32,
}

impl SchedGroupCapacity {
    fn new(weight: u64) -> Self {
        Self {
            capacity: AtomicU64::new(SCHED_CAPACITY_SCALE * weight),
            min_capacity: AtomicU64::new(SCHED_CAPACITY_SCALE),
            max_capacity: AtomicU64::new(SCHED_CAPACITY_SCALE),
            next_update: AtomicU64::new(0),
            imbalance: AtomicI32::new(0),
            nr_ref: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }
}

/// 调度域属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainAttr {
    /// 高于该层的调度域不做唤醒和 newidle 均衡，-1 表示系统默认
    pub relax_domain_level: i32,
}

impl Default for DomainAttr {
    fn default() -> Self {
        Self { relax_domain_level: -1 }
    }
}

/// 一个分区
#[derive(Debug)]
pub struct Partition {
    pub span: CpuMask,
    pub rd: Arc<RootDomain>,
    pub attr: DomainAttr,
}

/// 已发布的调度域树
#[derive(Debug)]
pub struct DomainTree {
    pub nr_cpus: usize,
    pub levels: Vec<TopologyLevel>,
    pub numa_distances: Vec<u32>,
    pub domains: Vec<SchedDomain>,
    pub groups: Vec<SchedGroup>,
    pub sgc: Vec<SchedGroupCapacity>,
    pub shared: Vec<SchedDomainShared>,
    /// 每个 CPU 退化后的最底层调度域
    pub base: Vec<Option<DomainId>>,
    pub sd_llc: Vec<Option<DomainId>>,
    pub sd_llc_size: Vec<u32>,
    pub sd_llc_id: Vec<usize>,
    pub sd_numa: Vec<Option<DomainId>>,
    pub sd_asym_packing: Vec<Option<DomainId>>,
    pub sd_asym_cpucapacity: Vec<Option<DomainId>>,
    pub partitions: Vec<Partition>,
    pub cpu_part: Vec<Option<usize>>,
    pub has_asym: bool,
}

/// 拓扑掩码既不相等又有交集
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyInsane {
    pub level: &'static str,
    pub cpu: usize,
}

/// 按容量等级判断 span 的非对称性
pub fn asym_cpu_capacity_classify(span: CpuMask, cpu_map: CpuMask, caps: &[(u64, CpuMask)]) -> SdFlags {
    let mut count = 0;
    let mut miss = 0;
    for (_, cap_span) in caps {
        if span.intersects(*cap_span) {
            count += 1;
        } else if cpu_map.intersects(*cap_span) {
            miss += 1;
        }
    }
    if count < 2 {
        return SdFlags::empty();
    }
    if miss != 0 {
        return SdFlags::ASYM_CPUCAPACITY;
    }
    SdFlags::ASYM_CPUCAPACITY | SdFlags::ASYM_CPUCAPACITY_FULL
}

fn topology_span_sane(tl: &TopologyLevel, cpu_map: CpuMask, cpu: usize) -> bool {
    if tl.overlap {
        return true;
    }
    cpu_map.iter().filter(|&i| i != cpu).all(|i| {
        let (a, b) = (tl.masks[cpu], tl.masks[i]);
        a == b || !a.intersects(b)
    })
}

/// 从 `start` 开始环绕遍历 `span`
fn wrap_from(span: CpuMask, start: usize) -> impl Iterator<Item = usize> {
    span.iter().filter(move |&c| c >= start).chain(span.iter().filter(move |&c| c < start))
}

struct Builder<'a> {
    topo: &'a ArchTopology,
    tree: DomainTree,
    /// [tl][cpu] -> 构建时的调度域
    sdd: Vec<Vec<Option<DomainId>>>,
    group_map: BTreeMap<(usize, usize), SchedGroupId>,
    sgc_map: BTreeMap<(usize, usize), usize>,
    shared_map: BTreeMap<(usize, usize), usize>,
    caps: Vec<(u64, CpuMask)>,
    jiffies: u64,
}

impl DomainTree {
    /// 不含任何调度域的树
    pub fn empty(topo: &ArchTopology) -> Self {
        let n = topo.nr_cpus;
        let (levels, numa_distances) = topology_levels(topo);
        Self {
            nr_cpus: n,
            levels,
            numa_distances,
            domains: Vec::new(),
            groups: Vec::new(),
            sgc: Vec::new(),
            shared: Vec::new(),
            base: vec![None; n],
            sd_llc: vec![None; n],
            sd_llc_size: vec![1; n],
            sd_llc_id: (0..n).collect(),
            sd_numa: vec![None; n],
            sd_asym_packing: vec![None; n],
            sd_asym_cpucapacity: vec![None; n],
            partitions: Vec::new(),
            cpu_part: vec![None; n],
            has_asym: false,
        }
    }

    /// 为每个分区构建调度域
    ///
    /// `default_relax` 是 relax_domain_level 启动参数，分区属性为 -1
    /// 时使用。
    pub fn build(
        topo: &ArchTopology,
        partitions: Vec<Partition>,
        default_relax: i32,
        jiffies: u64,
    ) -> Result<Self, TopologyInsane> {
        let tree = Self::empty(topo);
        let nlevels = tree.levels.len();
        let mut b = Builder {
            topo,
            tree,
            sdd: vec![vec![None; topo.nr_cpus]; nlevels],
            group_map: BTreeMap::new(),
            sgc_map: BTreeMap::new(),
            shared_map: BTreeMap::new(),
            caps: topo.asym_cap_list(),
            jiffies,
        };

        for (idx, part) in partitions.iter().enumerate() {
            let relax = if part.attr.relax_domain_level >= 0 {
                part.attr.relax_domain_level
            } else {
                default_relax
            };
            b.build_partition(part.span, relax)?;
            for cpu in part.span {
                b.tree.cpu_part[cpu] = Some(idx);
            }
        }
        b.tree.partitions = partitions;

        for cpu in 0..topo.nr_cpus {
            if b.tree.cpu_part[cpu].is_some() {
                b.tree.degenerate(cpu);
                b.tree.update_top_cache_domain(cpu);
            }
        }
        Ok(b.tree)
    }

    #[inline]
    pub fn sd(&self, id: DomainId) -> &SchedDomain {
        &self.domains[id]
    }

    #[inline]
    pub fn sg(&self, id: SchedGroupId) -> &SchedGroup {
        &self.groups[id]
    }

    #[inline]
    pub fn sgc_of(&self, id: SchedGroupId) -> &SchedGroupCapacity {
        &self.sgc[self.groups[id].sgc]
    }

    /// 从最底层向上遍历 CPU 的调度域
    pub fn for_each_domain(&self, cpu: usize) -> DomainIter<'_> {
        DomainIter {
            tree: self,
            next: self.base.get(cpu).copied().flatten(),
        }
    }

    /// 连续带有 `flag` 的最高一层
    pub fn highest_flag_domain(&self, cpu: usize, flag: SdFlags) -> Option<DomainId> {
        let mut hsd = None;
        for id in self.for_each_domain(cpu) {
            if !self.domains[id].flags.contains(flag) {
                break;
            }
            hsd = Some(id);
        }
        hsd
    }

    /// 最低的带有 `flag` 的一层
    pub fn lowest_flag_domain(&self, cpu: usize, flag: SdFlags) -> Option<DomainId> {
        self.for_each_domain(cpu).find(|&id| self.domains[id].flags.contains(flag))
    }

    pub fn rd_of(&self, cpu: usize) -> Option<&Arc<RootDomain>> {
        self.cpu_part[cpu].map(|p| &self.partitions[p].rd)
    }

    /// 两个 CPU 共享 LLC
    pub fn cpus_share_cache(&self, a: usize, b: usize) -> bool {
        a == b || self.sd_llc_id[a] == self.sd_llc_id[b]
    }

    fn degenerate_sd(&self, id: DomainId) -> bool {
        let sd = &self.domains[id];
        if sd.span.weight() == 1 {
            return true;
        }
        if sd.flags.intersects(SdFlags::DEGENERATE_GROUPS_MASK) && sd.groups.len() > 1 {
            return false;
        }
        if sd.flags.contains(SdFlags::WAKE_AFFINE) {
            return false;
        }
        true
    }

    fn parent_degenerate(&self, id: DomainId, parent: DomainId) -> bool {
        if self.degenerate_sd(parent) {
            return true;
        }
        let (sd, p) = (&self.domains[id], &self.domains[parent]);
        if sd.span != p.span {
            return false;
        }
        let mut pflags = p.flags;
        if p.groups.len() <= 1 {
            pflags.remove(SdFlags::DEGENERATE_GROUPS_MASK);
        }
        (pflags & !sd.flags).is_empty()
    }

    /// 去掉对均衡没有贡献的层
    fn degenerate(&mut self, cpu: usize) {
        let mut cur = self.base[cpu];
        while let Some(tmp) = cur {
            let Some(parent) = self.domains[tmp].parent else {
                break;
            };
            if self.parent_degenerate(tmp, parent) {
                let grand = self.domains[parent].parent;
                self.domains[tmp].parent = grand;
                if let Some(g) = grand {
                    self.domains[g].child = Some(tmp);
                    if self.domains[parent].flags.contains(SdFlags::PREFER_SIBLING) {
                        self.domains[tmp].flags |= SdFlags::PREFER_SIBLING;
                    }
                }
            } else {
                cur = Some(parent);
            }
        }

        if let Some(sd) = self.base[cpu] {
            if self.degenerate_sd(sd) {
                let parent = self.domains[sd].parent;
                self.base[cpu] = parent;
                if let Some(p) = parent {
                    self.domains[p].child = None;
                }
            }
        }
    }

    fn update_top_cache_domain(&mut self, cpu: usize) {
        let llc = self.highest_flag_domain(cpu, SdFlags::SHARE_PKG_RESOURCES);
        let (size, id) = match llc {
            Some(sd) => (self.domains[sd].span.weight() as u32, self.domains[sd].span.first().unwrap_or(cpu)),
            None => (1, cpu),
        };
        self.sd_llc[cpu] = llc;
        self.sd_llc_size[cpu] = size;
        self.sd_llc_id[cpu] = id;
        self.sd_numa[cpu] = self.lowest_flag_domain(cpu, SdFlags::NUMA);
        self.sd_asym_packing[cpu] = self.highest_flag_domain(cpu, SdFlags::ASYM_PACKING);
        self.sd_asym_cpucapacity[cpu] = self.lowest_flag_domain(cpu, SdFlags::ASYM_CPUCAPACITY_FULL);
    }

    pub fn llc_shared(&self, cpu: usize) -> Option<&SchedDomainShared> {
        let sd = self.sd_llc[cpu]?;
        self.domains[sd].shared.map(|i| &self.shared[i])
    }

    /// 更新本地组的容量
    ///
    /// 最底层直接取 CPU 容量；上层把子域各组的容量相加（子域为重叠
    /// 时逐个 CPU 相加）。
    pub fn update_group_capacity(&self, sd: DomainId, capacity_of: &dyn Fn(usize) -> u64, next_update: u64) {
        let d = &self.domains[sd];
        let Some(&local) = d.groups.first() else {
            return;
        };
        let sgc = self.sgc_of(local);
        sgc.next_update.store(next_update, Ordering::Relaxed);

        let Some(child) = d.child else {
            let cap = capacity_of(d.cpu);
            sgc.capacity.store(cap, Ordering::Relaxed);
            sgc.min_capacity.store(cap, Ordering::Relaxed);
            sgc.max_capacity.store(cap, Ordering::Relaxed);
            return;
        };

        let (mut capacity, mut min, mut max) = (0u64, u64::MAX, 0u64);
        let c = &self.domains[child];
        if c.flags.contains(SdFlags::OVERLAP) {
            for cpu in self.groups[local].span {
                let cap = capacity_of(cpu);
                capacity += cap;
                min = min.min(cap);
                max = max.max(cap);
            }
        } else {
            for &g in &c.groups {
                let gc = self.sgc_of(g);
                capacity += gc.capacity();
                min = min.min(gc.min_capacity.load(Ordering::Relaxed));
                max = max.max(gc.max_capacity.load(Ordering::Relaxed));
            }
        }
        sgc.capacity.store(capacity, Ordering::Relaxed);
        sgc.min_capacity.store(min, Ordering::Relaxed);
        sgc.max_capacity.store(max, Ordering::Relaxed);
    }

    /// `sched_domain_debug` 的文本
    pub fn debug_lines(&self, cpu: usize) -> Vec<String> {
        let mut out = Vec::new();
        if self.base[cpu].is_none() {
            out.push(alloc::format!("CPU{} attaching NULL sched-domain.", cpu));
            return out;
        }
        out.push(alloc::format!("CPU{} attaching sched-domain(s):", cpu));
        for (depth, id) in self.for_each_domain(cpu).enumerate() {
            let sd = &self.domains[id];
            let mut line = String::new();
            let _ = write!(
                line,
                "{:indent$}domain-{}: span={} level={}",
                "",
                depth,
                sd.span,
                sd.name,
                indent = depth + 1
            );
            out.push(line);
            let mut line = String::new();
            let _ = write!(line, "{:indent$}groups:", "", indent = depth + 2);
            for (i, &g) in sd.groups.iter().enumerate() {
                let sg = &self.groups[g];
                let _ = write!(line, " {}:{{ span={}", sg.balance_cpu(), sg.span);
                if sg.balance_mask != sg.span {
                    let _ = write!(line, " mask={}", sg.balance_mask);
                }
                let cap = self.sgc[sg.sgc].capacity();
                if cap != SCHED_CAPACITY_SCALE {
                    let _ = write!(line, " cap={}", cap);
                }
                line.push_str(" }");
                if i + 1 != sd.groups.len() {
                    line.push(',');
                }
            }
            out.push(line);
        }
        out
    }
}

pub struct DomainIter<'a> {
    tree: &'a DomainTree,
    next: Option<DomainId>,
}

impl Iterator for DomainIter<'_> {
    type Item = DomainId;

    fn next(&mut self) -> Option<DomainId> {
        let cur = self.next?;
        self.next = self.tree.domains[cur].parent;
        Some(cur)
    }
}

impl Builder<'_> {
    fn sd_init(&mut self, tli: usize, cpu_map: CpuMask, child: Option<DomainId>, cpu: usize) -> DomainId {
        let tl = &self.tree.levels[tli];
        let sd_weight = tl.masks[cpu].weight() as u64;
        let span = tl.masks[cpu].and(cpu_map);

        let mut flags = SdFlags::BALANCE_NEWIDLE
            | SdFlags::BALANCE_EXEC
            | SdFlags::BALANCE_FORK
            | SdFlags::WAKE_AFFINE
            | SdFlags::PREFER_SIBLING
            | tl.flags;
        flags |= asym_cpu_capacity_classify(span, cpu_map, &self.caps);

        if flags.contains(SdFlags::SHARE_CPUCAPACITY | SdFlags::ASYM_CPUCAPACITY) {
            log::warn!("sched: SMT with asymmetric capacity in {} domain, EAS stays off", tl.name);
        }

        let mut imbalance_pct = 117;
        let cache_nice_tries;
        if flags.contains(SdFlags::SHARE_CPUCAPACITY) {
            imbalance_pct = 110;
            cache_nice_tries = 0;
        } else if flags.contains(SdFlags::SHARE_PKG_RESOURCES) {
            cache_nice_tries = 1;
        } else if flags.contains(SdFlags::NUMA) {
            cache_nice_tries = 2;
            flags.remove(SdFlags::PREFER_SIBLING);
            flags |= SdFlags::SERIALIZE;
            let far = tl
                .numa_level
                .and_then(|j| self.tree.numa_distances.get(j))
                .is_some_and(|&d| d > NODE_RECLAIM_DISTANCE);
            if far {
                flags.remove(SdFlags::BALANCE_EXEC | SdFlags::BALANCE_FORK | SdFlags::WAKE_AFFINE);
            }
        } else {
            cache_nice_tries = 1;
        }

        if flags.contains(SdFlags::ASYM_CPUCAPACITY) {
            if let Some(c) = child {
                self.tree.domains[c].flags.remove(SdFlags::PREFER_SIBLING);
            }
        }

        let shared = if flags.contains(SdFlags::SHARE_PKG_RESOURCES) {
            let sd_id = span.first().unwrap_or(cpu);
            let shared = &mut self.tree.shared;
            let idx = *self.shared_map.entry((tli, sd_id)).or_insert_with(|| {
                shared.push(SchedDomainShared::default());
                shared.len() - 1
            });
            self.tree.shared[idx].nr_busy_cpus.store(sd_weight as u32, Ordering::Relaxed);
            Some(idx)
        } else {
            None
        };

        let tl = &self.tree.levels[tli];
        let sd = SchedDomain {
            cpu,
            name: tl.name,
            tl: tli,
            level: 0,
            span,
            span_weight: span.weight() as u32,
            flags,
            imbalance_pct,
            cache_nice_tries,
            busy_factor: 16,
            min_interval: sd_weight,
            max_interval: 2 * sd_weight,
            parent: None,
            child,
            groups: Vec::new(),
            shared,
            balance: DomainBalance::default(),
        };
        sd.balance.last_balance.store(self.jiffies, Ordering::Relaxed);
        sd.balance.balance_interval.store(sd_weight, Ordering::Relaxed);
        sd.balance.last_decay_max_lb_cost.store(self.jiffies, Ordering::Relaxed);
        self.tree.domains.push(sd);
        self.tree.domains.len() - 1
    }

    fn build_partition(&mut self, cpu_map: CpuMask, relax: i32) -> Result<(), TopologyInsane> {
        let nlevels = self.tree.levels.len();
        for cpu in cpu_map {
            let mut child: Option<DomainId> = None;
            for tli in 0..nlevels {
                if !topology_span_sane(&self.tree.levels[tli], cpu_map, cpu) {
                    log::error!("sched: topology level {} not sane for CPU{}", self.tree.levels[tli].name, cpu);
                    return Err(TopologyInsane { level: self.tree.levels[tli].name, cpu });
                }
                let sd = self.sd_init(tli, cpu_map, child, cpu);
                if let Some(c) = child {
                    self.tree.domains[sd].level = self.tree.domains[c].level + 1;
                    self.tree.domains[c].parent = Some(sd);
                    let cspan = self.tree.domains[c].span;
                    if !cspan.is_subset(self.tree.domains[sd].span) {
                        log::warn!("sched: domain {} span {} not a superset of child", cpu, self.tree.domains[sd].span);
                        let d = &mut self.tree.domains[sd];
                        d.span = d.span.or(cspan);
                        d.span_weight = d.span.weight() as u32;
                    }
                } else {
                    self.tree.base[cpu] = Some(sd);
                }

                // relax_domain_level 以上不做唤醒/newidle 均衡
                let d = &mut self.tree.domains[sd];
                if relax >= 0 && d.level as i32 > relax {
                    d.flags.remove(SdFlags::BALANCE_WAKE | SdFlags::BALANCE_NEWIDLE);
                }
                if d.flags.contains(SdFlags::ASYM_CPUCAPACITY) {
                    self.tree.has_asym = true;
                }
                if self.tree.levels[tli].overlap {
                    self.tree.domains[sd].flags |= SdFlags::OVERLAP;
                }
                self.sdd[tli][cpu] = Some(sd);
                child = Some(sd);
                if self.tree.domains[sd].span == cpu_map {
                    break;
                }
            }
        }

        for cpu in cpu_map {
            let mut cur = self.tree.base[cpu];
            while let Some(sd) = cur {
                if self.tree.domains[sd].flags.contains(SdFlags::OVERLAP) {
                    self.build_overlap_sched_groups(sd, cpu);
                } else {
                    self.build_sched_groups(sd, cpu);
                }
                cur = self.tree.domains[sd].parent;
            }
        }

        for cpu in cpu_map.iter().collect::<Vec<_>>().into_iter().rev() {
            let mut cur = self.tree.base[cpu];
            while let Some(sd) = cur {
                self.init_sched_groups_capacity(cpu, sd);
                cur = self.tree.domains[sd].parent;
            }
        }
        Ok(())
    }

    fn sgc_for(&mut self, tli: usize, cpu: usize, weight: u64) -> usize {
        let sgc = &mut self.tree.sgc;
        let idx = *self.sgc_map.entry((tli, cpu)).or_insert_with(|| {
            sgc.push(SchedGroupCapacity::new(weight));
            sgc.len() - 1
        });
        self.tree.sgc[idx].nr_ref.fetch_add(1, Ordering::Relaxed);
        idx
    }

    /// 非重叠层：每个组就是某个 CPU 的子域，同层同首 CPU 的组共享
    fn get_group(&mut self, tli: usize, cpu: usize) -> SchedGroupId {
        let child = self.sdd[tli][cpu].and_then(|sd| self.tree.domains[sd].child);
        let (key, span, flags) = match child {
            Some(c) => {
                let c = &self.tree.domains[c];
                (c.span.first().unwrap_or(cpu), c.span, c.flags)
            }
            None => (cpu, CpuMask::of(cpu), SdFlags::empty()),
        };
        if let Some(&g) = self.group_map.get(&(tli, key)) {
            return g;
        }
        let sgc = self.sgc_for(tli, key, span.weight() as u64);
        self.tree.groups.push(SchedGroup {
            span,
            balance_mask: span,
            group_weight: span.weight() as u32,
            sgc,
            asym_prefer_cpu: key,
            flags,
        });
        let g = self.tree.groups.len() - 1;
        self.group_map.insert((tli, key), g);
        g
    }

    fn build_sched_groups(&mut self, sd: DomainId, cpu: usize) {
        let (span, tli) = (self.tree.domains[sd].span, self.tree.domains[sd].tl);
        let mut covered = CpuMask::new();
        let mut groups = Vec::new();
        for i in wrap_from(span, cpu) {
            if covered.test(i) {
                continue;
            }
            let g = self.get_group(tli, i);
            covered = covered.or(self.tree.groups[g].span);
            groups.push(g);
        }
        self.tree.domains[sd].groups = groups;
    }

    /// 向下找到第一个 span 是 `sd` 子集的子域，再跳过 span 相同的层
    fn find_descended_sibling(&self, sd: DomainId, mut sibling: DomainId) -> DomainId {
        let span = self.tree.domains[sd].span;
        while let Some(c) = self.tree.domains[sibling].child {
            if self.tree.domains[c].span.is_subset(span) {
                break;
            }
            sibling = c;
        }
        while let Some(c) = self.tree.domains[sibling].child {
            if self.tree.domains[c].span != self.tree.domains[sibling].span {
                break;
            }
            sibling = c;
        }
        sibling
    }

    /// 组中子域恰好等于组 span 的 CPU
    fn build_balance_mask(&self, tli: usize, sg_span: CpuMask) -> CpuMask {
        let mut mask = CpuMask::new();
        for i in sg_span {
            let Some(sibling) = self.sdd[tli][i] else {
                continue;
            };
            let Some(child) = self.tree.domains[sibling].child else {
                continue;
            };
            if self.tree.domains[child].span != sg_span {
                continue;
            }
            mask.set(i);
        }
        mask
    }

    fn build_overlap_sched_groups(&mut self, sd: DomainId, cpu: usize) {
        let (span, tli) = (self.tree.domains[sd].span, self.tree.domains[sd].tl);
        let mut covered = CpuMask::new();
        let mut groups = Vec::new();

        for i in wrap_from(span, cpu) {
            if covered.test(i) {
                continue;
            }
            let Some(mut sibling) = self.sdd[tli][i] else {
                continue;
            };
            if !self.tree.domains[sibling].span.test(i) {
                continue;
            }
            if let Some(c) = self.tree.domains[sibling].child {
                if !self.tree.domains[c].span.is_subset(span) {
                    sibling = self.find_descended_sibling(sd, sibling);
                }
            }

            let (sg_span, flags) = match self.tree.domains[sibling].child {
                Some(c) => (self.tree.domains[c].span, self.tree.domains[c].flags),
                None => (self.tree.domains[sibling].span, SdFlags::empty()),
            };
            covered = covered.or(sg_span);

            let mut mask = self.build_balance_mask(tli, sg_span);
            if mask.is_empty() {
                log::warn!("sched: empty balance mask for group {} at {}", sg_span, self.tree.levels[tli].name);
                mask = CpuMask::of(sg_span.first().unwrap_or(i));
            }
            let first = mask.first().unwrap_or(i);
            let sgc = self.sgc_for(tli, first, sg_span.weight() as u64);
            self.tree.groups.push(SchedGroup {
                span: sg_span,
                balance_mask: mask,
                group_weight: sg_span.weight() as u32,
                sgc,
                asym_prefer_cpu: first,
                flags,
            });
            groups.push(self.tree.groups.len() - 1);
        }
        self.tree.domains[sd].groups = groups;
    }

    fn init_sched_groups_capacity(&mut self, cpu: usize, sd: DomainId) {
        let asym_packing = self.tree.domains[sd].flags.contains(SdFlags::ASYM_PACKING);
        for gi in 0..self.tree.domains[sd].groups.len() {
            let g = self.tree.domains[sd].groups[gi];
            let span = self.tree.groups[g].span;
            self.tree.groups[g].group_weight = span.weight() as u32;
            if !asym_packing {
                continue;
            }
            let mut max_cpu: Option<usize> = None;
            for c in span {
                max_cpu = match max_cpu {
                    None => Some(c),
                    Some(m) if self.topo.asym_prefer(c, m) => Some(c),
                    keep => keep,
                };
            }
            if let Some(m) = max_cpu {
                self.tree.groups[g].asym_prefer_cpu = m;
            }
        }

        let Some(&local) = self.tree.domains[sd].groups.first() else {
            return;
        };
        if cpu != self.tree.groups[local].balance_cpu() {
            return;
        }
        let caps = &self.topo.cpu_capacity;
        let capacity_of = |c: usize| caps.get(c).copied().unwrap_or(SCHED_CAPACITY_SCALE);
        self.tree.update_group_capacity(sd, &capacity_of, self.jiffies);
    }
}
