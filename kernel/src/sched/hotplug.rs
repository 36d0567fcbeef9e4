//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! CPU 热插拔与调度域重建
//!
//! 上线顺序：`sched_cpu_starting` 置 online，`sched_cpu_activate` 置
//! active 并重建调度域。下线反过来：`sched_cpu_deactivate` 先做 DL
//! 带宽检查再清 active，`sched_cpu_dying` 把排队的任务迁走，最后
//! idle 任务发现 CPU 已经离线时调用 `cpuhp_report_idle_dead`。
//!
//! 重建时按 cpuset 分区（没有配置时用去掉 isolcpus 的活跃 CPU）生成
//! 新的调度域树；跨度不变的分区沿用原来的根域，保住已接纳的 DL 带宽。
//! 不在任何分区里的 CPU 挂到默认根域上，没有调度域。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::class::SchedClass;
use super::core::Scheduler;
use super::energy::{build_perf_domains, EasCheck};
use super::hrtimer::TimerEvent;
use super::loadavg::RqLoad;
use super::rq::{Rq, IDLE_PID};
use super::root_domain::RootDomain;
use super::topology::{DomainAttr, DomainTree, Partition};
use crate::cpumask::CpuMask;
use crate::errno::{SchedError, SchedResult};
use crate::process::{OnRq, Pid};
use crate::sched_bug_on;

impl Scheduler {
    pub(crate) fn set_rq_online(&self, rq: &mut Rq) {
        if rq.online {
            return;
        }
        rq.rd.online.set_cpu(rq.cpu, Ordering::Release);
        rq.online = true;
        for class in SchedClass::ALL {
            class.rq_online(self, rq);
        }
    }

    pub(crate) fn set_rq_offline(&self, rq: &mut Rq) {
        if !rq.online {
            return;
        }
        for class in SchedClass::ALL {
            class.rq_offline(self, rq);
        }
        rq.rd.online.clear_cpu(rq.cpu, Ordering::Release);
        rq.online = false;
    }

    /// 把 rq 挂到 `rd` 上，活跃 CPU 随即在新根域上线
    pub(crate) fn rq_attach_root(&self, rq: &mut Rq, rd: &Arc<RootDomain>) {
        self.set_rq_offline(rq);
        rq.rd.span.clear_cpu(rq.cpu, Ordering::Release);
        rq.rd = rd.clone();
        rd.span.set_cpu(rq.cpu, Ordering::Release);
        if self.cpu_active(rq.cpu) {
            self.set_rq_online(rq);
        }
    }

    /// 设置 cpuset 分区，`None` 恢复自动划分
    pub fn set_cpuset_partitions(&self, parts: Option<Vec<(CpuMask, DomainAttr)>>) {
        *self.cpuset_partitions.lock() = parts;
        self.rebuild_sched_domains();
    }

    /// 按当前的活跃 CPU 和 cpuset 配置重建
    pub fn rebuild_sched_domains(&self) {
        let active = self.active_mask();
        let parts: Vec<(CpuMask, DomainAttr)> = match &*self.cpuset_partitions.lock() {
            Some(parts) => parts.iter().map(|&(span, attr)| (span.and(active), attr)).collect(),
            None => alloc::vec![(active.andnot(self.boot.isolcpus), DomainAttr::default())],
        };
        let parts = parts.into_iter().filter(|(span, _)| !span.is_empty()).collect();
        self.partition_sched_domains(parts);
    }

    /// 用给定的分区替换当前的调度域树
    pub fn partition_sched_domains(&self, parts: Vec<(CpuMask, DomainAttr)>) {
        let _guard = self.domains_mutex.lock();
        let old = self.domain_tree();

        let mut seen = CpuMask::new();
        let mut partitions = Vec::with_capacity(parts.len());
        for (span, attr) in parts {
            // 分区不能重叠，重叠部分归前一个
            let span = span.andnot(seen);
            if span.is_empty() {
                continue;
            }
            seen = seen.or(span);
            let rd = old
                .partitions
                .iter()
                .find(|p| p.span == span)
                .map(|p| p.rd.clone())
                .unwrap_or_else(|| Arc::new(RootDomain::new(self.nr_cpus)));
            partitions.push(Partition { span, rd, attr });
        }

        let relax = self.boot.relax_domain_level.unwrap_or(-1);
        let tree = match DomainTree::build(&self.topo, partitions, relax, self.jiffies()) {
            Ok(tree) => tree,
            Err(e) => {
                log::error!("sched: topology of CPU{} at {} is broken, keeping old domains", e.cpu, e.level);
                return;
            }
        };

        for part in &tree.partitions {
            let check = EasCheck {
                energy_aware: self.tunables.energy_aware(),
                has_asym: part.span.iter().any(|cpu| tree.sd_asym_cpucapacity[cpu].is_some()),
                smt_active: self.topo.smt_present(),
                schedutil: self.hooks.schedutil_governor(),
                freq_invariant: self.hooks.freq_invariant(),
            };
            let pds = build_perf_domains(&self.topo, part.span, &check);
            *part.rd.pd.write() = pds.map(Arc::new);
            let max_cap = part.span.iter().map(|cpu| self.capacity_orig_of(cpu)).max().unwrap_or(0);
            part.rd.max_cpu_capacity.store(max_cap, Ordering::Relaxed);
        }

        let tree = Arc::new(tree);
        *self.domains.write() = tree.clone();

        for cpu in 0..self.nr_cpus {
            let rd = tree.rd_of(cpu).cloned().unwrap_or_else(|| self.def_root_domain.clone());
            let mut rq = self.rq_lock(cpu);
            self.rq_attach_root(&mut rq, &rd);
            drop(rq);
            for line in tree.debug_lines(cpu) {
                log::debug!("{}", line);
            }
        }
        self.dl_rebuild_rd_accounting();
    }

    /// 是否有根域启用了能耗感知调度
    pub fn eas_enabled_any(&self) -> bool {
        self.domain_tree().partitions.iter().any(|p| p.rd.eas_enabled())
    }

    // ---------------------------------------------------------------
    // 上线 / 下线
    // ---------------------------------------------------------------

    /// CPU 已经启动，可以接受中断和远程唤醒
    pub fn sched_cpu_starting(&self, cpu: usize) {
        let mut rq = self.rq_lock(cpu);
        self.update_rq_clock(&mut rq);
        rq.calc_load = RqLoad {
            calc_load_update: self.loadavg.calc_load_update(),
            calc_load_active: 0,
        };
        drop(rq);
        self.stopper_enable(cpu, true);
        self.cpu_online.set_cpu(cpu, Ordering::Release);
    }

    pub fn sched_cpu_activate(&self, cpu: usize) -> SchedResult<()> {
        if !self.cpu_online(cpu) {
            return Err(SchedError::InvalidAttr);
        }
        self.cpu_active.set_cpu(cpu, Ordering::Release);
        self.rebuild_sched_domains();
        let mut rq = self.rq_lock(cpu);
        self.set_rq_online(&mut rq);
        log::info!("sched: CPU{} active", cpu);
        Ok(())
    }

    /// 最后一个活跃 CPU 不能下线，DL 带宽装不下时也不能
    pub fn sched_cpu_deactivate(&self, cpu: usize) -> SchedResult<()> {
        if !self.cpu_active(cpu) {
            return Ok(());
        }
        if self.active_mask().weight() <= 1 {
            return Err(SchedError::Busy);
        }
        self.dl_bw_check_deactivate(cpu)?;

        self.cpu_active.clear_cpu(cpu, Ordering::Release);
        self.nohz_balance_exit_idle(cpu);
        {
            let mut rq = self.rq_lock(cpu);
            self.update_rq_clock(&mut rq);
            self.set_rq_offline(&mut rq);
        }
        self.rebuild_sched_domains();
        log::info!("sched: CPU{} inactive", cpu);
        Ok(())
    }

    /// 在即将离线的 CPU 上运行：迁走所有排队的任务
    pub fn sched_cpu_dying(&self, cpu: usize) {
        self.stopper_enable(cpu, false);
        self.cpu_online.clear_cpu(cpu, Ordering::Release);
        if self.tick_do_timer_cpu.load(Ordering::Relaxed) == cpu {
            if let Some(next) = self.online_mask().first() {
                self.tick_do_timer_cpu.store(next, Ordering::Relaxed);
            }
        }
        self.timers.cancel(TimerEvent::Hrtick(cpu));
        self.switch_to_idle(cpu);
        self.migrate_tasks(cpu);

        let mut rq = self.rq_lock(cpu);
        let (nr, unint) = (rq.nr_running, rq.nr_uninterruptible);
        self.loadavg.calc_load_migrate(&mut rq.calc_load, nr, unint);
        drop(rq);
        self.dl_rebuild_rd_accounting();
    }

    /// 当前任务放回队列，idle 接管 CPU
    fn switch_to_idle(&self, cpu: usize) {
        let mut rq = self.rq_lock(cpu);
        let prev = rq.curr;
        if prev == IDLE_PID {
            return;
        }
        self.update_rq_clock(&mut rq);
        let class = rq.task(prev).class;
        class.put_prev_task(self, &mut rq, prev);
        rq.task(prev).task.set_on_cpu(false);
        rq.task(IDLE_PID).task.set_on_cpu(true);
        rq.curr = IDLE_PID;
        SchedClass::Idle.set_next_task(self, &mut rq, IDLE_PID, true);
        rq.publish_curr();
    }

    fn next_to_migrate(&self, cpu: usize) -> Option<Pid> {
        let rq = self.rq_lock(cpu);
        rq.tasks
            .iter()
            .find(|(pid, st)| **pid != IDLE_PID && Some(**pid) != rq.stop && st.task.on_rq() == OnRq::Queued)
            .map(|(pid, _)| *pid)
    }

    /// 睡眠中的任务留在原处，唤醒时再选 CPU
    fn migrate_tasks(&self, cpu: usize) {
        while let Some(pid) = self.next_to_migrate(cpu) {
            let Some(p) = self.find_task(pid) else {
                break;
            };
            let (mut pi, mut rq) = self.task_rq_lock(&p);
            if rq.cpu != cpu || p.on_rq() != OnRq::Queued {
                continue;
            }
            self.update_rq_clock(&mut rq);
            let snap = self.task_snapshot(&rq, rq.task(pid));
            let (dest, wide) = self.select_fallback_rq(&snap);
            sched_bug_on!(dest == cpu, "CPU{}: nowhere to move task {}", cpu, pid);
            if let Some(mask) = wide {
                pi.cpus_mask = mask;
                self.do_set_cpus_allowed(&mut rq, pid, mask);
            }
            let rq = self.move_queued_task(rq, pid, dest);
            drop(pi);
            self.unlock_with_callbacks(rq);
            log::debug!("sched: task {} moved off dying CPU{} to CPU{}", pid, cpu, dest);
        }
    }

    /// idle 任务发现所在 CPU 已经离线
    pub(crate) fn cpuhp_report_idle_dead(&self, cpu: usize) {
        let rq = self.rq_lock(cpu);
        sched_bug_on!(rq.nr_running > 0, "CPU{}: {} tasks left on a dead CPU", cpu, rq.nr_running);
        drop(rq);
        self.hooks.rcu_idle_enter(cpu);
        log::info!("sched: CPU{} is now offline", cpu);
    }

    /// 下线 `cpu`
    pub fn cpu_down(&self, cpu: usize) -> SchedResult<()> {
        self.sched_cpu_deactivate(cpu)?;
        self.sched_cpu_dying(cpu);
        Ok(())
    }

    /// 重新上线 `cpu`
    pub fn cpu_up(&self, cpu: usize) -> SchedResult<()> {
        if cpu >= self.nr_cpus {
            return Err(SchedError::InvalidAttr);
        }
        if self.cpu_active(cpu) {
            return Ok(());
        }
        self.sched_cpu_starting(cpu);
        self.sched_cpu_activate(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::BootParams;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;
    use crate::sched::stop::StopWork;
    use crate::sched::SchedAttr;
    use crate::process::SchedPolicy;

    const MS: u64 = 1_000_000;

    fn sched_with(topo: ArchTopology, boot: BootParams) -> Scheduler {
        let clock = Arc::new(ManualClock::new(topo.nr_cpus));
        Scheduler::with_boot_params(topo, clock, Arc::new(NoopHooks), boot)
    }

    fn sched(cpus: usize) -> Scheduler {
        sched_with(ArchTopology::flat(cpus), BootParams::new())
    }

    #[test]
    fn boot_attaches_every_cpu_to_one_root_domain() {
        let s = sched(4);
        let tree = s.domain_tree();
        assert_eq!(tree.partitions.len(), 1);
        let rd = tree.partitions[0].rd.clone();
        assert_eq!(rd.span(), CpuMask::first_n(4));
        assert_eq!(rd.online(), CpuMask::first_n(4));
        for cpu in 0..4 {
            s.with_rq(cpu, |rq| {
                assert!(rq.online);
                assert!(Arc::ptr_eq(&rq.rd, &rd));
            });
        }
    }

    #[test]
    fn isolated_cpus_get_no_domains() {
        let mut boot = BootParams::new();
        boot.isolcpus = CpuMask::of(3);
        let s = sched_with(ArchTopology::flat(4), boot);
        let tree = s.domain_tree();
        assert_eq!(tree.partitions[0].span, CpuMask::first_n(3));
        assert!(tree.rd_of(3).is_none());
        s.with_rq(3, |rq| assert!(Arc::ptr_eq(&rq.rd, &s.def_root_domain)));
    }

    #[test]
    fn unchanged_partition_keeps_its_root_domain() {
        let s = sched(4);
        let p = s.spawn("dl", SchedAttr::deadline(10 * MS, 100 * MS, 100 * MS), None).unwrap();
        let before = s.domain_tree().partitions[0].rd.clone();
        s.rebuild_sched_domains();
        let after = s.domain_tree().partitions[0].rd.clone();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(after.dl_bw.lock().total_bw > 0);
        assert!(s.find_task(p).is_some());
    }

    #[test]
    fn cpuset_split_creates_two_root_domains() {
        let s = sched(4);
        s.set_cpuset_partitions(Some(alloc::vec![
            (CpuMask::from_cpus(&[0, 1]), DomainAttr::default()),
            (CpuMask::from_cpus(&[2, 3]), DomainAttr::default()),
        ]));
        let tree = s.domain_tree();
        assert_eq!(tree.partitions.len(), 2);
        let (a, b) = (tree.rd_of(0).unwrap(), tree.rd_of(2).unwrap());
        assert!(!Arc::ptr_eq(a, b));
        assert_eq!(a.span(), CpuMask::from_cpus(&[0, 1]));
        assert_eq!(b.online(), CpuMask::from_cpus(&[2, 3]));
        s.set_cpuset_partitions(None);
        assert_eq!(s.domain_tree().partitions.len(), 1);
    }

    #[test]
    fn offline_cpu_moves_queued_tasks_away() {
        let s = sched(2);
        let a = s.spawn("a", SchedAttr::normal(0), Some(CpuMask::of(1))).unwrap();
        let b = s.spawn("b", SchedAttr::rt(SchedPolicy::Fifo, 10), None).unwrap();
        s.set_cpus_allowed_ptr(b, CpuMask::of(1)).unwrap();
        s.schedule_on(1, false);

        s.cpu_down(1).unwrap();
        assert!(!s.cpu_online(1));
        assert!(!s.cpu_active(1));
        assert_eq!(s.find_task(a).unwrap().task_cpu(), 0);
        assert_eq!(s.find_task(b).unwrap().task_cpu(), 0);
        // 亲和性被放宽
        assert!(s.find_task(a).unwrap().cpus_mask().test(0));
        s.with_rq(1, |rq| {
            assert_eq!(rq.nr_running, 0);
            assert!(rq.curr_is_idle());
            assert!(!rq.online);
        });
        assert_eq!(s.nr_running_on(0), 2);
        assert_eq!(s.domain_tree().partitions[0].span, CpuMask::of(0));
    }

    #[test]
    fn offline_cpu_refuses_stop_work_until_back_up() {
        let s = sched(2);
        s.cpu_down(1).unwrap();
        assert!(!s.stop_one_cpu_nowait(1, StopWork::ActiveBalance { target: 0 }));

        s.cpu_up(1).unwrap();
        assert!(s.cpu_online(1));
        assert!(s.stop_one_cpu_nowait(1, StopWork::ActiveBalance { target: 0 }));
    }

    #[test]
    fn last_active_cpu_stays() {
        let s = sched(2);
        s.cpu_down(1).unwrap();
        assert_eq!(s.cpu_down(0), Err(SchedError::Busy));
        s.cpu_up(1).unwrap();
        assert!(s.cpu_active(1));
        assert_eq!(s.domain_tree().partitions[0].span, CpuMask::first_n(2));
        s.with_rq(1, |rq| assert!(rq.online));
    }

    #[test]
    fn dl_bandwidth_blocks_offlining() {
        let s = sched(2);
        // 每个 CPU 最多 95%，两个 60% 的任务放不进一个 CPU
        s.spawn("d0", SchedAttr::deadline(60 * MS, 100 * MS, 100 * MS), None).unwrap();
        s.spawn("d1", SchedAttr::deadline(60 * MS, 100 * MS, 100 * MS), None).unwrap();
        assert_eq!(s.cpu_down(1), Err(SchedError::Busy));
        assert!(s.cpu_active(1));
    }

    #[test]
    fn big_little_enables_energy_aware_scheduling() {
        let topo = ArchTopology::big_little(2, 438, &[(500, 50), (1000, 150)], 2, 1024, &[(1000, 400), (2000, 1200)]);
        let s = sched_with(topo, BootParams::new());
        assert_eq!(s.eas_enabled_any(), s.tunables.energy_aware());
        s.sysctl_sched_energy_aware(false);
        assert!(!s.eas_enabled_any());
    }
}
