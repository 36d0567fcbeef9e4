//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! CPU 时间统计与调试输出
//!
//! 每个 tick 把一个 `TICK_NSEC` 记到当前 CPU 的 cpustat 里，并生成
//! `/proc/stat`、`/proc/loadavg` 格式的文本。

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::Ordering;

use super::core::Scheduler;
use super::loadavg::{load_frac, load_int, FIXED_1};
use super::rq::{CpuTime, PerCpu, Rq, NR_STATS};
use super::DEFAULT_PRIO;
use crate::config::TICK_NSEC;
use crate::process::{OnRq, Pid};

/// `/proc/stat` 使用的时钟频率
pub const USER_HZ: u64 = 100;

fn nsec_to_clock_t(ns: u64) -> u64 {
    ns / (1_000_000_000 / USER_HZ)
}

/// `/proc/stat` 中 cpu 行的列顺序
const STAT_COLUMNS: [CpuTime; NR_STATS] = [
    CpuTime::User,
    CpuTime::Nice,
    CpuTime::System,
    CpuTime::Idle,
    CpuTime::Iowait,
    CpuTime::Irq,
    CpuTime::Softirq,
    CpuTime::Steal,
    CpuTime::Guest,
    CpuTime::GuestNice,
];

fn stat_line(out: &mut String, name: &str, stat: impl Fn(CpuTime) -> u64) {
    let _ = write!(out, "{}", name);
    for idx in STAT_COLUMNS {
        let _ = write!(out, " {}", nsec_to_clock_t(stat(idx)));
    }
    out.push('\n');
}

impl Scheduler {
    /// 按 tick 采样记账
    ///
    /// 中断时间由时钟源单独给出，先从这个 tick 里扣掉，剩下的归给
    /// 当前任务或 idle。
    pub(crate) fn account_process_tick(&self, cpu: usize, user_tick: bool) {
        let pcpu = &self.pcpu[cpu];
        let irq_now = self.clock.irq_time(cpu);
        let irq_prev = pcpu.irq_accounted.swap(irq_now, Ordering::Relaxed);
        let irq = irq_now.saturating_sub(irq_prev).min(TICK_NSEC);
        if irq > 0 {
            pcpu.account(CpuTime::Irq, irq);
        }
        let rest = TICK_NSEC - irq;
        if rest == 0 {
            return;
        }

        let rq = self.rq_lock(cpu);
        if rq.curr_is_idle() {
            if pcpu.nr_iowait.load(Ordering::Relaxed) > 0 {
                pcpu.account(CpuTime::Iowait, rest);
            } else {
                pcpu.account(CpuTime::Idle, rest);
            }
            return;
        }
        let st = rq.curr_task();
        if user_tick {
            st.task.utime.fetch_add(rest, Ordering::Relaxed);
            let idx = if st.static_prio > DEFAULT_PRIO { CpuTime::Nice } else { CpuTime::User };
            pcpu.account(idx, rest);
        } else {
            st.task.stime.fetch_add(rest, Ordering::Relaxed);
            pcpu.account(CpuTime::System, rest);
        }
    }

    /// 全部 CPU 的上下文切换次数
    pub fn nr_context_switches(&self) -> u64 {
        self.pcpu.iter().map(|p| p.ctxt.load(Ordering::Relaxed)).sum()
    }

    /// 处于 iowait 睡眠的任务数
    pub fn nr_iowait(&self) -> u64 {
        self.pcpu.iter().map(|p| p.nr_iowait.load(Ordering::Relaxed).max(0) as u64).sum()
    }

    pub fn nr_threads(&self) -> usize {
        self.tasks.read().len()
    }

    /// `/proc/stat` 的调度相关部分，`btime` 为启动时刻（秒）
    pub fn proc_stat(&self, btime: u64) -> String {
        let online = self.online_mask();
        let mut out = String::new();
        let sum = |idx: CpuTime| online.iter().map(|cpu| self.pcpu[cpu].stat(idx)).sum::<u64>();
        stat_line(&mut out, "cpu ", sum);
        for cpu in online.iter() {
            let pcpu: &PerCpu = &self.pcpu[cpu];
            stat_line(&mut out, &format!("cpu{}", cpu), |idx| pcpu.stat(idx));
        }
        let _ = writeln!(out, "ctxt {}", self.nr_context_switches());
        let _ = writeln!(out, "btime {}", btime);
        let _ = writeln!(out, "processes {}", self.total_forks.load(Ordering::Relaxed));
        let _ = writeln!(out, "procs_running {}", self.nr_running());
        let _ = writeln!(out, "procs_blocked {}", self.nr_iowait());
        out
    }

    /// `/proc/loadavg`
    pub fn proc_loadavg(&self) -> String {
        let avnrun = self.loadavg.get_avenrun(FIXED_1 / 200, 0);
        format!(
            "{}.{:02} {}.{:02} {}.{:02} {}/{} {}\n",
            load_int(avnrun[0]),
            load_frac(avnrun[0]),
            load_int(avnrun[1]),
            load_frac(avnrun[1]),
            load_int(avnrun[2]),
            load_frac(avnrun[2]),
            self.nr_running(),
            self.nr_threads(),
            self.pids.last_pid()
        )
    }

    /// 单个任务的调度状态，一行
    pub fn sched_show_task(&self, pid: Pid) -> Option<String> {
        let p = self.find_task(pid)?;
        let (_pi, rq) = self.task_rq_lock(&p);
        let st = rq.try_task(pid)?;
        Some(format!(
            "task:{:<15} state:{} pid:{:>5} cpu:{} policy:{:?} prio:{} vruntime:{} exec:{} switches:{}/{}",
            p.comm(),
            p.state().as_char(),
            pid,
            st.cpu(),
            st.policy,
            st.prio,
            st.se.vruntime,
            st.se.sum_exec_runtime,
            p.nvcsw.load(Ordering::Relaxed),
            p.nivcsw.load(Ordering::Relaxed)
        ))
    }

    /// 运行队列的调试快照
    pub fn sched_debug_rq(&self, cpu: usize) -> Vec<String> {
        let rq = self.rq_lock(cpu);
        rq_lines(&rq)
    }

    /// 把所有在线 CPU 的运行队列和调度域打到日志里
    pub fn print_sched_debug(&self) {
        let tree = self.domain_tree();
        for cpu in self.online_mask().iter() {
            for line in self.sched_debug_rq(cpu) {
                log::debug!("{}", line);
            }
            for line in tree.debug_lines(cpu) {
                log::debug!("{}", line);
            }
        }
    }
}

fn rq_lines(rq: &Rq) -> Vec<String> {
    let mut out = Vec::new();
    out.push(format!("cpu#{}", rq.cpu));
    out.push(format!("  .nr_running                    : {}", rq.nr_running));
    out.push(format!("  .nr_switches                   : {}", rq.nr_switches));
    out.push(format!("  .nr_uninterruptible            : {}", rq.nr_uninterruptible));
    out.push(format!("  .curr->pid                     : {}", rq.curr));
    out.push(format!("  .clock                         : {}", rq.clock));
    out.push(format!("  .clock_task                    : {}", rq.clock_task));
    out.push(format!("  .cpu_capacity                  : {}", rq.cpu_capacity));
    for (g, cfs) in rq.cfs.iter().enumerate().filter(|(_, c)| c.on_list || c.tg == 0) {
        out.push(format!("cfs_rq[{}]:/{}", rq.cpu, g));
        out.push(format!("  .min_vruntime                  : {}", cfs.min_vruntime));
        out.push(format!("  .nr_running                    : {}", cfs.nr_running));
        out.push(format!("  .h_nr_running                  : {}", cfs.h_nr_running));
        out.push(format!("  .load_avg                      : {}", cfs.avg.load_avg));
        out.push(format!("  .util_avg                      : {}", cfs.avg.util_avg));
        out.push(format!("  .throttled                     : {}", cfs.throttled as u8));
    }
    let rt = &rq.rt[0];
    out.push(format!("rt_rq[{}]:", rq.cpu));
    out.push(format!("  .rt_nr_running                 : {}", rt.rt_nr_running));
    out.push(format!("  .rt_throttled                  : {}", rt.rt_throttled as u8));
    out.push(format!("dl_rq[{}]:", rq.cpu));
    out.push(format!("  .dl_nr_running                 : {}", rq.dl.dl_nr_running));
    out.push(format!("  .running_bw                    : {}", rq.dl.running_bw));
    out.push(format!("  .this_bw                       : {}", rq.dl.this_bw));
    out.push(String::from("runnable tasks:"));
    for (pid, st) in rq.tasks.iter().filter(|(_, st)| st.task.on_rq() == OnRq::Queued) {
        out.push(format!(
            " {}{:>15} {:>5} {:>9} {:>3} {:?}",
            if *pid == rq.curr { '>' } else { ' ' },
            st.task.comm(),
            pid,
            st.se.vruntime,
            st.prio,
            st.policy
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::cmdline::BootParams;
    use crate::sched::hooks::{ManualClock, NoopHooks};
    use crate::sched::topology::ArchTopology;
    use crate::sched::SchedAttr;

    fn sched(cpus: usize) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(cpus));
        let s = Scheduler::with_boot_params(ArchTopology::flat(cpus), clock.clone(), Arc::new(NoopHooks), BootParams::new());
        (s, clock)
    }

    #[test]
    fn idle_and_user_ticks_are_split() {
        let (s, clock) = sched(1);
        clock.advance(TICK_NSEC);
        s.timer_interrupt(0, false);
        assert_eq!(s.pcpu[0].stat(CpuTime::Idle), TICK_NSEC);

        let p = s.spawn("p", SchedAttr::normal(5), None).unwrap();
        s.schedule_on(0, false);
        assert_eq!(s.curr_on(0), p);
        clock.advance(TICK_NSEC);
        s.timer_interrupt(0, true);
        assert_eq!(s.pcpu[0].stat(CpuTime::Nice), TICK_NSEC);
        assert_eq!(s.pcpu[0].stat(CpuTime::User), 0);
        clock.advance(TICK_NSEC);
        s.timer_interrupt(0, false);
        assert_eq!(s.pcpu[0].stat(CpuTime::System), TICK_NSEC);
        let t = s.find_task(p).unwrap();
        assert_eq!(t.utime.load(Ordering::Relaxed), TICK_NSEC);
        assert_eq!(t.stime.load(Ordering::Relaxed), TICK_NSEC);
    }

    #[test]
    fn irq_time_is_taken_out_of_the_tick() {
        let (s, clock) = sched(1);
        clock.add_irq_time(0, TICK_NSEC / 4);
        clock.advance(TICK_NSEC);
        s.timer_interrupt(0, false);
        assert_eq!(s.pcpu[0].stat(CpuTime::Irq), TICK_NSEC / 4);
        assert_eq!(s.pcpu[0].stat(CpuTime::Idle), TICK_NSEC - TICK_NSEC / 4);
    }

    #[test]
    fn proc_stat_lists_online_cpus() {
        let (s, clock) = sched(2);
        clock.advance(TICK_NSEC);
        s.timer_interrupt(0, false);
        s.timer_interrupt(1, false);
        let text = s.proc_stat(1_700_000_000);
        let lines: Vec<&str> = text.lines().collect();
        // 两个 tick 的 idle，各 0.4 个 USER_HZ
        assert!(lines[0].starts_with("cpu  0 0 0 0 0"));
        assert!(lines[1].starts_with("cpu0 "));
        assert!(lines[2].starts_with("cpu1 "));
        assert!(text.contains("btime 1700000000\n"));
        assert!(text.contains("procs_running 0\n"));
    }

    #[test]
    fn proc_loadavg_format() {
        let (s, _) = sched(1);
        let p = s.spawn("p", SchedAttr::normal(0), None).unwrap();
        let text = s.proc_loadavg();
        // migration/0 也算一个线程
        assert_eq!(text, format!("0.00 0.00 0.00 1/2 {}\n", p));
    }

    #[test]
    fn debug_dump_shows_queued_tasks() {
        let (s, _) = sched(1);
        let p = s.spawn("worker", SchedAttr::normal(0), None).unwrap();
        let lines = s.sched_debug_rq(0);
        assert_eq!(lines[0], "cpu#0");
        assert!(lines.iter().any(|l| l.contains("worker")));
        let line = s.sched_show_task(p).unwrap();
        assert!(line.starts_with("task:worker"));
        assert!(s.sched_show_task(9999).is_none());
    }
}
