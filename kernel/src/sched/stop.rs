//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! stop 调度类与每 CPU 的 stopper
//!
//! stopper 是每个 CPU 上优先级最高的内核线程，用来执行必须独占 CPU
//! 的工作：把正在运行的任务迁走、主动负载均衡。工作一旦排入就会执行
//! 完毕，不能取消。

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::core::Scheduler;
use super::rq::Rq;
use super::EnqueueFlags;
use super::DequeueFlags;
use crate::process::{OnRq, Pid, TaskState};

/// 交给 stopper 的工作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopWork {
    /// 把任务迁到 `dest`，`None` 表示按亲和性任选
    Migrate { pid: Pid, dest: Option<usize> },
    /// 从本 CPU 向 `target` 推一个 fair 任务
    ActiveBalance { target: usize },
    /// 推走当前任务，给关了迁移的任务让位
    Push { pid: Pid },
}

pub struct CpuStopper {
    pub pid: Pid,
    works: Mutex<VecDeque<StopWork>>,
    enabled: AtomicBool,
}

impl CpuStopper {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            works: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn pending(&self) -> usize {
        self.works.lock().len()
    }
}

impl Scheduler {
    pub(crate) fn enqueue_task_stop(&self, rq: &mut Rq, _pid: Pid, _flags: EnqueueFlags) {
        self.add_nr_running(rq, 1);
    }

    pub(crate) fn dequeue_task_stop(&self, rq: &mut Rq, _pid: Pid, _flags: DequeueFlags) {
        self.sub_nr_running(rq, 1);
    }

    pub(crate) fn pick_task_stop(&self, rq: &mut Rq) -> Option<Pid> {
        let pid = rq.stop?;
        (rq.task(pid).task.on_rq() == OnRq::Queued).then_some(pid)
    }

    pub(crate) fn balance_stop(&self, rq: &Rq) -> bool {
        rq.stop.map_or(false, |pid| rq.task(pid).task.on_rq() == OnRq::Queued)
    }

    pub(crate) fn set_next_task_stop(&self, rq: &mut Rq, pid: Pid, _first: bool) {
        let now = rq.clock_task;
        rq.task_mut(pid).se.exec_start = now;
    }

    pub(crate) fn put_prev_task_stop(&self, rq: &mut Rq, _pid: Pid) {
        self.update_curr_stop(rq);
    }

    pub(crate) fn update_curr_stop(&self, rq: &mut Rq) {
        let now = rq.clock_task;
        let curr = rq.curr;
        let se = &mut rq.task_mut(curr).se;
        let delta = now.saturating_sub(se.exec_start);
        if delta == 0 {
            return;
        }
        se.exec_start = now;
        se.sum_exec_runtime += delta;
        se.statistics.exec_max = se.statistics.exec_max.max(delta);
    }

    pub(crate) fn stopper_is_curr(&self, cpu: usize) -> bool {
        self.curr_on(cpu) == self.stoppers[cpu].pid
    }

    /// 把工作排给 `cpu` 的 stopper，不等待完成
    ///
    /// stopper 已停用（CPU 下线中）时返回 false。
    pub fn stop_one_cpu_nowait(&self, cpu: usize, work: StopWork) -> bool {
        let stopper = &self.stoppers[cpu];
        {
            let mut works = stopper.works.lock();
            if !stopper.enabled.load(Ordering::Acquire) {
                return false;
            }
            works.push_back(work);
        }
        self.wake_up_process(stopper.pid);
        true
    }

    pub(crate) fn stopper_enable(&self, cpu: usize, on: bool) {
        let stopper = &self.stoppers[cpu];
        let _works = stopper.works.lock();
        stopper.enabled.store(on, Ordering::Release);
    }

    /// stopper 线程体：做完所有工作后睡眠
    pub(crate) fn cpu_stopper_thread(&self, cpu: usize) {
        let stopper = &self.stoppers[cpu];
        loop {
            let work = {
                let mut works = stopper.works.lock();
                match works.pop_front() {
                    Some(w) => w,
                    None => {
                        // 在工作队列锁内睡下，避免与新排入的工作错过唤醒
                        if let Some(p) = self.find_task(stopper.pid) {
                            p.set_current_state(TaskState::INTERRUPTIBLE);
                        }
                        return;
                    }
                }
            };
            log::trace!("CPU{}: stopper runs {:?}", cpu, work);
            match work {
                StopWork::Migrate { pid, dest } => self.migration_cpu_stop(cpu, pid, dest),
                StopWork::ActiveBalance { target } => self.active_load_balance_cpu_stop(cpu, target),
                StopWork::Push { pid } => self.push_cpu_stop(cpu, pid),
            }
        }
    }

    /// 在 `cpu` 上把任务迁走；此时任务不可能在运行
    fn migration_cpu_stop(&self, cpu: usize, pid: Pid, dest: Option<usize>) {
        let Some(p) = self.find_task(pid) else {
            return;
        };
        let pi = p.pi_lock.lock();
        let rq = self.rq_lock(cpu);
        if p.task_cpu() != cpu || pi.migration_disabled > 0 {
            // 已经被别人迁走，或者又关了迁移
            return;
        }
        let valid = self.active_mask();
        let dest = match dest {
            Some(d) if pi.cpus_mask.test(d) && valid.test(d) => Some(d),
            _ => pi.cpus_mask.and(valid).first(),
        };
        let Some(dest) = dest else {
            return;
        };
        if dest == cpu {
            return;
        }
        if p.on_rq() == OnRq::Queued {
            let mut rq = rq;
            self.update_rq_clock(&mut rq);
            let rq = self.move_queued_task(rq, pid, dest);
            drop(pi);
            self.unlock_with_callbacks(rq);
        } else {
            p.set_wake_cpu(dest);
        }
    }
}
