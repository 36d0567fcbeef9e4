//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器使用的高精度定时器
//!
//! 只有固定的几类定时器：RT/CFS 带宽周期、CFS slack、DL 补充和
//! inactive、hrtick。每个定时器由 [`TimerEvent`] 唯一标识，重复
//! `start` 会改期而不是新增。到期回调在不持有 base 锁的情况下执行，
//! 需要周期运行的回调返回新的到期时间。

use alloc::collections::BTreeMap;
use spin::Mutex;

use super::group::GroupId;
use crate::process::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerEvent {
    RtPeriod(GroupId),
    CfsPeriod(GroupId),
    CfsSlack(GroupId),
    DlReplenish(Pid),
    DlInactive(Pid),
    Hrtick(usize),
}

/// 回调返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrtimerRestart {
    NoRestart,
    Restart(u64),
}

struct Queue {
    /// (到期时间, 序号) -> 事件
    pending: BTreeMap<(u64, u64), TimerEvent>,
    armed: BTreeMap<TimerEvent, (u64, u64)>,
    seq: u64,
}

pub struct HrtimerBase {
    queue: Mutex<Queue>,
}

/// 把 `expires` 向后推进整数个 `interval` 直到超过 `now`，返回新的到期时间和推进次数
pub fn hrtimer_forward(expires: u64, now: u64, interval: u64) -> (u64, u64) {
    if now < expires || interval == 0 {
        return (expires, 0);
    }
    let delta = now - expires;
    let overrun = delta / interval + 1;
    (expires + overrun * interval, overrun)
}

impl HrtimerBase {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                pending: BTreeMap::new(),
                armed: BTreeMap::new(),
                seq: 0,
            }),
        }
    }

    /// 启动或改期
    pub fn start(&self, ev: TimerEvent, expires: u64) {
        let mut q = self.queue.lock();
        if let Some(key) = q.armed.remove(&ev) {
            q.pending.remove(&key);
        }
        q.seq += 1;
        let key = (expires, q.seq);
        q.pending.insert(key, ev);
        q.armed.insert(ev, key);
    }

    /// 取消，返回之前是否处于激活状态
    pub fn cancel(&self, ev: TimerEvent) -> bool {
        let mut q = self.queue.lock();
        match q.armed.remove(&ev) {
            Some(key) => {
                q.pending.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, ev: TimerEvent) -> bool {
        self.queue.lock().armed.contains_key(&ev)
    }

    pub fn expires(&self, ev: TimerEvent) -> Option<u64> {
        self.queue.lock().armed.get(&ev).map(|k| k.0)
    }

    pub fn next_expiry(&self) -> Option<u64> {
        self.queue.lock().pending.keys().next().map(|k| k.0)
    }

    /// 取出一个已到期的定时器
    pub fn pop_expired(&self, now: u64) -> Option<(u64, TimerEvent)> {
        let mut q = self.queue.lock();
        let (&key, &ev) = q.pending.iter().next()?;
        if key.0 > now {
            return None;
        }
        q.pending.remove(&key);
        q.armed.remove(&ev);
        Some((key.0, ev))
    }
}

impl Default for HrtimerBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_counts_overruns() {
        assert_eq!(hrtimer_forward(100, 50, 10), (100, 0));
        assert_eq!(hrtimer_forward(100, 100, 10), (110, 1));
        assert_eq!(hrtimer_forward(100, 135, 10), (140, 4));
    }

    #[test]
    fn restart_replaces_and_pops_in_order() {
        let base = HrtimerBase::new();
        base.start(TimerEvent::RtPeriod(0), 300);
        base.start(TimerEvent::DlReplenish(7), 100);
        base.start(TimerEvent::RtPeriod(0), 50);
        assert_eq!(base.next_expiry(), Some(50));
        assert_eq!(base.pop_expired(40), None);
        assert_eq!(base.pop_expired(200), Some((50, TimerEvent::RtPeriod(0))));
        assert!(!base.is_active(TimerEvent::RtPeriod(0)));
        assert!(base.cancel(TimerEvent::DlReplenish(7)));
        assert!(!base.cancel(TimerEvent::DlReplenish(7)));
        assert_eq!(base.pop_expired(u64::MAX), None);
    }
}
