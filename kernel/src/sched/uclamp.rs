//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 利用率钳制 (uclamp)
//!
//! 每个任务有 [min, max] 两个钳制值。rq 按桶记录可运行任务的钳制值，
//! rq 的有效钳制取所有桶中的最大值（max-aggregation）：只要有一个任务
//! 要求高 min，整个 CPU 就按高 min 跑。

use super::fixedpt::SCHED_CAPACITY_SCALE;

pub const UCLAMP_BUCKETS: usize = 5;
/// 每个桶覆盖的利用率区间，四舍五入
pub const UCLAMP_BUCKET_DELTA: u32 =
    ((SCHED_CAPACITY_SCALE as u32) + (UCLAMP_BUCKETS as u32) / 2) / UCLAMP_BUCKETS as u32;

/// rq 变为空闲后保留 max 钳制
pub const UCLAMP_FLAG_IDLE: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UclampId {
    Min = 0,
    Max = 1,
}

pub const UCLAMP_IDS: [UclampId; 2] = [UclampId::Min, UclampId::Max];

#[inline]
pub fn uclamp_none(id: UclampId) -> u32 {
    match id {
        UclampId::Min => 0,
        UclampId::Max => SCHED_CAPACITY_SCALE as u32,
    }
}

#[inline]
pub fn uclamp_bucket_id(value: u32) -> u32 {
    (value / UCLAMP_BUCKET_DELTA).min(UCLAMP_BUCKETS as u32 - 1)
}

/// 任务的一个钳制值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UclampSe {
    pub value: u32,
    pub bucket_id: u32,
    /// 已计入 rq 的桶
    pub active: bool,
    /// 由 setattr 显式设置
    pub user_defined: bool,
}

impl UclampSe {
    pub fn new(value: u32, user_defined: bool) -> Self {
        Self {
            value,
            bucket_id: uclamp_bucket_id(value),
            active: false,
            user_defined,
        }
    }

    pub fn none(id: UclampId) -> Self {
        Self::new(uclamp_none(id), false)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UclampBucket {
    pub value: u32,
    pub tasks: u32,
}

/// rq 上一个钳制维度的聚合
#[derive(Debug, Clone, Copy)]
pub struct UclampRq {
    pub value: u32,
    pub bucket: [UclampBucket; UCLAMP_BUCKETS],
}

impl UclampRq {
    pub fn new(id: UclampId) -> Self {
        Self {
            value: uclamp_none(id),
            bucket: [UclampBucket::default(); UCLAMP_BUCKETS],
        }
    }
}

/// 每个 rq 的 uclamp 状态
#[derive(Debug, Clone, Copy)]
pub struct RqUclamp {
    pub clamp: [UclampRq; 2],
    pub flags: u32,
}

impl Default for RqUclamp {
    fn default() -> Self {
        Self {
            clamp: [UclampRq::new(UclampId::Min), UclampRq::new(UclampId::Max)],
            flags: UCLAMP_FLAG_IDLE,
        }
    }
}

/// 受系统默认值限制后的有效钳制
pub fn uclamp_eff_get(req: UclampSe, id: UclampId, system: [u32; 2]) -> UclampSe {
    let sys_max = system[id as usize];
    if req.value > sys_max {
        return UclampSe::new(sys_max, false);
    }
    req
}

impl RqUclamp {
    #[inline]
    pub fn value(&self, id: UclampId) -> u32 {
        self.clamp[id as usize].value
    }

    /// 无任务时的取值：max 钳制保留最后一个任务的值，避免 idle 时频率抖动
    fn idle_value(&mut self, id: UclampId, clamp_value: u32) -> u32 {
        if id == UclampId::Max {
            self.flags |= UCLAMP_FLAG_IDLE;
            return clamp_value;
        }
        uclamp_none(UclampId::Min)
    }

    fn idle_reset(&mut self, id: UclampId, clamp_value: u32) {
        if self.flags & UCLAMP_FLAG_IDLE == 0 {
            return;
        }
        self.clamp[id as usize].value = clamp_value;
    }

    fn max_value(&mut self, id: UclampId, clamp_value: u32) -> u32 {
        let buckets = &self.clamp[id as usize].bucket;
        if let Some(b) = buckets.iter().rev().find(|b| b.tasks != 0) {
            return b.value;
        }
        self.idle_value(id, clamp_value)
    }

    /// 任务入队时计入桶，返回写回任务的有效值
    pub fn inc_id(&mut self, eff: UclampSe, id: UclampId) -> UclampSe {
        let mut uc_se = eff;
        let b = &mut self.clamp[id as usize].bucket[uc_se.bucket_id as usize];
        b.tasks += 1;
        uc_se.active = true;

        self.idle_reset(id, uc_se.value);

        let b = &mut self.clamp[id as usize].bucket[uc_se.bucket_id as usize];
        if b.tasks == 1 || uc_se.value > b.value {
            b.value = uc_se.value;
        }
        if uc_se.value > self.clamp[id as usize].value {
            self.clamp[id as usize].value = uc_se.value;
        }
        uc_se
    }

    /// 任务出队时移出桶
    pub fn dec_id(&mut self, uc_se: &mut UclampSe, id: UclampId) {
        if !uc_se.active {
            return;
        }
        let b = &mut self.clamp[id as usize].bucket[uc_se.bucket_id as usize];
        if b.tasks == 0 {
            super::bug(format_args!("uclamp bucket underflow"));
        }
        b.tasks -= 1;
        uc_se.active = false;

        // 桶空后保留旧值，下次计入时覆盖
        if b.tasks != 0 {
            return;
        }
        let bucket_value = b.value;
        let rq_clamp = self.clamp[id as usize].value;
        if bucket_value >= rq_clamp {
            let v = self.max_value(id, uc_se.value);
            self.clamp[id as usize].value = v;
        }
    }

    /// 第一个任务入队后清除 idle 标志
    pub fn clear_idle_flag(&mut self) {
        self.flags &= !UCLAMP_FLAG_IDLE;
    }

    /// 对 `util` 施加 rq（以及可选的任务）钳制
    pub fn util_with(&self, util: u64, task: Option<(u32, u32)>) -> u64 {
        let mut min_util = self.value(UclampId::Min);
        let mut max_util = self.value(UclampId::Max);

        if let Some((tmin, tmax)) = task {
            min_util = min_util.max(tmin);
            // 空闲 rq 的 max 钳制只由唤醒任务决定
            if self.flags & UCLAMP_FLAG_IDLE != 0 {
                max_util = tmax;
            } else {
                max_util = max_util.max(tmax);
            }
        }

        if min_util >= max_util {
            return min_util as u64;
        }
        util.clamp(min_util as u64, max_util as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_mapping() {
        assert_eq!(UCLAMP_BUCKET_DELTA, 205);
        assert_eq!(uclamp_bucket_id(0), 0);
        assert_eq!(uclamp_bucket_id(204), 0);
        assert_eq!(uclamp_bucket_id(205), 1);
        assert_eq!(uclamp_bucket_id(1024), 4);
    }

    fn enqueue(rq: &mut RqUclamp, min: u32, max: u32) -> (UclampSe, UclampSe) {
        let a = rq.inc_id(UclampSe::new(min, true), UclampId::Min);
        let b = rq.inc_id(UclampSe::new(max, true), UclampId::Max);
        rq.clear_idle_flag();
        (a, b)
    }

    #[test]
    fn max_aggregation_and_idle_hold() {
        let mut rq = RqUclamp::default();
        let (mut a_min, mut a_max) = enqueue(&mut rq, 300, 512);
        assert_eq!(rq.value(UclampId::Min), 300);
        assert_eq!(rq.value(UclampId::Max), 512);

        let (mut b_min, mut b_max) = enqueue(&mut rq, 700, 1024);
        assert_eq!(rq.value(UclampId::Min), 700);
        assert_eq!(rq.value(UclampId::Max), 1024);

        rq.dec_id(&mut b_min, UclampId::Min);
        rq.dec_id(&mut b_max, UclampId::Max);
        assert_eq!(rq.value(UclampId::Min), 300);
        assert_eq!(rq.value(UclampId::Max), 512);

        rq.dec_id(&mut a_min, UclampId::Min);
        rq.dec_id(&mut a_max, UclampId::Max);
        assert_eq!(rq.value(UclampId::Min), 0);
        // 最后一个任务离开后保留它的 max
        assert_eq!(rq.value(UclampId::Max), 512);
        assert!(rq.flags & UCLAMP_FLAG_IDLE != 0);
    }

    #[test]
    fn util_clamping() {
        let rq = RqUclamp::default();
        assert_eq!(rq.util_with(100, Some((300, 1024))), 300);
        assert_eq!(rq.util_with(900, Some((0, 512))), 512);
        assert_eq!(rq.util_with(900, None), 900);
    }

    #[test]
    fn system_default_restricts() {
        let eff = uclamp_eff_get(UclampSe::new(800, true), UclampId::Min, [512, 1024]);
        assert_eq!(eff.value, 512);
    }
}
