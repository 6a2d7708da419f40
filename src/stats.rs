/// 统计存储
/// Latest per-source stats plus global throughput, shared across threads
///
/// 写入方只有汇合线程 (每帧覆盖一次), 叠加与日志并发读取快照.
use crate::rate::RateEstimator;
use crate::types::SourceStats;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::time::Instant;

/// 全局统计快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalStats {
    pub frame_count: u64,
    pub rate: f64,
    pub average_rate: f64,
    pub start_time: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct StatsStore {
    latest: RwLock<BTreeMap<u32, SourceStats>>,
    global: Mutex<RateEstimator>,
    /// streammux 入口处每个源的帧数 (调试)
    muxed: Mutex<BTreeMap<u32, u64>>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个批次调用一次, 返回当前瞬时帧率
    pub fn tick(&self) -> f64 {
        self.global.lock().tick()
    }

    pub fn tick_at(&self, now: Instant) -> f64 {
        self.global.lock().tick_at(now)
    }

    pub fn current_rate(&self) -> f64 {
        self.global.lock().rate()
    }

    pub fn global(&self) -> GlobalStats {
        let est = self.global.lock();
        GlobalStats {
            frame_count: est.frame_count(),
            rate: est.rate(),
            average_rate: est.average(),
            start_time: est.start_time(),
        }
    }

    /// 覆盖该源的上一帧统计
    pub fn publish(&self, stats: SourceStats) {
        self.latest.write().insert(stats.source_id, stats);
    }

    pub fn get(&self, source_id: u32) -> Option<SourceStats> {
        self.latest.read().get(&source_id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<u32, SourceStats> {
        self.latest.read().clone()
    }

    /// 记录进入 streammux 的帧, 返回累计总帧数
    pub fn record_muxed(&self, source_id: u32) -> u64 {
        let mut muxed = self.muxed.lock();
        *muxed.entry(source_id).or_insert(0) += 1;
        muxed.values().sum()
    }

    pub fn muxed_counts(&self) -> BTreeMap<u32, u64> {
        self.muxed.lock().clone()
    }
}
