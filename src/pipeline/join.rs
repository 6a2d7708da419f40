/// 分支汇合 (Fan-in barrier)
/// 职责: 等待批次的所有分支结果 → 合并检测 → 聚合统计 → 生成叠加信息
///
/// 一个批次只有在所有分支都交付后才会进入聚合器; 汇合超时按配置的策略处理.
use super::{CompositeFrame, FrameBatch};
use crate::aggregator::DetectionAggregator;
use crate::config::{JoinConfig, StallPolicy};
use crate::control::ControlEvent;
use crate::overlay::{OverlayComposer, TileLayout};
use crate::registry::StreamRegistry;
use crate::stats::StatsStore;
use crate::types::{DetectionRecord, SourceState};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 每隔多少个批次打印一次汇总
pub const SUMMARY_INTERVAL: u64 = 30;

/// 记住最近多少个已丢弃批次, 用于识别迟到的分支结果
const DROPPED_WINDOW: usize = 256;

pub(crate) enum JoinMessage {
    /// 批次进入图, 汇合线程开始等待它的分支结果
    Expect(Arc<FrameBatch>),
    Output(BranchOutput),
    /// 分支线程已退出, 之后不再等待该分支
    Detached(usize),
}

/// 某个分支对一个批次的结果, 与批次内帧一一对应
pub(crate) struct BranchOutput {
    pub seq: u64,
    pub branch: usize,
    pub detections: Vec<Vec<DetectionRecord>>,
}

/// 汇合线程退出时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinReport {
    pub completed: u64,
    /// 超时后丢弃的批次
    pub dropped: u64,
    /// 关闭时分支未全部交付, 按已有结果合并的批次
    pub partial: u64,
    pub stalls: u64,
    /// 中途退出的分支数
    pub detached: u64,
    /// 周期汇总打印次数
    pub summaries: u64,
}

struct PendingJoin {
    batch: Arc<FrameBatch>,
    outputs: Vec<Option<Vec<Vec<DetectionRecord>>>>,
    since: Instant,
}

impl PendingJoin {
    fn is_complete(&self) -> bool {
        self.outputs.iter().all(Option::is_some)
    }

    /// 已退出的分支按无检测处理
    fn fill_empty(&mut self, branch: usize) {
        let frames = self.batch.frames.len();
        if let Some(slot) = self.outputs.get_mut(branch) {
            if slot.is_none() {
                *slot = Some(vec![Vec::new(); frames]);
            }
        }
    }
}

pub(crate) struct Joiner {
    /// 每个分支包含的模型 (并行: 各一个; 串联: 全部在一个分支)
    branch_models: Vec<Vec<u32>>,
    pending: BTreeMap<u64, PendingJoin>,
    dropped: BTreeSet<u64>,
    detached: BTreeSet<usize>,
    /// 最近一次收到分支结果 (或处理超时) 的时刻
    last_progress: Instant,
    aggregator: DetectionAggregator,
    overlay: OverlayComposer,
    layout: TileLayout,
    registry: Arc<StreamRegistry>,
    store: Arc<StatsStore>,
    join: JoinConfig,
    control: Sender<ControlEvent>,
    output: Option<Sender<CompositeFrame>>,
    report: JoinReport,
}

impl Joiner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        branch_models: Vec<Vec<u32>>,
        aggregator: DetectionAggregator,
        overlay: OverlayComposer,
        layout: TileLayout,
        registry: Arc<StreamRegistry>,
        store: Arc<StatsStore>,
        join: JoinConfig,
        control: Sender<ControlEvent>,
        output: Option<Sender<CompositeFrame>>,
    ) -> Self {
        Self {
            branch_models,
            pending: BTreeMap::new(),
            dropped: BTreeSet::new(),
            detached: BTreeSet::new(),
            last_progress: Instant::now(),
            aggregator,
            overlay,
            layout,
            registry,
            store,
            join,
            control,
            output,
            report: JoinReport::default(),
        }
    }

    fn poll_interval(&self) -> Duration {
        (self.join.stall_timeout() / 4).max(Duration::from_millis(5))
    }

    /// 运行到所有发送端关闭, 关闭前合并仍在等待的批次
    pub fn run(mut self, rx: Receiver<JoinMessage>) -> JoinReport {
        let interval = self.poll_interval();
        loop {
            match rx.recv_timeout(interval) {
                Ok(msg) => self.handle(msg, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.check_stalls(Instant::now());
        }
        self.flush();
        info!(
            "✅ 汇合线程退出: 完成 {} | 丢弃 {} | 部分 {} | 超时 {} | 退出分支 {}",
            self.report.completed,
            self.report.dropped,
            self.report.partial,
            self.report.stalls,
            self.report.detached
        );
        self.report
    }

    pub fn handle(&mut self, msg: JoinMessage, now: Instant) {
        match msg {
            JoinMessage::Expect(batch) => {
                let seq = batch.seq;
                let mut pending = PendingJoin {
                    batch,
                    outputs: vec![None; self.branch_models.len()],
                    since: now,
                };
                for &branch in &self.detached {
                    pending.fill_empty(branch);
                }
                self.pending.insert(seq, pending);
                self.try_complete(seq);
            }
            JoinMessage::Output(output) => {
                let seq = output.seq;
                let Some(pending) = self.pending.get_mut(&seq) else {
                    if self.is_dropped(seq) {
                        debug!("批次 #{} 已丢弃, 忽略分支 {} 的迟到结果", seq, output.branch);
                    } else {
                        warn!("⚠️  未知批次 #{} 的分支结果", seq);
                    }
                    return;
                };
                match pending.outputs.get_mut(output.branch) {
                    Some(slot) => *slot = Some(output.detections),
                    None => {
                        warn!("⚠️  批次 #{}: 无效的分支下标 {}", seq, output.branch);
                        return;
                    }
                }
                self.last_progress = now;
                self.try_complete(seq);
            }
            JoinMessage::Detached(branch) => self.detach(branch, now),
        }
    }

    fn try_complete(&mut self, seq: u64) {
        if !self.pending.get(&seq).is_some_and(PendingJoin::is_complete) {
            return;
        }
        if let Some(pending) = self.pending.remove(&seq) {
            self.complete(pending, false);
        }
    }

    /// 分支退出: 等待中的和之后的批次都不再等它
    fn detach(&mut self, branch: usize, now: Instant) {
        let Some(models) = self.branch_models.get(branch) else {
            warn!("⚠️  无效的分支下标 {}", branch);
            return;
        };
        if !self.detached.insert(branch) {
            return;
        }
        warn!("⚠️  分支 {} (模型 {:?}) 已退出, 后续批次不再等待", branch, models);
        self.report.detached += 1;
        self.last_progress = now;

        let seqs: Vec<u64> = self.pending.keys().copied().collect();
        for seq in seqs {
            if let Some(pending) = self.pending.get_mut(&seq) {
                pending.fill_empty(branch);
            }
            self.try_complete(seq);
        }
    }

    fn is_dropped(&self, seq: u64) -> bool {
        // 窗口之前的旧批次同样视为已丢弃
        self.dropped.contains(&seq) || self.dropped.first().is_some_and(|&first| seq < first)
    }

    fn mark_dropped(&mut self, seq: u64) {
        self.dropped.insert(seq);
        while self.dropped.len() > DROPPED_WINDOW {
            self.dropped.pop_first();
        }
        self.report.dropped += 1;
    }

    fn missing_models(&self, pending: &PendingJoin) -> Vec<u32> {
        pending
            .outputs
            .iter()
            .zip(&self.branch_models)
            .filter(|(out, _)| out.is_none())
            .flat_map(|(_, models)| models.iter().copied())
            .collect()
    }

    /// 从最近一次汇合进展开始计时, 只检查最早的批次;
    /// 分支在处理积压时后面的批次不会被误判超时
    pub fn check_stalls(&mut self, now: Instant) {
        let Some((&seq, pending)) = self.pending.first_key_value() else {
            return;
        };
        let idle = now.duration_since(pending.since.max(self.last_progress));
        if idle < self.join.stall_timeout() {
            return;
        }
        let waited = now.duration_since(pending.since);
        let missing = self.missing_models(pending);
        self.report.stalls += 1;
        self.last_progress = now;

        match self.join.stall_policy {
            StallPolicy::Wait => {
                warn!(
                    "⚠️  批次 #{} 汇合等待 {:?}, 缺少模型 {:?}",
                    seq, waited, missing
                );
            }
            StallPolicy::Drop => {
                warn!(
                    "⚠️  批次 #{} 汇合超时 {:?}, 缺少模型 {:?}, 丢弃",
                    seq, waited, missing
                );
                self.pending.remove(&seq);
                self.mark_dropped(seq);
            }
            StallPolicy::Abort => {
                error!("❌ 批次 #{} 汇合超时 {:?}, 缺少模型 {:?}", seq, waited, missing);
                self.pending.remove(&seq);
                self.mark_dropped(seq);
                let _ = self.control.send(ControlEvent::JoinStall {
                    seq,
                    waited,
                    missing,
                });
            }
        }
    }

    /// 通道关闭: 用已有的分支结果合并剩余批次, 不丢弃进行中的帧
    fn flush(&mut self) {
        let remaining = std::mem::take(&mut self.pending);
        for (seq, pending) in remaining {
            let missing = self.missing_models(&pending);
            let partial = !missing.is_empty();
            if partial {
                warn!("⚠️  批次 #{} 关闭时缺少模型 {:?}, 按部分结果合并", seq, missing);
            }
            self.complete(pending, partial);
        }
    }

    /// 合并分支结果 → 聚合 → 叠加
    fn complete(&mut self, pending: PendingJoin, partial: bool) {
        if partial {
            self.report.partial += 1;
        } else {
            self.report.completed += 1;
        }

        let seq = pending.batch.seq;
        let mut frames = pending.batch.frames.clone();
        for (idx, frame) in frames.iter_mut().enumerate() {
            for detections in pending.outputs.iter().flatten() {
                if let Some(dets) = detections.get(idx) {
                    frame.detections.extend(dets.iter().cloned());
                }
            }
        }

        let stats = self.aggregator.ingest_batch(&mut frames);

        let states = self.registry.snapshot();
        let annotations: Vec<_> = self
            .store
            .snapshot()
            .values()
            .flat_map(|s| {
                let state = states.get(&s.source_id).copied().unwrap_or(SourceState::Active);
                self.overlay.compose(s, state, &self.layout)
            })
            .collect();

        let joined = self.report.completed + self.report.partial;
        if joined % SUMMARY_INTERVAL == 0 {
            self.log_summary();
            self.report.summaries += 1;
        }

        if let Some(output) = &self.output {
            let composite = CompositeFrame {
                seq,
                frames,
                stats,
                annotations,
            };
            if output.send(composite).is_err() {
                debug!("输出通道已关闭, 丢弃批次 #{}", seq);
            }
        }
    }

    /// 周期性控制台汇总
    fn log_summary(&self) {
        let global = self.store.global();
        let states = self.registry.snapshot();
        let latest = self.store.snapshot();
        let ended = states.values().filter(|s| **s == SourceState::Ended).count();

        info!(
            "📊 FPS: {:.1} | 批次: {} | Active: {} | Ended: {}/{}",
            global.rate,
            global.frame_count,
            self.registry.active_count(),
            ended,
            states.len()
        );
        for stats in latest.values() {
            let models: Vec<String> = self
                .aggregator
                .models()
                .iter()
                .map(|m| format!("M{}={}", m.id, stats.model_total(m.id)))
                .collect();
            let state = states
                .get(&stats.source_id)
                .map(SourceState::label)
                .unwrap_or("?");
            info!(
                "  Stream-{}[{}] F:{} {} Tracked:{}",
                stats.source_id,
                state,
                stats.frame_number,
                models.join(" "),
                stats.tracked_object_count
            );
        }
        for (id, state) in &states {
            if *state == SourceState::Ended && !latest.contains_key(id) {
                info!("  Stream-{}[ENDED] 无帧", id);
            }
        }
    }
}
