/// 分析运行时 (Analytics runtime)
///
/// 多线程架构, 通过 crossbeam 通道通信:
/// - Branch: 模型推理 (并行模式每个模型一个线程, 串联模式一个线程)
/// - Joiner: 逐批次汇合 → 聚合 → 叠加 (单线程, 统计的唯一写入方)
/// - Control: 控制消息分发 (见 control 模块)
pub mod branch;
pub mod join;

pub use join::{JoinReport, SUMMARY_INTERVAL};

use crate::aggregator::DetectionAggregator;
use crate::config::PipelineConfig;
use crate::control::ControlEvent;
use crate::error::{PipelineError, Result};
use crate::overlay::{AnnotationBlock, OverlayComposer, TileLayout};
use crate::registry::StreamRegistry;
use crate::stats::StatsStore;
use crate::types::{DetectionRecord, FrameRecord, PipelineMode, SourceState, SourceStats};
use branch::BranchWorker;
use crossbeam_channel::{bounded, unbounded, Sender};
use join::{JoinMessage, Joiner};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

// ========== 运行时消息类型定义 ==========

/// 一个推理阶段 (由媒体引擎的推理元件或测试桩实现)
///
/// 返回的检测会被运行时打上该阶段的 model_id.
pub trait ModelStage: Send {
    fn model_id(&self) -> u32;

    fn infer(&mut self, frame: &FrameRecord) -> Result<Vec<DetectionRecord>>;
}

/// streammux 输出的批次
#[derive(Clone, Debug)]
pub struct FrameBatch {
    pub seq: u64,
    pub frames: Vec<FrameRecord>,
}

/// 汇合完成的批次 (检测已合并, 叠加信息已生成)
#[derive(Clone, Debug)]
pub struct CompositeFrame {
    pub seq: u64,
    pub frames: Vec<FrameRecord>,
    pub stats: Vec<SourceStats>,
    pub annotations: Vec<AnnotationBlock>,
}

/// 运行时共享的状态与通道
pub struct RuntimeContext {
    pub registry: Arc<StreamRegistry>,
    pub store: Arc<StatsStore>,
    pub control: Sender<ControlEvent>,
    /// 合成后的批次 (None 表示不需要下游输出)
    pub output: Option<Sender<CompositeFrame>>,
}

pub struct Pipeline {
    mode: PipelineMode,
    branch_txs: Vec<Sender<Arc<FrameBatch>>>,
    /// 每个分支的模型 (用于报错)
    branch_models: Vec<Vec<u32>>,
    /// 工作线程已退出的分支, 不再向其投递
    detached: Vec<bool>,
    control: Sender<ControlEvent>,
    join_tx: Option<Sender<JoinMessage>>,
    workers: Vec<JoinHandle<()>>,
    joiner: Option<JoinHandle<JoinReport>>,
    store: Arc<StatsStore>,
    next_seq: u64,
    report: Option<JoinReport>,
}

impl Pipeline {
    /// 启动分支线程与汇合线程, stages 按配置中的模型顺序提供
    pub fn start(
        config: &PipelineConfig,
        layout: TileLayout,
        stages: Vec<Box<dyn ModelStage>>,
        ctx: RuntimeContext,
    ) -> Result<Self> {
        let models = config.model_descriptors();
        let expected: Vec<u32> = models.iter().map(|m| m.id).collect();
        let provided: Vec<u32> = stages.iter().map(|s| s.model_id()).collect();
        if expected != provided {
            return Err(PipelineError::GraphConstruction(format!(
                "model stages {provided:?} do not match configured models {expected:?}"
            )));
        }

        let mode = config.pipeline.mode;
        let capacity = config.pipeline.queue.max_size_buffers.max(1) as usize;
        let (join_tx, join_rx) = unbounded();

        let groups: Vec<Vec<Box<dyn ModelStage>>> = match mode {
            PipelineMode::Parallel => stages.into_iter().map(|s| vec![s]).collect(),
            PipelineMode::Serial => vec![stages],
        };
        let branch_models: Vec<Vec<u32>> = groups
            .iter()
            .map(|g| g.iter().map(|s| s.model_id()).collect())
            .collect();

        let mut branch_txs = Vec::with_capacity(groups.len());
        let mut workers = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            let (tx, rx) = bounded(capacity);
            let worker = BranchWorker::new(index, group, ctx.control.clone());
            workers.push(worker.spawn(rx, join_tx.clone())?);
            branch_txs.push(tx);
        }

        let aggregator = DetectionAggregator::new(
            models.clone(),
            config.tracker.display_tracking_id,
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.store),
        );
        let overlay = OverlayComposer::new(models, mode, config.tracker.enable);
        let joiner = Joiner::new(
            branch_models.clone(),
            aggregator,
            overlay,
            layout,
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.store),
            config.pipeline.join.clone(),
            ctx.control.clone(),
            ctx.output,
        );
        let joiner = thread::Builder::new()
            .name("joiner".into())
            .spawn(move || joiner.run(join_rx))?;

        info!(
            "🚀 运行时启动: {} 模式, {} 个分支线程, 队列容量 {}",
            mode.label(),
            workers.len(),
            capacity
        );

        Ok(Self {
            mode,
            detached: vec![false; branch_txs.len()],
            branch_txs,
            branch_models,
            control: ctx.control,
            join_tx: Some(join_tx),
            workers,
            joiner: Some(joiner),
            store: ctx.store,
            next_seq: 0,
            report: None,
        })
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.join_tx.is_none()
    }

    /// 推入一个批次 (分支队列满时阻塞), 返回批次序号
    ///
    /// 某个分支的工作线程已退出时, 上报 ERROR 并让汇合点不再等待它, 其余分支照常处理.
    pub fn push_batch(&mut self, frames: Vec<FrameRecord>) -> Result<u64> {
        let Some(join_tx) = &self.join_tx else {
            return Err(PipelineError::ShuttingDown);
        };

        for frame in &frames {
            let total = self.store.record_muxed(frame.source_id);
            if total % SUMMARY_INTERVAL == 0 {
                debug!("[MUX] 总帧数 {} | {:?}", total, self.store.muxed_counts());
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let batch = Arc::new(FrameBatch { seq, frames });

        // 先登记再分发, 保证汇合线程总是先看到批次
        join_tx
            .send(JoinMessage::Expect(Arc::clone(&batch)))
            .map_err(|_| PipelineError::ShuttingDown)?;
        for (index, tx) in self.branch_txs.iter().enumerate() {
            if self.detached[index] || tx.send(Arc::clone(&batch)).is_ok() {
                continue;
            }
            self.detached[index] = true;
            let origin = self.branch_models[index]
                .iter()
                .map(|id| format!("pgie{id}"))
                .collect::<Vec<_>>()
                .join("+");
            warn!("⚠️  {} 分支线程已退出, 从批次 #{} 起不再投递", origin, seq);
            let _ = self
                .control
                .send(ControlEvent::error(origin, "branch worker exited"));
            let _ = join_tx.send(JoinMessage::Detached(index));
        }
        Ok(seq)
    }

    /// 停止接收新批次, 排空分支与汇合点后返回汇合统计 (可重复调用)
    pub fn shutdown(&mut self) -> JoinReport {
        if let Some(report) = self.report {
            return report;
        }
        self.join_tx = None;
        self.branch_txs.clear();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("⚠️  分支线程异常退出");
            }
        }
        let report = match self.joiner.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                warn!("⚠️  汇合线程异常退出");
                JoinReport::default()
            }
            None => JoinReport::default(),
        };
        self.report = Some(report);
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 运行结束汇总
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub batches: u64,
    pub average_fps: f64,
    pub ended: usize,
    pub total_sources: usize,
    pub muxed: BTreeMap<u32, u64>,
    pub join: JoinReport,
}

impl RunSummary {
    pub fn collect(
        store: &StatsStore,
        registry: &StreamRegistry,
        total_sources: usize,
        join: JoinReport,
    ) -> Self {
        let global = store.global();
        let elapsed = global
            .start_time
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let ended = registry
            .snapshot()
            .values()
            .filter(|s| **s == SourceState::Ended)
            .count();
        Self {
            elapsed,
            batches: global.frame_count,
            average_fps: global.average_rate,
            ended,
            total_sources,
            muxed: store.muxed_counts(),
            join,
        }
    }

    pub fn log(&self) {
        info!("==================================================");
        info!("📋 运行汇总");
        info!("  总时长: {:.2}s", self.elapsed.as_secs_f64());
        info!("  总批次: {}", self.batches);
        info!("  平均FPS: {:.2}", self.average_fps);
        info!("  已结束: {}/{}", self.ended, self.total_sources);
        for (id, count) in &self.muxed {
            info!("  Stream-{}: {} 帧进入 streammux", id, count);
        }
        if self.join.dropped > 0 || self.join.partial > 0 || self.join.detached > 0 {
            warn!(
                "⚠️  汇合: 丢弃 {} | 部分合并 {} | 超时 {} | 退出分支 {}",
                self.join.dropped, self.join.partial, self.join.stalls, self.join.detached
            );
        }
        info!("==================================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, SourceDescriptor};
    use crossbeam_channel::Receiver;
    use std::collections::HashMap;

    const MODEL_A: u32 = 1;
    const MODEL_B: u32 = 2;

    /// 按源返回固定数量的 class 0 目标
    struct FixedStage {
        model_id: u32,
        per_source: HashMap<u32, usize>,
    }

    impl ModelStage for FixedStage {
        fn model_id(&self) -> u32 {
            self.model_id
        }

        fn infer(&mut self, frame: &FrameRecord) -> Result<Vec<DetectionRecord>> {
            let n = self.per_source.get(&frame.source_id).copied().unwrap_or(0);
            Ok(vec![DetectionRecord::new(0, 0, BBox::new(10.0, 20.0, 30.0, 40.0)); n])
        }
    }

    fn config(mode: &str) -> PipelineConfig {
        PipelineConfig::from_json(&format!(
            r#"{{
                "pipeline": {{"mode": "{mode}", "max_sources": 3}},
                "models": [
                    {{"id": 1, "classes": {{"0": "car"}}, "color": {{"r": 1, "g": 0, "b": 0}}}},
                    {{"id": 2, "classes": {{"0": "person"}}, "color": {{"r": 0, "g": 1, "b": 0}}}}
                ]
            }}"#
        ))
        .unwrap()
    }

    fn stages() -> Vec<Box<dyn ModelStage>> {
        vec![
            Box::new(FixedStage {
                model_id: MODEL_A,
                per_source: HashMap::from([(0, 2), (1, 1)]),
            }) as Box<dyn ModelStage>,
            Box::new(FixedStage {
                model_id: MODEL_B,
                per_source: HashMap::from([(0, 1)]),
            }),
        ]
    }

    struct Harness {
        pipeline: Pipeline,
        registry: Arc<StreamRegistry>,
        store: Arc<StatsStore>,
        output_rx: Receiver<CompositeFrame>,
        control_rx: Receiver<ControlEvent>,
    }

    fn start(mode: &str) -> Harness {
        start_with(&config(mode), stages())
    }

    fn start_with(cfg: &PipelineConfig, stages: Vec<Box<dyn ModelStage>>) -> Harness {
        let sources: Vec<_> = (0..3)
            .map(|i| SourceDescriptor::new(i, format!("rtsp://cam/{i}")))
            .collect();
        let registry = Arc::new(StreamRegistry::with_sources(&sources));
        let store = Arc::new(StatsStore::new());
        let (control, control_rx) = unbounded();
        let (output, output_rx) = unbounded();
        let pipeline = Pipeline::start(
            cfg,
            TileLayout::for_sources(3, 1920, 1080),
            stages,
            RuntimeContext {
                registry: Arc::clone(&registry),
                store: Arc::clone(&store),
                control,
                output: Some(output),
            },
        )
        .unwrap();
        Harness {
            pipeline,
            registry,
            store,
            output_rx,
            control_rx,
        }
    }

    #[test]
    fn test_parallel_end_to_end() {
        let mut h = start("parallel");
        let frames = (0..3).map(|id| FrameRecord::new(id, 1)).collect();
        assert_eq!(h.pipeline.push_batch(frames).unwrap(), 0);
        let report = h.pipeline.shutdown();
        assert_eq!(report.completed, 1);

        let stats = h.store.get(0).unwrap();
        assert_eq!(stats.frame_number, 1);
        let expected = BTreeMap::from([
            (MODEL_A, BTreeMap::from([(0, 2)])),
            (MODEL_B, BTreeMap::from([(0, 1)])),
        ]);
        assert_eq!(stats.per_model_class_counts, expected);
        assert_eq!(stats.tracked_object_count, 0);
        assert_eq!(h.store.get(2).unwrap().model_total(MODEL_A), 0);
        assert_eq!(h.registry.state(1), Some(SourceState::Active));

        let composite = h.output_rx.try_recv().unwrap();
        assert_eq!(composite.frames[0].detections.len(), 3);
        assert!(composite.frames[0].detections.iter().all(|d| d.style.is_some()));
        assert!(h.control_rx.try_recv().is_err());
    }

    #[test]
    fn test_serial_mode_single_branch() {
        let mut h = start("serial");
        h.pipeline
            .push_batch(vec![FrameRecord::new(0, 1)])
            .unwrap();
        h.pipeline.push_batch(vec![FrameRecord::new(0, 2)]).unwrap();
        let report = h.pipeline.shutdown();
        assert_eq!(report.completed, 2);

        let stats = h.store.get(0).unwrap();
        assert_eq!(stats.frame_number, 2);
        assert_eq!(stats.count(MODEL_A, 0), 2);
        assert_eq!(stats.count(MODEL_B, 0), 1);
        assert_eq!(h.store.muxed_counts().get(&0), Some(&2));
    }

    #[test]
    fn test_push_after_shutdown() {
        let mut h = start("parallel");
        h.pipeline.shutdown();
        assert!(h.pipeline.is_closed());
        assert!(matches!(
            h.pipeline.push_batch(vec![FrameRecord::new(0, 1)]),
            Err(PipelineError::ShuttingDown)
        ));
        // 重复关闭返回同一份统计
        assert_eq!(h.pipeline.shutdown(), JoinReport::default());
    }

    #[test]
    fn test_stage_mismatch_rejected() {
        let cfg = config("parallel");
        let (control, _rx) = unbounded();
        let err = Pipeline::start(
            &cfg,
            TileLayout::for_sources(1, 1920, 1080),
            vec![Box::new(FixedStage {
                model_id: MODEL_B,
                per_source: HashMap::new(),
            }) as Box<dyn ModelStage>],
            RuntimeContext {
                registry: Arc::new(StreamRegistry::new()),
                store: Arc::new(StatsStore::new()),
                control,
                output: None,
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::GraphConstruction(_)));
    }

    #[test]
    fn test_run_summary() {
        let mut h = start("parallel");
        for n in 1..=3 {
            let frames = (0..3).map(|id| FrameRecord::new(id, n)).collect();
            h.pipeline.push_batch(frames).unwrap();
        }
        let report = h.pipeline.shutdown();
        h.registry.mark_ended(2);

        let summary = RunSummary::collect(&h.store, &h.registry, 3, report);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.ended, 1);
        assert_eq!(summary.muxed.values().sum::<u64>(), 9);
        assert_eq!(summary.join.completed, 3);
    }

    /// 第一帧就 panic 的推理阶段
    struct CrashStage;

    impl ModelStage for CrashStage {
        fn model_id(&self) -> u32 {
            MODEL_A
        }

        fn infer(&mut self, _frame: &FrameRecord) -> Result<Vec<DetectionRecord>> {
            panic!("inference engine crashed");
        }
    }

    /// 每帧耗时固定的推理阶段
    struct SlowStage {
        model_id: u32,
        delay: Duration,
    }

    impl ModelStage for SlowStage {
        fn model_id(&self) -> u32 {
            self.model_id
        }

        fn infer(&mut self, _frame: &FrameRecord) -> Result<Vec<DetectionRecord>> {
            thread::sleep(self.delay);
            Ok(vec![DetectionRecord::new(0, 0, BBox::default())])
        }
    }

    #[test]
    fn test_dead_branch_detached() {
        let stages = vec![
            Box::new(CrashStage) as Box<dyn ModelStage>,
            Box::new(FixedStage {
                model_id: MODEL_B,
                per_source: HashMap::from([(0, 1)]),
            }),
        ];
        let mut h = start_with(&config("parallel"), stages);
        for n in 1..=4 {
            h.pipeline.push_batch(vec![FrameRecord::new(0, n)]).unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        let report = h.pipeline.shutdown();

        // 剩余分支的结果照常汇合, 不按部分结果处理
        assert_eq!(report.completed, 4);
        assert_eq!(report.partial, 0);
        assert_eq!(report.detached, 1);
        let stats = h.store.get(0).unwrap();
        assert_eq!(stats.frame_number, 4);
        assert_eq!(stats.count(MODEL_B, 0), 1);
        assert_eq!(stats.count(MODEL_A, 0), 0);

        let origins: Vec<String> = h
            .control_rx
            .try_iter()
            .filter_map(|event| match event {
                ControlEvent::Error { origin, .. } => Some(origin),
                _ => None,
            })
            .collect();
        assert!(origins.iter().any(|o| o == "pgie1"), "{origins:?}");
    }

    #[test]
    fn test_slow_branch_not_dropped() {
        let mut cfg = config("parallel");
        cfg.pipeline.queue.max_size_buffers = 8;
        cfg.pipeline.join = crate::config::JoinConfig {
            stall_timeout_ms: 150,
            stall_policy: crate::config::StallPolicy::Drop,
        };
        let stages = vec![
            Box::new(SlowStage {
                model_id: MODEL_A,
                delay: Duration::from_millis(40),
            }) as Box<dyn ModelStage>,
            Box::new(FixedStage {
                model_id: MODEL_B,
                per_source: HashMap::new(),
            }),
        ];
        let mut h = start_with(&cfg, stages);
        // 8个批次一次推入, 最后一个批次要等约320ms, 但分支一直在交付
        for n in 1..=8 {
            h.pipeline.push_batch(vec![FrameRecord::new(0, n)]).unwrap();
        }
        let report = h.pipeline.shutdown();
        assert_eq!(report.dropped, 0);
        assert_eq!(report.completed, 8);
        assert_eq!(h.output_rx.try_iter().count(), 8);
    }
}
