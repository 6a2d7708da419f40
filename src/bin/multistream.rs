/// 多路多模型视频分析
/// 构建拓扑 → 接入视频源 → 启动分支/汇合运行时 → 输出统计
///
/// 架构:
/// 1. 主线程: 推送批次 (模拟 streammux 输出) 与源结束信号
/// 2. 分支线程: 每个模型一个 (并行) 或一个串联线程
/// 3. 汇合线程: 聚合统计 + 叠加信息
/// 4. 控制线程: ERROR / WARNING / EOS / stream-eos 分发
use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use multistream_analytics::config::{ColorConfig, ModelConfig};
use multistream_analytics::{
    gen_time_string, BBox, CompositeFrame, ControlDispatcher, ControlEvent, DetectionRecord,
    FrameRecord, GraphEngine, ModelDescriptor, ModelStage, Pipeline, PipelineConfig,
    PipelineError, RunSummary, RuntimeContext, SourceDescriptor, StatsStore, StreamRegistry,
    TopologyBuilder,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// 多路多模型分析程序
#[derive(Parser, Debug)]
#[command(author, version, about = "多路视频多模型分析 (并行/串联)", long_about = None)]
struct Args {
    /// 视频源地址 (rtsp:// rtmp:// file://)
    #[arg(required = true)]
    uris: Vec<String>,

    /// 模型与流水线配置 (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// 每路模拟帧数
    #[arg(short, long, default_value_t = 300)]
    frames: u64,

    /// 模拟帧率
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// 每帧每个模型最多的目标数
    #[arg(long, default_value_t = 4)]
    max_objects: usize,

    /// 随机种子
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// 模拟推理阶段: 按模型类别随机生成检测框
struct SyntheticStage {
    model: ModelDescriptor,
    rng: StdRng,
    tracking: bool,
    max_objects: usize,
}

impl ModelStage for SyntheticStage {
    fn model_id(&self) -> u32 {
        self.model.id
    }

    fn infer(&mut self, frame: &FrameRecord) -> multistream_analytics::Result<Vec<DetectionRecord>> {
        let classes: Vec<u32> = self.model.class_labels.keys().copied().collect();
        let n = self.rng.gen_range(0..=self.max_objects);
        let mut detections = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(&class_id) = classes.choose(&mut self.rng) else {
                break;
            };
            let bbox = BBox::new(
                self.rng.gen_range(0.0..1800.0),
                self.rng.gen_range(0.0..1000.0),
                self.rng.gen_range(20.0..120.0),
                self.rng.gen_range(20.0..120.0),
            );
            let mut det = DetectionRecord::new(self.model.id, class_id, bbox)
                .with_confidence(self.rng.gen_range(0.3..1.0));
            if self.tracking {
                det = det.with_track(frame.source_id as u64 * 1000 + self.rng.gen_range(0..16));
            }
            detections.push(det);
        }
        Ok(detections)
    }
}

/// 内置的两模型配置
fn default_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.models = vec![
        ModelConfig {
            id: 1,
            config: "config_infer_primary_1.txt".to_string(),
            classes: BTreeMap::from([
                (0, "car".to_string()),
                (1, "bicycle".to_string()),
                (2, "person".to_string()),
                (3, "roadsign".to_string()),
            ]),
            color: ColorConfig { r: 1.0, g: 0.0, b: 0.0 },
            border_width: 3,
        },
        ModelConfig {
            id: 2,
            config: "config_infer_primary_2.txt".to_string(),
            classes: BTreeMap::from([(0, "face".to_string())]),
            color: ColorConfig { r: 0.0, g: 1.0, b: 0.0 },
            border_width: 2,
        },
    ];
    cfg.pipeline.debug.use_fakesink = true;
    cfg
}

fn is_supported_uri(uri: &str) -> bool {
    ["rtsp://", "rtmp://", "file://"]
        .iter()
        .any(|scheme| uri.starts_with(scheme))
}

/// 模拟格式协商: 根据地址推断编码
fn simulated_caps(uri: &str) -> &'static str {
    let uri = uri.to_lowercase();
    if uri.contains("h265") || uri.contains("hevc") {
        "video/x-h265"
    } else if uri.contains("vp9") || uri.ends_with(".webm") {
        "video/x-vp9"
    } else {
        "video/x-h264"
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // ========== 源地址校验 ==========
    let mut sources = Vec::new();
    for uri in &args.uris {
        if is_supported_uri(uri) {
            sources.push(SourceDescriptor::new(sources.len() as u32, uri.clone()));
        } else {
            warn!("⚠️  忽略不支持的地址: {}", uri);
        }
    }
    if sources.is_empty() {
        bail!("没有有效的视频源 (支持 rtsp:// rtmp:// file://)");
    }

    // ========== 配置 ==========
    let cfg = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("加载配置失败: {path}"))?,
        None => {
            let cfg = default_config();
            cfg.validate()?;
            cfg
        }
    };
    cfg.print_summary();
    let models = cfg.model_descriptors();

    println!("🚀 启动时间 {}", gen_time_string("-"));
    println!("📹 {} 路视频源", sources.len());
    for source in &sources {
        println!("  Stream-{}: {}", source.id, source.uri);
    }
    println!();

    // ========== 构建拓扑 ==========
    let mut builder = TopologyBuilder::new(GraphEngine::new(), &cfg, sources.len());
    let topology = builder
        .build(&models, cfg.pipeline.mode)
        .context("拓扑构建失败")?;

    let registry = Arc::new(StreamRegistry::with_sources(&sources));
    let store = Arc::new(StatsStore::new());
    let (control_tx, control_rx) = unbounded();

    let mut live = BTreeSet::new();
    for source in &sources {
        builder
            .register_source(source.clone())
            .context("源接入失败")?;
        match builder.on_format_detected(source.id, simulated_caps(&source.uri)) {
            Ok(_) => {
                live.insert(source.id);
                let _ = control_tx.send(ControlEvent::StateChanged {
                    origin: format!("source-bin-{:02}", source.id),
                    old: "PAUSED".into(),
                    new: "PLAYING".into(),
                });
            }
            Err(e @ PipelineError::UnsupportedFormat { .. }) => {
                warn!("⚠️  {}, 放弃该源", e);
                registry.abandon(source.id);
            }
            Err(e) => return Err(e).context("源格式协商失败"),
        }
    }
    debug!("拓扑:\n{}", builder.engine().describe());
    info!(
        "✅ 统计读取点 {}.{} | 叠加写入点 {}.{}",
        topology.stats_point.stage, topology.stats_point.pad, topology.overlay_point.stage,
        topology.overlay_point.pad
    );

    // ========== 控制线程 ==========
    let dispatcher = ControlDispatcher::new(
        Arc::clone(&registry),
        cfg.benign_patterns()?,
        sources.len(),
    );
    let control = dispatcher.spawn(control_rx);

    // ========== 输出线程 ==========
    let (output_tx, output_rx) = unbounded::<CompositeFrame>();
    let consumer = std::thread::spawn(move || {
        let mut count = 0u64;
        for composite in output_rx.iter() {
            count += 1;
            if let Some(header) = composite.annotations.first() {
                debug!("🖼️  #{} {}", composite.seq, header.text.text);
            }
        }
        count
    });

    // ========== 启动运行时 ==========
    let stages: Vec<Box<dyn ModelStage>> = models
        .iter()
        .enumerate()
        .map(|(i, model)| {
            Box::new(SyntheticStage {
                model: model.clone(),
                rng: StdRng::seed_from_u64(args.seed.wrapping_add(i as u64)),
                tracking: cfg.tracker.enable,
                max_objects: args.max_objects,
            }) as Box<dyn ModelStage>
        })
        .collect();
    let mut pipeline = Pipeline::start(
        &cfg,
        topology.layout,
        stages,
        RuntimeContext {
            registry: Arc::clone(&registry),
            store: Arc::clone(&store),
            control: control_tx.clone(),
            output: Some(output_tx),
        },
    )?;

    // ========== 推送批次 ==========
    // 后面的源提前结束, 模拟各路长度不同
    let stagger = (args.frames / (2 * sources.len() as u64)).max(1);
    let end_at: BTreeMap<u32, u64> = live
        .iter()
        .map(|&id| (id, args.frames.saturating_sub(id as u64 * stagger).max(1)))
        .collect();
    let interval = Duration::from_secs_f64(1.0 / args.fps.max(1.0));

    for frame_number in 1..=args.frames {
        if control.is_finished() {
            warn!("⚠️  控制线程已停止, 停止推送");
            break;
        }
        let frames: Vec<FrameRecord> = live
            .iter()
            .map(|&id| FrameRecord::new(id, frame_number))
            .collect();
        if frames.is_empty() {
            break;
        }
        match pipeline.push_batch(frames) {
            Ok(_) => {}
            Err(PipelineError::ShuttingDown) => break,
            Err(e) => {
                let _ = control_tx.send(ControlEvent::error("streammux", e.to_string()));
                break;
            }
        }

        let ended: Vec<u32> = live
            .iter()
            .copied()
            .filter(|id| end_at.get(id).is_some_and(|&end| frame_number >= end))
            .collect();
        for id in ended {
            live.remove(&id);
            let _ = control_tx.send(ControlEvent::SourceEnd { source_id: id });
        }
        std::thread::sleep(interval);
    }

    // ========== 排空并结束 ==========
    let report = pipeline.shutdown();
    for id in live {
        let _ = control_tx.send(ControlEvent::SourceEnd { source_id: id });
    }
    let _ = control_tx.send(ControlEvent::GlobalEos);
    drop(control_tx);
    drop(pipeline);

    let reason = control
        .join()
        .map_err(|_| anyhow::anyhow!("控制线程异常退出"))?;
    let composites = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("输出线程异常退出"))?;

    let summary = RunSummary::collect(&store, &registry, sources.len(), report);
    summary.log();
    info!("🖼️  合成批次: {}", composites);
    println!("🏁 结束时间 {} ({:?})", gen_time_string("-"), reason);

    if reason.is_fatal() {
        std::process::exit(reason.exit_code());
    }
    Ok(())
}
