//! 拓扑构建器
//! Topology builder: static graph, branch wiring and late-bound decode stages
//!
//! 源的接入是两阶段协议:
//! 1. `register_source` 预留 streammux 的输入槽位, 源进入 Pending
//! 2. `on_format_detected` 根据caps决定解析器, 插入 parser → decoder 并链接到槽位
//! 每个源的插入只发生一次, 重复调用返回错误且不会产生第二个解码分支.

use super::graph::{Codec, MediaEngine, PadRef, StageId, StageKind, StageSpec};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::overlay::TileLayout;
use crate::types::{ModelDescriptor, PipelineMode, SourceDescriptor};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// 已预留槽位的源
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSource {
    pub source_id: u32,
    pub source_stage: StageId,
    pub mux_pad: PadRef,
}

/// 已完成插入的解码分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedSource {
    pub source_id: u32,
    pub codec: Codec,
    pub parser: StageId,
    pub decoder: StageId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Pending,
    Attached(AttachedSource),
    Rejected { caps: String },
}

#[derive(Debug, Clone)]
struct SourceSlot {
    descriptor: SourceDescriptor,
    pending: PendingSource,
    state: SlotState,
}

/// 单个模型分支 (串联模式下没有queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchHandle {
    pub model_id: u32,
    pub queue: Option<StageId>,
    pub inference: StageId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchPlan {
    pub mode: PipelineMode,
    pub fan_out: Option<StageId>,
    pub fan_in: Option<StageId>,
    pub branches: Vec<BranchHandle>,
    /// 分支之后第一个输出pad所在节点
    pub tail: StageId,
}

/// 构建完成的静态拓扑
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub muxer: StageId,
    pub plan: BranchPlan,
    pub tracker: Option<StageId>,
    pub tiler: StageId,
    pub osd: StageId,
    pub sink: StageId,
    /// 聚合器读取元数据的位置
    pub stats_point: PadRef,
    /// 叠加信息写入的位置
    pub overlay_point: PadRef,
    pub layout: TileLayout,
}

pub struct TopologyBuilder<E: MediaEngine> {
    engine: E,
    config: PipelineConfig,
    num_sources: usize,
    capacity: usize,
    muxer: Option<StageId>,
    slots: BTreeMap<u32, SourceSlot>,
}

impl<E: MediaEngine> TopologyBuilder<E> {
    pub fn new(engine: E, config: &PipelineConfig, num_sources: usize) -> Self {
        Self {
            engine,
            config: config.clone(),
            num_sources,
            capacity: config.pipeline.max_sources,
            muxer: None,
            slots: BTreeMap::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn slot_state(&self, source_id: u32) -> Option<&SlotState> {
        self.slots.get(&source_id).map(|s| &s.state)
    }

    fn batch_size(&self) -> usize {
        self.num_sources.max(1)
    }

    fn add(&mut self, spec: StageSpec) -> Result<StageId> {
        let name = spec.name.clone();
        let id = self.engine.add_stage(spec)?;
        debug!("  [OK] {} {}", name, id);
        Ok(id)
    }

    fn muxer(&self) -> Result<StageId> {
        self.muxer.ok_or_else(|| {
            PipelineError::GraphConstruction("streammux not created, call build() first".into())
        })
    }

    /// 构建完整静态图: streammux → 模型分支 → [tracker] → tiler → osd → 输出
    pub fn build(&mut self, models: &[ModelDescriptor], mode: PipelineMode) -> Result<Topology> {
        let mux = &self.config.pipeline.streammux;
        let muxer_kind = StageKind::Muxer {
            batch_size: self.batch_size(),
            width: mux.width,
            height: mux.height,
            batched_push_timeout_us: mux.batched_push_timeout_us,
            live_source: mux.live_source,
        };
        let muxer = self.add(StageSpec::new("muxer", muxer_kind))?;
        self.muxer = Some(muxer);

        let plan = self.build_branches(models, mode)?;
        let topology = self.build_output(muxer, plan)?;
        info!(
            "✅ 拓扑构建完成: {} 个模型 ({}) | Tiler {}x{}",
            topology.plan.branches.len(),
            mode.label(),
            topology.layout.rows,
            topology.layout.cols
        );
        Ok(topology)
    }

    /// 构建模型分支
    ///
    /// - parallel: muxer → tee → (queue → infer)×N → metamux
    /// - serial:   muxer → infer1 → infer2 → ...
    pub fn build_branches(
        &mut self,
        models: &[ModelDescriptor],
        mode: PipelineMode,
    ) -> Result<BranchPlan> {
        if models.is_empty() {
            return Err(PipelineError::GraphConstruction("no models to build".into()));
        }
        let muxer = self.muxer()?;
        info!("⚙️  创建 {} 个模型 ({} 模式)", models.len(), mode.label());

        match mode {
            PipelineMode::Parallel => {
                let tee = self.add(StageSpec::new(
                    "tee",
                    StageKind::FanOut {
                        allow_not_linked: true,
                    },
                ))?;
                let metamux = self.add(StageSpec::new("metamux", StageKind::MetaMux))?;
                self.engine.link_stages(muxer, tee)?;

                let mut branches = Vec::with_capacity(models.len());
                for model in models {
                    let max_size_buffers = self.config.pipeline.queue.max_size_buffers;
                    let leaky = self.config.pipeline.queue.leaky;
                    let queue = self.add(
                        StageSpec::new(
                            format!("queue{}", model.id),
                            StageKind::Queue {
                                max_size_buffers,
                                leaky,
                            },
                        )
                        .for_model(model.id),
                    )?;
                    let inference = self.add_inference(model)?;

                    let tee_src = self.engine.request_pad(tee, "src_%u")?;
                    self.engine.link(tee_src, PadRef::sink(queue))?;
                    self.engine.link_stages(queue, inference)?;
                    let meta_sink = self.engine.request_pad(metamux, "sink_%u")?;
                    self.engine.link(PadRef::src(inference), meta_sink)?;

                    debug!("  [OK] Branch M{}: tee -> queue -> pgie -> metamux", model.id);
                    branches.push(BranchHandle {
                        model_id: model.id,
                        queue: Some(queue),
                        inference,
                    });
                }

                Ok(BranchPlan {
                    mode,
                    fan_out: Some(tee),
                    fan_in: Some(metamux),
                    branches,
                    tail: metamux,
                })
            }
            PipelineMode::Serial => {
                let mut prev = muxer;
                let mut branches = Vec::with_capacity(models.len());
                for model in models {
                    let inference = self.add_inference(model)?;
                    self.engine.link_stages(prev, inference)?;
                    prev = inference;
                    branches.push(BranchHandle {
                        model_id: model.id,
                        queue: None,
                        inference,
                    });
                }
                Ok(BranchPlan {
                    mode,
                    fan_out: None,
                    fan_in: None,
                    branches,
                    tail: prev,
                })
            }
        }
    }

    fn add_inference(&mut self, model: &ModelDescriptor) -> Result<StageId> {
        let config_path = self
            .config
            .models
            .iter()
            .find(|m| m.id == model.id)
            .map(|m| m.config.clone())
            .unwrap_or_default();
        let batch_size = self.batch_size();
        let id = self.add(
            StageSpec::new(
                format!("pgie{}", model.id),
                StageKind::Inference {
                    config_path,
                    batch_size,
                },
            )
            .for_model(model.id),
        )?;
        info!("  [OK] Model-{} batch={}", model.id, batch_size);
        Ok(id)
    }

    fn build_output(&mut self, muxer: StageId, plan: BranchPlan) -> Result<Topology> {
        let tracker = if self.config.tracker.enable {
            let config_file = self.config.tracker.config_file.clone();
            Some(self.add(StageSpec::new("tracker", StageKind::Tracker { config_file }))?)
        } else {
            None
        };

        let layout = TileLayout::for_sources(
            self.num_sources,
            self.config.pipeline.tiler.width,
            self.config.pipeline.tiler.height,
        );
        let tiler = self.add(StageSpec::new(
            "tiler",
            StageKind::Tiler {
                rows: layout.rows,
                cols: layout.cols,
                width: layout.width,
                height: layout.height,
            },
        ))?;
        let osd = self.add(StageSpec::new("osd", StageKind::Osd))?;
        let convertor = self.add(StageSpec::new("convertor", StageKind::Converter))?;
        let capsfilter = self.add(StageSpec::new(
            "capsfilter",
            StageKind::CapsFilter {
                caps: "video/x-raw(memory:NVMM), format=I420".into(),
            },
        ))?;

        let mut chain = Vec::new();
        if let Some(tracker) = tracker {
            chain.push(tracker);
        }
        chain.extend([tiler, osd, convertor, capsfilter]);

        let sink = if self.config.pipeline.debug.use_fakesink {
            warn!("⚠️  DEBUG MODE: 使用 fakesink 代替 RTSP 输出");
            let sink = self.add(StageSpec::new("fakesink", StageKind::FakeSink))?;
            chain.push(sink);
            sink
        } else {
            let rtsp = self.config.pipeline.output.rtsp.clone();
            let encoder = self.add(StageSpec::new(
                "encoder",
                StageKind::Encoder {
                    bitrate: self.config.pipeline.encoder.bitrate,
                },
            ))?;
            let parser = self.add(StageSpec::new("h264parser", StageKind::OutputParser))?;
            let rtppay = self.add(StageSpec::new("rtppay", StageKind::RtpPay))?;
            let sink = self.add(StageSpec::new(
                "udpsink",
                StageKind::UdpSink {
                    host: rtsp.multicast_ip,
                    port: rtsp.udp_port,
                },
            ))?;
            chain.extend([encoder, parser, rtppay, sink]);
            sink
        };

        let mut prev = plan.tail;
        for stage in chain {
            self.engine.link_stages(prev, stage)?;
            prev = stage;
        }

        let stats_point = PadRef::src(tracker.unwrap_or(plan.tail));
        Ok(Topology {
            muxer,
            plan,
            tracker,
            tiler,
            osd,
            sink,
            stats_point,
            overlay_point: PadRef::sink(osd),
            layout,
        })
    }

    /// 为源预留 streammux 输入槽位并创建源节点
    pub fn register_source(&mut self, descriptor: SourceDescriptor) -> Result<PendingSource> {
        let muxer = self.muxer()?;
        let source_id = descriptor.id;
        if self.slots.len() >= self.capacity {
            return Err(PipelineError::CapacityExceeded {
                source_id,
                capacity: self.capacity,
            });
        }
        if self.slots.contains_key(&source_id) {
            return Err(PipelineError::GraphConstruction(format!(
                "source {source_id} registered twice"
            )));
        }

        let source_stage = self.add(
            StageSpec::new(
                format!("source-bin-{source_id:02}"),
                StageKind::SourceBin {
                    uri: descriptor.uri.clone(),
                },
            )
            .for_source(source_id),
        )?;
        let mux_pad = match self.engine.request_pad(muxer, &format!("sink_{source_id}")) {
            Ok(pad) => pad,
            Err(e) => {
                let _ = self.engine.remove_stage(source_stage);
                return Err(e);
            }
        };

        let pending = PendingSource {
            source_id,
            source_stage,
            mux_pad,
        };
        info!("✅ Stream-{}: source bin created for {}", source_id, descriptor.uri);
        self.slots.insert(
            source_id,
            SourceSlot {
                descriptor,
                pending: pending.clone(),
                state: SlotState::Pending,
            },
        );
        Ok(pending)
    }

    /// 源的格式协商完成: 选择解析器并插入解码分支 (每个源只成功一次)
    pub fn on_format_detected(&mut self, source_id: u32, caps: &str) -> Result<AttachedSource> {
        let slot = self
            .slots
            .get(&source_id)
            .ok_or(PipelineError::UnknownSource(source_id))?;

        match &slot.state {
            SlotState::Attached(_) => {
                warn!("⚠️  Stream-{}: 解码分支已存在, 忽略重复的格式通知", source_id);
                return Err(PipelineError::AlreadyAttached { source_id });
            }
            SlotState::Rejected { caps } => {
                return Err(PipelineError::UnsupportedFormat {
                    source_id,
                    caps: caps.clone(),
                });
            }
            SlotState::Pending => {}
        }
        let pending = slot.pending.clone();

        info!("🔍 Stream-{}: detected stream {}", source_id, caps);
        if !caps.starts_with("video") {
            return Err(PipelineError::NotVideo {
                source_id,
                caps: caps.to_string(),
            });
        }

        let Some(codec) = Codec::from_caps(caps) else {
            if let Some(slot) = self.slots.get_mut(&source_id) {
                slot.state = SlotState::Rejected {
                    caps: caps.to_string(),
                };
            }
            warn!("❌ Stream-{}: unsupported video format {} (H.264/H.265 only)", source_id, caps);
            return Err(PipelineError::UnsupportedFormat {
                source_id,
                caps: caps.to_string(),
            });
        };
        info!("  [OK] Stream-{}: video format {}", source_id, codec.name());

        let attached = self.attach_decoder(&pending, codec)?;
        if let Some(slot) = self.slots.get_mut(&source_id) {
            slot.state = SlotState::Attached(attached);
            debug!(
                "  [OK] Stream-{} ({}) -> {} -> decoder -> muxer.{}",
                source_id,
                slot.descriptor.uri,
                codec.parser_factory(),
                pending.mux_pad.pad
            );
        }
        Ok(attached)
    }

    /// 插入 parser/decoder, 任一步失败则回滚已添加的节点
    fn attach_decoder(&mut self, pending: &PendingSource, codec: Codec) -> Result<AttachedSource> {
        let source_id = pending.source_id;
        let parser = self.add(
            StageSpec::new(
                format!("{}-{}", codec.parser_factory(), source_id),
                StageKind::Parser(codec),
            )
            .for_source(source_id),
        )?;
        let decoder = match self.add(
            StageSpec::new(format!("decoder-{source_id}"), StageKind::Decoder).for_source(source_id),
        ) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.engine.remove_stage(parser);
                return Err(e);
            }
        };

        let linked = self
            .engine
            .link_stages(pending.source_stage, parser)
            .and_then(|_| self.engine.link_stages(parser, decoder))
            .and_then(|_| {
                self.engine
                    .link(PadRef::src(decoder), pending.mux_pad.clone())
            });
        if let Err(e) = linked {
            let _ = self.engine.remove_stage(decoder);
            let _ = self.engine.remove_stage(parser);
            return Err(e);
        }

        Ok(AttachedSource {
            source_id,
            codec,
            parser,
            decoder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::graph::GraphEngine;
    use crate::types::Rgba;

    fn config(json: &str) -> PipelineConfig {
        PipelineConfig::from_json(json).unwrap()
    }

    fn base_config(extra: &str) -> PipelineConfig {
        config(&format!(
            r#"{{
                "pipeline": {{ "max_sources": 3 {extra} }},
                "models": [
                    {{"id": 1, "config": "pgie1.txt", "classes": {{"0": "car"}}, "color": {{"r": 1, "g": 0, "b": 0}}}},
                    {{"id": 2, "config": "pgie2.txt", "classes": {{"0": "person"}}, "color": {{"r": 0, "g": 1, "b": 0}}}}
                ]
            }}"#
        ))
    }

    fn models() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new(1, [(0, "car".to_string())].into(), Rgba::RED, 3),
            ModelDescriptor::new(2, [(0, "person".to_string())].into(), Rgba::CYAN, 3),
        ]
    }

    fn built(cfg: &PipelineConfig, mode: PipelineMode) -> (TopologyBuilder<GraphEngine>, Topology) {
        let mut builder = TopologyBuilder::new(GraphEngine::new(), cfg, 3);
        let topo = builder.build(&models(), mode).unwrap();
        (builder, topo)
    }

    #[test]
    fn test_parallel_branches() {
        let cfg = base_config("");
        let (builder, topo) = built(&cfg, PipelineMode::Parallel);
        let engine = builder.engine();

        let tee = topo.plan.fan_out.unwrap();
        let metamux = topo.plan.fan_in.unwrap();
        assert_eq!(
            engine.stage(tee).unwrap().kind,
            StageKind::FanOut {
                allow_not_linked: true
            }
        );
        assert_eq!(engine.downstream(tee).len(), 2);
        assert_eq!(engine.upstream(metamux).len(), 2);

        for (branch, model_id) in topo.plan.branches.iter().zip([1, 2]) {
            let spec = engine.stage(branch.inference).unwrap();
            assert_eq!(spec.model_id, Some(model_id));
            assert_eq!(
                spec.kind,
                StageKind::Inference {
                    config_path: format!("pgie{model_id}.txt"),
                    batch_size: 3
                }
            );
            let queue = branch.queue.unwrap();
            assert_eq!(engine.downstream(queue), vec![branch.inference]);
            assert_eq!(engine.downstream(branch.inference), vec![metamux]);
        }
        assert_eq!(topo.stats_point, PadRef::src(metamux));
        assert_eq!(topo.overlay_point, PadRef::sink(topo.osd));
        assert_eq!(engine.downstream(metamux), vec![topo.tiler]);
        // 默认RTSP输出链
        assert_eq!(engine.count_factory("udpsink"), 1);
        assert_eq!(engine.count_factory("fakesink"), 0);
    }

    #[test]
    fn test_serial_chain_with_tracker() {
        let mut cfg = base_config(r#", "debug": {"use_fakesink": true}"#);
        cfg.tracker.enable = true;
        let (builder, topo) = built(&cfg, PipelineMode::Serial);
        let engine = builder.engine();

        assert!(topo.plan.fan_out.is_none());
        assert_eq!(engine.count_factory("tee"), 0);
        assert_eq!(engine.count_factory("queue"), 0);

        let first = topo.plan.branches[0].inference;
        let second = topo.plan.branches[1].inference;
        assert_eq!(engine.downstream(topo.muxer), vec![first]);
        assert_eq!(engine.downstream(first), vec![second]);

        let tracker = topo.tracker.unwrap();
        assert_eq!(engine.downstream(second), vec![tracker]);
        assert_eq!(topo.stats_point, PadRef::src(tracker));
        assert_eq!(engine.downstream(topo.osd).len(), 1);
        assert_eq!(engine.count_factory("fakesink"), 1);
        assert_eq!(engine.count_factory("nvv4l2h264enc"), 0);
    }

    #[test]
    fn test_serial_stats_point_is_last_model() {
        let cfg = base_config("");
        let (_, topo) = built(&cfg, PipelineMode::Serial);
        assert_eq!(topo.stats_point, PadRef::src(topo.plan.branches[1].inference));
    }

    #[test]
    fn test_model_stage_failure_is_fatal() {
        let cfg = base_config("");
        let mut builder = TopologyBuilder::new(GraphEngine::new().with_unavailable("nvinfer"), &cfg, 2);
        let err = builder.build(&models(), PipelineMode::Parallel).unwrap_err();
        assert!(matches!(err, PipelineError::GraphConstruction(_)));
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_capacity_exceeded() {
        let cfg = base_config("");
        let (mut builder, _) = built(&cfg, PipelineMode::Parallel);
        for id in 0..3 {
            builder
                .register_source(SourceDescriptor::new(id, format!("rtsp://cam/{id}")))
                .unwrap();
        }
        let err = builder
            .register_source(SourceDescriptor::new(3, "rtsp://cam/3"))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CapacityExceeded { capacity: 3, .. }
        ));
        assert_eq!(builder.engine().count_factory("uridecodebin"), 3);
    }

    #[test]
    fn test_register_requires_build() {
        let cfg = base_config("");
        let mut builder = TopologyBuilder::new(GraphEngine::new(), &cfg, 1);
        assert!(builder
            .register_source(SourceDescriptor::new(0, "rtsp://cam/0"))
            .is_err());
    }

    #[test]
    fn test_format_insertion_is_idempotent() {
        let cfg = base_config("");
        let (mut builder, topo) = built(&cfg, PipelineMode::Parallel);
        let pending = builder
            .register_source(SourceDescriptor::new(0, "rtsp://cam/0"))
            .unwrap();
        assert_eq!(pending.mux_pad.pad, "sink_0");

        let attached = builder.on_format_detected(0, "video/x-h264").unwrap();
        assert_eq!(attached.codec, Codec::H264);

        let err = builder.on_format_detected(0, "video/x-h265").unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyAttached { source_id: 0 }));

        let engine = builder.engine();
        assert_eq!(engine.count_factory("nvv4l2decoder"), 1);
        assert_eq!(engine.count_factory("h264parse"), 2); // 源解析器 + 输出编码后的解析器
        assert_eq!(engine.count_factory("h265parse"), 0);
        assert_eq!(engine.downstream(attached.decoder), vec![topo.muxer]);
        assert_eq!(engine.downstream(pending.source_stage), vec![attached.parser]);
    }

    #[test]
    fn test_unsupported_format_drops_source() {
        let cfg = base_config("");
        let (mut builder, _) = built(&cfg, PipelineMode::Parallel);
        builder
            .register_source(SourceDescriptor::new(1, "rtsp://cam/1"))
            .unwrap();

        // 音频pad不影响视频协商
        assert!(matches!(
            builder.on_format_detected(1, "audio/x-raw"),
            Err(PipelineError::NotVideo { .. })
        ));
        assert_eq!(builder.slot_state(1), Some(&SlotState::Pending));

        assert!(matches!(
            builder.on_format_detected(1, "video/x-vp9"),
            Err(PipelineError::UnsupportedFormat { source_id: 1, .. })
        ));
        assert!(matches!(
            builder.on_format_detected(1, "video/x-h264"),
            Err(PipelineError::UnsupportedFormat { .. })
        ));
        assert_eq!(builder.engine().count_factory("nvv4l2decoder"), 0);
        assert!(matches!(
            builder.on_format_detected(9, "video/x-h264"),
            Err(PipelineError::UnknownSource(9))
        ));
    }

    #[test]
    fn test_failed_insertion_rolls_back() {
        let cfg = base_config("");
        let mut builder = TopologyBuilder::new(GraphEngine::new().with_unavailable("nvv4l2decoder"), &cfg, 1);
        builder.build(&models(), PipelineMode::Parallel).unwrap();
        builder
            .register_source(SourceDescriptor::new(0, "file:///clip.mp4"))
            .unwrap();
        assert!(builder.on_format_detected(0, "video/x-h265").is_err());
        assert_eq!(builder.engine().count_factory("h265parse"), 0);
        assert_eq!(builder.slot_state(0), Some(&SlotState::Pending));
    }
}
