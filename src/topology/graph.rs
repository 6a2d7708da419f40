//! 处理图与媒体引擎接口
//! Stage graph model and the media-engine mutation interface

use crate::error::{PipelineError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// 支持的视频编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// 从caps名称识别编码 (例如 "video/x-h264")
    pub fn from_caps(caps: &str) -> Option<Self> {
        let caps = caps.to_lowercase();
        if caps.contains("h264") || caps.contains("avc") {
            Some(Codec::H264)
        } else if caps.contains("h265") || caps.contains("hevc") {
            Some(Codec::H265)
        } else {
            None
        }
    }

    pub fn parser_factory(&self) -> &'static str {
        match self {
            Codec::H264 => "h264parse",
            Codec::H265 => "h265parse",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "H.264 (AVC)",
            Codec::H265 => "H.265 (HEVC)",
        }
    }
}

/// 图中节点类型
#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    SourceBin { uri: String },
    Parser(Codec),
    Decoder,
    /// 批处理汇入点 (streammux)
    Muxer {
        batch_size: usize,
        width: u32,
        height: u32,
        batched_push_timeout_us: u64,
        live_source: bool,
    },
    /// 分流点 (tee)
    FanOut { allow_not_linked: bool },
    Queue { max_size_buffers: u32, leaky: u8 },
    Inference { config_path: String, batch_size: usize },
    /// 分支元数据汇合点 (metamux)
    MetaMux,
    Tracker { config_file: Option<String> },
    Tiler { rows: u32, cols: u32, width: u32, height: u32 },
    Osd,
    Converter,
    CapsFilter { caps: String },
    Encoder { bitrate: u32 },
    OutputParser,
    RtpPay,
    UdpSink { host: String, port: u16 },
    FakeSink,
}

impl StageKind {
    /// 媒体引擎中的元件工厂名
    pub fn factory(&self) -> &'static str {
        match self {
            StageKind::SourceBin { .. } => "uridecodebin",
            StageKind::Parser(codec) => codec.parser_factory(),
            StageKind::Decoder => "nvv4l2decoder",
            StageKind::Muxer { .. } => "nvstreammux",
            StageKind::FanOut { .. } => "tee",
            StageKind::Queue { .. } => "queue",
            StageKind::Inference { .. } => "nvinfer",
            StageKind::MetaMux => "nvdsmetamux",
            StageKind::Tracker { .. } => "nvtracker",
            StageKind::Tiler { .. } => "nvmultistreamtiler",
            StageKind::Osd => "nvdsosd",
            StageKind::Converter => "nvvideoconvert",
            StageKind::CapsFilter { .. } => "capsfilter",
            StageKind::Encoder { .. } => "nvv4l2h264enc",
            StageKind::OutputParser => "h264parse",
            StageKind::RtpPay => "rtph264pay",
            StageKind::UdpSink { .. } => "udpsink",
            StageKind::FakeSink => "fakesink",
        }
    }
}

/// 节点描述, 带所属模型/源标签
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    pub model_id: Option<u32>,
    pub source_id: Option<u32>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            model_id: None,
            source_id: None,
        }
    }

    pub fn for_model(mut self, model_id: u32) -> Self {
        self.model_id = Some(model_id);
        self
    }

    pub fn for_source(mut self, source_id: u32) -> Self {
        self.source_id = Some(source_id);
        self
    }
}

/// 引擎分配的节点句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PadRef {
    pub stage: StageId,
    pub pad: String,
}

impl PadRef {
    pub fn new(stage: StageId, pad: impl Into<String>) -> Self {
        Self {
            stage,
            pad: pad.into(),
        }
    }

    pub fn src(stage: StageId) -> Self {
        Self::new(stage, "src")
    }

    pub fn sink(stage: StageId) -> Self {
        Self::new(stage, "sink")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from: PadRef,
    pub to: PadRef,
}

/// 媒体引擎图操作接口, 每个调用都可能在调用时失败
pub trait MediaEngine {
    fn add_stage(&mut self, spec: StageSpec) -> Result<StageId>;

    fn remove_stage(&mut self, id: StageId) -> Result<()>;

    /// 申请请求型pad: 模板 "sink_%u" 自动编号, 否则按名称精确申请
    fn request_pad(&mut self, stage: StageId, template: &str) -> Result<PadRef>;

    fn link(&mut self, from: PadRef, to: PadRef) -> Result<()>;

    fn link_stages(&mut self, from: StageId, to: StageId) -> Result<()> {
        self.link(PadRef::src(from), PadRef::sink(to))
    }
}

#[derive(Debug, Clone)]
struct StageNode {
    spec: StageSpec,
    request_pads: BTreeSet<String>,
    next_pad: u32,
}

/// 内存中的邻接图实现 (演示/测试用引擎)
#[derive(Debug, Default)]
pub struct GraphEngine {
    stages: BTreeMap<StageId, StageNode>,
    links: Vec<Link>,
    next_id: u32,
    /// 创建失败的工厂名 (模拟缺失插件)
    unavailable: BTreeSet<String>,
}

impl GraphEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让某个工厂的元件创建失败
    pub fn with_unavailable(mut self, factory: &str) -> Self {
        self.unavailable.insert(factory.to_string());
        self
    }

    pub fn stage(&self, id: StageId) -> Option<&StageSpec> {
        self.stages.get(&id).map(|n| &n.spec)
    }

    pub fn stages(&self) -> impl Iterator<Item = (StageId, &StageSpec)> {
        self.stages.iter().map(|(id, n)| (*id, &n.spec))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn find(&self, name: &str) -> Option<StageId> {
        self.stages
            .iter()
            .find(|(_, n)| n.spec.name == name)
            .map(|(id, _)| *id)
    }

    pub fn count_factory(&self, factory: &str) -> usize {
        self.stages
            .values()
            .filter(|n| n.spec.kind.factory() == factory)
            .count()
    }

    /// 下游节点 (按链接顺序)
    pub fn downstream(&self, id: StageId) -> Vec<StageId> {
        self.links
            .iter()
            .filter(|l| l.from.stage == id)
            .map(|l| l.to.stage)
            .collect()
    }

    pub fn upstream(&self, id: StageId) -> Vec<StageId> {
        self.links
            .iter()
            .filter(|l| l.to.stage == id)
            .map(|l| l.from.stage)
            .collect()
    }

    fn is_pad_linked(&self, pad: &PadRef) -> bool {
        self.links.iter().any(|l| &l.from == pad || &l.to == pad)
    }

    fn pad_exists(&self, pad: &PadRef) -> bool {
        match self.stages.get(&pad.stage) {
            Some(node) => {
                pad.pad == "src" || pad.pad == "sink" || node.request_pads.contains(&pad.pad)
            }
            None => false,
        }
    }

    fn name_of(&self, id: StageId) -> &str {
        self.stages
            .get(&id)
            .map(|n| n.spec.name.as_str())
            .unwrap_or("?")
    }

    /// 打印拓扑: 每行一条链接
    pub fn describe(&self) -> String {
        self.links
            .iter()
            .map(|l| {
                format!(
                    "{}.{} -> {}.{}",
                    self.name_of(l.from.stage),
                    l.from.pad,
                    self.name_of(l.to.stage),
                    l.to.pad
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl MediaEngine for GraphEngine {
    fn add_stage(&mut self, spec: StageSpec) -> Result<StageId> {
        let factory = spec.kind.factory();
        if self.unavailable.contains(factory) {
            return Err(PipelineError::GraphConstruction(format!(
                "failed to create `{}` ({})",
                spec.name, factory
            )));
        }
        if self.stages.values().any(|n| n.spec.name == spec.name) {
            return Err(PipelineError::GraphConstruction(format!(
                "duplicate stage name `{}`",
                spec.name
            )));
        }
        let id = StageId(self.next_id);
        self.next_id += 1;
        self.stages.insert(
            id,
            StageNode {
                spec,
                request_pads: BTreeSet::new(),
                next_pad: 0,
            },
        );
        Ok(id)
    }

    fn remove_stage(&mut self, id: StageId) -> Result<()> {
        if self.stages.remove(&id).is_none() {
            return Err(PipelineError::GraphConstruction(format!(
                "no stage {id} to remove"
            )));
        }
        self.links.retain(|l| l.from.stage != id && l.to.stage != id);
        Ok(())
    }

    fn request_pad(&mut self, stage: StageId, template: &str) -> Result<PadRef> {
        let node = self.stages.get_mut(&stage).ok_or_else(|| {
            PipelineError::GraphConstruction(format!("no stage {stage} for pad request"))
        })?;

        let name = if let Some(prefix) = template.strip_suffix("%u") {
            loop {
                let candidate = format!("{}{}", prefix, node.next_pad);
                node.next_pad += 1;
                if !node.request_pads.contains(&candidate) {
                    break candidate;
                }
            }
        } else {
            template.to_string()
        };

        if !node.request_pads.insert(name.clone()) {
            return Err(PipelineError::GraphConstruction(format!(
                "pad `{}.{}` already requested",
                node.spec.name, name
            )));
        }
        Ok(PadRef::new(stage, name))
    }

    fn link(&mut self, from: PadRef, to: PadRef) -> Result<()> {
        for pad in [&from, &to] {
            if !self.pad_exists(pad) {
                return Err(PipelineError::GraphConstruction(format!(
                    "pad `{}.{}` does not exist",
                    self.name_of(pad.stage),
                    pad.pad
                )));
            }
        }
        // 每个pad只能链接一次, 多路输出必须走请求pad
        for pad in [&from, &to] {
            if self.is_pad_linked(pad) {
                return Err(PipelineError::GraphConstruction(format!(
                    "pad `{}.{}` already linked",
                    self.name_of(pad.stage),
                    pad.pad
                )));
            }
        }
        self.links.push(Link { from, to });
        Ok(())
    }
}
