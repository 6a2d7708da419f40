/// 多路分析系统数据结构定义
/// Data structures for the multi-stream analytics pipeline
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ========== 公共常量 ==========

/// 跟踪器未分配ID时的哨兵值
pub const UNTRACKED_OBJECT_ID: u64 = u64::MAX;

/// 标签默认字体
pub const DEFAULT_FONT: &str = "Serif";

// ========== 枚举类型 ==========

/// 视频源生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    Discovered,
    Active,
    Ended,
}

impl SourceState {
    pub fn label(&self) -> &'static str {
        match self {
            SourceState::Discovered => "DISCOVERED",
            SourceState::Active => "ACTIVE",
            SourceState::Ended => "ENDED",
        }
    }
}

/// 多模型组织方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// tee → N个并行分支 → metamux
    #[default]
    Parallel,
    /// 模型串联
    Serial,
}

impl PipelineMode {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineMode::Parallel => "PARALLEL",
            PipelineMode::Serial => "SERIAL",
        }
    }
}

// ========== 数据结构 ==========

/// 颜色 (RGBA, 0.0-1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    #[serde(default = "opaque")]
    pub a: f32,
}

fn opaque() -> f32 {
    1.0
}

impl Rgba {
    pub const RED: Rgba = Rgba::new(1.0, 0.0, 0.0, 1.0);
    pub const YELLOW: Rgba = Rgba::new(1.0, 1.0, 0.0, 1.0);
    pub const CYAN: Rgba = Rgba::new(0.0, 1.0, 1.0, 1.0);
    pub const WHITE: Rgba = Rgba::new(1.0, 1.0, 1.0, 1.0);
    pub const BLACK: Rgba = Rgba::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub const fn with_alpha(self, a: f32) -> Self {
        Self::new(self.r, self.g, self.b, a)
    }
}

/// 视频源描述 (启动时创建, 不可变)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: u32,
    pub uri: String,
}

impl SourceDescriptor {
    pub fn new(id: u32, uri: impl Into<String>) -> Self {
        Self {
            id,
            uri: uri.into(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.uri.starts_with("rtsp://") || self.uri.starts_with("rtmp://")
    }
}

/// 模型描述 (配置加载后只读共享)
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: u32,
    pub class_labels: BTreeMap<u32, String>,
    pub branch_color: Rgba,
    pub border_width: u32,
}

impl ModelDescriptor {
    pub fn new(id: u32, class_labels: BTreeMap<u32, String>, branch_color: Rgba, border_width: u32) -> Self {
        Self {
            id,
            class_labels,
            branch_color,
            border_width,
        }
    }

    pub fn label(&self, class_id: u32) -> Option<&str> {
        self.class_labels.get(&class_id).map(String::as_str)
    }

    pub fn accepts(&self, class_id: u32) -> bool {
        self.class_labels.contains_key(&class_id)
    }
}

/// 检测框 (left/top/width/height, 像素)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// 边框样式 (由所属模型决定)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxStyle {
    pub border_color: Rgba,
    pub border_width: u32,
}

/// 文字参数 (OSD阶段烧录到画面)
#[derive(Debug, Clone, PartialEq)]
pub struct TextParams {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub font_name: &'static str,
    pub font_size: u32,
    pub font_color: Rgba,
    pub background: Option<Rgba>,
}

/// 单个目标的检测记录
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub model_id: u32,
    pub class_id: u32,
    pub track_id: u64,
    pub bbox: BBox,
    pub confidence: f32,
    pub style: Option<BoxStyle>,
    pub label: Option<TextParams>,
}

impl DetectionRecord {
    pub fn new(model_id: u32, class_id: u32, bbox: BBox) -> Self {
        Self {
            model_id,
            class_id,
            track_id: UNTRACKED_OBJECT_ID,
            bbox,
            confidence: 1.0,
            style: None,
            label: None,
        }
    }

    pub fn with_track(mut self, track_id: u64) -> Self {
        self.track_id = track_id;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn is_tracked(&self) -> bool {
        self.track_id != UNTRACKED_OBJECT_ID
    }
}

/// 帧记录 (流水线中流动的工作单元)
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub source_id: u32,
    pub frame_number: u64,
    pub detections: Vec<DetectionRecord>,
}

impl FrameRecord {
    pub fn new(source_id: u32, frame_number: u64) -> Self {
        Self {
            source_id,
            frame_number,
            detections: Vec::new(),
        }
    }

    pub fn with_detections(mut self, detections: Vec<DetectionRecord>) -> Self {
        self.detections = detections;
        self
    }
}

/// 单个源的每帧统计 (每帧覆盖, 不累加)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceStats {
    pub source_id: u32,
    pub frame_number: u64,
    pub per_model_class_counts: BTreeMap<u32, BTreeMap<u32, u32>>,
    pub tracked_object_count: usize,
    pub instantaneous_rate: f64,
}

impl SourceStats {
    pub fn count(&self, model_id: u32, class_id: u32) -> u32 {
        self.per_model_class_counts
            .get(&model_id)
            .and_then(|classes| classes.get(&class_id))
            .copied()
            .unwrap_or(0)
    }

    /// 某个模型在本帧的目标总数
    pub fn model_total(&self, model_id: u32) -> u32 {
        self.per_model_class_counts
            .get(&model_id)
            .map(|classes| classes.values().sum())
            .unwrap_or(0)
    }
}
