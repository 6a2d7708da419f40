#![allow(clippy::type_complexity)]
pub mod aggregator; // 检测结果聚合
pub mod config; // 流水线配置
pub mod control; // 控制消息分发
pub mod error; // 错误类型
pub mod overlay; // 画面叠加信息
pub mod pipeline; // 分支/汇合运行时
pub mod rate; // 帧率估计
pub mod registry; // 视频源注册表
pub mod stats; // 统计存储
pub mod topology; // 拓扑构建
pub mod types; // 公共数据结构

pub use crate::aggregator::DetectionAggregator;
pub use crate::config::{PipelineConfig, StallPolicy};
pub use crate::control::{ControlDispatcher, ControlEvent, Flow, StopReason};
pub use crate::error::{PipelineError, Result};
pub use crate::overlay::{AnnotationBlock, BlockKind, OverlayComposer, TileLayout};
pub use crate::pipeline::{
    CompositeFrame, FrameBatch, JoinReport, ModelStage, Pipeline, RunSummary, RuntimeContext,
};
pub use crate::rate::RateEstimator;
pub use crate::registry::StreamRegistry;
pub use crate::stats::{GlobalStats, StatsStore};
pub use crate::topology::{GraphEngine, MediaEngine, Topology, TopologyBuilder};
pub use crate::types::{
    BBox, DetectionRecord, FrameRecord, ModelDescriptor, PipelineMode, Rgba, SourceDescriptor,
    SourceState, SourceStats,
};

/// 带分隔符的本地时间字符串, 用于日志与输出文件命名
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}
