//! 流水线错误类型
//! Error types for the analytics pipeline

use std::time::Duration;
use thiserror::Error;

/// 流水线结果类型
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 编码格式不在支持列表中, 该源被放弃
    #[error("Stream-{source_id}: unsupported format `{caps}` (supported: H.264, H.265)")]
    UnsupportedFormat { source_id: u32, caps: String },

    /// 非视频 caps (例如音频pad), 忽略并继续等待视频pad
    #[error("Stream-{source_id}: `{caps}` is not a video stream")]
    NotVideo { source_id: u32, caps: String },

    #[error("graph construction failed: {0}")]
    GraphConstruction(String),

    #[error("fan-in stage has no free slot ({capacity} sources max, requested source {source_id})")]
    CapacityExceeded { source_id: u32, capacity: usize },

    /// 同一个源的解码分支已经插入过
    #[error("Stream-{source_id}: decode stage already attached")]
    AlreadyAttached { source_id: u32 },

    #[error("Stream-{0}: not registered")]
    UnknownSource(u32),

    #[error("join of batch #{seq} stalled for {waited:?}, missing models {missing:?}")]
    JoinStall {
        seq: u64,
        waited: Duration,
        missing: Vec<u32>,
    },

    #[error("model {model_id} stage failed: {message}")]
    Stage { model_id: u32, message: String },

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl PipelineError {
    /// 启动阶段的致命错误 (进入运行循环前必须退出)
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            PipelineError::GraphConstruction(_)
                | PipelineError::CapacityExceeded { .. }
                | PipelineError::Config(_)
        )
    }
}
