//! 流水线配置 - 通过JSON文件描述模型、分支模式与输出
//! Pipeline configuration loaded once at startup

use crate::error::{PipelineError, Result};
use crate::types::{ModelDescriptor, PipelineMode, Rgba};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// 完整配置文档
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub models: Vec<ModelConfig>,
    pub tracker: TrackerSection,
    /// 可忽略的警告 (正则)
    pub benign_warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub mode: PipelineMode,
    /// streammux 可接入的最大源数
    pub max_sources: usize,
    pub streammux: StreammuxConfig,
    pub queue: QueueConfig,
    pub tiler: TilerConfig,
    pub encoder: EncoderConfig,
    pub output: OutputConfig,
    pub debug: DebugConfig,
    pub join: JoinConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreammuxConfig {
    pub width: u32,
    pub height: u32,
    pub batched_push_timeout_us: u64,
    pub live_source: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size_buffers: u32,
    /// 0=不丢弃 1=丢上游 2=丢下游
    pub leaky: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TilerConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub bitrate: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub rtsp: RtspOutputConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspOutputConfig {
    pub rtsp_port: u16,
    pub udp_port: u16,
    pub multicast_ip: String,
    pub stream_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub use_fakesink: bool,
}

/// 分支汇合卡住时的处理策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallPolicy {
    /// 记录诊断后继续等待
    Wait,
    /// 丢弃未汇合完成的批次
    #[default]
    Drop,
    /// 视为致命错误, 触发关闭
    Abort,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    pub stall_timeout_ms: u64,
    pub stall_policy: StallPolicy,
}

impl JoinConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColorConfig {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: u32,
    /// 推理引擎的模型配置文件 (透传给媒体引擎)
    #[serde(default)]
    pub config: String,
    pub classes: BTreeMap<u32, String>,
    pub color: ColorConfig,
    #[serde(default = "default_border_width")]
    pub border_width: u32,
}

fn default_border_width() -> u32 {
    3
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    pub enable: bool,
    pub display_tracking_id: bool,
    pub config_file: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineSection::default(),
            models: Vec::new(),
            tracker: TrackerSection::default(),
            benign_warnings: vec!["QoS".to_string(), "upstream".to_string()],
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Parallel,
            max_sources: 16,
            streammux: StreammuxConfig::default(),
            queue: QueueConfig::default(),
            tiler: TilerConfig::default(),
            encoder: EncoderConfig::default(),
            output: OutputConfig::default(),
            debug: DebugConfig::default(),
            join: JoinConfig::default(),
        }
    }
}

impl Default for StreammuxConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            batched_push_timeout_us: 40_000,
            live_source: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size_buffers: 3,
            leaky: 2,
        }
    }
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self { bitrate: 4_000_000 }
    }
}

impl Default for RtspOutputConfig {
    fn default() -> Self {
        Self {
            rtsp_port: 8554,
            udp_port: 5400,
            multicast_ip: "224.224.255.255".to_string(),
            stream_path: "/ds-test".to_string(),
        }
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 2_000,
            stall_policy: StallPolicy::Drop,
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            enable: false,
            display_tracking_id: true,
            config_file: None,
        }
    }
}

impl ModelConfig {
    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(
            self.id,
            self.classes.clone(),
            Rgba::new(self.color.r, self.color.g, self.color.b, 1.0),
            self.border_width,
        )
    }
}

impl PipelineConfig {
    /// 从JSON文件加载并校验配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(PipelineError::Config("no models configured".into()));
        }
        let mut seen = BTreeSet::new();
        for model in &self.models {
            if !seen.insert(model.id) {
                return Err(PipelineError::Config(format!(
                    "duplicate model id {}",
                    model.id
                )));
            }
            if model.classes.is_empty() {
                return Err(PipelineError::Config(format!(
                    "model {} has no classes",
                    model.id
                )));
            }
        }
        if self.pipeline.max_sources == 0 {
            return Err(PipelineError::Config("max_sources must be > 0".into()));
        }
        if self.pipeline.join.stall_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "join.stall_timeout_ms must be > 0".into(),
            ));
        }
        self.benign_patterns()?;
        Ok(())
    }

    /// 模型描述表 (按配置顺序)
    pub fn model_descriptors(&self) -> Vec<ModelDescriptor> {
        self.models.iter().map(ModelConfig::descriptor).collect()
    }

    pub fn benign_patterns(&self) -> Result<Vec<Regex>> {
        self.benign_warnings
            .iter()
            .map(|p| Regex::new(p).map_err(PipelineError::from))
            .collect()
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!(
            "🎛️  模式: {} | 模型: {} | 跟踪器: {} | 输出: {}",
            self.pipeline.mode.label(),
            self.models.len(),
            if self.tracker.enable { "ON" } else { "OFF" },
            if self.pipeline.debug.use_fakesink {
                "fakesink".to_string()
            } else {
                format!(
                    "rtsp://localhost:{}{}",
                    self.pipeline.output.rtsp.rtsp_port, self.pipeline.output.rtsp.stream_path
                )
            }
        );
        for model in &self.models {
            info!(
                "  Model-{}: {} 类 | 边框{}px | {}",
                model.id,
                model.classes.len(),
                model.border_width,
                model.config
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "pipeline": {
            "mode": "serial",
            "max_sources": 4,
            "queue": {"max_size_buffers": 2, "leaky": 2},
            "debug": {"use_fakesink": true},
            "join": {"stall_timeout_ms": 500, "stall_policy": "abort"}
        },
        "models": [
            {"id": 1, "config": "pgie1.txt", "classes": {"0": "car", "2": "truck"},
             "color": {"r": 1.0, "g": 0.0, "b": 0.0}, "border_width": 4},
            {"id": 2, "classes": {"0": "person"}, "color": {"r": 0.0, "g": 1.0, "b": 0.0}}
        ],
        "tracker": {"enable": true}
    }"#;

    #[test]
    fn test_parse_sample() {
        let cfg = PipelineConfig::from_json(SAMPLE).unwrap();
        assert_eq!(cfg.pipeline.mode, PipelineMode::Serial);
        assert_eq!(cfg.pipeline.max_sources, 4);
        assert_eq!(cfg.pipeline.join.stall_policy, StallPolicy::Abort);
        assert_eq!(cfg.pipeline.streammux.width, 1920);
        assert!(cfg.tracker.enable);
        assert!(cfg.tracker.display_tracking_id);
        assert_eq!(cfg.benign_warnings, vec!["QoS", "upstream"]);

        let models = cfg.model_descriptors();
        assert_eq!(models[0].label(2), Some("truck"));
        assert_eq!(models[0].border_width, 4);
        assert_eq!(models[1].border_width, 3);
        assert_eq!(models[1].branch_color, Rgba::new(0.0, 1.0, 0.0, 1.0));
    }

    #[test]
    fn test_rejects_duplicate_models() {
        let json = r#"{"models": [
            {"id": 1, "classes": {"0": "a"}, "color": {"r": 1, "g": 0, "b": 0}},
            {"id": 1, "classes": {"0": "b"}, "color": {"r": 1, "g": 0, "b": 0}}
        ]}"#;
        assert!(matches!(
            PipelineConfig::from_json(json),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_empty_and_bad_patterns() {
        assert!(PipelineConfig::from_json("{}").is_err());
        let json = r#"{"models": [{"id": 1, "classes": {"0": "a"}, "color": {"r": 1, "g": 0, "b": 0}}],
                      "benign_warnings": ["("]}"#;
        assert!(matches!(
            PipelineConfig::from_json(json),
            Err(PipelineError::Regex(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(cfg.models.len(), 2);

        assert!(matches!(
            PipelineConfig::load("/nonexistent/models.json"),
            Err(PipelineError::Io(_))
        ));
    }
}
