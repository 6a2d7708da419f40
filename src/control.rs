/// 控制消息分发
/// Control event dispatcher: errors, warnings, end-of-stream and per-source end markers
///
/// 独立线程消费控制通道, 驱动注册表状态与运行循环的停止.
use crate::error::PipelineError;
use crate::registry::StreamRegistry;
use crossbeam_channel::Receiver;
use regex::Regex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 带外控制消息
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// 致命错误
    Error {
        origin: String,
        message: String,
        debug: Option<String>,
    },
    Warning {
        origin: String,
        message: String,
    },
    /// 全局结束
    GlobalEos,
    /// 单个源结束
    SourceEnd { source_id: u32 },
    StateChanged {
        origin: String,
        old: String,
        new: String,
    },
    /// 分支汇合超时 (abort 策略)
    JoinStall {
        seq: u64,
        waited: Duration,
        missing: Vec<u32>,
    },
    /// 外部停止请求 (Ctrl-C 等)
    StopRequested,
}

impl ControlEvent {
    pub fn error(origin: impl Into<String>, message: impl Into<String>) -> Self {
        ControlEvent::Error {
            origin: origin.into(),
            message: message.into(),
            debug: None,
        }
    }

    pub fn warning(origin: impl Into<String>, message: impl Into<String>) -> Self {
        ControlEvent::Warning {
            origin: origin.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// 正常结束
    Eos,
    Fatal(String),
    /// 外部请求停止, 或控制通道关闭
    Stopped,
}

impl StopReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::Fatal(_) => 1,
            StopReason::Eos | StopReason::Stopped => 0,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StopReason::Fatal(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(StopReason),
}

pub struct ControlDispatcher {
    registry: Arc<StreamRegistry>,
    benign: Vec<Regex>,
    total_sources: usize,
}

impl ControlDispatcher {
    pub fn new(registry: Arc<StreamRegistry>, benign: Vec<Regex>, total_sources: usize) -> Self {
        Self {
            registry,
            benign,
            total_sources,
        }
    }

    fn is_benign(&self, message: &str) -> bool {
        self.benign.iter().any(|re| re.is_match(message))
    }

    pub fn dispatch(&self, event: ControlEvent) -> Flow {
        match event {
            ControlEvent::Error {
                origin,
                message,
                debug,
            } => {
                error!("❌ ERROR from {}: {}", origin, message);
                if let Some(detail) = debug {
                    error!("   Debug: {}", detail);
                }
                Flow::Stop(StopReason::Fatal(format!("{origin}: {message}")))
            }
            ControlEvent::Warning { origin, message } => {
                if self.is_benign(&message) {
                    debug!("WARNING from {} (ignored): {}", origin, message);
                } else {
                    warn!("⚠️  WARNING from {}: {}", origin, message);
                }
                Flow::Continue
            }
            ControlEvent::GlobalEos => {
                info!("✅ End-of-stream");
                Flow::Stop(StopReason::Eos)
            }
            ControlEvent::SourceEnd { source_id } => {
                self.registry.mark_ended(source_id);
                if self.registry.all_ended(self.total_sources) {
                    info!("✅ All {} streams ended, waiting for EOS", self.total_sources);
                }
                Flow::Continue
            }
            ControlEvent::StateChanged { origin, old, new } => {
                if origin.starts_with("source-bin") && new == "PLAYING" {
                    info!("▶️  {}: {} -> {}", origin, old, new);
                }
                Flow::Continue
            }
            ControlEvent::JoinStall {
                seq,
                waited,
                missing,
            } => {
                let err = PipelineError::JoinStall {
                    seq,
                    waited,
                    missing,
                };
                error!("❌ {}", err);
                Flow::Stop(StopReason::Fatal(err.to_string()))
            }
            ControlEvent::StopRequested => {
                info!("⏹️  Stop requested");
                Flow::Stop(StopReason::Stopped)
            }
        }
    }

    /// 阻塞消费直到停止; 通道关闭视为外部停止
    pub fn run(&self, rx: &Receiver<ControlEvent>) -> StopReason {
        for event in rx.iter() {
            if let Flow::Stop(reason) = self.dispatch(event) {
                return reason;
            }
        }
        debug!("control channel closed");
        StopReason::Stopped
    }

    pub fn spawn(self, rx: Receiver<ControlEvent>) -> JoinHandle<StopReason> {
        thread::spawn(move || self.run(&rx))
    }
}
