/// 视频源注册表
/// Per-source lifecycle registry
///
/// DISCOVERED → ACTIVE (首帧到达) → ENDED (stream-eos), ENDED为终态.
/// 控制线程写, 聚合/叠加线程读, 全部经由同一把读写锁.
use crate::types::{SourceDescriptor, SourceState};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct RegistryInner {
    states: BTreeMap<u32, SourceState>,
    abandoned: BTreeSet<u32>,
    ended_count: usize,
}

impl RegistryInner {
    fn end(&mut self, source_id: u32) -> bool {
        let changed = match self.states.get_mut(&source_id) {
            Some(SourceState::Ended) => false,
            Some(state) => {
                *state = SourceState::Ended;
                true
            }
            None => {
                debug!("Stream-{} 未注册, 忽略结束信号", source_id);
                false
            }
        };
        if changed {
            self.ended_count += 1;
            info!(
                "✅ Stream-{} ended ({}/{})",
                source_id,
                self.ended_count,
                self.states.len()
            );
        }
        changed
    }
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    inner: RwLock<RegistryInner>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: &[SourceDescriptor]) -> Self {
        let registry = Self::new();
        for source in sources {
            registry.register(source.id);
        }
        registry
    }

    /// 登记新源 (DISCOVERED), 已存在则不变
    pub fn register(&self, source_id: u32) -> bool {
        let mut inner = self.inner.write();
        if inner.states.contains_key(&source_id) {
            return false;
        }
        inner.states.insert(source_id, SourceState::Discovered);
        true
    }

    /// 返回是否发生了 DISCOVERED → ACTIVE
    pub fn mark_active(&self, source_id: u32) -> bool {
        let mut inner = self.inner.write();
        match inner.states.get_mut(&source_id) {
            Some(state) if *state == SourceState::Discovered => {
                *state = SourceState::Active;
                debug!("🟢 Stream-{} ACTIVE", source_id);
                true
            }
            Some(_) => false,
            None => {
                debug!("Stream-{} 未注册, 忽略", source_id);
                false
            }
        }
    }

    /// 返回是否发生了状态变化, 已结束的源不重复计数
    pub fn mark_ended(&self, source_id: u32) -> bool {
        let mut inner = self.inner.write();
        inner.end(source_id)
    }

    /// 格式不支持的源: 直接结束并标记为放弃, 永远不会变为ACTIVE
    ///
    /// 结束与放弃标记在同一次加锁内完成, 读者不会看到未标记的ENDED.
    pub fn abandon(&self, source_id: u32) -> bool {
        let mut inner = self.inner.write();
        let changed = inner.end(source_id);
        if changed {
            inner.abandoned.insert(source_id);
        }
        changed
    }

    /// 状态与放弃标记的一致快照
    pub fn entry(&self, source_id: u32) -> Option<(SourceState, bool)> {
        let inner = self.inner.read();
        let state = inner.states.get(&source_id).copied()?;
        Some((state, inner.abandoned.contains(&source_id)))
    }

    pub fn state(&self, source_id: u32) -> Option<SourceState> {
        self.inner.read().states.get(&source_id).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<u32, SourceState> {
        self.inner.read().states.clone()
    }

    pub fn is_abandoned(&self, source_id: u32) -> bool {
        self.inner.read().abandoned.contains(&source_id)
    }

    pub fn ended_count(&self) -> usize {
        self.inner.read().ended_count
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .states
            .values()
            .filter(|s| **s == SourceState::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().states.is_empty()
    }

    /// 0..total_expected 的每个源都已结束
    pub fn all_ended(&self, total_expected: usize) -> bool {
        let inner = self.inner.read();
        (0..total_expected as u32)
            .all(|id| inner.states.get(&id) == Some(&SourceState::Ended))
    }
}
