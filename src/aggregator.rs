/// 检测结果聚合器
/// Detection aggregator: per-frame counting and per-model visual attribution
///
/// 在汇合点之后对每帧执行一次:
/// 1. 按 (model_id, class_id) 计数, 未配置的类别直接跳过
/// 2. 按模型设置边框颜色/宽度与目标标签
/// 3. 统计不同的跟踪ID数量
/// 4. 覆盖写入该源的 SourceStats
use crate::registry::StreamRegistry;
use crate::stats::StatsStore;
use crate::types::{
    BoxStyle, FrameRecord, ModelDescriptor, Rgba, SourceStats, TextParams, DEFAULT_FONT,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// 边框透明度
const BORDER_ALPHA: f32 = 0.9;
/// 目标标签背景
const LABEL_BG: Rgba = Rgba::new(0.0, 0.0, 0.0, 0.7);
const LABEL_FONT_SIZE: u32 = 10;
const LABEL_Y_GAP: i32 = 10;

pub struct DetectionAggregator {
    models: Vec<ModelDescriptor>,
    /// model_id → models 下标
    index: HashMap<u32, usize>,
    display_tracking_id: bool,
    registry: Arc<StreamRegistry>,
    store: Arc<StatsStore>,
}

impl DetectionAggregator {
    pub fn new(
        models: Vec<ModelDescriptor>,
        display_tracking_id: bool,
        registry: Arc<StreamRegistry>,
        store: Arc<StatsStore>,
    ) -> Self {
        let index = models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id, i))
            .collect();
        Self {
            models,
            index,
            display_tracking_id,
            registry,
            store,
        }
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// 一个批次对应一次帧率更新, 批内每帧共享同一帧率
    pub fn ingest_batch(&self, frames: &mut [FrameRecord]) -> Vec<SourceStats> {
        let rate = self.store.tick();
        frames
            .iter_mut()
            .map(|frame| self.ingest_with_rate(frame, rate))
            .collect()
    }

    pub fn ingest(&self, frame: &mut FrameRecord) -> SourceStats {
        let rate = self.store.current_rate();
        self.ingest_with_rate(frame, rate)
    }

    fn ingest_with_rate(&self, frame: &mut FrameRecord, rate: f64) -> SourceStats {
        self.registry.mark_active(frame.source_id);

        // 计数器每帧从0开始
        let mut counters: BTreeMap<u32, BTreeMap<u32, u32>> = self
            .models
            .iter()
            .map(|m| (m.id, m.class_labels.keys().map(|&c| (c, 0)).collect()))
            .collect();
        let mut tracked = HashSet::new();

        for det in frame.detections.iter_mut() {
            let tracked_obj = det.is_tracked();
            if tracked_obj {
                tracked.insert(det.track_id);
            }

            let Some(model) = self.index.get(&det.model_id).map(|&i| &self.models[i]) else {
                continue;
            };
            let Some(class_name) = model.label(det.class_id) else {
                continue;
            };

            if let Some(count) = counters
                .get_mut(&model.id)
                .and_then(|classes| classes.get_mut(&det.class_id))
            {
                *count += 1;
            }

            det.style = Some(BoxStyle {
                border_color: model.branch_color.with_alpha(BORDER_ALPHA),
                border_width: model.border_width,
            });

            let text = if self.display_tracking_id && tracked_obj {
                format!("{}[{}]", class_name, det.track_id)
            } else {
                class_name.to_string()
            };
            det.label = Some(TextParams {
                text,
                x: det.bbox.left as i32,
                y: (det.bbox.top as i32 - LABEL_Y_GAP).max(0),
                font_name: DEFAULT_FONT,
                font_size: LABEL_FONT_SIZE,
                font_color: Rgba::WHITE,
                background: Some(LABEL_BG),
            });
        }

        let stats = SourceStats {
            source_id: frame.source_id,
            frame_number: frame.frame_number,
            per_model_class_counts: counters,
            tracked_object_count: tracked.len(),
            instantaneous_rate: rate,
        };
        self.store.publish(stats.clone());
        stats
    }
}
