/// 画面叠加信息生成
/// Overlay composer for the tiled multi-stream canvas
///
/// 纯函数: (SourceStats, SourceState, TileLayout) → [AnnotationBlock]
/// 只读取统计快照, 不修改任何统计.
use crate::types::{ModelDescriptor, PipelineMode, Rgba, SourceState, SourceStats, TextParams, DEFAULT_FONT};

const MARGIN_X: i32 = 10;
const MARGIN_Y: i32 = 12;
/// 每行文字的垂直间距
const LINE_HEIGHT: i32 = 20;
const HEADER_FONT_SIZE: u32 = 12;
const BODY_FONT_SIZE: u32 = 10;
const HEADER_BG: Rgba = Rgba::new(0.0, 0.0, 0.0, 0.9);
const BODY_BG: Rgba = Rgba::new(0.0, 0.0, 0.0, 0.8);

/// 拼接画面网格
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    pub rows: u32,
    pub cols: u32,
    pub width: u32,
    pub height: u32,
}

impl TileLayout {
    /// 根据源数量选择接近正方形的最小网格
    pub fn grid(source_count: usize) -> (u32, u32) {
        match source_count {
            0 | 1 => (1, 1),
            2 => (1, 2),
            3..=4 => (2, 2),
            5..=6 => (2, 3),
            7..=9 => (3, 3),
            10..=16 => (4, 4),
            n => {
                let rows = (n as f64).sqrt().ceil() as usize;
                let cols = n.div_ceil(rows);
                (rows as u32, cols as u32)
            }
        }
    }

    pub fn for_sources(source_count: usize, width: u32, height: u32) -> Self {
        let (rows, cols) = Self::grid(source_count);
        Self {
            rows,
            cols,
            width,
            height,
        }
    }

    pub fn tile_width(&self) -> u32 {
        self.width / self.cols
    }

    pub fn tile_height(&self) -> u32 {
        self.height / self.rows
    }

    /// 源在网格中的 (行, 列)
    pub fn position(&self, source_id: u32) -> (u32, u32) {
        (source_id / self.cols, source_id % self.cols)
    }

    /// 源所在格子的左上角像素坐标
    pub fn origin(&self, source_id: u32) -> (i32, i32) {
        let (row, col) = self.position(source_id);
        (
            (col * self.tile_width()) as i32,
            (row * self.tile_height()) as i32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Header,
    Model(u32),
    Tracking,
}

/// 一块文字标注
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationBlock {
    pub source_id: u32,
    pub kind: BlockKind,
    pub text: TextParams,
}

pub struct OverlayComposer {
    models: Vec<ModelDescriptor>,
    mode: PipelineMode,
    show_tracking: bool,
}

impl OverlayComposer {
    pub fn new(models: Vec<ModelDescriptor>, mode: PipelineMode, show_tracking: bool) -> Self {
        Self {
            models,
            mode,
            show_tracking,
        }
    }

    pub fn compose(
        &self,
        stats: &SourceStats,
        state: SourceState,
        layout: &TileLayout,
    ) -> Vec<AnnotationBlock> {
        let (tile_x, tile_y) = layout.origin(stats.source_id);
        let x = tile_x + MARGIN_X;
        let y = tile_y + MARGIN_Y;
        let header_color = match state {
            SourceState::Discovered => Rgba::WHITE,
            SourceState::Active => Rgba::YELLOW,
            SourceState::Ended => Rgba::RED,
        };

        let mut blocks = Vec::with_capacity(self.models.len() + 2);

        // 头部: 状态 | 模式 | 帧率 | 帧号
        blocks.push(AnnotationBlock {
            source_id: stats.source_id,
            kind: BlockKind::Header,
            text: TextParams {
                text: format!(
                    "Stream-{}[{}]|{}|FPS:{:.1}|F:{}",
                    stats.source_id,
                    state.label(),
                    self.mode.label(),
                    stats.instantaneous_rate,
                    stats.frame_number
                ),
                x,
                y,
                font_name: DEFAULT_FONT,
                font_size: HEADER_FONT_SIZE,
                font_color: header_color,
                background: Some(HEADER_BG),
            },
        });

        for (idx, model) in self.models.iter().enumerate() {
            blocks.push(AnnotationBlock {
                source_id: stats.source_id,
                kind: BlockKind::Model(model.id),
                text: self.body_text(
                    model_line(model, stats),
                    x,
                    y + (idx as i32 + 1) * LINE_HEIGHT,
                    model.branch_color.with_alpha(1.0),
                ),
            });
        }

        if self.show_tracking {
            blocks.push(AnnotationBlock {
                source_id: stats.source_id,
                kind: BlockKind::Tracking,
                text: self.body_text(
                    format!("Tracked:{}", stats.tracked_object_count),
                    x,
                    y + (self.models.len() as i32 + 1) * LINE_HEIGHT,
                    Rgba::CYAN,
                ),
            });
        }

        blocks
    }

    fn body_text(&self, text: String, x: i32, y: i32, color: Rgba) -> TextParams {
        TextParams {
            text,
            x,
            y,
            font_name: DEFAULT_FONT,
            font_size: BODY_FONT_SIZE,
            font_color: color,
            background: Some(BODY_BG),
        }
    }
}

/// "M1: car=2 truck=1", 全为0时 "M1:0"
fn model_line(model: &ModelDescriptor, stats: &SourceStats) -> String {
    let parts: Vec<String> = stats
        .per_model_class_counts
        .get(&model.id)
        .into_iter()
        .flat_map(|classes| classes.iter())
        .filter(|&(_, &count)| count > 0)
        .filter_map(|(class_id, count)| model.label(*class_id).map(|name| format!("{name}={count}")))
        .collect();

    if parts.is_empty() {
        format!("M{}:0", model.id)
    } else {
        format!("M{}: {}", model.id, parts.join(" "))
    }
}
