/// 拓扑 (Topology)
///
/// - graph:   节点/pad/链接模型与媒体引擎接口
/// - builder: 静态图构建, 模型分支连线, 源的延迟接入
pub mod builder;
pub mod graph;

pub use builder::{
    AttachedSource, BranchHandle, BranchPlan, PendingSource, SlotState, Topology, TopologyBuilder,
};
pub use graph::{Codec, GraphEngine, Link, MediaEngine, PadRef, StageId, StageKind, StageSpec};
