/// 模型分支工作线程 (Branch workers)
/// 职责: 接收批次 → 逐帧推理 → 把检测结果发送到汇合线程
use super::join::{BranchOutput, JoinMessage};
use super::{FrameBatch, ModelStage};
use crate::control::ControlEvent;
use crate::error::Result;
use crate::types::{DetectionRecord, FrameRecord};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// 一个工作线程持有的推理阶段
pub(crate) struct BranchWorker {
    /// 在汇合点的下标
    index: usize,
    stages: Vec<Box<dyn ModelStage>>,
    control: Sender<ControlEvent>,
    processed: u64,
}

impl BranchWorker {
    /// 并行模式每个分支一个阶段; 串联模式多个阶段依次处理同一帧, 后面的阶段能看到前面的检测结果
    pub fn new(index: usize, stages: Vec<Box<dyn ModelStage>>, control: Sender<ControlEvent>) -> Self {
        Self {
            index,
            stages,
            control,
            processed: 0,
        }
    }

    fn name(&self) -> String {
        let ids: Vec<String> = self
            .stages
            .iter()
            .map(|s| format!("pgie{}", s.model_id()))
            .collect();
        ids.join("+")
    }

    /// 对单帧运行全部阶段, 返回本分支新增的检测
    fn process_frame(&mut self, frame: &FrameRecord) -> Vec<DetectionRecord> {
        let mut working = frame.clone();
        let base = working.detections.len();

        for stage in self.stages.iter_mut() {
            let model_id = stage.model_id();
            match stage.infer(&working) {
                Ok(mut detections) => {
                    for det in detections.iter_mut() {
                        det.model_id = model_id;
                    }
                    working.detections.extend(detections);
                }
                Err(e) => {
                    // 推理失败是致命错误, 本帧该模型按无结果处理以便汇合完成
                    let _ = self.control.send(ControlEvent::Error {
                        origin: format!("pgie{model_id}"),
                        message: e.to_string(),
                        debug: Some(format!(
                            "Stream-{} frame {}",
                            frame.source_id, frame.frame_number
                        )),
                    });
                }
            }
        }

        working.detections.split_off(base)
    }

    fn run(mut self, rx: Receiver<Arc<FrameBatch>>, join: Sender<JoinMessage>) {
        let name = self.name();
        info!("🔍 {} 分支启动", name);
        let _guard = ExitGuard {
            index: self.index,
            name: name.clone(),
            join: join.clone(),
            control: self.control.clone(),
        };

        for batch in rx.iter() {
            let detections = batch
                .frames
                .iter()
                .map(|frame| self.process_frame(frame))
                .collect();
            self.processed += 1;

            let output = BranchOutput {
                seq: batch.seq,
                branch: self.index,
                detections,
            };
            if join.send(JoinMessage::Output(output)).is_err() {
                debug!("{}: 汇合线程已退出", name);
                break;
            }
        }

        info!("✅ {} 分支退出, 处理 {} 个批次", name, self.processed);
    }

    pub fn spawn(
        self,
        rx: Receiver<Arc<FrameBatch>>,
        join: Sender<JoinMessage>,
    ) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name(format!("branch-{}", self.index))
            .spawn(move || self.run(rx, join))?;
        Ok(handle)
    }
}

/// 阶段 panic 时通知控制线程与汇合线程, 避免汇合点一直等待该分支
struct ExitGuard {
    index: usize,
    name: String,
    join: Sender<JoinMessage>,
    control: Sender<ControlEvent>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        error!("❌ {} 分支线程 panic", self.name);
        let _ = self.control.send(ControlEvent::error(
            self.name.clone(),
            "branch worker panicked",
        ));
        let _ = self.join.send(JoinMessage::Detached(self.index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::types::BBox;
    use crossbeam_channel::unbounded;

    /// 每帧输出固定数量的目标
    struct CountStage {
        model_id: u32,
        per_frame: usize,
    }

    impl ModelStage for CountStage {
        fn model_id(&self) -> u32 {
            self.model_id
        }

        fn infer(&mut self, frame: &FrameRecord) -> Result<Vec<DetectionRecord>> {
            // 串联时可以看到上游结果
            let upstream = frame.detections.len();
            Ok((0..self.per_frame)
                .map(|_| DetectionRecord::new(0, upstream as u32, BBox::default()))
                .collect())
        }
    }

    struct FailingStage;

    impl ModelStage for FailingStage {
        fn model_id(&self) -> u32 {
            9
        }

        fn infer(&mut self, _frame: &FrameRecord) -> Result<Vec<DetectionRecord>> {
            Err(PipelineError::Stage {
                model_id: 9,
                message: "engine not loaded".into(),
            })
        }
    }

    #[test]
    fn test_chained_stages_see_upstream() {
        let (control, _control_rx) = unbounded();
        let mut worker = BranchWorker::new(
            0,
            vec![
                Box::new(CountStage { model_id: 1, per_frame: 2 }) as Box<dyn ModelStage>,
                Box::new(CountStage { model_id: 2, per_frame: 1 }),
            ],
            control,
        );
        let dets = worker.process_frame(&FrameRecord::new(0, 1));
        assert_eq!(dets.len(), 3);
        assert_eq!(dets[0].model_id, 1);
        assert_eq!(dets[2].model_id, 2);
        // 第二个模型看到了第一个模型的2个目标
        assert_eq!(dets[2].class_id, 2);
    }

    #[test]
    fn test_stage_error_reported() {
        let (control, control_rx) = unbounded();
        let mut worker = BranchWorker::new(1, vec![Box::new(FailingStage) as Box<dyn ModelStage>], control);
        let dets = worker.process_frame(&FrameRecord::new(2, 5));
        assert!(dets.is_empty());
        match control_rx.try_recv().unwrap() {
            ControlEvent::Error { origin, debug, .. } => {
                assert_eq!(origin, "pgie9");
                assert_eq!(debug.as_deref(), Some("Stream-2 frame 5"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct PanicStage;

    impl ModelStage for PanicStage {
        fn model_id(&self) -> u32 {
            5
        }

        fn infer(&mut self, _frame: &FrameRecord) -> Result<Vec<DetectionRecord>> {
            panic!("engine crashed");
        }
    }

    #[test]
    fn test_panicking_worker_detaches() {
        let (control, control_rx) = unbounded();
        let (batch_tx, batch_rx) = unbounded();
        let (join_tx, join_rx) = unbounded();
        let worker = BranchWorker::new(2, vec![Box::new(PanicStage) as Box<dyn ModelStage>], control);
        let handle = worker.spawn(batch_rx, join_tx).unwrap();

        batch_tx
            .send(Arc::new(FrameBatch {
                seq: 0,
                frames: vec![FrameRecord::new(0, 1)],
            }))
            .unwrap();
        assert!(handle.join().is_err());

        assert!(matches!(join_rx.recv().unwrap(), JoinMessage::Detached(2)));
        match control_rx.recv().unwrap() {
            ControlEvent::Error { origin, .. } => assert_eq!(origin, "pgie5"),
            other => panic!("unexpected {other:?}"),
        }
        // 工作线程退出后不能再投递批次
        assert!(batch_tx
            .send(Arc::new(FrameBatch {
                seq: 1,
                frames: Vec::new(),
            }))
            .is_err());
    }

    #[test]
    fn test_worker_thread_outputs() {
        let (control, _control_rx) = unbounded();
        let (batch_tx, batch_rx) = unbounded();
        let (join_tx, join_rx) = unbounded();
        let worker = BranchWorker::new(
            3,
            vec![Box::new(CountStage { model_id: 4, per_frame: 1 }) as Box<dyn ModelStage>],
            control,
        );
        let handle = worker.spawn(batch_rx, join_tx).unwrap();

        batch_tx
            .send(Arc::new(FrameBatch {
                seq: 0,
                frames: vec![FrameRecord::new(0, 1), FrameRecord::new(1, 1)],
            }))
            .unwrap();
        drop(batch_tx);
        handle.join().unwrap();

        match join_rx.recv().unwrap() {
            JoinMessage::Output(out) => {
                assert_eq!(out.branch, 3);
                assert_eq!(out.detections.len(), 2);
                assert_eq!(out.detections[1][0].model_id, 4);
            }
            _ => panic!("expected branch output"),
        }
    }
}
