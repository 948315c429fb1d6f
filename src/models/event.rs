use serde::{Deserialize, Serialize};

use super::attempt::{AttemptOutcome, LadderStep};
use super::block::{BlockId, FailureReason};
use super::task::{TaskId, TaskStage};

/// 对外推送的进度事件
///
/// 非终态事件至少送达一次，消费方需容忍重复和乱序；
/// 终态事件（任务 completed/failed、区块 accepted/failed）每个任务、每轮区块识别只发一次。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageUpdate {
        task_id: TaskId,
        stage: TaskStage,
        progress: f64,
    },
    BlockAttempt {
        task_id: TaskId,
        block_id: BlockId,
        run: u32,
        sequence: usize,
        step: LadderStep,
        engine: String,
        outcome: AttemptOutcome,
        confidence: f64,
    },
    BlockCompleted {
        task_id: TaskId,
        block_id: BlockId,
        run: u32,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<FailureReason>,
        progress: f64,
    },
}

impl ProgressEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            ProgressEvent::StageUpdate { task_id, .. }
            | ProgressEvent::BlockAttempt { task_id, .. }
            | ProgressEvent::BlockCompleted { task_id, .. } => *task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            ProgressEvent::StageUpdate { stage, .. } => stage.is_terminal(),
            ProgressEvent::BlockCompleted { .. } => true,
            ProgressEvent::BlockAttempt { .. } => false,
        }
    }
}
