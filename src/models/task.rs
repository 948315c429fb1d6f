use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::block::{BlockId, BlockStatus, BlockType, ConfidenceLevel, FailureReason};

/// 任务标识
pub type TaskId = uuid::Uuid;

/// 任务阶段，按声明顺序单调前进；`Failed` 可从任意非终态进入且不可离开
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Uploaded,
    Preprocessing,
    Segmented,
    Classified,
    OcrProcessing,
    Standardizing,
    Completed,
    Failed,
}

impl TaskStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStage::Completed | TaskStage::Failed)
    }

    /// 正常流程中的下一个阶段
    pub fn successor(self) -> Option<TaskStage> {
        match self {
            TaskStage::Uploaded => Some(TaskStage::Preprocessing),
            TaskStage::Preprocessing => Some(TaskStage::Segmented),
            TaskStage::Segmented => Some(TaskStage::Classified),
            TaskStage::Classified => Some(TaskStage::OcrProcessing),
            TaskStage::OcrProcessing => Some(TaskStage::Standardizing),
            TaskStage::Standardizing => Some(TaskStage::Completed),
            TaskStage::Completed | TaskStage::Failed => None,
        }
    }

    pub fn can_transition_to(self, to: TaskStage) -> bool {
        if to == TaskStage::Failed {
            return !self.is_terminal();
        }
        self.successor() == Some(to)
    }

    /// 识别阶段已结束（进入标准化之后或失败）
    pub fn recognition_finished(self) -> bool {
        self >= TaskStage::Standardizing
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStage::Uploaded => "uploaded",
            TaskStage::Preprocessing => "preprocessing",
            TaskStage::Segmented => "segmented",
            TaskStage::Classified => "classified",
            TaskStage::OcrProcessing => "ocr_processing",
            TaskStage::Standardizing => "standardizing",
            TaskStage::Completed => "completed",
            TaskStage::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailure {
    TaskTimeout,
    Aborted,
    NoAcceptedBlocks,
    EngineUnavailable,
    StandardizationFailed,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskFailure::TaskTimeout => "task_timeout",
            TaskFailure::Aborted => "aborted",
            TaskFailure::NoAcceptedBlocks => "no_accepted_blocks",
            TaskFailure::EngineUnavailable => "engine_unavailable",
            TaskFailure::StandardizationFailed => "standardization_failed",
        };
        f.write_str(s)
    }
}

/// 一次用户提交
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub stage: TaskStage,
    pub created_at: DateTime<Utc>,
    /// 超时看门狗的触发时刻
    pub deadline: Instant,
    pub error: Option<TaskFailure>,
}

impl Task {
    pub fn new(name: impl Into<String>, deadline: Instant) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            stage: TaskStage::Uploaded,
            created_at: Utc::now(),
            deadline,
            error: None,
        }
    }
}

/// 单个区块的进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockProgress {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub status: BlockStatus,
    pub confidence: Option<f64>,
    pub confidence_level: Option<ConfidenceLevel>,
    pub engine_used: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub attempts: usize,
}

/// 任务状态查询结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub name: String,
    pub stage: TaskStage,
    pub progress_percent: f64,
    pub per_block: Vec<BlockProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<TaskFailure>,
    pub failed_blocks: Vec<BlockId>,
}

impl TaskStatus {
    pub fn accepted_count(&self) -> usize {
        self.per_block
            .iter()
            .filter(|b| b.status == BlockStatus::Accepted)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.per_block
            .iter()
            .filter(|b| b.status == BlockStatus::Failed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_only_move_forward() {
        assert!(TaskStage::Uploaded.can_transition_to(TaskStage::Preprocessing));
        assert!(!TaskStage::Uploaded.can_transition_to(TaskStage::Segmented));
        assert!(!TaskStage::Standardizing.can_transition_to(TaskStage::OcrProcessing));
        assert!(TaskStage::Classified.can_transition_to(TaskStage::Failed));
    }

    #[test]
    fn terminal_stages_are_absorbing() {
        assert!(!TaskStage::Failed.can_transition_to(TaskStage::Failed));
        assert!(!TaskStage::Failed.can_transition_to(TaskStage::Completed));
        assert!(!TaskStage::Completed.can_transition_to(TaskStage::Failed));
    }
}
