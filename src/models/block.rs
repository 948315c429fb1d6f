use std::fmt;

use serde::{Deserialize, Serialize};

use super::attempt::Attempt;
use super::TaskId;

/// 区块标识（任务内唯一）
pub type BlockId = String;

/// 区块类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// 题干
    ProblemStem,
    /// 选项
    Options,
    /// 公式
    Formula,
    /// 图片
    Figure,
}

/// 识别方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    Text,
    Formula,
}

impl BlockType {
    /// 该类型使用的识别方式，图片区块不参与识别
    pub fn mode(self) -> Option<RecognitionMode> {
        match self {
            BlockType::ProblemStem | BlockType::Options => Some(RecognitionMode::Text),
            BlockType::Formula => Some(RecognitionMode::Formula),
            BlockType::Figure => None,
        }
    }

    /// 只有公式区块允许动用兜底引擎
    pub fn allows_emergency(self) -> bool {
        matches!(self, BlockType::Formula)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::ProblemStem => "problem_stem",
            BlockType::Options => "options",
            BlockType::Formula => "formula",
            BlockType::Figure => "figure",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 图片版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageVariant {
    /// 压缩图
    Compressed,
    /// 原图
    Original,
}

impl fmt::Display for ImageVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageVariant::Compressed => f.write_str("compressed"),
            ImageVariant::Original => f.write_str("original"),
        }
    }
}

/// 区块的两份图片引用，整个生命周期内都保留
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockImages {
    pub compressed: String,
    pub original: String,
}

impl BlockImages {
    pub fn get(&self, variant: ImageVariant) -> &str {
        match variant {
            ImageVariant::Compressed => &self.compressed,
            ImageVariant::Original => &self.original,
        }
    }
}

/// 区块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Processing,
    Accepted,
    Failed,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BlockStatus::Accepted | BlockStatus::Failed)
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Processing => "processing",
            BlockStatus::Accepted => "accepted",
            BlockStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 区块失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    LowConfidence,
    SyntaxInvalid,
    EmptyResult,
    QuotaExhausted,
    EngineUnavailable,
    Cancelled,
    AttemptLimit,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::LowConfidence => "low_confidence",
            FailureReason::SyntaxInvalid => "syntax_invalid",
            FailureReason::EmptyResult => "empty_result",
            FailureReason::QuotaExhausted => "quota_exhausted",
            FailureReason::EngineUnavailable => "engine_unavailable",
            FailureReason::Cancelled => "cancelled",
            FailureReason::AttemptLimit => "attempt_limit",
        }
    }

    /// 给用户的补救建议
    pub fn remedy_hint(self) -> &'static str {
        match self {
            FailureReason::LowConfidence | FailureReason::EmptyResult => "建议使用高画质重试",
            FailureReason::SyntaxInvalid => "建议人工校对公式",
            FailureReason::QuotaExhausted => "兜底配额已用完，请等待次日或接受降级结果",
            FailureReason::EngineUnavailable => "识别引擎不可用，请稍后重试",
            FailureReason::Cancelled => "任务已取消或超时",
            FailureReason::AttemptLimit => "已达最大尝试次数，请人工处理",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 置信度等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    /// >= 0.9
    High,
    /// 0.7 - 0.9
    Medium,
    /// < 0.7
    Low,
}

impl ConfidenceLevel {
    pub fn from_score(confidence: f64) -> Self {
        if confidence >= 0.9 {
            ConfidenceLevel::High
        } else if confidence >= 0.7 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// 区块最终识别结果（文字或 LaTeX）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedContent {
    pub content: String,
    pub confidence: f64,
    /// 图片区块直通时为空
    pub engine_used: Option<String>,
}

/// 分割结果中的区块描述（外部输入）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BlockId>,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub compressed: String,
    pub original: String,
}

impl BlockDescriptor {
    pub fn new(block_type: BlockType, compressed: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            id: None,
            block_type,
            compressed: compressed.into(),
            original: original.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<BlockId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// 任务中的一个内容区块
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub task_id: TaskId,
    pub block_type: BlockType,
    /// 由类型决定的置信度阈值
    pub threshold: f64,
    pub images: BlockImages,
    pub status: BlockStatus,
    pub result: Option<RecognizedContent>,
    pub failure_reason: Option<FailureReason>,
    /// 只追加，构成审计轨迹
    pub attempts: Vec<Attempt>,
}

impl Block {
    pub fn new(task_id: TaskId, id: BlockId, descriptor: &BlockDescriptor, threshold: f64) -> Self {
        Self {
            id,
            task_id,
            block_type: descriptor.block_type,
            threshold,
            images: BlockImages {
                compressed: descriptor.compressed.clone(),
                original: descriptor.original.clone(),
            },
            status: BlockStatus::Pending,
            result: None,
            failure_reason: None,
            attempts: Vec::new(),
        }
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn confidence(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.confidence)
    }

    pub fn engine_used(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.engine_used.as_deref())
    }
}
