use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::block::{FailureReason, ImageVariant};

/// 升级阶梯的四个固定步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LadderStep {
    /// 1. 压缩图 + 主引擎
    CompressedPrimary,
    /// 2. 压缩图 + 第一备援引擎
    CompressedFallback,
    /// 3. 原图 + 主引擎
    OriginalPrimary,
    /// 4. 原图 + 兜底引擎（仅公式，受配额保护）
    OriginalEmergency,
}

impl LadderStep {
    pub const ALL: [LadderStep; 4] = [
        LadderStep::CompressedPrimary,
        LadderStep::CompressedFallback,
        LadderStep::OriginalPrimary,
        LadderStep::OriginalEmergency,
    ];

    pub fn number(self) -> u8 {
        match self {
            LadderStep::CompressedPrimary => 1,
            LadderStep::CompressedFallback => 2,
            LadderStep::OriginalPrimary => 3,
            LadderStep::OriginalEmergency => 4,
        }
    }

    pub fn next(self) -> Option<LadderStep> {
        match self {
            LadderStep::CompressedPrimary => Some(LadderStep::CompressedFallback),
            LadderStep::CompressedFallback => Some(LadderStep::OriginalPrimary),
            LadderStep::OriginalPrimary => Some(LadderStep::OriginalEmergency),
            LadderStep::OriginalEmergency => None,
        }
    }

    pub fn image_variant(self) -> ImageVariant {
        match self {
            LadderStep::CompressedPrimary | LadderStep::CompressedFallback => ImageVariant::Compressed,
            LadderStep::OriginalPrimary | LadderStep::OriginalEmergency => ImageVariant::Original,
        }
    }

    /// 手动重试的起点：高画质从第 3 步开始，否则从第 1 步
    pub fn retry_start(use_high_quality: bool) -> LadderStep {
        if use_high_quality {
            LadderStep::OriginalPrimary
        } else {
            LadderStep::CompressedPrimary
        }
    }
}

impl fmt::Display for LadderStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step{}", self.number())
    }
}

/// 单次尝试的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Escalated,
    Exhausted,
}

/// 一次引擎调用记录，写入后不可修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 区块内序号（从 1 开始）
    pub sequence: usize,
    pub step: LadderStep,
    pub engine: String,
    pub image_variant: ImageVariant,
    pub raw_result: String,
    pub confidence: f64,
    /// 仅公式区块有值
    pub syntax_valid: Option<bool>,
    pub outcome: AttemptOutcome,
    /// 未被接受时的原因
    pub rejection: Option<FailureReason>,
    /// 引擎报错或超时的说明
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Attempt {
    pub fn is_accepted(&self) -> bool {
        self.outcome == AttemptOutcome::Accepted
    }
}
