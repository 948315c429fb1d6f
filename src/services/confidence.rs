//! 置信度判定 - 业务能力层
//!
//! 纯函数：(区块类型, 置信度) → 接受 / 升级

use crate::config::Config;
use crate::models::BlockType;

/// 判定结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceDecision {
    Accept,
    Escalate,
}

/// 按区块类型比较置信度阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceEvaluator {
    text_threshold: f64,
    formula_threshold: f64,
}

impl ConfidenceEvaluator {
    pub fn new(text_threshold: f64, formula_threshold: f64) -> Self {
        Self {
            text_threshold,
            formula_threshold,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.text_confidence_threshold,
            config.formula_confidence_threshold,
        )
    }

    /// 类型对应的阈值；图片区块不识别，阈值为 0
    pub fn threshold(&self, block_type: BlockType) -> f64 {
        match block_type {
            BlockType::ProblemStem | BlockType::Options => self.text_threshold,
            BlockType::Formula => self.formula_threshold,
            BlockType::Figure => 0.0,
        }
    }

    pub fn evaluate(&self, block_type: BlockType, confidence: f64) -> ConfidenceDecision {
        if confidence >= self.threshold(block_type) {
            ConfidenceDecision::Accept
        } else {
            ConfidenceDecision::Escalate
        }
    }

    pub fn accepts(&self, block_type: BlockType, confidence: f64) -> bool {
        self.evaluate(block_type, confidence) == ConfidenceDecision::Accept
    }
}

impl Default for ConfidenceEvaluator {
    fn default() -> Self {
        Self::new(0.8, 0.7)
    }
}
