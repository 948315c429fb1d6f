//! 引擎路由
//!
//! 路由表在构造时确定：区块类型 + 阶梯步骤 -> (引擎角色, 图片版本)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use super::{EngineOutput, EngineRole, RecognitionEngine, RecognitionRequest};
use crate::models::{BlockType, ImageVariant, LadderStep, RecognitionMode};

/// 一次引擎调用的结果；出错或超时时 `output` 为空结果
#[derive(Debug, Clone)]
pub struct Invocation {
    pub engine: String,
    pub output: EngineOutput,
    pub error: Option<String>,
    /// 超过单次调用时限
    pub timed_out: bool,
    pub latency: Duration,
}

impl Invocation {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// 已配置的引擎角色
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    pub role: EngineRole,
    pub engine: String,
}

/// 引擎路由器
pub struct EngineRouter {
    engines: BTreeMap<EngineRole, Arc<dyn RecognitionEngine>>,
    timeout: Duration,
}

impl EngineRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            engines: BTreeMap::new(),
            timeout,
        }
    }

    /// 注册某个角色的引擎（同一角色重复注册以后者为准）
    pub fn with_engine(mut self, role: EngineRole, engine: Arc<dyn RecognitionEngine>) -> Self {
        self.engines.insert(role, engine);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 该区块类型在此步骤使用的引擎角色；步骤不适用或角色未配置时返回 `None`
    pub fn route(&self, block_type: BlockType, step: LadderStep) -> Option<(EngineRole, ImageVariant)> {
        let role = match (block_type.mode()?, step) {
            (RecognitionMode::Text, LadderStep::CompressedPrimary | LadderStep::OriginalPrimary) => {
                EngineRole::PrimaryText
            }
            (RecognitionMode::Text, LadderStep::CompressedFallback) => EngineRole::FallbackText,
            (RecognitionMode::Text, LadderStep::OriginalEmergency) => return None,
            (RecognitionMode::Formula, LadderStep::CompressedPrimary | LadderStep::OriginalPrimary) => {
                EngineRole::PrimaryFormula
            }
            (RecognitionMode::Formula, LadderStep::CompressedFallback) => EngineRole::FallbackFormula,
            (RecognitionMode::Formula, LadderStep::OriginalEmergency) => EngineRole::EmergencyFormula,
        };

        if role == EngineRole::EmergencyFormula && !block_type.allows_emergency() {
            return None;
        }

        self.engines
            .contains_key(&role)
            .then_some((role, step.image_variant()))
    }

    /// 该区块类型是否至少有一个可用步骤
    pub fn supports(&self, block_type: BlockType) -> bool {
        LadderStep::ALL
            .iter()
            .any(|step| self.route(block_type, *step).is_some())
    }

    pub fn engine_name(&self, role: EngineRole) -> Option<&str> {
        self.engines.get(&role).map(|e| e.name())
    }

    /// 调用某个角色的引擎，带单次调用超时
    pub async fn invoke(&self, role: EngineRole, image: &str, mode: RecognitionMode) -> Invocation {
        let Some(engine) = self.engines.get(&role) else {
            return Invocation {
                engine: role.to_string(),
                output: EngineOutput::default(),
                error: Some(format!("角色 {} 未配置引擎", role)),
                timed_out: false,
                latency: Duration::ZERO,
            };
        };

        let name = engine.name().to_string();
        let request = RecognitionRequest { image, mode };
        let started = Instant::now();
        debug!("调用引擎 {} ({}) 图片 {}", name, role, image);

        let (output, error, timed_out) =
            match tokio::time::timeout(self.timeout, engine.recognize(&request)).await {
                Ok(Ok(output)) => (output, None, false),
                Ok(Err(e)) => {
                    warn!("⚠️ 引擎 {} 调用失败: {}", name, e);
                    (EngineOutput::default(), Some(e.to_string()), false)
                }
                Err(_) => {
                    warn!("⏰ 引擎 {} 超时 ({:?})", name, self.timeout);
                    (
                        EngineOutput::default(),
                        Some(format!("调用超时 ({:?})", self.timeout)),
                        true,
                    )
                }
            };

        Invocation {
            engine: name,
            output,
            error,
            timed_out,
            latency: started.elapsed(),
        }
    }

    /// 列出已配置的引擎
    pub fn health(&self) -> Vec<EngineHealth> {
        self.engines
            .iter()
            .map(|(role, engine)| EngineHealth {
                role: *role,
                engine: engine.name().to_string(),
            })
            .collect()
    }
}
