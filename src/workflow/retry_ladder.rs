//! 升级阶梯 - 流程层
//!
//! 固定四步，遇到第一个被接受的结果即停止：
//! 1. 压缩图 + 主引擎
//! 2. 压缩图 + 备援引擎
//! 3. 原图 + 主引擎
//! 4. 原图 + 兜底引擎（仅公式，受配额保护）
//!
//! 每一步严格串行；只有引擎调用会挂起，取消标记只在两步之间检查。

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engines::{EngineRouter, Invocation};
use crate::infrastructure::QuotaManager;
use crate::models::{
    Attempt, AttemptOutcome, BlockId, BlockImages, BlockType, ConfidenceLevel, FailureReason,
    LadderStep, RecognizedContent, TaskId,
};
use crate::services::{ConfidenceDecision, ConfidenceEvaluator, SyntaxValidator};
use crate::utils::{short_id, truncate_text};

/// 阶梯执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum LadderOutcome {
    Accepted(RecognizedContent),
    Failed(FailureReason),
}

/// 单个区块在本轮执行所需的只读信息
#[derive(Debug, Clone)]
pub struct LadderJob {
    pub task_id: TaskId,
    pub block_id: BlockId,
    pub block_type: BlockType,
    pub images: BlockImages,
    /// 之前各轮已产生的尝试次数
    pub prior_attempts: usize,
}

/// 下一步的安排
enum Plan {
    Run(LadderStep),
    /// `None` 表示没有后续步骤，沿用最后一次尝试的原因
    Stop(Option<FailureReason>),
}

/// 单次尝试的判定
struct Verdict {
    accepted: bool,
    syntax_valid: Option<bool>,
    rejection: Option<FailureReason>,
}

/// 升级阶梯
pub struct RetryLadder {
    router: Arc<EngineRouter>,
    evaluator: ConfidenceEvaluator,
    validator: Arc<SyntaxValidator>,
    quota: Arc<QuotaManager>,
    max_attempts: usize,
}

impl RetryLadder {
    pub fn new(
        router: Arc<EngineRouter>,
        evaluator: ConfidenceEvaluator,
        validator: Arc<SyntaxValidator>,
        quota: Arc<QuotaManager>,
        max_attempts: usize,
    ) -> Self {
        Self {
            router,
            evaluator,
            validator,
            quota,
            max_attempts,
        }
    }

    pub fn from_config(
        config: &Config,
        router: Arc<EngineRouter>,
        validator: Arc<SyntaxValidator>,
        quota: Arc<QuotaManager>,
    ) -> Self {
        Self::new(
            router,
            ConfidenceEvaluator::from_config(config),
            validator,
            quota,
            config.max_attempts,
        )
    }

    pub fn evaluator(&self) -> &ConfidenceEvaluator {
        &self.evaluator
    }

    pub fn router(&self) -> &EngineRouter {
        &self.router
    }

    /// 从 `start` 开始执行阶梯
    ///
    /// 每写完一条尝试记录就交给 `on_attempt`，由调用方追加到区块并发布事件
    pub async fn execute(
        &self,
        job: &LadderJob,
        start: LadderStep,
        cancel: &CancellationToken,
        on_attempt: &mut (dyn FnMut(Attempt) + Send),
    ) -> LadderOutcome {
        let prefix = format!("[任务 {}] 区块 {}", short_id(&job.task_id), job.block_id);
        let Some(mode) = job.block_type.mode() else {
            return LadderOutcome::Failed(FailureReason::EngineUnavailable);
        };

        let mut made = job.prior_attempts;
        let mut plan = self.plan(job.block_type, Some(start), made, cancel, &prefix);

        loop {
            let step = match plan {
                Plan::Run(step) => step,
                Plan::Stop(reason) => {
                    let reason = reason.unwrap_or(FailureReason::EngineUnavailable);
                    warn!("{} ❌ 无法开始识别: {}", prefix, reason);
                    return LadderOutcome::Failed(reason);
                }
            };

            let Some((role, variant)) = self.router.route(job.block_type, step) else {
                return LadderOutcome::Failed(FailureReason::EngineUnavailable);
            };

            debug!("{} ▶ {} ({} / {})", prefix, step, role, variant);
            let timestamp = Utc::now();
            let invocation = self
                .router
                .invoke(role, job.images.get(variant), mode)
                .await;

            made += 1;
            let verdict = if cancel.is_cancelled() {
                // 调用已发生，照常记录，但结果不被采纳
                info!("{} 🛑 已取消，{} 的结果不被采纳", prefix, invocation.engine);
                Verdict {
                    accepted: false,
                    syntax_valid: None,
                    rejection: Some(FailureReason::Cancelled),
                }
            } else {
                self.judge(job.block_type, &invocation)
            };

            let mut attempt = Attempt {
                sequence: made,
                step,
                engine: invocation.engine.clone(),
                image_variant: variant,
                raw_result: invocation.output.content.clone(),
                confidence: invocation.output.confidence,
                syntax_valid: verdict.syntax_valid,
                outcome: AttemptOutcome::Accepted,
                rejection: verdict.rejection,
                error: invocation.error.clone(),
                timestamp,
                duration_ms: invocation.latency.as_millis() as u64,
            };

            if verdict.accepted {
                info!(
                    "{} ✅ {} 接受 (置信度 {:.2}, {:?}): {}",
                    prefix,
                    attempt.engine,
                    attempt.confidence,
                    ConfidenceLevel::from_score(attempt.confidence),
                    truncate_text(&attempt.raw_result, 40)
                );
                let result = RecognizedContent {
                    content: attempt.raw_result.clone(),
                    confidence: attempt.confidence,
                    engine_used: Some(attempt.engine.clone()),
                };
                on_attempt(attempt);
                return LadderOutcome::Accepted(result);
            }

            let rejection = verdict.rejection.unwrap_or(FailureReason::LowConfidence);
            plan = self.plan(job.block_type, step.next(), made, cancel, &prefix);
            attempt.outcome = match plan {
                Plan::Run(_) => AttemptOutcome::Escalated,
                Plan::Stop(_) => AttemptOutcome::Exhausted,
            };
            debug!(
                "{} ↪ {} 未接受 ({}, 置信度 {:.2}) -> {:?}",
                prefix, attempt.engine, rejection, attempt.confidence, attempt.outcome
            );
            on_attempt(attempt);

            if let Plan::Stop(reason) = plan {
                let reason = reason.unwrap_or(rejection);
                warn!("{} ❌ 识别失败: {} ({})", prefix, reason, reason.remedy_hint());
                return LadderOutcome::Failed(reason);
            }
        }
    }

    /// 决定下一步：跳过不适用的步骤，检查取消、次数上限，并为兜底步骤占用配额
    fn plan(
        &self,
        block_type: BlockType,
        candidate: Option<LadderStep>,
        made: usize,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> Plan {
        let mut next = candidate;
        while let Some(step) = next {
            if self.router.route(block_type, step).is_some() {
                break;
            }
            next = step.next();
        }

        let Some(step) = next else {
            return Plan::Stop(None);
        };
        if cancel.is_cancelled() {
            return Plan::Stop(Some(FailureReason::Cancelled));
        }
        if made >= self.max_attempts {
            return Plan::Stop(Some(FailureReason::AttemptLimit));
        }

        if step == LadderStep::OriginalEmergency {
            if !self.quota.try_consume() {
                warn!("{} 🛡️ 兜底配额已用完，跳过兜底引擎", prefix);
                return Plan::Stop(Some(FailureReason::QuotaExhausted));
            }
            info!("{} 🛡️ 已占用一个兜底配额", prefix);
        }

        Plan::Run(step)
    }

    fn judge(&self, block_type: BlockType, invocation: &Invocation) -> Verdict {
        let output = &invocation.output;

        if output.is_empty() {
            let rejection = if invocation.failed() && !invocation.timed_out {
                FailureReason::EngineUnavailable
            } else {
                FailureReason::EmptyResult
            };
            return Verdict {
                accepted: false,
                syntax_valid: None,
                rejection: Some(rejection),
            };
        }

        let syntax_valid = if block_type == BlockType::Formula {
            Some(self.validator.is_valid(&output.content))
        } else {
            None
        };
        if syntax_valid == Some(false) {
            return Verdict {
                accepted: false,
                syntax_valid,
                rejection: Some(FailureReason::SyntaxInvalid),
            };
        }

        match self.evaluator.evaluate(block_type, output.confidence) {
            ConfidenceDecision::Accept => Verdict {
                accepted: true,
                syntax_valid,
                rejection: None,
            },
            ConfidenceDecision::Escalate => Verdict {
                accepted: false,
                syntax_valid,
                rejection: Some(FailureReason::LowConfidence),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{EngineOutput, EngineRole, RecognitionEngine, RecognitionRequest};
    use crate::error::EngineError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// 按顺序返回预设结果的引擎
    struct Scripted {
        name: &'static str,
        replies: Mutex<VecDeque<(&'static str, f64)>>,
    }

    impl Scripted {
        fn new(name: &'static str, replies: &[(&'static str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                name,
                replies: Mutex::new(replies.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl RecognitionEngine for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn recognize(&self, _: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError> {
            let (content, confidence) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(("", 0.0));
            Ok(EngineOutput::new(content, confidence))
        }
    }

    fn job(block_type: BlockType, prior_attempts: usize) -> LadderJob {
        LadderJob {
            task_id: uuid::Uuid::new_v4(),
            block_id: "b1".to_string(),
            block_type,
            images: BlockImages {
                compressed: "c.png".to_string(),
                original: "o.png".to_string(),
            },
            prior_attempts,
        }
    }

    fn ladder(router: EngineRouter, quota: Arc<QuotaManager>, max_attempts: usize) -> RetryLadder {
        RetryLadder::new(
            Arc::new(router),
            ConfidenceEvaluator::default(),
            Arc::new(SyntaxValidator::default()),
            quota,
            max_attempts,
        )
    }

    async fn run(ladder: &RetryLadder, job: &LadderJob, start: LadderStep) -> (LadderOutcome, Vec<Attempt>) {
        let mut attempts = Vec::new();
        let cancel = CancellationToken::new();
        let outcome = ladder
            .execute(job, start, &cancel, &mut |a| attempts.push(a))
            .await;
        (outcome, attempts)
    }

    fn formula_router(primary: &[(&'static str, f64)], fallback: &[(&'static str, f64)], emergency: &[(&'static str, f64)]) -> EngineRouter {
        EngineRouter::new(Duration::from_secs(5))
            .with_engine(EngineRole::PrimaryFormula, Scripted::new("pix2tex", primary))
            .with_engine(EngineRole::FallbackFormula, Scripted::new("trocr", fallback))
            .with_engine(EngineRole::EmergencyFormula, Scripted::new("mathpix", emergency))
    }

    #[tokio::test]
    async fn syntax_failure_escalates_one_step() {
        let router = formula_router(&[(r"\frac{a}{b", 0.95)], &[(r"\frac{a}{b}", 0.9)], &[]);
        let quota = Arc::new(QuotaManager::new(10));
        let ladder = ladder(router, quota.clone(), 5);

        let (outcome, attempts) = run(&ladder, &job(BlockType::Formula, 0), LadderStep::CompressedPrimary).await;

        assert!(matches!(outcome, LadderOutcome::Accepted(_)));
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].syntax_valid, Some(false));
        assert_eq!(attempts[0].rejection, Some(FailureReason::SyntaxInvalid));
        assert_eq!(attempts[1].step, LadderStep::CompressedFallback);
        assert_eq!(quota.status().usage, 0);
    }

    #[tokio::test]
    async fn text_blocks_exhaust_after_step_three() {
        let router = EngineRouter::new(Duration::from_secs(5))
            .with_engine(EngineRole::PrimaryText, Scripted::new("paddle", &[("甲", 0.5), ("乙", 0.6)]))
            .with_engine(EngineRole::FallbackText, Scripted::new("tesseract", &[("丙", 0.4)]));
        let quota = Arc::new(QuotaManager::new(10));
        let ladder = ladder(router, quota.clone(), 5);

        let (outcome, attempts) = run(&ladder, &job(BlockType::ProblemStem, 0), LadderStep::CompressedPrimary).await;

        assert_eq!(outcome, LadderOutcome::Failed(FailureReason::LowConfidence));
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].outcome, AttemptOutcome::Exhausted);
        assert_eq!(quota.status().usage, 0);
    }

    #[tokio::test]
    async fn empty_result_reason_is_reported() {
        let router = EngineRouter::new(Duration::from_secs(5))
            .with_engine(EngineRole::PrimaryText, Scripted::new("paddle", &[]));
        let ladder = ladder(router, Arc::new(QuotaManager::new(1)), 5);

        let (outcome, attempts) = run(&ladder, &job(BlockType::Options, 0), LadderStep::CompressedPrimary).await;

        assert_eq!(outcome, LadderOutcome::Failed(FailureReason::EmptyResult));
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.syntax_valid.is_none()));
    }

    #[tokio::test]
    async fn attempt_cap_counts_earlier_runs() {
        let router = formula_router(&[("x", 0.1), ("x", 0.1)], &[("x", 0.1)], &[("x", 0.1)]);
        let quota = Arc::new(QuotaManager::new(10));
        let ladder = ladder(router, quota.clone(), 5);

        let (outcome, attempts) = run(&ladder, &job(BlockType::Formula, 3), LadderStep::CompressedPrimary).await;

        assert_eq!(outcome, LadderOutcome::Failed(FailureReason::AttemptLimit));
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].sequence, 5);
        assert_eq!(attempts[1].outcome, AttemptOutcome::Exhausted);
        assert_eq!(quota.status().usage, 0);
    }

    #[tokio::test]
    async fn no_engines_means_unavailable() {
        let ladder = ladder(EngineRouter::new(Duration::from_secs(5)), Arc::new(QuotaManager::new(1)), 5);
        let (outcome, attempts) = run(&ladder, &job(BlockType::Formula, 0), LadderStep::CompressedPrimary).await;
        assert_eq!(outcome, LadderOutcome::Failed(FailureReason::EngineUnavailable));
        assert!(attempts.is_empty());
    }

    /// 返回前先触发取消的引擎
    struct CancelsDuringCall(CancellationToken);

    #[async_trait]
    impl RecognitionEngine for CancelsDuringCall {
        fn name(&self) -> &str {
            "mathpix"
        }

        async fn recognize(&self, _: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError> {
            self.0.cancel();
            Ok(EngineOutput::new(r"\frac{a}{b}", 0.99))
        }
    }

    #[tokio::test]
    async fn call_finishing_after_cancel_is_recorded_but_not_accepted() {
        let cancel = CancellationToken::new();
        let router = EngineRouter::new(Duration::from_secs(5))
            .with_engine(EngineRole::PrimaryFormula, Scripted::new("pix2tex", &[("x", 0.3), ("x", 0.3)]))
            .with_engine(EngineRole::FallbackFormula, Scripted::new("trocr", &[("x", 0.3)]))
            .with_engine(EngineRole::EmergencyFormula, Arc::new(CancelsDuringCall(cancel.clone())));
        let quota = Arc::new(QuotaManager::new(10));
        let ladder = ladder(router, quota.clone(), 5);

        let mut attempts = Vec::new();
        let outcome = ladder
            .execute(&job(BlockType::Formula, 0), LadderStep::CompressedPrimary, &cancel, &mut |a| attempts.push(a))
            .await;

        assert_eq!(outcome, LadderOutcome::Failed(FailureReason::Cancelled));
        assert_eq!(attempts.len(), 4);
        let last = attempts.last().unwrap();
        assert_eq!(last.engine, "mathpix");
        assert_eq!(last.step, LadderStep::OriginalEmergency);
        assert_eq!(last.outcome, AttemptOutcome::Exhausted);
        assert_eq!(last.rejection, Some(FailureReason::Cancelled));
        assert_eq!(quota.status().usage, 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_attempts() {
        let router = formula_router(&[(r"\frac{a}{b}", 0.9)], &[], &[]);
        let ladder = ladder(router, Arc::new(QuotaManager::new(1)), 5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut attempts = Vec::new();
        let outcome = ladder
            .execute(&job(BlockType::Formula, 0), LadderStep::CompressedPrimary, &cancel, &mut |a| attempts.push(a))
            .await;

        assert_eq!(outcome, LadderOutcome::Failed(FailureReason::Cancelled));
        assert!(attempts.is_empty());
    }
}
