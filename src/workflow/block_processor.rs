//! 区块处理器 - 流程层
//!
//! 每个区块由唯一一个处理器持有；同一时刻只允许一轮识别（首轮或手动重试）

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskError;
use crate::infrastructure::EventBus;
use crate::models::{
    Attempt, Block, BlockId, BlockProgress, BlockStatus, BlockType, ConfidenceLevel, FailureReason,
    LadderStep, ProgressEvent, RecognizedContent,
};
use crate::services::StatsAggregator;
use crate::workflow::retry_ladder::{LadderJob, LadderOutcome, RetryLadder};

/// 一轮识别的结果
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRun {
    pub block_id: BlockId,
    /// 第几轮（首轮为 1）
    pub run: u32,
    pub status: BlockStatus,
    pub confidence: Option<f64>,
    pub reason: Option<FailureReason>,
}

impl BlockRun {
    pub fn success(&self) -> bool {
        self.status == BlockStatus::Accepted
    }
}

/// 区块处理器
pub struct BlockProcessor {
    block: Mutex<Block>,
    run_lock: tokio::sync::Mutex<()>,
    runs: AtomicU32,
    ladder: Arc<RetryLadder>,
    events: EventBus,
    stats: Arc<StatsAggregator>,
}

impl BlockProcessor {
    pub fn new(
        block: Block,
        ladder: Arc<RetryLadder>,
        events: EventBus,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            block: Mutex::new(block),
            run_lock: tokio::sync::Mutex::new(()),
            runs: AtomicU32::new(0),
            ladder,
            events,
            stats,
        }
    }

    pub fn id(&self) -> BlockId {
        self.lock().id.clone()
    }

    pub fn block_type(&self) -> BlockType {
        self.lock().block_type
    }

    pub fn status(&self) -> BlockStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> Block {
        self.lock().clone()
    }

    pub fn progress(&self) -> BlockProgress {
        let block = self.lock();
        let confidence = block.confidence();
        BlockProgress {
            id: block.id.clone(),
            block_type: block.block_type,
            status: block.status,
            confidence,
            confidence_level: confidence.map(ConfidenceLevel::from_score),
            engine_used: block.engine_used().map(str::to_string),
            failure_reason: block.failure_reason,
            attempts: block.attempts.len(),
        }
    }

    /// 首轮识别，从第 1 步开始
    pub async fn run(&self, cancel: &CancellationToken) -> Result<BlockRun, TaskError> {
        self.retry_from(LadderStep::CompressedPrimary, cancel).await
    }

    /// 从指定步骤重新进入阶梯，新尝试追加在旧记录之后
    pub async fn retry_from(
        &self,
        step: LadderStep,
        cancel: &CancellationToken,
    ) -> Result<BlockRun, TaskError> {
        let _guard = self.run_lock.try_lock().map_err(|_| TaskError::BlockBusy {
            block_id: self.id(),
        })?;
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;

        let job = {
            let mut block = self.lock();
            if block.block_type == BlockType::Figure {
                // 图片区块不识别，原图直接作为结果
                block.status = BlockStatus::Accepted;
                block.failure_reason = None;
                block.result = Some(RecognizedContent {
                    content: block.images.original.clone(),
                    confidence: 1.0,
                    engine_used: None,
                });
                debug!("图片区块 {} 直通", block.id);
                return Ok(Self::summarize(&block, run));
            }

            block.status = BlockStatus::Processing;
            block.result = None;
            block.failure_reason = None;
            LadderJob {
                task_id: block.task_id,
                block_id: block.id.clone(),
                block_type: block.block_type,
                images: block.images.clone(),
                prior_attempts: block.attempts.len(),
            }
        };

        let mut record = |attempt: Attempt| {
            self.stats.record_attempt(&attempt);
            self.events.publish(ProgressEvent::BlockAttempt {
                task_id: job.task_id,
                block_id: job.block_id.clone(),
                run,
                sequence: attempt.sequence,
                step: attempt.step,
                engine: attempt.engine.clone(),
                outcome: attempt.outcome,
                confidence: attempt.confidence,
            });
            self.lock().attempts.push(attempt);
        };

        let outcome = self.ladder.execute(&job, step, cancel, &mut record).await;

        let mut block = self.lock();
        match outcome {
            LadderOutcome::Accepted(result) => {
                block.status = BlockStatus::Accepted;
                block.result = Some(result);
            }
            LadderOutcome::Failed(reason) => {
                block.status = BlockStatus::Failed;
                block.failure_reason = Some(reason);
            }
        }
        self.stats.record_block(&block);

        Ok(Self::summarize(&block, run))
    }

    fn summarize(block: &Block, run: u32) -> BlockRun {
        BlockRun {
            block_id: block.id.clone(),
            run,
            status: block.status,
            confidence: block.confidence(),
            reason: block.failure_reason,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Block> {
        self.block.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{EngineOutput, EngineRole, EngineRouter, RecognitionEngine, RecognitionRequest};
    use crate::error::EngineError;
    use crate::infrastructure::QuotaManager;
    use crate::models::{AttemptOutcome, BlockDescriptor};
    use crate::services::{ConfidenceEvaluator, SyntaxValidator};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Constant(f64);

    #[async_trait]
    impl RecognitionEngine for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        async fn recognize(&self, _: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError> {
            Ok(EngineOutput::new("已知函数", self.0))
        }
    }

    fn processor(block_type: BlockType, confidence: f64) -> (BlockProcessor, EventBus) {
        let router = EngineRouter::new(Duration::from_secs(5))
            .with_engine(EngineRole::PrimaryText, Arc::new(Constant(confidence)))
            .with_engine(EngineRole::FallbackText, Arc::new(Constant(confidence)));
        let ladder = RetryLadder::new(
            Arc::new(router),
            ConfidenceEvaluator::default(),
            Arc::new(SyntaxValidator::default()),
            Arc::new(QuotaManager::new(10)),
            5,
        );
        let descriptor = BlockDescriptor::new(block_type, "c.png", "o.png");
        let block = Block::new(uuid::Uuid::new_v4(), "b1".to_string(), &descriptor, 0.8);
        let events = EventBus::new(64);
        let processor = BlockProcessor::new(
            block,
            Arc::new(ladder),
            events.clone(),
            Arc::new(StatsAggregator::new()),
        );
        (processor, events)
    }

    #[tokio::test]
    async fn figure_blocks_pass_through() {
        let (processor, _) = processor(BlockType::Figure, 0.0);
        let run = processor.run(&CancellationToken::new()).await.unwrap();

        assert!(run.success());
        let block = processor.snapshot();
        assert!(block.attempts.is_empty());
        assert_eq!(block.result.unwrap().content, "o.png");
    }

    #[tokio::test]
    async fn retry_appends_attempts_and_bumps_run() {
        let (processor, events) = processor(BlockType::ProblemStem, 0.5);
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();

        let first = processor.run(&cancel).await.unwrap();
        assert_eq!(first.run, 1);
        assert_eq!(first.reason, Some(FailureReason::LowConfidence));
        assert_eq!(processor.snapshot().attempts.len(), 3);

        let second = processor.retry_from(LadderStep::OriginalPrimary, &cancel).await.unwrap();
        assert_eq!(second.run, 2);
        let block = processor.snapshot();
        assert_eq!(block.attempts.len(), 4);
        assert_eq!(block.attempts[3].sequence, 4);
        assert_eq!(block.attempts[3].step, LadderStep::OriginalPrimary);
        assert_eq!(block.attempts[3].outcome, AttemptOutcome::Exhausted);

        let attempt_events = rx
            .drain()
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::BlockAttempt { .. }))
            .count();
        assert_eq!(attempt_events, 4);
    }

    #[tokio::test]
    async fn progress_reports_confidence_level() {
        let (processor, _) = processor(BlockType::Options, 0.93);
        processor.run(&CancellationToken::new()).await.unwrap();

        let progress = processor.progress();
        assert_eq!(progress.status, BlockStatus::Accepted);
        assert_eq!(progress.confidence_level, Some(ConfidenceLevel::High));
        assert_eq!(progress.engine_used.as_deref(), Some("constant"));
        assert_eq!(progress.attempts, 1);
    }
}
