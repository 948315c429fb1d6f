//! 识别统计 - 业务能力层
//!
//! 多写单读：写入方只做递增 / 追加，快照按需生成

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::{Attempt, Block, BlockStatus, FailureReason, LadderStep, TaskStage};

/// 单个引擎的统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub engine: String,
    pub requests: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// 失败原因排行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReasonStat {
    pub reason: FailureReason,
    pub count: u64,
    pub percentage: f64,
}

/// 统计快照（比率均为百分比）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub success_rate: f64,
    pub fallback_rate: f64,
    pub emergency_rate: f64,
    pub total_attempts: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub engines: Vec<EngineStats>,
    pub top_failure_reasons: Vec<FailureReasonStat>,
}

#[derive(Debug, Default)]
struct EngineCounters {
    requests: u64,
    successes: u64,
    total_latency_ms: u64,
}

const TOP_FAILURE_REASONS: usize = 3;

/// 统计聚合器
#[derive(Debug, Default)]
pub struct StatsAggregator {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    fallback_accepted: AtomicU64,
    emergency_invocations: AtomicU64,
    total_attempts: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    engines: Mutex<HashMap<String, EngineCounters>>,
    failures: Mutex<HashMap<FailureReason, u64>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次引擎调用
    pub fn record_attempt(&self, attempt: &Attempt) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt.step == LadderStep::OriginalEmergency {
            self.emergency_invocations.fetch_add(1, Ordering::Relaxed);
        }

        let mut engines = lock(&self.engines);
        let counters = engines.entry(attempt.engine.clone()).or_default();
        counters.requests += 1;
        counters.total_latency_ms += attempt.duration_ms;
        if attempt.is_accepted() {
            counters.successes += 1;
        }
    }

    /// 记录一个区块的终态（每轮识别一次）
    pub fn record_block(&self, block: &Block) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match block.status {
            BlockStatus::Accepted => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
                let via_fallback = block
                    .last_attempt()
                    .is_some_and(|a| a.step == LadderStep::CompressedFallback);
                if via_fallback {
                    self.fallback_accepted.fetch_add(1, Ordering::Relaxed);
                }
            }
            BlockStatus::Failed => {
                if let Some(reason) = block.failure_reason {
                    *lock(&self.failures).entry(reason).or_insert(0) += 1;
                }
            }
            BlockStatus::Pending | BlockStatus::Processing => {}
        }
    }

    /// 记录任务终态
    pub fn record_task(&self, stage: TaskStage) {
        match stage {
            TaskStage::Completed => {
                self.tasks_completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskStage::Failed => {
                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);

        let mut engines: Vec<EngineStats> = lock(&self.engines)
            .iter()
            .map(|(name, c)| EngineStats {
                engine: name.clone(),
                requests: c.requests,
                successes: c.successes,
                success_rate: percentage(c.successes, c.requests),
                avg_latency_ms: if c.requests == 0 {
                    0.0
                } else {
                    c.total_latency_ms as f64 / c.requests as f64
                },
            })
            .collect();
        engines.sort_by(|a, b| a.engine.cmp(&b.engine));

        let failures = lock(&self.failures);
        let failure_total: u64 = failures.values().sum();
        let mut reasons: Vec<FailureReasonStat> = failures
            .iter()
            .map(|(reason, count)| FailureReasonStat {
                reason: *reason,
                count: *count,
                percentage: percentage(*count, failure_total),
            })
            .collect();
        reasons.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.reason.as_str().cmp(b.reason.as_str()))
        });
        reasons.truncate(TOP_FAILURE_REASONS);

        StatsSnapshot {
            total_requests: total,
            successful_requests: successful,
            success_rate: percentage(successful, total),
            fallback_rate: percentage(self.fallback_accepted.load(Ordering::Relaxed), total),
            emergency_rate: percentage(self.emergency_invocations.load(Ordering::Relaxed), total),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            engines,
            top_failure_reasons: reasons,
        }
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptOutcome, BlockDescriptor, BlockType, ImageVariant};
    use chrono::Utc;

    fn attempt(step: LadderStep, engine: &str, outcome: AttemptOutcome, ms: u64) -> Attempt {
        Attempt {
            sequence: 1,
            step,
            engine: engine.to_string(),
            image_variant: ImageVariant::Compressed,
            raw_result: "x".to_string(),
            confidence: 0.5,
            syntax_valid: None,
            outcome,
            rejection: None,
            error: None,
            timestamp: Utc::now(),
            duration_ms: ms,
        }
    }

    fn block(status: BlockStatus, reason: Option<FailureReason>, attempts: Vec<Attempt>) -> Block {
        let descriptor = BlockDescriptor::new(BlockType::Formula, "c.png", "o.png");
        let mut block = Block::new(uuid::Uuid::new_v4(), "b1".to_string(), &descriptor, 0.7);
        block.status = status;
        block.failure_reason = reason;
        block.attempts = attempts;
        block
    }

    #[test]
    fn empty_snapshot_has_zero_rates() {
        let stats = StatsAggregator::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.success_rate, 0.0);
        assert!(snapshot.engines.is_empty());
    }

    #[test]
    fn aggregates_engines_and_rates() {
        let stats = StatsAggregator::new();
        let a1 = attempt(LadderStep::CompressedPrimary, "pix2tex", AttemptOutcome::Escalated, 10);
        let a2 = attempt(LadderStep::CompressedFallback, "trocr", AttemptOutcome::Accepted, 30);
        stats.record_attempt(&a1);
        stats.record_attempt(&a2);
        stats.record_block(&block(BlockStatus::Accepted, None, vec![a1, a2]));

        let e = attempt(LadderStep::OriginalEmergency, "mathpix", AttemptOutcome::Exhausted, 50);
        stats.record_attempt(&e);
        stats.record_block(&block(
            BlockStatus::Failed,
            Some(FailureReason::LowConfidence),
            vec![e],
        ));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.success_rate, 50.0);
        assert_eq!(snapshot.fallback_rate, 50.0);
        assert_eq!(snapshot.emergency_rate, 50.0);
        assert_eq!(snapshot.total_attempts, 3);

        let names: Vec<_> = snapshot.engines.iter().map(|e| e.engine.as_str()).collect();
        assert_eq!(names, vec!["mathpix", "pix2tex", "trocr"]);
        let trocr = &snapshot.engines[2];
        assert_eq!(trocr.success_rate, 100.0);
        assert_eq!(trocr.avg_latency_ms, 30.0);
    }

    #[test]
    fn ranks_top_three_failure_reasons() {
        let stats = StatsAggregator::new();
        let reasons = [
            FailureReason::LowConfidence,
            FailureReason::LowConfidence,
            FailureReason::LowConfidence,
            FailureReason::QuotaExhausted,
            FailureReason::QuotaExhausted,
            FailureReason::SyntaxInvalid,
            FailureReason::Cancelled,
        ];
        for reason in reasons {
            stats.record_block(&block(BlockStatus::Failed, Some(reason), Vec::new()));
        }

        let top = stats.snapshot().top_failure_reasons;
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].reason, FailureReason::LowConfidence);
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].reason, FailureReason::QuotaExhausted);
        assert_eq!(top[2].reason, FailureReason::Cancelled);
    }
}
