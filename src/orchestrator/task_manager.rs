//! 任务管理器 - 编排层
//!
//! ## 职责
//!
//! - 持有每个任务的阶段状态机，阶段只前进，`failed` 为吸收态
//! - 分割结果到达后为每个区块创建 `BlockProcessor` 并发识别
//! - 汇总区块终态，推进到 `standardizing` 或 `failed`
//! - 任务级超时看门狗、取消、手动重试
//! - 用 Semaphore 限制同时识别的任务数，超出部分停留在 `classified` 排队
//!
//! 锁顺序：任务锁 -> 区块锁，区块处理器从不反向获取任务锁。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engines::{EngineHealth, EngineRouter};
use crate::error::TaskError;
use crate::infrastructure::{EventBus, EventStream, QuotaManager, QuotaStatus};
use crate::models::{
    Block, BlockDescriptor, BlockId, BlockProgress, BlockStatus, BlockType, LadderStep,
    ProgressEvent, Task, TaskFailure, TaskId, TaskStage, TaskStatus,
};
use crate::services::{
    ConfidenceEvaluator, StandardizedBlock, StandardizedDocument, StatsAggregator, StatsSnapshot,
    SyntaxValidator,
};
use crate::utils::short_id;
use crate::workflow::{BlockProcessor, BlockRun, RetryLadder};

struct TaskEntry {
    task: Mutex<Task>,
    processors: Mutex<Vec<Arc<BlockProcessor>>>,
    cancel: CancellationToken,
    stage_tx: watch::Sender<TaskStage>,
    /// 识别驱动是否已启动 / 已结束
    driver_started: watch::Sender<bool>,
    driver_done: watch::Sender<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl TaskEntry {
    fn task(&self) -> MutexGuard<'_, Task> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processors(&self) -> Vec<Arc<BlockProcessor>> {
        self.processors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn processor(&self, block_id: &str) -> Option<Arc<BlockProcessor>> {
        self.processors().into_iter().find(|p| p.id() == block_id)
    }

    /// (已终结区块数 / 区块总数) * 100，无区块时为 0
    fn progress(&self) -> f64 {
        let processors = self.processors();
        if processors.is_empty() {
            return 0.0;
        }
        let finished = processors.iter().filter(|p| p.status().is_terminal()).count();
        finished as f64 / processors.len() as f64 * 100.0
    }
}

struct Inner {
    ladder: Arc<RetryLadder>,
    router: Arc<EngineRouter>,
    evaluator: ConfidenceEvaluator,
    quota: Arc<QuotaManager>,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    permits: Arc<Semaphore>,
    task_timeout: std::time::Duration,
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
}

/// 任务管理器（可廉价克隆，内部共享状态）
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(config: &Config, router: Arc<EngineRouter>, quota: Arc<QuotaManager>) -> Self {
        Self::with_validator(config, router, quota, SyntaxValidator::default())
    }

    /// 使用自定义公式渲染能力
    pub fn with_validator(
        config: &Config,
        router: Arc<EngineRouter>,
        quota: Arc<QuotaManager>,
        validator: SyntaxValidator,
    ) -> Self {
        let ladder = RetryLadder::from_config(config, router.clone(), Arc::new(validator), quota.clone());
        Self {
            inner: Arc::new(Inner {
                ladder: Arc::new(ladder),
                router,
                evaluator: ConfidenceEvaluator::from_config(config),
                quota,
                stats: Arc::new(StatsAggregator::new()),
                events: EventBus::new(config.event_channel_capacity),
                permits: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
                task_timeout: config.task_timeout(),
                tasks: RwLock::new(HashMap::new()),
            }),
        }
    }

    // ========== 任务生命周期 ==========

    /// 创建任务（阶段 `uploaded`），同时启动超时看门狗
    pub fn create_task(&self, name: impl Into<String>) -> TaskId {
        let task = Task::new(name, Instant::now() + self.inner.task_timeout);
        let task_id = task.id;
        let deadline = task.deadline;
        let (stage_tx, _) = watch::channel(TaskStage::Uploaded);
        let (driver_started, _) = watch::channel(false);
        let (driver_done, _) = watch::channel(false);

        let entry = Arc::new(TaskEntry {
            task: Mutex::new(task),
            processors: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            stage_tx,
            driver_started,
            driver_done,
            watchdog: Mutex::new(None),
        });

        self.inner
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, entry.clone());

        let weak = Arc::downgrade(&self.inner);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = Weak::upgrade(&weak) {
                TaskManager { inner }.on_timeout(task_id);
            }
        });
        *entry.watchdog.lock().unwrap_or_else(PoisonError::into_inner) = Some(watchdog);

        info!("[任务 {}] 📥 已创建", short_id(&task_id));
        self.publish_stage(task_id, TaskStage::Uploaded, 0.0);
        task_id
    }

    /// 外部协作方（预处理、分割）完成后推进阶段
    pub fn advance(&self, task_id: TaskId, stage: TaskStage) -> Result<(), TaskError> {
        let entry = self.entry(task_id)?;
        if !matches!(stage, TaskStage::Preprocessing | TaskStage::Segmented) {
            let from = entry.task().stage;
            return Err(TaskError::InvalidTransition { from, to: stage });
        }
        self.transition(task_id, &entry, stage)
    }

    /// 接收分割 / 分类结果，创建区块并进入 `classified`
    pub fn attach_blocks(
        &self,
        task_id: TaskId,
        descriptors: Vec<BlockDescriptor>,
    ) -> Result<Vec<BlockId>, TaskError> {
        let entry = self.entry(task_id)?;
        let stage = entry.task().stage;
        if stage != TaskStage::Segmented {
            return Err(TaskError::InvalidTransition {
                from: stage,
                to: TaskStage::Classified,
            });
        }

        let mut ids: Vec<BlockId> = Vec::with_capacity(descriptors.len());
        let mut processors = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            let mut id = descriptor
                .id
                .clone()
                .unwrap_or_else(|| format!("b{}", index + 1));
            if ids.contains(&id) {
                warn!("[任务 {}] 区块 ID 重复: {}，已改名", short_id(&task_id), id);
                id = format!("{}-{}", id, index + 1);
            }

            let threshold = self.inner.evaluator.threshold(descriptor.block_type);
            let block = Block::new(task_id, id.clone(), descriptor, threshold);
            processors.push(Arc::new(BlockProcessor::new(
                block,
                self.inner.ladder.clone(),
                self.inner.events.clone(),
                self.inner.stats.clone(),
            )));
            ids.push(id);
        }

        *entry.processors.lock().unwrap_or_else(PoisonError::into_inner) = processors;
        self.transition(task_id, &entry, TaskStage::Classified)?;

        info!("[任务 {}] 🧩 收到 {} 个区块", short_id(&task_id), ids.len());
        Ok(ids)
    }

    /// 启动识别：排队等待并发名额，拿到后进入 `ocr_processing`
    pub fn start_recognition(&self, task_id: TaskId) -> Result<(), TaskError> {
        let entry = self.entry(task_id)?;
        let stage = entry.task().stage;
        if stage != TaskStage::Classified || *entry.driver_started.borrow() {
            return Err(TaskError::InvalidTransition {
                from: stage,
                to: TaskStage::OcrProcessing,
            });
        }

        let needs_engines = entry
            .processors()
            .iter()
            .any(|p| p.block_type() != BlockType::Figure);
        if needs_engines && self.inner.router.is_empty() {
            error!("[任务 {}] ❌ 没有可用的识别引擎", short_id(&task_id));
            self.fail(task_id, &entry, TaskFailure::EngineUnavailable);
            return Err(TaskError::NoEngines);
        }

        entry.driver_started.send_replace(true);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive(task_id, entry.clone()).await;
            entry.driver_done.send_replace(true);
        });
        Ok(())
    }

    /// 便捷入口：创建任务、提交分割结果并开始识别
    pub fn submit(
        &self,
        name: impl Into<String>,
        blocks: Vec<BlockDescriptor>,
    ) -> Result<TaskId, TaskError> {
        let task_id = self.create_task(name);
        self.advance(task_id, TaskStage::Preprocessing)?;
        self.advance(task_id, TaskStage::Segmented)?;
        self.attach_blocks(task_id, blocks)?;
        self.start_recognition(task_id)?;
        Ok(task_id)
    }

    /// 外部标准化步骤成功
    pub fn complete_standardization(&self, task_id: TaskId) -> Result<(), TaskError> {
        let entry = self.entry(task_id)?;
        self.transition(task_id, &entry, TaskStage::Completed)
    }

    /// 外部标准化步骤失败
    pub fn fail_standardization(&self, task_id: TaskId) -> Result<(), TaskError> {
        let entry = self.entry(task_id)?;
        let stage = entry.task().stage;
        if stage != TaskStage::Standardizing {
            return Err(TaskError::InvalidTransition {
                from: stage,
                to: TaskStage::Failed,
            });
        }
        self.fail(task_id, &entry, TaskFailure::StandardizationFailed);
        Ok(())
    }

    /// 主动中止任务，正在识别的区块在两步之间停止
    pub fn abort(&self, task_id: TaskId) -> Result<(), TaskError> {
        let entry = self.entry(task_id)?;
        if self.fail(task_id, &entry, TaskFailure::Aborted) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                from: entry.task().stage,
                to: TaskStage::Failed,
            })
        }
    }

    /// 等待识别阶段结束（进入 `standardizing` 或失败），且所有区块处理器都已返回
    pub async fn join(&self, task_id: TaskId) -> Result<TaskStatus, TaskError> {
        let entry = self.entry(task_id)?;

        let mut stage_rx = entry.stage_tx.subscribe();
        let _ = stage_rx.wait_for(|stage| stage.recognition_finished()).await;

        if *entry.driver_started.borrow() {
            let mut done_rx = entry.driver_done.subscribe();
            let _ = done_rx.wait_for(|done| *done).await;
        }

        self.get_status(task_id)
    }

    /// 清理已终结的任务（供外部定时清理使用）
    pub fn remove_task(&self, task_id: TaskId) -> Result<(), TaskError> {
        let entry = self.entry(task_id)?;
        if !entry.task().stage.is_terminal() {
            return Err(TaskError::StillActive { task_id });
        }
        self.inner
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id);
        Ok(())
    }

    // ========== 查询与重试 ==========

    pub fn get_status(&self, task_id: TaskId) -> Result<TaskStatus, TaskError> {
        let entry = self.entry(task_id)?;
        let task = entry.task().clone();
        let per_block: Vec<BlockProgress> = entry.processors().iter().map(|p| p.progress()).collect();
        let failed_blocks = per_block
            .iter()
            .filter(|b| b.status == BlockStatus::Failed)
            .map(|b| b.id.clone())
            .collect();

        Ok(TaskStatus {
            task_id,
            name: task.name,
            stage: task.stage,
            progress_percent: entry.progress(),
            per_block,
            failure_reason: task.error,
            failed_blocks,
        })
    }

    /// 手动重试单个区块：高画质从第 3 步开始，否则从第 1 步
    ///
    /// 仅在识别阶段结束后（`standardizing` / `completed`）且区块已终结时允许
    pub async fn retry(
        &self,
        task_id: TaskId,
        block_id: &str,
        use_high_quality: bool,
    ) -> Result<BlockProgress, TaskError> {
        let entry = self.entry(task_id)?;
        let stage = entry.task().stage;
        if !matches!(stage, TaskStage::Standardizing | TaskStage::Completed) {
            return Err(TaskError::NotRetryable { task_id, stage });
        }

        let processor = entry.processor(block_id).ok_or_else(|| TaskError::BlockNotFound {
            task_id,
            block_id: block_id.to_string(),
        })?;
        if !processor.status().is_terminal() {
            return Err(TaskError::BlockBusy {
                block_id: block_id.to_string(),
            });
        }

        info!(
            "[任务 {}] 🔁 手动重试区块 {}{}",
            short_id(&task_id),
            block_id,
            if use_high_quality { " (高画质)" } else { "" }
        );
        let step = LadderStep::retry_start(use_high_quality);
        let run = processor.retry_from(step, &entry.cancel).await?;
        self.publish_block_completed(task_id, &entry, &run);
        Ok(processor.progress())
    }

    /// 订阅单个任务的进度事件
    pub fn subscribe(&self, task_id: TaskId) -> EventStream {
        self.inner.events.subscribe_task(task_id)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// 交给导出方的标准化结果
    pub fn standardized_results(&self, task_id: TaskId) -> Result<StandardizedDocument, TaskError> {
        let entry = self.entry(task_id)?;
        let name = entry.task().name.clone();
        let blocks = entry
            .processors()
            .iter()
            .map(|p| StandardizedBlock::from_block(&p.snapshot()))
            .collect();
        Ok(StandardizedDocument {
            task_id,
            name,
            blocks,
        })
    }

    /// 区块完整快照（含尝试记录）
    pub fn block(&self, task_id: TaskId, block_id: &str) -> Result<Block, TaskError> {
        let entry = self.entry(task_id)?;
        entry
            .processor(block_id)
            .map(|p| p.snapshot())
            .ok_or_else(|| TaskError::BlockNotFound {
                task_id,
                block_id: block_id.to_string(),
            })
    }

    // ========== 管理操作 ==========

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn quota_status(&self) -> QuotaStatus {
        self.inner.quota.status()
    }

    pub fn reset_quota(&self) {
        self.inner.quota.reset();
    }

    pub fn engine_health(&self) -> Vec<EngineHealth> {
        self.inner.router.health()
    }

    // ========== 内部流程 ==========

    async fn drive(&self, task_id: TaskId, entry: Arc<TaskEntry>) {
        let prefix = format!("[任务 {}]", short_id(&task_id));

        let permit = tokio::select! {
            permit = self.inner.permits.clone().acquire_owned() => permit.ok(),
            _ = entry.cancel.cancelled() => None,
        };

        if permit.is_some() && self.transition(task_id, &entry, TaskStage::OcrProcessing).is_ok() {
            info!("{} 🔍 开始识别", prefix);
        }

        let mut set = JoinSet::new();
        for processor in entry.processors() {
            let cancel = entry.cancel.clone();
            set.spawn(async move { processor.run(&cancel).await });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(run)) => self.publish_block_completed(task_id, &entry, &run),
                Ok(Err(e)) => warn!("{} ⚠️ 区块未能运行: {}", prefix, e),
                Err(e) => error!("{} ❌ 区块处理器异常退出: {}", prefix, e),
            }
        }

        self.finish_recognition(task_id, &entry);
        drop(permit);
    }

    /// 所有区块终结后：部分成功进入 `standardizing`，没有任何非图片区块成功则失败
    fn finish_recognition(&self, task_id: TaskId, entry: &Arc<TaskEntry>) {
        let processors = entry.processors();
        let failed = failed_block_ids(&processors);
        let non_figure: Vec<_> = processors
            .iter()
            .filter(|p| p.block_type() != BlockType::Figure)
            .collect();
        let accepted_non_figure = non_figure
            .iter()
            .filter(|p| p.status() == BlockStatus::Accepted)
            .count();

        if entry.task().stage != TaskStage::OcrProcessing {
            return;
        }

        if !non_figure.is_empty() && accepted_non_figure == 0 {
            warn!("[任务 {}] ❌ 没有任何区块识别成功", short_id(&task_id));
            self.fail(task_id, entry, TaskFailure::NoAcceptedBlocks);
            return;
        }

        if self.transition(task_id, entry, TaskStage::Standardizing).is_ok() {
            info!(
                "[任务 {}] 📝 识别完成: 成功 {}，失败 {}",
                short_id(&task_id),
                processors.len() - failed.len(),
                failed.len()
            );
        }
    }

    fn on_timeout(&self, task_id: TaskId) {
        let Ok(entry) = self.entry(task_id) else {
            return;
        };
        if self.fail(task_id, &entry, TaskFailure::TaskTimeout) {
            warn!("[任务 {}] ⏰ 任务超时，已取消进行中的区块", short_id(&task_id));
        }
    }

    /// 受状态机约束的阶段转换
    fn transition(&self, task_id: TaskId, entry: &TaskEntry, to: TaskStage) -> Result<(), TaskError> {
        {
            let mut task = entry.task();
            if !task.stage.can_transition_to(to) {
                return Err(TaskError::InvalidTransition {
                    from: task.stage,
                    to,
                });
            }
            task.stage = to;
            entry.stage_tx.send_replace(to);
        }

        self.publish_stage(task_id, to, entry.progress());
        if to.is_terminal() {
            self.on_terminal(entry, to);
        }
        Ok(())
    }

    /// 进入 `failed`；已是终态时返回 `false`
    fn fail(&self, task_id: TaskId, entry: &TaskEntry, reason: TaskFailure) -> bool {
        {
            let mut task = entry.task();
            if task.stage.is_terminal() {
                return false;
            }
            task.stage = TaskStage::Failed;
            task.error = Some(reason);
            entry.stage_tx.send_replace(TaskStage::Failed);
        }

        entry.cancel.cancel();
        warn!("[任务 {}] ❌ 任务失败: {}", short_id(&task_id), reason);
        self.publish_stage(task_id, TaskStage::Failed, entry.progress());
        self.on_terminal(entry, TaskStage::Failed);
        true
    }

    fn on_terminal(&self, entry: &TaskEntry, stage: TaskStage) {
        self.inner.stats.record_task(stage);
        if let Some(watchdog) = entry
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watchdog.abort();
        }
    }

    fn publish_stage(&self, task_id: TaskId, stage: TaskStage, progress: f64) {
        self.inner.events.publish(ProgressEvent::StageUpdate {
            task_id,
            stage,
            progress,
        });
    }

    fn publish_block_completed(&self, task_id: TaskId, entry: &TaskEntry, run: &BlockRun) {
        self.inner.events.publish(ProgressEvent::BlockCompleted {
            task_id,
            block_id: run.block_id.clone(),
            run: run.run,
            success: run.success(),
            confidence: run.confidence,
            reason: run.reason,
            progress: entry.progress(),
        });
    }

    fn entry(&self, task_id: TaskId) -> Result<Arc<TaskEntry>, TaskError> {
        self.inner
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .cloned()
            .ok_or(TaskError::NotFound { task_id })
    }
}

fn failed_block_ids(processors: &[Arc<BlockProcessor>]) -> Vec<BlockId> {
    processors
        .iter()
        .filter(|p| p.status() == BlockStatus::Failed)
        .map(|p| p.id())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> TaskManager {
        let router = Arc::new(EngineRouter::new(Duration::from_secs(1)));
        TaskManager::new(&Config::default(), router, Arc::new(QuotaManager::new(1)))
    }

    #[tokio::test]
    async fn stages_cannot_skip() {
        let manager = manager();
        let task_id = manager.create_task("卷一");

        let err = manager.advance(task_id, TaskStage::Segmented).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        manager.advance(task_id, TaskStage::Preprocessing).unwrap();

        let err = manager.advance(task_id, TaskStage::Completed).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn blocks_need_segmented_stage() {
        let manager = manager();
        let task_id = manager.create_task("卷一");
        let blocks = vec![BlockDescriptor::new(BlockType::Figure, "c.png", "o.png")];
        assert!(manager.attach_blocks(task_id, blocks).is_err());
    }

    #[tokio::test]
    async fn missing_engines_fail_the_task() {
        let manager = manager();
        let blocks = vec![BlockDescriptor::new(BlockType::ProblemStem, "c.png", "o.png")];
        let task_id = manager.create_task("卷一");
        manager.advance(task_id, TaskStage::Preprocessing).unwrap();
        manager.advance(task_id, TaskStage::Segmented).unwrap();
        manager.attach_blocks(task_id, blocks).unwrap();

        let err = manager.start_recognition(task_id).unwrap_err();
        assert!(matches!(err, TaskError::NoEngines));
        let status = manager.get_status(task_id).unwrap();
        assert_eq!(status.stage, TaskStage::Failed);
        assert_eq!(status.failure_reason, Some(TaskFailure::EngineUnavailable));
    }

    #[tokio::test]
    async fn figure_only_task_reaches_standardizing() {
        let manager = manager();
        let blocks = vec![
            BlockDescriptor::new(BlockType::Figure, "c1.png", "o1.png").with_id("fig"),
            BlockDescriptor::new(BlockType::Figure, "c2.png", "o2.png").with_id("fig"),
        ];
        let task_id = manager.submit("卷一", blocks).unwrap();

        let status = manager.join(task_id).await.unwrap();
        assert_eq!(status.stage, TaskStage::Standardizing);
        assert_eq!(status.progress_percent, 100.0);
        assert_eq!(status.per_block[1].id, "fig-2");

        manager.complete_standardization(task_id).unwrap();
        assert_eq!(manager.get_status(task_id).unwrap().stage, TaskStage::Completed);
        manager.remove_task(task_id).unwrap();
        assert!(matches!(
            manager.get_status(task_id),
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn active_tasks_cannot_be_removed() {
        let manager = manager();
        let task_id = manager.create_task("卷一");
        assert!(matches!(
            manager.remove_task(task_id),
            Err(TaskError::StillActive { .. })
        ));
        manager.abort(task_id).unwrap();
        assert!(manager.abort(task_id).is_err());
        manager.remove_task(task_id).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fires_at_task_deadline() {
        let manager = manager();
        let started = Instant::now();
        let task_id = manager.create_task("卷一");
        let deadline = manager.entry(task_id).unwrap().task().deadline;
        assert_eq!(deadline, started + Duration::from_secs(300));

        tokio::time::sleep_until(deadline - Duration::from_secs(1)).await;
        assert_eq!(manager.get_status(task_id).unwrap().stage, TaskStage::Uploaded);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = manager.get_status(task_id).unwrap();
        assert_eq!(status.stage, TaskStage::Failed);
        assert_eq!(status.failure_reason, Some(TaskFailure::TaskTimeout));
    }
}
