//! 批量任务处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量任务的识别、导出和统计。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：校验配置、构建引擎路由、恢复配额记录
//! 2. **批量加载**：扫描并加载所有分割结果清单（`Vec<TaskManifest>`）
//! 3. **并发控制**：全部提交给 `TaskManager`，由其 Semaphore 排队
//! 4. **结果导出**：识别结束后导出标准化结果，失败区块写入记录文件
//! 5. **全局统计**：汇总任务结果、区块统计和配额用量

use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engines::build_router;
use crate::infrastructure::QuotaManager;
use crate::models::{BlockStatus, TaskManifest, TaskStage};
use crate::orchestrator::task_manager::TaskManager;
use crate::services::{FailureLog, JsonExporter, ResultExporter};
use crate::utils::logging::{log_startup, log_tasks_loaded, print_final_stats};
use crate::utils::short_id;

/// 应用主结构
pub struct App {
    config: Config,
    manager: TaskManager,
    exporter: Arc<dyn ResultExporter>,
    failure_log: Arc<FailureLog>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        config.validate()?;
        log_startup(&config);

        let router = Arc::new(build_router(&config)?);
        for engine in router.health() {
            info!("🔧 {} 可用: {}", engine.role, engine.engine);
        }

        let quota = Arc::new(QuotaManager::load(
            &config.quota_state_file,
            config.emergency_daily_limit,
        ));
        let manager = TaskManager::new(&config, router, quota);

        Ok(Self {
            exporter: Arc::new(JsonExporter::new(&config.output_folder)),
            failure_log: Arc::new(FailureLog::new(&config.failure_log_file)),
            manager,
            config,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        let manifests = self.load_manifests().await?;

        if manifests.is_empty() {
            warn!("⚠️ 没有找到待处理的TOML文件，程序结束");
            return Ok(());
        }

        let total = manifests.len();
        log_tasks_loaded(total, self.config.max_concurrent_tasks);

        let handles = manifests.into_iter().enumerate().map(|(idx, manifest)| {
            let manager = self.manager.clone();
            let exporter = self.exporter.clone();
            let failure_log = self.failure_log.clone();
            let index = idx + 1;

            tokio::spawn(async move {
                process_manifest(&manager, exporter.as_ref(), &failure_log, manifest, index).await
            })
        });
        let results = join_all(handles).await;

        let mut success = 0;
        let mut failed = 0;
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(true)) => success += 1,
                Ok(Ok(false)) => failed += 1,
                Ok(Err(e)) => {
                    error!("[清单 {}] ❌ 处理过程中发生错误: {}", idx + 1, e);
                    failed += 1;
                }
                Err(e) => {
                    error!("[清单 {}] 任务执行失败: {}", idx + 1, e);
                    failed += 1;
                }
            }
        }

        print_final_stats(
            success,
            failed,
            total,
            &self.manager.stats(),
            &self.manager.quota_status(),
            &self.config.failure_log_file,
        );

        Ok(())
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// 加载分割结果清单
    async fn load_manifests(&self) -> Result<Vec<TaskManifest>> {
        info!("\n📁 正在扫描待识别的分割结果...");
        crate::models::load_all_manifests(&self.config.input_folder).await
    }
}

/// 处理单个清单：提交、等待识别、导出、记录失败区块
///
/// 返回任务是否完成
async fn process_manifest(
    manager: &TaskManager,
    exporter: &dyn ResultExporter,
    failure_log: &FailureLog,
    manifest: TaskManifest,
    index: usize,
) -> Result<bool> {
    info!(
        "[清单 {}] 📄 {} ({} 个区块)",
        index,
        manifest.name,
        manifest.blocks.len()
    );

    let task_id = manager.submit(manifest.name.clone(), manifest.blocks)?;
    let prefix = format!("[任务 {}]", short_id(&task_id));
    let status = manager.join(task_id).await?;

    for block in status.per_block.iter().filter(|b| b.status == BlockStatus::Failed) {
        if let Err(e) = failure_log.write(&status.name, block) {
            warn!("{} ⚠️ 写入失败记录出错: {}", prefix, e);
        }
    }

    if status.stage != TaskStage::Standardizing {
        warn!(
            "{} ❌ 任务未完成: {}",
            prefix,
            status
                .failure_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| status.stage.to_string())
        );
        return Ok(false);
    }

    let document = manager.standardized_results(task_id)?;
    match exporter.export(&document).await {
        Ok(_) => {
            manager.complete_standardization(task_id)?;
            info!(
                "{} ✅ 完成: 成功 {} / 失败 {}",
                prefix,
                status.accepted_count(),
                status.failed_count()
            );
            Ok(true)
        }
        Err(e) => {
            error!("{} ❌ 导出失败: {}", prefix, e);
            manager.fail_standardization(task_id)?;
            Ok(false)
        }
    }
}
