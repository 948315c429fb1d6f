/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::infrastructure::QuotaStatus;
use crate::models::TaskId;
use crate::services::StatsSnapshot;

/// 初始化日志订阅者
///
/// 读取 `RUST_LOG`，未设置时默认 `info`；`verbose` 为真时默认 `debug`。
/// 重复调用时静默忽略。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 任务 ID 的短形式，用于日志前缀
pub fn short_id(task_id: &TaskId) -> String {
    task_id.simple().to_string().chars().take(8).collect()
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 试卷区块识别调度");
    info!("📊 最大并发任务数: {}", config.max_concurrent_tasks);
    info!(
        "🎯 置信度阈值: 文字 {:.2} / 公式 {:.2}",
        config.text_confidence_threshold, config.formula_confidence_threshold
    );
    info!(
        "⏱️ 任务超时: {}s，单次引擎超时: {}s",
        config.task_timeout_secs, config.engine_timeout_secs
    );
    info!("🛡️ 兜底引擎每日上限: {}", config.emergency_daily_limit);
    info!("{}", "=".repeat(60));
}

/// 记录任务清单加载信息
pub fn log_tasks_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个待识别的任务", total);
    info!("📋 最多同时处理 {} 个，其余排队等待\n", max_concurrent);
}

/// 打印最终统计信息
pub fn print_final_stats(
    success: usize,
    failed: usize,
    total: usize,
    stats: &StatsSnapshot,
    quota: &QuotaStatus,
    failure_log_path: &str,
) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功任务: {}/{}", success, total);
    info!("❌ 失败任务: {}", failed);
    info!(
        "🧩 区块: 共 {} 个，成功率 {:.1}%，备援接受率 {:.1}%，兜底调用率 {:.1}%",
        stats.total_requests, stats.success_rate, stats.fallback_rate, stats.emergency_rate
    );
    for engine in &stats.engines {
        info!(
            "   🔧 {}: {} 次调用，成功率 {:.1}%，平均耗时 {:.0}ms",
            engine.engine, engine.requests, engine.success_rate, engine.avg_latency_ms
        );
    }
    if !stats.top_failure_reasons.is_empty() {
        info!("⚠️ 主要失败原因:");
        for reason in &stats.top_failure_reasons {
            info!(
                "   - {}: {} 次 ({:.1}%)",
                reason.reason, reason.count, reason.percentage
            );
        }
    }
    info!(
        "🛡️ 兜底配额: {}/{} ({:.1}%)",
        quota.usage, quota.limit, quota.percentage
    );
    info!("{}", "=".repeat(60));
    if failed > 0 || stats.successful_requests < stats.total_requests {
        info!("\n失败区块已记录至: {}", failure_log_path);
    }
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
