//! 兜底引擎配额 - 基础设施层
//!
//! 持有全进程唯一的配额计数器，只暴露"尝试消耗 / 重置 / 查询"能力。
//! 日期翻转检查与消耗检查在同一个临界区内完成，保证并发区块不会同时看到最后一个名额。

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// 日期来源（测试中可替换）
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// 持久化的配额记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub usage: u32,
    pub limit: u32,
    /// 计数对应的 UTC 日期
    pub date: NaiveDate,
}

/// 配额查询结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub usage: u32,
    pub limit: u32,
    pub percentage: f64,
}

impl QuotaStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.usage)
    }
}

/// 兜底引擎配额管理器
pub struct QuotaManager {
    record: Mutex<QuotaRecord>,
    store: Option<PathBuf>,
    clock: Clock,
}

impl QuotaManager {
    /// 创建仅存于内存的配额管理器
    pub fn new(limit: u32) -> Self {
        Self::with_clock(limit, Arc::new(|| Utc::now().date_naive()))
    }

    pub fn with_clock(limit: u32, clock: Clock) -> Self {
        let today = clock();
        Self {
            record: Mutex::new(QuotaRecord {
                usage: 0,
                limit,
                date: today,
            }),
            store: None,
            clock,
        }
    }

    /// 从持久化文件恢复配额，文件不存在或损坏时从零开始
    ///
    /// 上限以配置为准，文件中的旧上限会被覆盖
    pub fn load(path: impl Into<PathBuf>, limit: u32) -> Self {
        let path = path.into();
        let mut manager = Self::new(limit);

        match read_record(&path) {
            Ok(Some(record)) => {
                info!(
                    "📂 已恢复配额记录: {} 已用 {}/{}",
                    record.date, record.usage, limit
                );
                manager.record = Mutex::new(QuotaRecord { limit, ..record });
            }
            Ok(None) => debug!("配额文件不存在，从零开始: {}", path.display()),
            Err(e) => warn!("⚠️ 配额文件无法读取，从零开始 ({}): {}", path.display(), e),
        }

        manager.store = Some(path);
        manager
    }

    /// 原子地检查并消耗一个名额
    ///
    /// 返回 `true` 表示已占用一个名额；返回 `false` 时不改变计数
    pub fn try_consume(&self) -> bool {
        let today = (self.clock)();
        let mut record = self.lock();
        let mut dirty = false;

        if record.date != today {
            debug!("配额日期翻转: {} -> {}", record.date, today);
            record.date = today;
            record.usage = 0;
            dirty = true;
        }

        let granted = record.usage < record.limit;
        if granted {
            record.usage += 1;
            dirty = true;
        }

        if dirty {
            self.persist(&record);
        }

        granted
    }

    /// 管理操作：立即清零（与日期无关）
    pub fn reset(&self) {
        let today = (self.clock)();
        let mut record = self.lock();
        let previous = record.usage;
        record.usage = 0;
        record.date = today;
        self.persist(&record);
        info!("🔄 兜底配额已重置 (原用量 {})", previous);
    }

    /// 只读查询；跨日后未被访问时按新的一天展示，但不修改记录
    pub fn status(&self) -> QuotaStatus {
        let today = (self.clock)();
        let record = *self.lock();
        let usage = if record.date == today { record.usage } else { 0 };
        let percentage = if record.limit == 0 {
            100.0
        } else {
            f64::from(usage) / f64::from(record.limit) * 100.0
        };

        QuotaStatus {
            usage,
            limit: record.limit,
            percentage,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QuotaRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 持久化失败只记日志，不影响消耗结果
    fn persist(&self, record: &QuotaRecord) {
        let Some(path) = &self.store else {
            return;
        };
        if let Err(e) = write_record(path, record) {
            warn!("⚠️ 配额记录写入失败 ({}): {}", path.display(), e);
        }
    }
}

fn read_record(path: &Path) -> anyhow::Result<Option<QuotaRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn write_record(path: &Path, record: &QuotaRecord) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap() + chrono::Duration::days(offset)
    }

    fn manual_clock() -> (Arc<AtomicI64>, Clock) {
        let offset = Arc::new(AtomicI64::new(0));
        let handle = offset.clone();
        let clock: Clock = Arc::new(move || day(handle.load(Ordering::SeqCst)));
        (offset, clock)
    }

    #[test]
    fn consumes_until_limit() {
        let quota = QuotaManager::new(2);
        assert!(quota.try_consume());
        assert!(quota.try_consume());
        assert!(!quota.try_consume());
        assert_eq!(quota.status().usage, 2);
        assert_eq!(quota.status().remaining(), 0);
    }

    #[test]
    fn concurrent_consumers_never_exceed_limit() {
        let quota = QuotaManager::new(100);
        for _ in 0..99 {
            assert!(quota.try_consume());
        }

        let successes = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| quota.try_consume()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|granted| *granted)
                .count()
        });

        assert_eq!(successes, 1);
        assert_eq!(quota.status().usage, 100);
    }

    #[test]
    fn rolls_over_on_new_day() {
        let (offset, clock) = manual_clock();
        let quota = QuotaManager::with_clock(1, clock);
        assert!(quota.try_consume());
        assert!(!quota.try_consume());

        offset.store(1, Ordering::SeqCst);
        assert_eq!(quota.status().usage, 0);
        assert!(quota.try_consume());
        assert!(!quota.try_consume());
    }

    #[test]
    fn status_is_idempotent() {
        let (offset, clock) = manual_clock();
        let quota = QuotaManager::with_clock(10, clock);
        quota.try_consume();
        offset.store(3, Ordering::SeqCst);

        let first = quota.status();
        let second = quota.status();
        assert_eq!(first, second);
        assert_eq!(first.usage, 0);
    }

    #[test]
    fn reset_clears_usage_immediately() {
        let quota = QuotaManager::new(3);
        quota.try_consume();
        quota.try_consume();
        quota.reset();
        assert_eq!(quota.status().usage, 0);
        assert!((quota.status().percentage - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn persists_and_restores_usage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");

        let quota = QuotaManager::load(&path, 5);
        assert!(quota.try_consume());
        assert!(quota.try_consume());
        drop(quota);

        let restored = QuotaManager::load(&path, 5);
        assert_eq!(restored.status().usage, 2);
        assert_eq!(restored.status().limit, 5);
    }

    #[test]
    fn corrupt_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        std::fs::write(&path, "not json").unwrap();

        let quota = QuotaManager::load(&path, 4);
        assert_eq!(quota.status().usage, 0);
    }
}
