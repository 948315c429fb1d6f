//! 失败区块记录 - 业务能力层
//!
//! 只负责"追加写 failed_blocks.txt"能力，不关心流程

use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use tracing::debug;

use crate::models::BlockProgress;

/// 失败区块记录服务
pub struct FailureLog {
    file_path: String,
}

impl FailureLog {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            file_path: path.into(),
        }
    }

    /// 追加一条失败记录
    pub fn write(&self, task_name: &str, block: &BlockProgress) -> Result<()> {
        let reason = block
            .failure_reason
            .map(|r| format!("{} ({})", r, r.remedy_hint()))
            .unwrap_or_else(|| "未知".to_string());

        debug!("写入失败记录: 任务 {} | 区块 {}", task_name, block.id);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;

        let line = format!(
            "任务 {} | 区块 {} | 类型 {} | 尝试 {} 次 | 原因: {}\n",
            task_name, block.id, block.block_type, block.attempts, reason
        );
        file.write_all(line.as_bytes())?;

        Ok(())
    }
}
