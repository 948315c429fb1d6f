//! 标准化结果导出 - 业务能力层
//!
//! 把区块结果整理成交给排版导出方的结构；失败区块带原因透传，是否放占位符由导出方决定

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{Block, BlockId, BlockStatus, BlockType, FailureReason, TaskId};
use crate::utils::short_id;

/// 单个区块的标准化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardizedBlock {
    pub block_id: BlockId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub confidence: Option<f64>,
    pub engine_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl StandardizedBlock {
    pub fn from_block(block: &Block) -> Self {
        let mut standardized = Self {
            block_id: block.id.clone(),
            block_type: block.block_type,
            text: None,
            latex: None,
            image: None,
            confidence: None,
            engine_used: None,
            failure_reason: None,
        };

        match (&block.result, block.status) {
            (Some(result), BlockStatus::Accepted) => {
                let content = Some(result.content.clone());
                match block.block_type {
                    BlockType::Formula => standardized.latex = content,
                    BlockType::Figure => standardized.image = content,
                    BlockType::ProblemStem | BlockType::Options => standardized.text = content,
                }
                standardized.confidence = Some(result.confidence);
                standardized.engine_used = result.engine_used.clone();
            }
            _ => standardized.failure_reason = block.failure_reason,
        }

        standardized
    }

    /// 有识别结果才算成功；识别中或失败的区块都没有结果
    pub fn is_accepted(&self) -> bool {
        self.text.is_some() || self.latex.is_some() || self.image.is_some()
    }
}

/// 一个任务的标准化文档
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardizedDocument {
    pub task_id: TaskId,
    pub name: String,
    pub blocks: Vec<StandardizedBlock>,
}

/// 导出协作方
#[async_trait]
pub trait ResultExporter: Send + Sync {
    async fn export(&self, document: &StandardizedDocument) -> AppResult<PathBuf>;
}

/// 以 JSON 文件形式导出
pub struct JsonExporter {
    output_dir: PathBuf,
}

impl JsonExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl ResultExporter for JsonExporter {
    async fn export(&self, document: &StandardizedDocument) -> AppResult<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| AppError::File {
                path: self.output_dir.display().to_string(),
                source,
            })?;

        // 同名清单各自导出，文件名附带任务短 ID
        let path = self.output_dir.join(format!(
            "{}_{}.json",
            sanitize_file_name(&document.name),
            short_id(&document.task_id)
        ));
        let body = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| AppError::File {
                path: path.display().to_string(),
                source,
            })?;

        let accepted = document.blocks.iter().filter(|b| b.is_accepted()).count();
        info!(
            "💾 已导出 {} 个区块（成功 {}）: {}",
            document.blocks.len(),
            accepted,
            path.display()
        );
        Ok(path)
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    if cleaned.trim().is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}
