use crate::models::block::BlockDescriptor;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 分割结果清单：一次上传对应的区块列表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub name: String,
    #[serde(default)]
    pub blocks: Vec<BlockDescriptor>,
    #[serde(skip_serializing, skip_deserializing)]
    pub file_path: Option<String>,
}

/// 从 TOML 文件加载任务清单
pub async fn load_manifest(toml_file_path: &Path) -> Result<TaskManifest> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut manifest: TaskManifest = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    manifest.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(manifest)
}

/// 从文件夹中加载所有任务清单，按文件名排序
pub async fn load_all_manifests(folder_path: &str) -> Result<Vec<TaskManifest>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_manifest(&path).await {
            Ok(manifest) => {
                tracing::info!("成功加载 {} 个区块", manifest.blocks.len());
                manifests.push(manifest);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(manifests)
}
