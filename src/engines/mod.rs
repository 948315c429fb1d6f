//! 识别引擎 - 基础设施层
//!
//! 具体引擎对流程不可见，阶梯只依赖 `RecognitionEngine` 能力和 `EngineRouter`

pub mod command;
pub mod factory;
pub mod mathpix;
pub mod router;
pub mod vision_llm;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;
use crate::models::RecognitionMode;

pub use command::CommandEngine;
pub use factory::{build_router, EngineSpec, EnginesConfig};
pub use mathpix::MathpixEngine;
pub use router::{EngineHealth, EngineRouter, Invocation};
pub use vision_llm::VisionLlmEngine;

/// 一次识别请求
#[derive(Debug, Clone, Copy)]
pub struct RecognitionRequest<'a> {
    /// 图片路径或 URL
    pub image: &'a str,
    pub mode: RecognitionMode,
}

/// 引擎返回的识别结果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineOutput {
    pub content: String,
    pub confidence: f64,
}

impl EngineOutput {
    pub fn new(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// 识别引擎能力
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, request: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError>;
}

/// 引擎角色（固定集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineRole {
    PrimaryText,
    FallbackText,
    PrimaryFormula,
    FallbackFormula,
    EmergencyFormula,
}

impl EngineRole {
    pub const ALL: [EngineRole; 5] = [
        EngineRole::PrimaryText,
        EngineRole::FallbackText,
        EngineRole::PrimaryFormula,
        EngineRole::FallbackFormula,
        EngineRole::EmergencyFormula,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineRole::PrimaryText => "primary_text",
            EngineRole::FallbackText => "fallback_text",
            EngineRole::PrimaryFormula => "primary_formula",
            EngineRole::FallbackFormula => "fallback_formula",
            EngineRole::EmergencyFormula => "emergency_formula",
        }
    }
}

impl fmt::Display for EngineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 把图片引用转成 HTTP 引擎可接受的来源：URL 原样返回，本地文件转成 base64 data URL
pub(crate) async fn image_source(engine: &str, image: &str) -> Result<String, EngineError> {
    if image.starts_with("http://") || image.starts_with("https://") || image.starts_with("data:") {
        return Ok(image.to_string());
    }

    let bytes = tokio::fs::read(image).await.map_err(|source| EngineError::Io {
        engine: engine.to_string(),
        path: image.to_string(),
        source,
    })?;

    Ok(format!("data:{};base64,{}", mime_type(image), STANDARD.encode(bytes)))
}

fn mime_type(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn urls_pass_through() {
        let src = image_source("t", "https://cdn.example.com/a.png").await.unwrap();
        assert_eq!(src, "https://cdn.example.com/a.png");
    }

    #[tokio::test]
    async fn local_files_become_data_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b1.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let src = image_source("t", &path.to_string_lossy()).await.unwrap();
        assert_eq!(src, "data:image/png;base64,AQID");
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = image_source("t", "/nonexistent/x.jpg").await.unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
