//! Mathpix 引擎 - 受配额保护的兜底公式引擎

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{image_source, EngineOutput, RecognitionEngine, RecognitionRequest};
use crate::error::EngineError;
use crate::models::RecognitionMode;

const DEFAULT_API_URL: &str = "https://api.mathpix.com/v3/text";

/// Mathpix 置信度偏高，统一打折且封顶
const CONFIDENCE_DISCOUNT: f64 = 0.9;
const CONFIDENCE_CAP: f64 = 0.95;

#[derive(Debug, Deserialize)]
struct MathpixReply {
    #[serde(default)]
    latex_simplified: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    error: Option<String>,
}

pub struct MathpixEngine {
    client: Client,
    api_url: String,
    app_id: String,
    app_key: String,
}

impl MathpixEngine {
    pub fn new(app_id: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: DEFAULT_API_URL.to_string(),
            app_id: app_id.into(),
            app_key: app_key.into(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn adjust_confidence(raw: f64) -> f64 {
        (raw * CONFIDENCE_DISCOUNT).clamp(0.0, CONFIDENCE_CAP)
    }
}

#[async_trait]
impl RecognitionEngine for MathpixEngine {
    fn name(&self) -> &str {
        "mathpix"
    }

    async fn recognize(&self, request: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError> {
        let src = image_source(self.name(), request.image).await?;
        let format = match request.mode {
            RecognitionMode::Formula => "latex_simplified",
            RecognitionMode::Text => "text",
        };

        let body = json!({
            "src": src,
            "formats": [format],
            "data_options": {
                "include_asciimath": false,
                "include_mathml": false,
                "include_tsv": false
            }
        });

        let response = self
            .client
            .post(&self.api_url)
            .header("app_id", &self.app_id)
            .header("app_key", &self.app_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::unavailable(self.name(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::BadResponse {
                engine: self.name().to_string(),
                status: status.as_u16(),
            });
        }

        let reply: MathpixReply = response
            .json()
            .await
            .map_err(|e| EngineError::malformed(self.name(), e))?;

        if let Some(error) = reply.error {
            return Err(EngineError::unavailable(self.name(), error));
        }

        let content = match request.mode {
            RecognitionMode::Formula => reply.latex_simplified,
            RecognitionMode::Text => reply.text,
        }
        .unwrap_or_default();

        debug!("Mathpix 原始置信度 {:.3}", reply.confidence);
        Ok(EngineOutput::new(
            content.trim(),
            Self::adjust_confidence(reply.confidence),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_discounted_and_capped() {
        assert!((MathpixEngine::adjust_confidence(0.8) - 0.72).abs() < 1e-9);
        assert!((MathpixEngine::adjust_confidence(1.0) - 0.9).abs() < 1e-9);
        assert_eq!(MathpixEngine::adjust_confidence(1.2), 0.95);
        assert_eq!(MathpixEngine::adjust_confidence(0.0), 0.0);
    }

    #[test]
    fn parses_reply() {
        let reply: MathpixReply = serde_json::from_str(
            r#"{"request_id": "r1", "latex_simplified": "\\sqrt{2}", "confidence": 0.99}"#,
        )
        .unwrap();
        assert_eq!(reply.latex_simplified.as_deref(), Some(r"\sqrt{2}"));
        assert!(reply.error.is_none());
    }
}
