//! 外部识别程序引擎
//!
//! 每次识别启动一个子进程，参数中的 `{image}` / `{mode}` 会被替换；
//! 子进程需在 stdout 输出 `{"text": "...", "confidence": 0.9}`

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{EngineOutput, RecognitionEngine, RecognitionRequest};
use crate::error::EngineError;
use crate::models::RecognitionMode;

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f64,
}

/// 通过外部程序识别（如 paddleocr / pix2tex 的命令行封装）
pub struct CommandEngine {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    fn build_args(&self, request: &RecognitionRequest<'_>) -> Vec<String> {
        let mode = match request.mode {
            RecognitionMode::Text => "text",
            RecognitionMode::Formula => "formula",
        };

        let mut has_image = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{image}") {
                    has_image = true;
                }
                arg.replace("{image}", request.image).replace("{mode}", mode)
            })
            .collect();

        if !has_image {
            args.push(request.image.to_string());
        }
        args
    }
}

#[async_trait]
impl RecognitionEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, request: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError> {
        let args = self.build_args(request);
        debug!("启动识别程序: {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::unavailable(&self.name, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::unavailable(
                &self.name,
                format!("退出码 {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: CommandReply = serde_json::from_str(stdout.trim())
            .map_err(|e| EngineError::malformed(&self.name, e))?;

        Ok(EngineOutput::new(reply.text.trim(), reply.confidence.clamp(0.0, 1.0)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(image: &str) -> RecognitionRequest<'_> {
        RecognitionRequest {
            image,
            mode: RecognitionMode::Formula,
        }
    }

    #[test]
    fn substitutes_placeholders() {
        let engine = CommandEngine::new(
            "pix2tex",
            "pix2tex-cli",
            vec!["--mode={mode}".to_string(), "{image}".to_string()],
        );
        assert_eq!(
            engine.build_args(&request("a.png")),
            vec!["--mode=formula".to_string(), "a.png".to_string()]
        );

        let engine = CommandEngine::new("ocr", "ocr-cli", vec!["--json".to_string()]);
        assert_eq!(
            engine.build_args(&request("b.png")),
            vec!["--json".to_string(), "b.png".to_string()]
        );
    }

    #[tokio::test]
    async fn parses_json_stdout() {
        let engine = CommandEngine::new(
            "echo",
            "sh",
            vec![
                "-c".to_string(),
                r#"printf '%s' '{"text": " \\frac{a}{b} ", "confidence": 0.82}'"#.to_string(),
                "{image}".to_string(),
            ],
        );
        let output = engine.recognize(&request("ignored.png")).await.unwrap();
        assert_eq!(output.content, r"\frac{a}{b}");
        assert_eq!(output.confidence, 0.82);
    }

    #[tokio::test]
    async fn non_zero_exit_is_unavailable() {
        let engine = CommandEngine::new(
            "fail",
            "sh",
            vec!["-c".to_string(), "exit 3".to_string(), "{image}".to_string()],
        );
        let err = engine.recognize(&request("x.png")).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn garbage_stdout_is_malformed() {
        let engine = CommandEngine::new(
            "garbage",
            "sh",
            vec!["-c".to_string(), "echo nope".to_string(), "{image}".to_string()],
        );
        let err = engine.recognize(&request("x.png")).await.unwrap_err();
        assert!(matches!(err, EngineError::Malformed { .. }));
    }
}
