//! 视觉大模型引擎
//!
//! 兼容 OpenAI API 的服务均可使用，要求模型只返回 `{"content": "...", "confidence": 0.9}`

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{image_source, EngineOutput, RecognitionEngine, RecognitionRequest};
use crate::error::EngineError;
use crate::models::RecognitionMode;

const SYSTEM_PROMPT: &str = "你是一个试卷识别助手。只输出一个 JSON 对象：\
                             {\"content\": 识别结果, \"confidence\": 0 到 1 之间的把握程度}，不要输出其他内容。";

#[derive(Debug, Deserialize)]
struct VisionReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    confidence: f64,
}

pub struct VisionLlmEngine {
    name: String,
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl VisionLlmEngine {
    pub fn new(
        name: impl Into<String>,
        api_key: &str,
        api_base_url: &str,
        model_name: impl Into<String>,
    ) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base_url);

        Self {
            name: name.into(),
            client: Client::with_config(openai_config),
            model_name: model_name.into(),
        }
    }

    fn instruction(mode: RecognitionMode) -> &'static str {
        match mode {
            RecognitionMode::Text => "识别图片中的全部文字，保持原有换行。",
            RecognitionMode::Formula => {
                "把图片中的数学公式转写为 LaTeX，不要包含 $ 定界符。"
            }
        }
    }

    fn build_messages(
        &self,
        image_url: String,
        mode: RecognitionMode,
    ) -> Result<Vec<ChatCompletionRequestMessage>, EngineError> {
        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_PROMPT)
            .build()
            .map_err(|e| EngineError::malformed(&self.name, e))?;

        let content_parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: Self::instruction(mode).to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: image_url,
                        detail: Some(ImageDetail::Auto),
                    },
                },
            ),
        ];

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(|e| EngineError::malformed(&self.name, e))?;

        Ok(vec![
            ChatCompletionRequestMessage::System(system_msg),
            ChatCompletionRequestMessage::User(user_msg),
        ])
    }
}

/// 解析模型回复，容忍 ```json 代码块包裹
fn parse_reply(engine: &str, raw: &str) -> Result<EngineOutput, EngineError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let reply: VisionReply =
        serde_json::from_str(body).map_err(|e| EngineError::malformed(engine, e))?;
    Ok(EngineOutput::new(
        reply.content.trim(),
        reply.confidence.clamp(0.0, 1.0),
    ))
}

#[async_trait]
impl RecognitionEngine for VisionLlmEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, request: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError> {
        let image_url = image_source(&self.name, request.image).await?;
        let messages = self.build_messages(image_url, request.mode)?;

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.0)
            .max_tokens(1024u32)
            .build()
            .map_err(|e| EngineError::malformed(&self.name, e))?;

        debug!("调用视觉模型 {}", self.model_name);
        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| EngineError::unavailable(&self.name, e))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| EngineError::malformed(&self.name, "模型返回内容为空"))?;

        parse_reply(&self.name, &content)
    }
}
