//! async_openai 封装：任意 OpenAI 兼容端点（OpenAI、DeepSeek、自建代理）
//!
//! 温度固定为 0；JSON 模式请求 `response_format = json_object`，供意图抽取与规划使用。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiClient {
    /// `api_key` 缺省读取 `OPENAI_API_KEY`；都没有时仍可构造，调用时由端点返回鉴权错误
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        if key.is_none() {
            tracing::warn!("No API key configured for model {}", model);
        }

        let mut config = OpenAIConfig::new().with_api_key(key.unwrap_or_default());
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message], json_mode: bool) -> Result<String, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(convert_messages(messages)?)
            .temperature(0.0);
        if json_mode {
            args.response_format(ResponseFormat::JsonObject);
        }
        let request = args
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let started = std::time::Instant::now();
        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                elapsed_ms = started.elapsed().as_millis() as u64,
                json_mode,
                "LLM call finished"
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

fn convert_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidRequest(e.to_string());
    messages
        .iter()
        .map(|m| {
            let content = m.content.clone();
            Ok(match m.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(invalid)?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(invalid)?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(invalid)?
                    .into(),
            })
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.chat(messages, false).await
    }

    async fn complete_json(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.chat(messages, true).await
    }
}
