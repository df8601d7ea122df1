//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient；意图抽取、规划与合成只依赖这个 trait。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Empty response")]
    EmptyResponse,
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 要求端点只返回 JSON 对象；不支持 JSON 模式的后端退化为普通完成
    async fn complete_json(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.complete(messages).await
    }
}
