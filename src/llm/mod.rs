//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, LlmError};

use crate::config::LlmSection;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 按配置创建客户端
///
/// - `deepseek`：优先 `DEEPSEEK_API_KEY`，base_url 缺省为 DeepSeek 官方端点
/// - `mock`：离线回放，不访问网络
/// - 其余按 OpenAI 兼容端点处理（`OPENAI_API_KEY`）
pub fn create_llm_client(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    match cfg.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::info!("Using mock LLM client");
            Arc::new(MockLlmClient::new())
        }
        "deepseek" => {
            let model = (!cfg.model.is_empty()).then_some(cfg.model.as_str());
            Arc::new(create_deepseek_client(cfg.base_url.as_deref(), model).with_timeout(timeout))
        }
        other => {
            if other != "openai" {
                tracing::warn!("Unknown LLM provider '{}', treating as OpenAI-compatible", other);
            }
            tracing::info!("Using OpenAI-compatible model {}", cfg.model);
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, None).with_timeout(timeout))
        }
    }
}

/// 创建 DeepSeek 客户端（OpenAI 兼容格式）
///
/// 优先使用 `DEEPSEEK_API_KEY`；模型缺省取 `DEEPSEEK_MODEL`，再缺省为 deepseek-chat
pub fn create_deepseek_client(base_url: Option<&str>, model: Option<&str>) -> OpenAiClient {
    let api_key = std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
    tracing::info!("Using DeepSeek model {}", model);
    OpenAiClient::new(Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)), &model, api_key.as_deref())
}
