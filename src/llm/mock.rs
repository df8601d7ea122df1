//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 按顺序回放预设回复；回复用完后重复最后一条，没有预设时返回 unclear 意图。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

const DEFAULT_REPLY: &str =
    r#"{"intent": "unclear", "entities": [], "ambiguities": ["Offline mode: no language model configured"]}"#;

/// Mock 客户端：回放脚本，并记录收到的最后一条 User 消息
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// 收到过的 User 消息（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(last_user);
        }

        let mut replies = self
            .replies
            .lock()
            .map_err(|_| LlmError::ApiError("mock lock poisoned".to_string()))?;
        let mut last = self
            .last
            .lock()
            .map_err(|_| LlmError::ApiError("mock lock poisoned".to_string()))?;

        let reply = match replies.pop_front() {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last.clone().unwrap_or_else(|| DEFAULT_REPLY.to_string()),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order_then_repeats_last() {
        let mock = MockLlmClient::with_replies(["one", "two"]);
        let msgs = [Message::user("hi")];
        assert_eq!(mock.complete(&msgs).await.unwrap(), "one");
        assert_eq!(mock.complete(&msgs).await.unwrap(), "two");
        assert_eq!(mock.complete(&msgs).await.unwrap(), "two");
        assert_eq!(mock.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_default_reply_is_unclear_intent() {
        let reply = MockLlmClient::new().complete(&[]).await.unwrap();
        assert!(reply.contains("unclear"));
    }
}
