//! 对话窗口
//!
//! 保留最近 N 轮（query, response），超出时淘汰最旧的一轮（FIFO）。
//! 规划阶段只读快照；响应定稿后由 Orchestrator 追加一次。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 发给 LLM 的单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 一轮对话
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub query: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 有界对话窗口
#[derive(Clone, Debug)]
pub struct ConversationWindow {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl ConversationWindow {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    /// 从已有记录恢复，只保留最近 max_turns 轮
    pub fn from_turns(turns: impl IntoIterator<Item = Turn>, max_turns: usize) -> Self {
        let mut window = Self::new(max_turns);
        for turn in turns {
            window.push(turn);
        }
        window
    }

    pub fn push(&mut self, turn: Turn) {
        if self.max_turns == 0 {
            return;
        }
        while self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// 快照（从旧到新）
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    /// 最近 n 轮（从旧到新）
    pub fn recent(&self, n: usize) -> Vec<Turn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// 展开为 user/assistant 消息序列
    pub fn to_messages(&self) -> Vec<Message> {
        self.turns
            .iter()
            .flat_map(|t| [Message::user(t.query.clone()), Message::assistant(t.response.clone())])
            .collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn capacity(&self) -> usize {
        self.max_turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
