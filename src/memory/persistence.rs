//! 对话持久化
//!
//! 将对话窗口写入 / 从 JSON 文件加载，用于跨进程恢复会话（可选使用）。

use std::path::{Path, PathBuf};

use crate::memory::{ConversationWindow, Turn};

/// 单文件 JSON，每轮含 query + response + timestamp
#[derive(Debug)]
pub struct ConversationPersistence {
    path: PathBuf,
}

impl ConversationPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 从 JSON 文件加载对话窗口；文件不存在时返回空窗口
    pub fn load(&self, max_turns: usize) -> anyhow::Result<ConversationWindow> {
        if !self.path.exists() {
            return Ok(ConversationWindow::new(max_turns));
        }
        let data = std::fs::read_to_string(&self.path)?;
        let turns: Vec<Turn> = serde_json::from_str(&data)?;
        Ok(ConversationWindow::from_turns(turns, max_turns))
    }

    /// 将对话窗口写入 JSON 文件；父目录不存在时自动创建
    pub fn save(&self, window: &ConversationWindow) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&window.snapshot())?)?;
        Ok(())
    }
}
