//! 会话注册表
//!
//! 每个会话持有自己的对话窗口；首次请求时创建，空闲超过 session_timeout 后回收。
//! 配置了 sessions_dir 时，窗口在创建时加载、在每轮结束后保存为 JSON。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::memory::{ConversationPersistence, ConversationWindow, Turn};

pub type SessionId = String;

/// 单个会话
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub window: ConversationWindow,
    pub last_active: Instant,
    pub created_at: Instant,
}

impl Session {
    pub fn new(id: SessionId, window: ConversationWindow) -> Self {
        Self {
            id,
            window,
            last_active: Instant::now(),
            created_at: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    max_turns: usize,
    session_timeout: Duration,
    persist_dir: Option<PathBuf>,
}

impl SessionRegistry {
    pub fn new(max_turns: usize, session_timeout_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
            session_timeout: Duration::from_secs(session_timeout_secs),
            persist_dir: None,
        }
    }

    /// 对话窗口持久化目录（每个会话一个 `<id>.json`）
    pub fn with_persistence(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    fn persistence(&self, id: &str) -> Option<ConversationPersistence> {
        let dir = self.persist_dir.as_ref()?;
        let file: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Some(ConversationPersistence::new(dir.join(format!("{file}.json"))))
    }

    /// 在阻塞线程池写盘；调用方持有会话锁以保证同一会话的写入顺序
    async fn persist(&self, id: &str, window: &ConversationWindow) {
        let Some(p) = self.persistence(id) else {
            return;
        };
        let window = window.clone();
        let result = tokio::task::spawn_blocking(move || p.save(&window)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to persist conversation for {}: {}", id, e),
            Err(e) => tracing::warn!("Persistence task for {} aborted: {}", id, e),
        }
    }

    /// 获取或创建会话；未给出 id 时生成新 id
    pub async fn get_or_create(&self, session_id: Option<&str>) -> (SessionId, SessionHandle) {
        if let Some(id) = session_id {
            if let Some(handle) = self.sessions.read().await.get(id) {
                handle.lock().await.touch();
                return (id.to_string(), handle.clone());
            }
        }

        let id = session_id
            .map(String::from)
            .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4()));

        let mut sessions = self.sessions.write().await;
        // 双检：等待写锁期间可能已被其他请求创建
        if let Some(handle) = sessions.get(&id) {
            handle.lock().await.touch();
            return (id, handle.clone());
        }

        let window = match self.persistence(&id) {
            Some(p) => p.load(self.max_turns).unwrap_or_else(|e| {
                tracing::warn!("Failed to load conversation for {}: {}", id, e);
                ConversationWindow::new(self.max_turns)
            }),
            None => ConversationWindow::new(self.max_turns),
        };
        tracing::info!(session = %id, turns = window.len(), "Session created");
        let handle = Arc::new(Mutex::new(Session::new(id.clone(), window)));
        sessions.insert(id.clone(), handle.clone());
        (id, handle)
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// 追加一轮对话（响应确定后调用一次）并按需保存
    pub async fn append_turn(&self, handle: &SessionHandle, turn: Turn) {
        let mut session = handle.lock().await;
        session.window.push(turn);
        session.touch();
        self.persist(&session.id, &session.window).await;
    }

    /// 清空会话的对话窗口；会话不存在时返回 false
    pub async fn reset(&self, session_id: &str) -> bool {
        let Some(handle) = self.get(session_id).await else {
            return false;
        };
        let mut session = handle.lock().await;
        session.window.clear();
        session.touch();
        self.persist(session_id, &session.window).await;
        true
    }

    /// 回收空闲超时的会话，返回回收数量
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();
        for (id, handle) in sessions.iter() {
            // 进行中的请求持有句柄副本，跳过
            if Arc::strong_count(handle) > 1 {
                continue;
            }
            if let Ok(session) = handle.try_lock() {
                if session.is_expired(self.session_timeout) {
                    expired.push(id.clone());
                }
            }
        }
        for id in &expired {
            sessions.remove(id);
            tracing::info!(session = %id, "Session expired");
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let registry = SessionRegistry::new(3, 3600);
        let (id, _) = registry.get_or_create(None).await;
        assert!(id.starts_with("session_"));
        let (again, _) = registry.get_or_create(Some(&id)).await;
        assert_eq!(again, id);
        let (named, _) = registry.get_or_create(Some("alice")).await;
        assert_eq!(named, "alice");
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_append_and_reset() {
        let registry = SessionRegistry::new(2, 3600);
        let (id, handle) = registry.get_or_create(Some("s")).await;
        for i in 0..3 {
            registry.append_turn(&handle, Turn::new(format!("q{i}"), "a")).await;
        }
        let turns = handle.lock().await.window.snapshot();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].query, "q1");

        assert!(registry.reset(&id).await);
        assert!(handle.lock().await.window.is_empty());
        assert!(!registry.reset("missing").await);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let registry = SessionRegistry::new(2, 0);
        registry.get_or_create(Some("old")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.cleanup_expired().await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_skips_session_with_request_in_flight() {
        let registry = SessionRegistry::new(2, 0);
        let (_, in_flight) = registry.get_or_create(Some("busy")).await;
        registry.get_or_create(Some("idle")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(registry.cleanup_expired().await, 1);
        assert!(registry.get("busy").await.is_some());
        assert!(registry.get("idle").await.is_none());

        drop(in_flight);
        assert_eq!(registry.cleanup_expired().await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reset_persists_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(5, 3600).with_persistence(dir.path());
        let (_, handle) = registry.get_or_create(Some("carol")).await;
        registry.append_turn(&handle, Turn::new("q", "a")).await;
        assert!(registry.reset("carol").await);

        let saved = std::fs::read_to_string(dir.path().join("carol.json")).unwrap();
        let turns: Vec<Turn> = serde_json::from_str(&saved).unwrap();
        assert!(turns.is_empty());
    }

    #[tokio::test]
    async fn test_window_persisted_across_registries() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(5, 3600).with_persistence(dir.path());
        let (_, handle) = registry.get_or_create(Some("bob")).await;
        registry.append_turn(&handle, Turn::new("Top 5 by revenue?", "...")).await;

        let reopened = SessionRegistry::new(5, 3600).with_persistence(dir.path());
        let (_, handle) = reopened.get_or_create(Some("bob")).await;
        assert_eq!(handle.lock().await.window.snapshot()[0].query, "Top 5 by revenue?");
    }
}
