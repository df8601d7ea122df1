//! 请求状态机
//!
//! RECEIVED → PLANNED → SCHEDULED → EXECUTING → SYNTHESIZING → DONE；
//! 任一非终态都可进入 FAILED。EXECUTING 可自转（每执行一步一次），不会回到 PLANNED。

use serde::Serialize;

/// 请求阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPhase {
    Received,
    Planned,
    Scheduled,
    Executing,
    Synthesizing,
    Done,
    Failed,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Received => "RECEIVED",
            RequestPhase::Planned => "PLANNED",
            RequestPhase::Scheduled => "SCHEDULED",
            RequestPhase::Executing => "EXECUTING",
            RequestPhase::Synthesizing => "SYNTHESIZING",
            RequestPhase::Done => "DONE",
            RequestPhase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestPhase::Done | RequestPhase::Failed)
    }

    /// 合法转移
    pub fn can_transition_to(&self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Received, Planned)
            | (Planned, Scheduled)
            | (Scheduled, Executing)
            | (Executing, Executing)
            | (Executing, Synthesizing)
            | (Synthesizing, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 非法转移（编排逻辑错误）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal phase transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RequestPhase,
    pub to: RequestPhase,
}

/// 单个请求的阶段跟踪，记录全部转移
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    phase: RequestPhase,
    history: Vec<RequestPhase>,
}

impl Default for RequestLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self {
            phase: RequestPhase::Received,
            history: vec![RequestPhase::Received],
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn history(&self) -> &[RequestPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: RequestPhase) -> Result<(), IllegalTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        if next != self.phase {
            tracing::info!("Request phase {} -> {}", self.phase, next);
        }
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    /// 进入 FAILED；已在终态时保持不变
    pub fn fail(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        tracing::warn!("Request failed in {}: {}", self.phase, reason);
        self.phase = RequestPhase::Failed;
        self.history.push(RequestPhase::Failed);
    }
}
