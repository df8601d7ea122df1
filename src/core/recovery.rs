//! 错误恢复引擎
//!
//! 重试与关键性策略集中在这里：只有暂时性失败（超时、连接）在次数上限内重试；
//! 校验失败与依赖失败从不重试。检索步骤失败且被合成步骤（传递地）依赖时整个请求失败。

use crate::core::RecoveryAction;
use crate::execution::FailureKind;
use crate::plan::StepKind;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryEngine {
    max_retries: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl RecoveryEngine {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 一次尝试失败后的动作；`failures` 为该步骤累计失败次数（含本次）
    pub fn handle(&self, kind: FailureKind, failures: u32) -> RecoveryAction {
        match kind {
            k if k.is_transient() && failures <= self.max_retries => RecoveryAction::Retry,
            FailureKind::DependencyUnavailable => RecoveryAction::Skip,
            _ => RecoveryAction::Degrade,
        }
    }

    /// 步骤最终失败对整个请求的影响
    pub fn settle(&self, step_kind: StepKind, feeds_synthesis: bool) -> RecoveryAction {
        match step_kind {
            StepKind::Retrieval if feeds_synthesis => RecoveryAction::Abort,
            _ => RecoveryAction::Degrade,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_retried_within_bound() {
        let engine = RecoveryEngine::default();
        assert_eq!(engine.handle(FailureKind::TransientExecution, 1), RecoveryAction::Retry);
        assert_eq!(engine.handle(FailureKind::Timeout, 1), RecoveryAction::Retry);
        assert_eq!(engine.handle(FailureKind::TransientExecution, 2), RecoveryAction::Degrade);
    }

    #[test]
    fn test_validation_and_dependency_never_retried() {
        let engine = RecoveryEngine::new(5);
        assert_eq!(engine.handle(FailureKind::SchemaViolation, 1), RecoveryAction::Degrade);
        assert_eq!(engine.handle(FailureKind::DependencyUnavailable, 1), RecoveryAction::Skip);
        assert_eq!(engine.handle(FailureKind::DataSource, 1), RecoveryAction::Degrade);
    }

    #[test]
    fn test_settle_criticality() {
        let engine = RecoveryEngine::default();
        assert_eq!(engine.settle(StepKind::Retrieval, true), RecoveryAction::Abort);
        assert_eq!(engine.settle(StepKind::Retrieval, false), RecoveryAction::Degrade);
        assert_eq!(engine.settle(StepKind::Visualization, true), RecoveryAction::Degrade);
    }
}
