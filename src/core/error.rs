//! 错误类型与恢复动作
//!
//! AgentError 覆盖外部协作者（LLM、意图、规划）与装配阶段的错误；
//! 步骤级失败是 StepFailure 值，由 RecoveryEngine 映射为 RecoveryAction。

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Planner error: {0}")]
    PlannerError(String),

    #[error("Catalog error: {0}")]
    CatalogError(#[from] CatalogError),
}

/// 单步失败后的处理动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 再尝试一次
    Retry,
    /// 前置步骤不可用：不执行，记录跳过
    Skip,
    /// 非关键步骤失败：继续执行，最终回答附带说明
    Degrade,
    /// 无法给出可信回答：请求失败
    Abort,
}
