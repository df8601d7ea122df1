//! 步骤结果与失败分类
//!
//! StepResult 一经写入 ExecutionState 即不可变；下游步骤只读引用。

use serde::{Deserialize, Serialize};

use crate::data::RowSet;
use crate::execution::analysis::AnalysisOutput;
use crate::execution::chart::ChartSpec;
use crate::plan::{PlanError, StepId, StepKind};
use crate::query::QueryRejection;

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 未知表 / 列、操作不允许、类型不符
    SchemaViolation,
    /// 悬空依赖、环等计划结构问题
    PlanStructure,
    /// 前置步骤失败或被跳过
    DependencyUnavailable,
    /// 数据源暂时性故障（连接、忙）
    TransientExecution,
    /// 数据源非暂时性错误
    DataSource,
    /// 分析 / 图表计算失败
    Computation,
    /// 合成无法给出可信回答
    SynthesisFault,
    /// 单步超时
    Timeout,
}

impl FailureKind {
    /// 只有暂时性故障允许重试
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::TransientExecution | FailureKind::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SchemaViolation => "schema_violation",
            FailureKind::PlanStructure => "plan_structure",
            FailureKind::DependencyUnavailable => "dependency_unavailable",
            FailureKind::TransientExecution => "transient_execution",
            FailureKind::DataSource => "data_source",
            FailureKind::Computation => "computation",
            FailureKind::SynthesisFault => "synthesis_fault",
            FailureKind::Timeout => "timeout",
        }
    }
}

/// 带类型的失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl From<QueryRejection> for StepFailure {
    fn from(err: QueryRejection) -> Self {
        StepFailure::new(FailureKind::SchemaViolation, err.to_string())
    }
}

impl From<PlanError> for StepFailure {
    fn from(err: PlanError) -> Self {
        StepFailure::new(FailureKind::PlanStructure, err.to_string())
    }
}

impl From<crate::data::DataSourceError> for StepFailure {
    fn from(err: crate::data::DataSourceError) -> Self {
        use crate::data::DataSourceError;
        let kind = match &err {
            DataSourceError::Timeout => FailureKind::Timeout,
            DataSourceError::Transient(_) => FailureKind::TransientExecution,
            DataSourceError::Query(_) | DataSourceError::Unavailable(_) => FailureKind::DataSource,
        };
        StepFailure::new(kind, err.to_string())
    }
}

/// 成功载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutput {
    Rows(RowSet),
    Analysis(AnalysisOutput),
    Chart(ChartSpec),
    Text { text: String },
}

impl StepOutput {
    pub fn rows(&self) -> Option<&RowSet> {
        match self {
            StepOutput::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            StepOutput::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn chart(&self) -> Option<&ChartSpec> {
        match self {
            StepOutput::Chart(chart) => Some(chart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { output: StepOutput },
    Failed { failure: StepFailure },
}

/// 单步的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub kind: StepKind,
    /// 实际执行次数（依赖不可用时为 0）
    pub attempts: u32,
    pub outcome: StepOutcome,
}

impl StepResult {
    pub fn success(step_id: impl Into<StepId>, kind: StepKind, attempts: u32, output: StepOutput) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            attempts,
            outcome: StepOutcome::Success { output },
        }
    }

    pub fn failed(step_id: impl Into<StepId>, kind: StepKind, attempts: u32, failure: StepFailure) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            attempts,
            outcome: StepOutcome::Failed { failure },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success { .. })
    }

    pub fn output(&self) -> Option<&StepOutput> {
        match &self.outcome {
            StepOutcome::Success { output } => Some(output),
            StepOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        match &self.outcome {
            StepOutcome::Success { .. } => None,
            StepOutcome::Failed { failure } => Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSourceError;

    #[test]
    fn test_data_source_error_classification() {
        let f: StepFailure = DataSourceError::Transient("busy".into()).into();
        assert!(f.kind.is_transient());
        let f: StepFailure = DataSourceError::Timeout.into();
        assert_eq!(f.kind, FailureKind::Timeout);
        let f: StepFailure = DataSourceError::Query("syntax".into()).into();
        assert!(!f.kind.is_transient());
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let r = StepResult::failed(
            "chart",
            StepKind::Visualization,
            1,
            StepFailure::new(FailureKind::Computation, "no numeric column"),
        );
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["failure"]["kind"], "computation");
        assert!(!r.is_success());
    }
}
