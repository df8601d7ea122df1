//! 计划类型定义
//!
//! 定义计划步骤、步骤载荷、依赖关系等核心数据类型。
//! Planner 的输出是不可信输入：按带标签的变体反序列化，再经 PlanScheduler 校验后才会执行。

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::execution::chart::ChartType;
use crate::query::QueryDescriptor;

pub type StepId = String;

/// 步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Retrieval,
    Analysis,
    Visualization,
    Synthesis,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Retrieval => "retrieval",
            StepKind::Analysis => "analysis",
            StepKind::Visualization => "visualization",
            StepKind::Synthesis => "synthesis",
        }
    }
}

/// 数值分析操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOp {
    Sum,
    #[serde(alias = "average", alias = "avg")]
    Mean,
    Ratio,
    #[serde(alias = "ranking")]
    Rank,
    Correlation,
    /// 差值与百分比变化（第一个值相对第二个值）
    #[serde(alias = "pct_change", alias = "comparison")]
    Difference,
    #[serde(alias = "stats")]
    Statistics,
}

impl AnalysisOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisOp::Sum => "sum",
            AnalysisOp::Mean => "mean",
            AnalysisOp::Ratio => "ratio",
            AnalysisOp::Rank => "rank",
            AnalysisOp::Correlation => "correlation",
            AnalysisOp::Difference => "difference",
            AnalysisOp::Statistics => "statistics",
        }
    }
}

/// 分析描述：从来源步骤的结果集中取列并计算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AnalysisSpec {
    pub operation: AnalysisOp,
    /// 主数值列
    pub column: String,
    /// correlation 的第二列
    #[serde(default)]
    pub second_column: Option<String>,
    /// 用于给数值命名的标签列（如 Symbol）
    #[serde(default)]
    pub label_column: Option<String>,
    /// 来源步骤；为空时取全部依赖（按声明顺序）
    #[serde(default, deserialize_with = "de_step_ids")]
    #[schemars(with = "Vec<String>")]
    pub sources: Vec<StepId>,
}

impl AnalysisSpec {
    pub fn new(operation: AnalysisOp, column: impl Into<String>) -> Self {
        Self {
            operation,
            column: column.into(),
            second_column: None,
            label_column: None,
            sources: Vec::new(),
        }
    }

    pub fn with_label(mut self, label_column: impl Into<String>) -> Self {
        self.label_column = Some(label_column.into());
        self
    }

    pub fn with_second_column(mut self, column: impl Into<String>) -> Self {
        self.second_column = Some(column.into());
        self
    }
}

/// 图表请求：类型可选，缺省时按数据推断
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChartRequest {
    #[serde(default)]
    pub chart_type: Option<ChartType>,
    #[serde(default)]
    pub title: Option<String>,
}

/// 合成描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SynthesisSpec {
    /// 额外的表述要求（交给 LLM 合成器）
    #[serde(default)]
    pub instructions: Option<String>,
    /// 需要向用户澄清的问题；非空时输出澄清请求
    #[serde(default)]
    pub clarifications: Vec<String>,
}

/// 步骤载荷（按 kind 打标签）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepPayload {
    Retrieval { query: QueryDescriptor },
    Analysis { analysis: AnalysisSpec },
    Visualization {
        #[serde(default)]
        chart: ChartRequest,
    },
    Synthesis {
        #[serde(default)]
        synthesis: SynthesisSpec,
    },
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanStep {
    #[serde(deserialize_with = "de_step_id")]
    #[schemars(with = "String")]
    pub id: StepId,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "dependencies", deserialize_with = "de_step_ids")]
    #[schemars(with = "Vec<String>")]
    pub depends_on: Vec<StepId>,
    #[serde(flatten)]
    pub payload: StepPayload,
}

impl PlanStep {
    pub fn retrieval(id: impl Into<StepId>, query: QueryDescriptor) -> Self {
        Self::new(id, StepPayload::Retrieval { query })
    }

    pub fn analysis(id: impl Into<StepId>, analysis: AnalysisSpec) -> Self {
        Self::new(id, StepPayload::Analysis { analysis })
    }

    pub fn visualization(id: impl Into<StepId>, chart: ChartRequest) -> Self {
        Self::new(id, StepPayload::Visualization { chart })
    }

    pub fn synthesis(id: impl Into<StepId>) -> Self {
        Self::new(
            id,
            StepPayload::Synthesis {
                synthesis: SynthesisSpec::default(),
            },
        )
    }

    fn new(id: impl Into<StepId>, payload: StepPayload) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            depends_on: Vec::new(),
            payload,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn kind(&self) -> StepKind {
        match self.payload {
            StepPayload::Retrieval { .. } => StepKind::Retrieval,
            StepPayload::Analysis { .. } => StepKind::Analysis,
            StepPayload::Visualization { .. } => StepKind::Visualization,
            StepPayload::Synthesis { .. } => StepKind::Synthesis,
        }
    }
}

/// 一次请求的候选计划（调度前）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn has_synthesis(&self) -> bool {
        self.steps.iter().any(|s| s.kind() == StepKind::Synthesis)
    }

    /// 没有合成步骤时追加一个，依赖所有汇点步骤（无下游的步骤）
    pub fn ensure_synthesis(&mut self) {
        if self.has_synthesis() {
            return;
        }
        let sinks: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| !self.steps.iter().any(|o| o.depends_on.contains(&s.id)))
            .map(|s| s.id.clone())
            .collect();

        let mut id = "synthesize".to_string();
        let mut n = 1;
        while self.steps.iter().any(|s| s.id == id) {
            n += 1;
            id = format!("synthesize_{n}");
        }
        self.steps.push(
            PlanStep::synthesis(id)
                .depends_on(sinks)
                .describe("Combine results and generate response"),
        );
    }
}

/// 计划结构错误（执行前拒绝，不重试）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Plan contains no steps")]
    EmptyPlan,

    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("Step '{step}' depends on undeclared step '{dependency}'")]
    DanglingDependency { step: StepId, dependency: StepId },

    #[error("Step '{step}' reads source '{source_step}' that is not one of its dependencies")]
    UndeclaredSource { step: StepId, source_step: StepId },

    #[error("Cyclic plan: {}", .0.join(" -> "))]
    CyclicPlan(Vec<StepId>),

    #[error("Step '{step}' depends on synthesis step '{synthesis}'")]
    SynthesisNotTerminal { step: StepId, synthesis: StepId },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StepIdRepr {
    Text(String),
    Number(u64),
}

impl From<StepIdRepr> for StepId {
    fn from(repr: StepIdRepr) -> Self {
        match repr {
            StepIdRepr::Text(s) => s,
            StepIdRepr::Number(n) => n.to_string(),
        }
    }
}

/// Planner 常把步骤 id 写成整数，统一成字符串
fn de_step_id<'de, D: Deserializer<'de>>(d: D) -> Result<StepId, D::Error> {
    StepIdRepr::deserialize(d).map(Into::into)
}

fn de_step_ids<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<StepId>, D::Error> {
    let ids = Vec::<StepIdRepr>::deserialize(d)?;
    Ok(ids.into_iter().map(Into::into).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_tagged_steps() {
        let raw = r#"[
            {"id": 1, "kind": "retrieval", "description": "get revenue",
             "query": {"table": "sp500_companies", "columns": ["Symbol", "Revenue"]}},
            {"id": 2, "kind": "analysis", "dependencies": [1],
             "analysis": {"operation": "pct_change", "column": "Revenue"}},
            {"id": "3", "kind": "synthesis", "depends_on": ["2"]}
        ]"#;
        let steps: Vec<PlanStep> = serde_json::from_str(raw).unwrap();
        assert_eq!(steps[0].id, "1");
        assert_eq!(steps[0].kind(), StepKind::Retrieval);
        assert_eq!(steps[1].depends_on, vec!["1"]);
        assert!(matches!(
            &steps[1].payload,
            StepPayload::Analysis { analysis } if analysis.operation == AnalysisOp::Difference
        ));
        assert_eq!(steps[2].kind(), StepKind::Synthesis);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let raw = r#"{"id": "x", "kind": "delete", "query": {"table": "t"}}"#;
        assert!(serde_json::from_str::<PlanStep>(raw).is_err());
    }

    #[test]
    fn test_ensure_synthesis_depends_on_sinks() {
        let mut plan = ExecutionPlan::new(vec![
            PlanStep::retrieval("a", QueryDescriptor::new("t")),
            PlanStep::analysis("b", AnalysisSpec::new(AnalysisOp::Sum, "x")).depends_on(["a"]),
            PlanStep::visualization("c", ChartRequest::default()).depends_on(["a"]),
            PlanStep::retrieval("synthesize", QueryDescriptor::new("t")),
        ]);
        plan.ensure_synthesis();
        let last = plan.steps.last().unwrap();
        assert_eq!(last.id, "synthesize_2");
        assert_eq!(last.depends_on, vec!["b", "c", "synthesize"]);

        let before = plan.steps.len();
        plan.ensure_synthesis();
        assert_eq!(plan.steps.len(), before);
    }
}
