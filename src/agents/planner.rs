//! 计划生成
//!
//! plan(intent, entities, schema) -> ExecutionPlan。LLM 的回复按带标签的步骤结构反序列化，
//! 既接受 `{"steps": [...]}` 也接受裸数组；JSON 格式错误时带着错误提示重试一次。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::agents::extract_json;
use crate::agents::intent::IntentAnalysis;
use crate::catalog::SchemaCatalog;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::plan::{plan_schema_json, ExecutionPlan, PlanStep};

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        query: &str,
        analysis: &IntentAnalysis,
        catalog: &SchemaCatalog,
    ) -> Result<ExecutionPlan, AgentError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanRepr {
    Wrapped { steps: Vec<PlanStep> },
    Bare(Vec<PlanStep>),
}

/// 解析 planner 回复为候选计划（尚未校验）
pub fn parse_plan_response(output: &str) -> Result<ExecutionPlan, AgentError> {
    let json = extract_json(output)
        .ok_or_else(|| AgentError::JsonParseError("no JSON found in planner reply".to_string()))?;
    // 先按对象解析，保留具体的字段错误信息
    let repr = match serde_json::from_str::<PlanRepr>(json) {
        Ok(repr) => repr,
        Err(_) => {
            let detail = if json.trim_start().starts_with('[') {
                serde_json::from_str::<Vec<PlanStep>>(json).err()
            } else {
                serde_json::from_str::<ExecutionPlan>(json).err()
            };
            return Err(AgentError::JsonParseError(
                detail.map(|e| e.to_string()).unwrap_or_else(|| "invalid plan".to_string()),
            ));
        }
    };
    Ok(match repr {
        PlanRepr::Wrapped { steps } | PlanRepr::Bare(steps) => ExecutionPlan::new(steps),
    })
}

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    max_attempts: usize,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm, max_attempts: 2 }
    }

    fn build_prompt(&self, query: &str, analysis: &IntentAnalysis, catalog: &SchemaCatalog) -> String {
        let entities = if analysis.entities.is_empty() {
            "none".to_string()
        } else {
            analysis.entities.join(", ")
        };
        format!(
            r#"You are an expert at creating execution plans for data questions.

DATABASE SCHEMA:
{schema}

USER QUERY: {query}
DETECTED INTENT: {intent}
ENTITIES MENTIONED: {entities}

Create a plan of typed steps. Each step has an "id", a "kind" and "depends_on" (ids of earlier steps):
- retrieval: "query" is a read-only query descriptor (table, columns, filters, aggregations, group_by, order_by, limit). Never write SQL.
- analysis: "analysis" names an operation (sum, mean, ratio, rank, correlation, difference, statistics), a numeric "column" and optional "label_column" / "second_column". It reads the results of its dependencies.
- visualization: "chart" with optional "chart_type" (bar, line, scatter, histogram) and "title".
- synthesis: the final step combining all results into the answer. Nothing may depend on it.

RULES:
1. Only use tables and columns from the schema above.
2. All arithmetic goes in analysis steps; never state computed numbers yourself.
3. Include a visualization step when the intent is visualization or the data benefits from a chart.

The plan must match this JSON Schema:
{plan_schema}

Example:
{{"steps": [
  {{"id": "fetch", "kind": "retrieval", "description": "Revenue of Apple and Microsoft",
    "query": {{"table": "sp500_companies", "columns": ["Symbol", "Revenue"],
              "filters": [{{"column": "Symbol", "op": "in", "value": ["AAPL", "MSFT"]}}]}}}},
  {{"id": "diff", "kind": "analysis", "depends_on": ["fetch"], "description": "Revenue difference",
    "analysis": {{"operation": "difference", "column": "Revenue", "label_column": "Symbol"}}}},
  {{"id": "answer", "kind": "synthesis", "depends_on": ["diff"], "description": "Explain the comparison"}}
]}}

Respond with JSON only."#,
            schema = catalog.describe_for_llm(),
            intent = analysis.intent.as_str(),
            plan_schema = plan_schema_json(),
        )
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        query: &str,
        analysis: &IntentAnalysis,
        catalog: &SchemaCatalog,
    ) -> Result<ExecutionPlan, AgentError> {
        let mut messages = vec![
            Message::system("You plan data analysis steps. Respond with JSON only."),
            Message::user(self.build_prompt(query, analysis, catalog)),
        ];

        let mut last_err = AgentError::PlannerError("planner produced no reply".to_string());
        for attempt in 1..=self.max_attempts {
            let reply = self.llm.complete_json(&messages).await?;
            match parse_plan_response(&reply) {
                Ok(plan) => {
                    tracing::info!(steps = plan.steps.len(), attempt, "Plan proposed");
                    return Ok(plan);
                }
                Err(AgentError::JsonParseError(raw)) => {
                    tracing::warn!("Planner reply not a valid plan (attempt {}): {}", attempt, raw);
                    messages.push(Message::assistant(reply));
                    messages.push(Message::user(format!(
                        "The previous reply was not a valid plan: {raw}. Respond with a single JSON object {{\"steps\": [...]}} matching the schema, and nothing else."
                    )));
                    last_err = AgentError::JsonParseError(raw);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

/// 固定计划（从文件加载或测试注入），忽略意图
pub struct FixedPlanner {
    plan: ExecutionPlan,
}

impl FixedPlanner {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self { plan }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AgentError::PlannerError(format!("{}: {e}", path.as_ref().display())))?;
        Ok(Self::new(parse_plan_response(&raw)?))
    }
}

#[async_trait]
impl Planner for FixedPlanner {
    async fn plan(
        &self,
        _query: &str,
        _analysis: &IntentAnalysis,
        _catalog: &SchemaCatalog,
    ) -> Result<ExecutionPlan, AgentError> {
        Ok(self.plan.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::intent::Intent;
    use crate::catalog::sp500_catalog;
    use crate::llm::MockLlmClient;
    use crate::plan::StepKind;

    fn comparison() -> IntentAnalysis {
        IntentAnalysis {
            intent: Intent::Comparison,
            entities: vec!["AAPL".into(), "MSFT".into()],
            ambiguities: Vec::new(),
        }
    }

    const PLAN: &str = r#"```json
{"steps": [
  {"id": 1, "kind": "retrieval", "query": {"table": "sp500_companies", "columns": ["Symbol", "Revenue"]}},
  {"id": 2, "kind": "synthesis", "depends_on": [1]}
]}
```"#;

    #[test]
    fn test_parse_wrapped_and_bare() {
        let plan = parse_plan_response(PLAN).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].kind(), StepKind::Synthesis);

        let bare = parse_plan_response(r#"[{"id": "a", "kind": "synthesis"}]"#).unwrap();
        assert_eq!(bare.steps[0].id, "a");
    }

    #[test]
    fn test_free_form_sql_rejected() {
        let raw = r#"{"steps": [{"id": 1, "kind": "retrieval",
            "query": {"table": "sp500_companies", "sql": "DELETE FROM sp500_companies"}}]}"#;
        assert!(matches!(parse_plan_response(raw), Err(AgentError::JsonParseError(_))));
    }

    #[tokio::test]
    async fn test_llm_planner_retries_after_bad_json() {
        let llm = Arc::new(MockLlmClient::with_replies(["Sure! Step one: fetch data.", PLAN]));
        let planner = LlmPlanner::new(llm.clone());
        let plan = planner
            .plan("Compare AAPL and MSFT revenue", &comparison(), &sp500_catalog())
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(llm.prompts()[0].contains("ENTITIES MENTIONED: AAPL, MSFT"));
        assert!(llm.prompts()[1].contains("not a valid plan"));
    }

    #[tokio::test]
    async fn test_llm_planner_gives_up() {
        let llm = Arc::new(MockLlmClient::with_replies(["nope"]));
        let result = LlmPlanner::new(llm)
            .plan("q", &comparison(), &sp500_catalog())
            .await;
        assert!(matches!(result, Err(AgentError::JsonParseError(_))));
    }

    #[test]
    fn test_fixed_planner_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, PLAN).unwrap();
        assert!(FixedPlanner::from_json_file(&path).is_ok());
        assert!(FixedPlanner::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
