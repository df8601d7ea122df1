//! 意图抽取
//!
//! extract(query, 对话窗口, 目录名) -> (intent, entities, ambiguities)。
//! LLM 回复解析失败时降级为 unclear，由 Orchestrator 走澄清路径。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::extract_json;
use crate::catalog::SchemaCatalog;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{Message, Turn};

/// 识别出的查询意图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Lookup,
    Comparison,
    Aggregation,
    Ranking,
    Trend,
    Correlation,
    Filter,
    Visualization,
    Unclear,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Lookup => "lookup",
            Intent::Comparison => "comparison",
            Intent::Aggregation => "aggregation",
            Intent::Ranking => "ranking",
            Intent::Trend => "trend",
            Intent::Correlation => "correlation",
            Intent::Filter => "filter",
            Intent::Visualization => "visualization",
            Intent::Unclear => "unclear",
        }
    }

    /// 未知字符串视为 unclear
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "lookup" => Intent::Lookup,
            "comparison" | "compare" => Intent::Comparison,
            "aggregation" | "aggregate" => Intent::Aggregation,
            "ranking" | "rank" => Intent::Ranking,
            "trend" | "trend_analysis" => Intent::Trend,
            "correlation" => Intent::Correlation,
            "filter" | "filtering" => Intent::Filter,
            "visualization" | "visualize" => Intent::Visualization,
            _ => Intent::Unclear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent: Intent,
    pub entities: Vec<String>,
    pub ambiguities: Vec<String>,
}

impl IntentAnalysis {
    pub fn unclear(reason: impl Into<String>) -> Self {
        Self {
            intent: Intent::Unclear,
            entities: Vec::new(),
            ambiguities: vec![reason.into()],
        }
    }

    /// 需要向用户澄清
    pub fn needs_clarification(&self) -> bool {
        self.intent == Intent::Unclear || !self.ambiguities.is_empty()
    }
}

#[async_trait]
pub trait IntentExtractor: Send + Sync {
    async fn extract(
        &self,
        query: &str,
        conversation: &[Turn],
        schema_names: &[String],
    ) -> Result<IntentAnalysis, AgentError>;
}

/// LLM 意图抽取：提示中带目录描述与最近 3 轮对话
pub struct LlmIntentExtractor {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<SchemaCatalog>,
}

const CONTEXT_TURNS: usize = 3;

impl LlmIntentExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, catalog: Arc<SchemaCatalog>) -> Self {
        Self { llm, catalog }
    }

    fn build_prompt(&self, query: &str, conversation: &[Turn], schema_names: &[String]) -> String {
        let mut context = String::new();
        if !conversation.is_empty() {
            context.push_str("Previous conversation:\n");
            let skip = conversation.len().saturating_sub(CONTEXT_TURNS);
            for turn in conversation.iter().skip(skip) {
                context.push_str(&format!("user: {}\nassistant: {}\n", turn.query, turn.response));
            }
            context.push('\n');
        }

        format!(
            r#"You are an expert at understanding user questions about a tabular dataset.

DATABASE SCHEMA:
{schema}

Known fields: {names}

{context}USER QUERY: {query}

Classify the intent as one of: lookup, comparison, aggregation, ranking, trend, correlation, filter, visualization, unclear.
List the entities mentioned (company symbols or names, sectors, column names).
List ambiguities only if the question cannot be answered without more information.

Respond with JSON only:
{{"intent": "...", "entities": ["..."], "ambiguities": ["..."]}}"#,
            schema = self.catalog.describe_for_llm(),
            names = schema_names.join(", "),
        )
    }
}

#[derive(Deserialize)]
struct RawIntent {
    intent: String,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    ambiguities: Vec<String>,
}

/// 解析 LLM 回复；失败时返回 unclear
pub fn parse_intent_response(output: &str) -> IntentAnalysis {
    let parsed = extract_json(output).and_then(|json| serde_json::from_str::<RawIntent>(json).ok());
    match parsed {
        Some(raw) => IntentAnalysis {
            intent: Intent::parse(&raw.intent),
            entities: raw.entities,
            ambiguities: raw.ambiguities.into_iter().filter(|a| !a.trim().is_empty()).collect(),
        },
        None => {
            tracing::warn!("Failed to parse intent response");
            IntentAnalysis::unclear("Failed to understand query")
        }
    }
}

#[async_trait]
impl IntentExtractor for LlmIntentExtractor {
    async fn extract(
        &self,
        query: &str,
        conversation: &[Turn],
        schema_names: &[String],
    ) -> Result<IntentAnalysis, AgentError> {
        let messages = vec![
            Message::system("You classify analytical questions. Respond with JSON only."),
            Message::user(self.build_prompt(query, conversation, schema_names)),
        ];
        let reply = self.llm.complete_json(&messages).await?;
        let analysis = parse_intent_response(&reply);
        tracing::info!(intent = analysis.intent.as_str(), entities = ?analysis.entities, "Intent detected");
        Ok(analysis)
    }
}

/// 关键词规则匹配（不调用 LLM）：离线运行或配合固定计划使用
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleIntentExtractor;

impl RuleIntentExtractor {
    pub fn new() -> Self {
        Self
    }

    fn classify(query: &str) -> Intent {
        let q = query.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| q.contains(w));
        if has(&["chart", "plot", "graph", "visualize", "visualise"]) {
            Intent::Visualization
        } else if has(&["correlat", "relationship between"]) {
            Intent::Correlation
        } else if has(&["compare", " vs ", "versus", "difference between"]) {
            Intent::Comparison
        } else if has(&["top ", "highest", "lowest", "largest", "smallest", "rank"]) {
            Intent::Ranking
        } else if has(&["average", "total", "sum of", "how many", "count", "mean"]) {
            Intent::Aggregation
        } else if has(&["trend", "over time", "since", "history"]) {
            Intent::Trend
        } else if has(&["where", "with ", "above", "below", "greater than", "less than"]) {
            Intent::Filter
        } else {
            Intent::Lookup
        }
    }
}

#[async_trait]
impl IntentExtractor for RuleIntentExtractor {
    async fn extract(
        &self,
        query: &str,
        _conversation: &[Turn],
        schema_names: &[String],
    ) -> Result<IntentAnalysis, AgentError> {
        if query.trim().is_empty() {
            return Ok(IntentAnalysis::unclear("The question is empty"));
        }
        let mut entities: Vec<String> = Vec::new();
        for word in query.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '.') {
            // 形如 AAPL、MSFT 的代码
            let is_ticker = (2..=5).contains(&word.len())
                && word.chars().all(|c| c.is_ascii_uppercase() || c == '.');
            if is_ticker && !entities.iter().any(|e| e == word) {
                entities.push(word.to_string());
            }
        }
        let lowered = query.to_lowercase();
        for name in schema_names {
            let column = name.rsplit('.').next().unwrap_or(name);
            let spoken = column.replace('_', " ").to_lowercase();
            if lowered.contains(&spoken) && !entities.iter().any(|e| e == column) {
                entities.push(column.to_string());
            }
        }
        Ok(IntentAnalysis {
            intent: Self::classify(query),
            entities,
            ambiguities: Vec::new(),
        })
    }
}
