//! 最终回答合成
//!
//! TemplateSynthesizer 只复述已有结果，输出确定；LlmSynthesizer 负责措辞，
//! 但它提到的每个数字都必须出现在已有结果或用户问题中，否则视为 SynthesisFault。

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::data::rows::cell_to_string;
use crate::execution::result::StepOutput;
use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::plan::{StepId, StepKind};

const MAX_ROWS_SHOWN: usize = 10;

/// 整数 0..=10 常用于列表编号与 "top 5" 之类的措辞，不要求出现在结果中
const FREE_INTEGER_MAX: f64 = 10.0;

/// 合成可用的一条事实（某个成功步骤的输出）
#[derive(Debug, Clone)]
pub struct Fact {
    pub step_id: StepId,
    pub kind: StepKind,
    pub description: String,
    pub output: StepOutput,
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisContext {
    pub query: String,
    pub facts: Vec<Fact>,
    /// 未能完成的部分（降级说明）
    pub missing: Vec<String>,
    pub clarifications: Vec<String>,
    pub instructions: Option<String>,
}

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("No results available to answer the question")]
    NoFacts,

    #[error("Answer mentions figures not present in the results: {}", .0.join(", "))]
    Unfaithful(Vec<String>),

    #[error("LLM synthesis failed: {0}")]
    Llm(#[from] LlmError),
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, ctx: &SynthesisContext) -> Result<String, SynthesisError>;
}

/// 确定性模板合成
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateSynthesizer;

impl TemplateSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// 渲染回答；没有事实时给出降级说明
    pub fn render(&self, ctx: &SynthesisContext) -> String {
        if !ctx.clarifications.is_empty() {
            return clarification_text(&ctx.clarifications);
        }

        let mut out = if ctx.facts.is_empty() {
            "I could not produce an answer from the available data.".to_string()
        } else {
            render_facts(&ctx.facts)
        };

        if !ctx.missing.is_empty() {
            out.push_str("\n\nNote: some parts could not be completed:\n");
            for note in &ctx.missing {
                out.push_str(&format!("- {note}\n"));
            }
            out.truncate(out.trim_end().len());
        }
        out
    }
}

#[async_trait]
impl Synthesizer for TemplateSynthesizer {
    async fn synthesize(&self, ctx: &SynthesisContext) -> Result<String, SynthesisError> {
        if ctx.facts.is_empty() && ctx.clarifications.is_empty() {
            return Err(SynthesisError::NoFacts);
        }
        Ok(self.render(ctx))
    }
}

pub fn clarification_text(questions: &[String]) -> String {
    let mut out = String::from("I need some clarification to answer your question accurately:\n");
    for (i, q) in questions.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, q));
    }
    out.push_str("\nCould you provide more details?");
    out
}

fn render_facts(facts: &[Fact]) -> String {
    facts
        .iter()
        .map(|fact| match &fact.output {
            StepOutput::Rows(rows) => {
                if rows.is_empty() {
                    return "No matching records were found.".to_string();
                }
                let mut text = format!("Found {} record(s):", rows.len());
                for row in rows.rows.iter().take(MAX_ROWS_SHOWN) {
                    let cells: Vec<String> = rows
                        .columns
                        .iter()
                        .zip(row)
                        .map(|(c, v)| format!("{c}: {}", cell_to_string(v)))
                        .collect();
                    text.push_str(&format!("\n- {}", cells.join(", ")));
                }
                if rows.len() > MAX_ROWS_SHOWN {
                    text.push_str(&format!("\n... and {} more", rows.len() - MAX_ROWS_SHOWN));
                }
                text
            }
            StepOutput::Analysis(analysis) => analysis.describe(),
            StepOutput::Chart(chart) => chart.describe(),
            StepOutput::Text { text } => text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?\d+(?:,\d{3})*(?:\.\d+)?").expect("number pattern is a valid regex")
});

fn parse_number(raw: &str) -> Option<(f64, usize)> {
    let cleaned = raw.replace(',', "");
    let decimals = cleaned.split_once('.').map(|(_, d)| d.len()).unwrap_or(0);
    cleaned.parse::<f64>().ok().map(|v| (v, decimals))
}

/// 文本中出现、但无法由 allowed 中任一数值（按相同小数位四舍五入）得到的数字
pub fn unsupported_numbers(text: &str, allowed: &str) -> Vec<String> {
    let known: Vec<f64> = NUMBER_RE
        .find_iter(allowed)
        .filter_map(|m| parse_number(m.as_str()).map(|(v, _)| v))
        .collect();

    let mut out = Vec::new();
    for m in NUMBER_RE.find_iter(text) {
        let Some((value, decimals)) = parse_number(m.as_str()) else {
            continue;
        };
        if value.fract() == 0.0 && (0.0..=FREE_INTEGER_MAX).contains(&value) {
            continue;
        }
        let scale = 10f64.powi(decimals as i32);
        let supported = known.iter().any(|k| {
            let rounded = (k * scale).round() / scale;
            (rounded - value).abs() < 1e-9 || (k.abs() - value.abs()).abs() < 1e-9
        });
        if !supported && !out.contains(&m.as_str().to_string()) {
            out.push(m.as_str().to_string());
        }
    }
    out
}

/// LLM 措辞 + 数字校验
pub struct LlmSynthesizer {
    llm: Arc<dyn LlmClient>,
    template: TemplateSynthesizer,
}

impl LlmSynthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            template: TemplateSynthesizer::new(),
        }
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(&self, ctx: &SynthesisContext) -> Result<String, SynthesisError> {
        if !ctx.clarifications.is_empty() {
            return Ok(clarification_text(&ctx.clarifications));
        }
        if ctx.facts.is_empty() {
            return Err(SynthesisError::NoFacts);
        }

        let facts = self.template.render(ctx);
        let mut prompt = format!(
            "USER QUESTION: {}\n\nRESULTS:\n{}\n\nWrite a concise answer to the question using only the results above. \
             Do not compute or invent any number; quote figures exactly as they appear.",
            ctx.query, facts
        );
        if let Some(instructions) = &ctx.instructions {
            prompt.push_str(&format!("\n\nAdditional instructions: {instructions}"));
        }

        let messages = vec![
            Message::system("You explain data analysis results faithfully."),
            Message::user(prompt),
        ];
        let answer = self.llm.complete(&messages).await?;

        let allowed = format!("{}\n{}", facts, ctx.query);
        let unsupported = unsupported_numbers(&answer, &allowed);
        if !unsupported.is_empty() {
            tracing::warn!(numbers = ?unsupported, "LLM answer mentions unsupported figures");
            return Err(SynthesisError::Unfaithful(unsupported));
        }
        Ok(answer.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RowSet;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn ctx() -> SynthesisContext {
        SynthesisContext {
            query: "Compare AAPL and MSFT revenue".into(),
            facts: vec![Fact {
                step_id: "fetch".into(),
                kind: StepKind::Retrieval,
                description: String::new(),
                output: StepOutput::Rows(RowSet::new(
                    vec!["Symbol".into(), "Revenue".into()],
                    vec![vec![json!("AAPL"), json!(394.0)], vec![json!("MSFT"), json!(212.5)]],
                )),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_template_render_rows_and_missing() {
        let mut c = ctx();
        c.missing.push("chart (visualization) could not be completed: no numeric column".into());
        let text = TemplateSynthesizer::new().render(&c);
        assert!(text.starts_with("Found 2 record(s):"));
        assert!(text.contains("- Symbol: AAPL, Revenue: 394"));
        assert!(text.contains("Revenue: 212.5"));
        assert!(text.ends_with("no numeric column"));
    }

    #[test]
    fn test_clarification_text() {
        let text = clarification_text(&["Which year?".to_string(), "Which company?".to_string()]);
        assert!(text.starts_with("I need some clarification to answer your question accurately:"));
        assert!(text.contains("1. Which year?\n2. Which company?"));
        assert!(text.ends_with("Could you provide more details?"));
    }

    #[tokio::test]
    async fn test_template_without_facts_is_fault() {
        let result = TemplateSynthesizer::new().synthesize(&SynthesisContext::default()).await;
        assert!(matches!(result, Err(SynthesisError::NoFacts)));
    }

    #[test]
    fn test_unsupported_numbers() {
        let allowed = "Revenue: 394, Revenue: 211.915, pct_change = 85.85%";
        assert!(unsupported_numbers("Apple earned 394 vs 211.9, up 85.85%", allowed).is_empty());
        assert!(unsupported_numbers("The top 3 companies", allowed).is_empty());
        assert_eq!(unsupported_numbers("Apple earned 400", allowed), vec!["400"]);
        assert_eq!(unsupported_numbers("1,234.5 total", "1234.5"), Vec::<String>::new());
    }

    #[test]
    fn test_number_check_never_silently_disabled() {
        assert!(NUMBER_RE.is_match("-1,250.75"));
        // 同一进程内重复调用，每次都要实际比对
        for _ in 0..3 {
            assert_eq!(
                unsupported_numbers("Loss of -42.5 and 1,250,000 shares", "-42.5"),
                vec!["1,250,000"]
            );
        }
    }

    #[tokio::test]
    async fn test_llm_synthesizer_checks_numbers() {
        let good = LlmSynthesizer::new(Arc::new(MockLlmClient::with_replies([
            "Apple's revenue (394) exceeds Microsoft's (212.5).",
        ])));
        assert!(good.synthesize(&ctx()).await.is_ok());

        let bad = LlmSynthesizer::new(Arc::new(MockLlmClient::with_replies([
            "Apple's revenue is 500, nearly double Microsoft's.",
        ])));
        assert!(matches!(
            bad.synthesize(&ctx()).await,
            Err(SynthesisError::Unfaithful(n)) if n == vec!["500"]
        ));
    }
}
