//! 外部协作者：意图抽取与计划生成
//!
//! 二者的输出都是不可信输入：意图只决定是否走澄清路径，计划必须经过 PlanScheduler 校验。

pub mod intent;
pub mod planner;

pub use intent::{Intent, IntentAnalysis, IntentExtractor, LlmIntentExtractor, RuleIntentExtractor};
pub use planner::{FixedPlanner, LlmPlanner, Planner};

/// 从 LLM 回复中取出 JSON：优先 ```json 代码块，其次最外层的 {...} 或 [...]
pub(crate) fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    let object = trimmed.find('{').zip(trimmed.rfind('}'));
    let array = trimmed.find('[').zip(trimmed.rfind(']'));
    let (start, end) = match (object, array) {
        (Some(o), Some(a)) => {
            if a.0 < o.0 {
                a
            } else {
                o
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    (start < end).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("Here you go: {\"a\": 1} done"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("[{\"id\": 1}]"), Some("[{\"id\": 1}]"));
        assert_eq!(extract_json("no json here"), None);
    }
}
