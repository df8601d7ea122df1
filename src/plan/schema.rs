//! 计划 JSON Schema 生成
//!
//! 用于把合法计划的 JSON 结构注入 planner prompt，减少 LLM 输出格式错误。

use schemars::schema_for;

use crate::plan::types::ExecutionPlan;

/// 返回 ExecutionPlan 的 JSON Schema 字符串，可拼入 system prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(ExecutionPlan);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_schema_names_step_kinds() {
        let schema = plan_schema_json();
        assert!(schema.contains("steps"));
        assert!(schema.contains("retrieval"));
        assert!(schema.contains("synthesis"));
    }
}
