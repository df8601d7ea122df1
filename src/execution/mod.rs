//! 执行层：步骤结果、执行状态、单步执行器、计划运行器、分析 / 图表 / 合成

pub mod analysis;
pub mod chart;
pub mod executor;
pub mod result;
pub mod runner;
pub mod state;
pub mod synthesis;

pub use analysis::{run_analysis, AnalysisOutput, LabeledValue};
pub use chart::{select_chart, ChartPoint, ChartSpec, ChartType};
pub use executor::{StepContext, StepExecutor};
pub use result::{FailureKind, StepFailure, StepOutcome, StepOutput, StepResult};
pub use runner::PlanRunner;
pub use state::{ExecutionState, RecordedError, SharedState};
pub use synthesis::{
    clarification_text, Fact, LlmSynthesizer, SynthesisContext, SynthesisError, Synthesizer,
    TemplateSynthesizer,
};

/// 数值展示：整数不带小数，其余最多保留两位（去掉末尾的 0）
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let precision = if value.abs() < 0.01 { 4 } else { 2 };
    let s = format!("{value:.precision$}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(394.0), "394");
        assert_eq!(format_number(-182.0), "-182");
        assert_eq!(format_number(85.849_056), "85.85");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(0.00123), "0.0012");
    }
}
