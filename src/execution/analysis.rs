//! 确定性数值分析
//!
//! 所有算术都在这里完成，合成阶段只引用这里产生的数字。
//! 取值顺序：来源步骤按声明顺序，行按结果集顺序。
//! 聚合类操作忽略空值；ratio / difference 必须恰好两个非空操作数。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::RowSet;
use crate::execution::format_number;
use crate::plan::{AnalysisOp, AnalysisSpec, StepId};

/// 带标签的输入值（rank 时按名次排列）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledValue {
    pub label: String,
    pub value: f64,
}

/// 分析结果：指标名 → 数值，以及参与计算的取值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub operation: AnalysisOp,
    pub column: String,
    pub metrics: BTreeMap<String, f64>,
    pub values: Vec<LabeledValue>,
}

impl AnalysisOutput {
    /// 转为两列结果集（标签 + 数值），供图表步骤使用
    pub fn to_rowset(&self) -> RowSet {
        RowSet::new(
            vec!["label".to_string(), self.column.clone()],
            self.values
                .iter()
                .map(|v| vec![serde_json::Value::from(v.label.clone()), serde_json::Value::from(v.value)])
                .collect(),
        )
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.values.is_empty() {
            let values: Vec<String> = self
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| match self.operation {
                    AnalysisOp::Rank => format!("{}. {} = {}", i + 1, v.label, format_number(v.value)),
                    _ => format!("{} = {}", v.label, format_number(v.value)),
                })
                .collect();
            parts.push(values.join(", "));
        }
        let metrics: Vec<String> = self
            .metrics
            .iter()
            .map(|(k, v)| {
                if k == "pct_change" {
                    format!("{k} = {}%", format_number(*v))
                } else {
                    format!("{k} = {}", format_number(*v))
                }
            })
            .collect();
        if !metrics.is_empty() {
            parts.push(metrics.join(", "));
        }
        format!("{} of {}: {}", self.operation.as_str(), self.column, parts.join("; "))
    }
}

/// 对来源结果集执行分析；错误信息作为 Computation 失败返回
pub fn run_analysis(spec: &AnalysisSpec, inputs: &[(StepId, RowSet)]) -> Result<AnalysisOutput, String> {
    if inputs.is_empty() {
        return Err("analysis has no input results".to_string());
    }

    let values = match spec.operation {
        AnalysisOp::Ratio | AnalysisOp::Difference => exact_pair(spec, inputs)?,
        _ => collect_values(spec, inputs)?,
    };
    let mut metrics = BTreeMap::new();
    let mut out_values = values.clone();

    match spec.operation {
        AnalysisOp::Sum => {
            require(&values, 1, "sum")?;
            metrics.insert("count".into(), values.len() as f64);
            metrics.insert("sum".into(), values.iter().map(|v| v.value).sum());
        }
        AnalysisOp::Mean => {
            require(&values, 1, "mean")?;
            metrics.insert("count".into(), values.len() as f64);
            metrics.insert("mean".into(), mean(&values));
        }
        AnalysisOp::Ratio => {
            let (first, second) = (values[0].value, values[1].value);
            if second == 0.0 {
                return Err(format!("ratio denominator '{}' is zero", values[1].label));
            }
            metrics.insert("ratio".into(), first / second);
        }
        AnalysisOp::Difference => {
            let (first, second) = (values[0].value, values[1].value);
            let diff = first - second;
            metrics.insert("difference".into(), diff);
            if second != 0.0 {
                metrics.insert("pct_change".into(), diff / second * 100.0);
            }
        }
        AnalysisOp::Rank => {
            require(&values, 1, "rank")?;
            // 稳定排序：同值保持输入顺序
            out_values.sort_by(|a, b| b.value.total_cmp(&a.value));
            metrics.insert("count".into(), values.len() as f64);
            metrics.insert("max".into(), out_values[0].value);
            metrics.insert("min".into(), out_values[out_values.len() - 1].value);
        }
        AnalysisOp::Statistics => {
            require(&values, 1, "statistics")?;
            let mut sorted: Vec<f64> = values.iter().map(|v| v.value).collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let n = sorted.len();
            let median = if n % 2 == 1 {
                sorted[n / 2]
            } else {
                (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
            };
            metrics.insert("count".into(), n as f64);
            metrics.insert("mean".into(), mean(&values));
            metrics.insert("median".into(), median);
            metrics.insert("std".into(), sample_std(&sorted));
            metrics.insert("min".into(), sorted[0]);
            metrics.insert("max".into(), sorted[n - 1]);
            metrics.insert("sum".into(), sorted.iter().sum());
            out_values.clear();
        }
        AnalysisOp::Correlation => {
            let second = spec
                .second_column
                .as_deref()
                .ok_or_else(|| "correlation requires second_column".to_string())?;
            let (xs, ys) = paired_columns(inputs, &spec.column, second)?;
            if xs.len() < 2 {
                return Err("correlation needs at least 2 paired values".to_string());
            }
            let r = pearson(&xs, &ys).ok_or_else(|| "correlation undefined for constant series".to_string())?;
            metrics.insert("correlation".into(), r);
            metrics.insert("n".into(), xs.len() as f64);
            out_values.clear();
        }
    }

    Ok(AnalysisOutput {
        operation: spec.operation,
        column: spec.column.clone(),
        metrics,
        values: out_values,
    })
}

fn require(values: &[LabeledValue], n: usize, op: &str) -> Result<(), String> {
    if values.len() < n {
        Err(format!("{op} needs at least {n} numeric value(s), found {}", values.len()))
    } else {
        Ok(())
    }
}

fn collect_values(spec: &AnalysisSpec, inputs: &[(StepId, RowSet)]) -> Result<Vec<LabeledValue>, String> {
    Ok(labeled_cells(spec, inputs)?
        .into_iter()
        .filter_map(|(label, value)| value.map(|value| LabeledValue { label, value }))
        .collect())
}

/// 二元操作数：恰好两个单元格且都非空，否则不做静默配对
fn exact_pair(spec: &AnalysisSpec, inputs: &[(StepId, RowSet)]) -> Result<Vec<LabeledValue>, String> {
    let op = spec.operation.as_str();
    let cells = labeled_cells(spec, inputs)?;
    if cells.len() != 2 {
        return Err(format!(
            "{op} needs exactly 2 values of '{}', found {}",
            spec.column,
            cells.len()
        ));
    }
    cells
        .into_iter()
        .map(|(label, value)| match value {
            Some(value) => Ok(LabeledValue { label, value }),
            None => Err(format!("{op} operand '{label}' has no value for '{}'", spec.column)),
        })
        .collect()
}

/// 所有来源中该列的单元格（含空值）及其标签
fn labeled_cells(spec: &AnalysisSpec, inputs: &[(StepId, RowSet)]) -> Result<Vec<(String, Option<f64>)>, String> {
    let mut out = Vec::new();
    let mut found_column = false;
    for (step_id, rows) in inputs {
        let Some(numbers) = rows.numeric_column(&spec.column) else {
            continue;
        };
        found_column = true;
        let labels = labels_for(spec, rows);
        let single = numbers.len() == 1;
        for (i, value) in numbers.into_iter().enumerate() {
            let label = match &labels {
                Some(labels) => labels[i].clone(),
                None if single && inputs.len() > 1 => step_id.clone(),
                None => format!("row {}", i + 1),
            };
            out.push((label, value));
        }
    }
    if !found_column {
        return Err(format!("column '{}' not present in input results", spec.column));
    }
    Ok(out)
}

/// 标签列：显式指定，否则取第一个非数值列
fn labels_for(spec: &AnalysisSpec, rows: &RowSet) -> Option<Vec<String>> {
    if let Some(label) = &spec.label_column {
        return rows.text_column(label);
    }
    let idx = (0..rows.columns.len()).find(|&i| {
        !rows.columns[i].eq_ignore_ascii_case(&spec.column) && !rows.is_numeric_column(i)
    })?;
    rows.text_column(&rows.columns[idx])
}

fn paired_columns(inputs: &[(StepId, RowSet)], x: &str, y: &str) -> Result<(Vec<f64>, Vec<f64>), String> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut found = false;
    for (_, rows) in inputs {
        let (Some(a), Some(b)) = (rows.numeric_column(x), rows.numeric_column(y)) else {
            continue;
        };
        found = true;
        for (a, b) in a.into_iter().zip(b) {
            if let (Some(a), Some(b)) = (a, b) {
                xs.push(a);
                ys.push(b);
            }
        }
    }
    if !found {
        return Err(format!("columns '{x}' and '{y}' not present together in input results"));
    }
    Ok((xs, ys))
}

fn mean(values: &[LabeledValue]) -> f64 {
    values.iter().map(|v| v.value).sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx == 0.0 || vy == 0.0 {
        return None;
    }
    Some(cov / (vx.sqrt() * vy.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revenue() -> Vec<(StepId, RowSet)> {
        vec![(
            "fetch".to_string(),
            RowSet::new(
                vec!["Symbol".into(), "Revenue".into()],
                vec![vec![json!("AAPL"), json!(394.0)], vec![json!("MSFT"), json!(212.0)]],
            ),
        )]
    }

    #[test]
    fn test_difference_and_pct_change() {
        let out = run_analysis(&AnalysisSpec::new(AnalysisOp::Difference, "Revenue"), &revenue()).unwrap();
        assert_eq!(out.metrics["difference"], 182.0);
        assert!((out.metrics["pct_change"] - 85.849).abs() < 0.01);
        assert_eq!(out.values[0].label, "AAPL");
        let text = out.describe();
        assert!(text.contains("AAPL = 394"));
        assert!(text.contains("MSFT = 212"));
        assert!(text.contains("pct_change = 85.85%"));
    }

    #[test]
    fn test_rank_descending_with_labels() {
        let mut inputs = revenue();
        inputs[0].1.rows.push(vec![json!("NVDA"), json!(500.0)]);
        let spec = AnalysisSpec::new(AnalysisOp::Rank, "revenue").with_label("Symbol");
        let out = run_analysis(&spec, &inputs).unwrap();
        let labels: Vec<&str> = out.values.iter().map(|v| v.label.as_str()).collect();
        assert_eq!(labels, vec!["NVDA", "AAPL", "MSFT"]);
        assert!(out.describe().starts_with("rank of revenue: 1. NVDA = 500"));
    }

    #[test]
    fn test_values_from_multiple_sources_use_step_ids() {
        let inputs = vec![
            ("apple".to_string(), RowSet::new(vec!["Revenue".into()], vec![vec![json!(10.0)]])),
            ("msft".to_string(), RowSet::new(vec!["Revenue".into()], vec![vec![json!(4.0)]])),
        ];
        let out = run_analysis(&AnalysisSpec::new(AnalysisOp::Ratio, "Revenue"), &inputs).unwrap();
        assert_eq!(out.metrics["ratio"], 2.5);
        assert_eq!(out.values[1].label, "msft");
    }

    #[test]
    fn test_statistics() {
        let inputs = vec![(
            "s".to_string(),
            RowSet::new(
                vec!["PE_Ratio".into()],
                vec![vec![json!(1.0)], vec![json!(2.0)], vec![json!(3.0)], vec![json!(4.0)], vec![serde_json::Value::Null]],
            ),
        )];
        let out = run_analysis(&AnalysisSpec::new(AnalysisOp::Statistics, "PE_Ratio"), &inputs).unwrap();
        assert_eq!(out.metrics["count"], 4.0);
        assert_eq!(out.metrics["median"], 2.5);
        assert_eq!(out.metrics["sum"], 10.0);
        assert!((out.metrics["std"] - 1.2910).abs() < 1e-3);
    }

    #[test]
    fn test_correlation() {
        let inputs = vec![(
            "s".to_string(),
            RowSet::new(
                vec!["Revenue".into(), "Net_Income".into()],
                vec![vec![json!(1.0), json!(2.0)], vec![json!(2.0), json!(4.0)], vec![json!(3.0), json!(6.5)]],
            ),
        )];
        let spec = AnalysisSpec::new(AnalysisOp::Correlation, "Revenue").with_second_column("Net_Income");
        let out = run_analysis(&spec, &inputs).unwrap();
        assert!(out.metrics["correlation"] > 0.99);
        assert!(run_analysis(&AnalysisSpec::new(AnalysisOp::Correlation, "Revenue"), &inputs).is_err());
    }

    #[test]
    fn test_missing_column_and_zero_denominator() {
        assert!(run_analysis(&AnalysisSpec::new(AnalysisOp::Sum, "Employees"), &revenue()).is_err());
        let inputs = vec![(
            "s".to_string(),
            RowSet::new(vec!["x".into()], vec![vec![json!(1.0)], vec![json!(0.0)]]),
        )];
        assert!(run_analysis(&AnalysisSpec::new(AnalysisOp::Ratio, "x"), &inputs).is_err());
    }

    #[test]
    fn test_difference_rejects_extra_rows() {
        let mut inputs = revenue();
        inputs[0].1.rows.push(vec![json!("GOOG"), json!(307.0)]);
        let err = run_analysis(&AnalysisSpec::new(AnalysisOp::Difference, "Revenue"), &inputs).unwrap_err();
        assert!(err.contains("exactly 2"));
        assert!(run_analysis(&AnalysisSpec::new(AnalysisOp::Ratio, "Revenue"), &inputs).is_err());
    }

    #[test]
    fn test_difference_rejects_null_operand() {
        let inputs = vec![(
            "fetch".to_string(),
            RowSet::new(
                vec!["Symbol".into(), "Revenue".into()],
                vec![
                    vec![json!("AAPL"), serde_json::Value::Null],
                    vec![json!("MSFT"), json!(212.0)],
                ],
            ),
        )];
        let err = run_analysis(&AnalysisSpec::new(AnalysisOp::Difference, "Revenue"), &inputs).unwrap_err();
        assert!(err.contains("AAPL"));

        // 三行中一行为空也不会退化成另外两行的比较
        let mut three = inputs.clone();
        three[0].1.rows.push(vec![json!("GOOG"), json!(307.0)]);
        assert!(run_analysis(&AnalysisSpec::new(AnalysisOp::Difference, "Revenue"), &three).is_err());
    }
}
