//! 图表描述符选择
//!
//! 按列类型与数量推断图表：时间 + 数值 → line；分类 / 文本 + 数值 → bar；
//! 两个以上数值列 → scatter；仅一个数值列 → histogram。只产出描述符，不渲染。

use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::RowSet;
use crate::plan::ChartRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Bar,
    Line,
    Scatter,
    Histogram,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Scatter => "scatter",
            ChartType::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub x: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

/// 图表描述符（交给外部渲染器）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub chart_type: ChartType,
    pub x: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    pub title: String,
    pub points: Vec<ChartPoint>,
}

impl ChartSpec {
    pub fn describe(&self) -> String {
        match &self.y {
            Some(y) => format!(
                "Prepared a {} chart of {} by {} ({} points).",
                self.chart_type.as_str(),
                y,
                self.x,
                self.points.len()
            ),
            None => format!(
                "Prepared a {} chart of {} ({} values).",
                self.chart_type.as_str(),
                self.x,
                self.points.len()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnClass {
    Numeric,
    Temporal,
    Categorical,
    Empty,
}

fn classify(rows: &RowSet, idx: usize) -> ColumnClass {
    if rows.is_numeric_column(idx) {
        return ColumnClass::Numeric;
    }
    let mut seen = false;
    let mut all_dates = true;
    for row in &rows.rows {
        match row.get(idx) {
            Some(Value::String(s)) => {
                seen = true;
                if NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_err() {
                    all_dates = false;
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => {
                seen = true;
                all_dates = false;
            }
        }
    }
    match (seen, all_dates) {
        (false, _) => ColumnClass::Empty,
        (true, true) => ColumnClass::Temporal,
        (true, false) => ColumnClass::Categorical,
    }
}

/// 从结果集选择图表；数据不支持时返回错误（Computation 失败）
pub fn select_chart(request: &ChartRequest, rows: &RowSet) -> Result<ChartSpec, String> {
    if rows.is_empty() {
        return Err("no rows to visualize".to_string());
    }
    let classes: Vec<ColumnClass> = (0..rows.columns.len()).map(|i| classify(rows, i)).collect();
    let first = |class: ColumnClass| classes.iter().position(|c| *c == class);
    let numeric: Vec<usize> = (0..classes.len())
        .filter(|&i| classes[i] == ColumnClass::Numeric)
        .collect();
    let label = first(ColumnClass::Categorical);
    let temporal = first(ColumnClass::Temporal);

    let supported = |chart: ChartType| -> Option<(usize, Option<usize>)> {
        match chart {
            ChartType::Line => {
                let x = temporal.or_else(|| (numeric.len() >= 2).then(|| numeric[0]))?;
                let y = numeric.iter().copied().find(|&i| i != x)?;
                Some((x, Some(y)))
            }
            ChartType::Bar => Some((label.or(temporal)?, Some(*numeric.first()?))),
            ChartType::Scatter => (numeric.len() >= 2).then(|| (numeric[0], Some(numeric[1]))),
            ChartType::Histogram => Some((*numeric.first()?, None)),
        }
    };

    let hinted = request
        .chart_type
        .and_then(|chart| supported(chart).map(|axes| (chart, axes)));
    if let (Some(hint), None) = (request.chart_type, hinted) {
        tracing::debug!("Chart hint '{}' not supported by data, inferring", hint.as_str());
    }

    let inferred = || {
        let chart = if temporal.is_some() && !numeric.is_empty() {
            ChartType::Line
        } else if label.is_some() && !numeric.is_empty() {
            ChartType::Bar
        } else if numeric.len() >= 2 {
            ChartType::Scatter
        } else if numeric.len() == 1 {
            ChartType::Histogram
        } else {
            return None;
        };
        supported(chart).map(|axes| (chart, axes))
    };

    let (chart_type, (x, y)) = hinted
        .or_else(inferred)
        .ok_or_else(|| "no numeric column to visualize".to_string())?;

    let points = rows
        .rows
        .iter()
        .filter_map(|row| {
            let x_value = row.get(x).cloned().unwrap_or(Value::Null);
            match y {
                Some(y) => {
                    let y_value = row.get(y).and_then(crate::data::rows::cell_as_f64)?;
                    Some(ChartPoint { x: x_value, y: Some(y_value) })
                }
                None => (!x_value.is_null()).then_some(ChartPoint { x: x_value, y: None }),
            }
        })
        .collect();

    let x_name = rows.columns[x].clone();
    let y_name = y.map(|i| rows.columns[i].clone());
    let title = request.title.clone().unwrap_or_else(|| match &y_name {
        Some(y) => format!("{y} by {x_name}"),
        None => format!("Distribution of {x_name}"),
    });

    Ok(ChartSpec {
        chart_type,
        x: x_name,
        y: y_name,
        title,
        points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(columns: &[&str], data: Vec<Vec<Value>>) -> RowSet {
        RowSet::new(columns.iter().map(|c| c.to_string()).collect(), data)
    }

    #[test]
    fn test_categorical_numeric_is_bar() {
        let r = rows(
            &["Sector", "avg_PE_Ratio"],
            vec![vec![json!("Energy"), json!(12.5)], vec![json!("Utilities"), json!(18.0)]],
        );
        let chart = select_chart(&ChartRequest::default(), &r).unwrap();
        assert_eq!(chart.chart_type, ChartType::Bar);
        assert_eq!(chart.x, "Sector");
        assert_eq!(chart.title, "avg_PE_Ratio by Sector");
        assert_eq!(chart.points.len(), 2);
    }

    #[test]
    fn test_dates_make_line() {
        let r = rows(
            &["Date_added", "Price"],
            vec![vec![json!("2020-01-01"), json!(10.0)], vec![json!("2021-06-30"), json!(12.0)]],
        );
        assert_eq!(select_chart(&ChartRequest::default(), &r).unwrap().chart_type, ChartType::Line);
    }

    #[test]
    fn test_two_numeric_scatter_one_numeric_histogram() {
        let two = rows(&["Revenue", "Net_Income"], vec![vec![json!(1.0), json!(2.0)]]);
        assert_eq!(select_chart(&ChartRequest::default(), &two).unwrap().chart_type, ChartType::Scatter);

        let one = rows(&["Price"], vec![vec![json!(1.0)], vec![json!(3.0)]]);
        let chart = select_chart(&ChartRequest::default(), &one).unwrap();
        assert_eq!(chart.chart_type, ChartType::Histogram);
        assert_eq!(chart.y, None);
    }

    #[test]
    fn test_hint_respected_when_supported() {
        let r = rows(
            &["Sector", "Revenue", "Net_Income"],
            vec![vec![json!("Energy"), json!(1.0), json!(2.0)]],
        );
        let request = ChartRequest {
            chart_type: Some(ChartType::Scatter),
            title: Some("Revenue vs income".into()),
        };
        let chart = select_chart(&request, &r).unwrap();
        assert_eq!(chart.chart_type, ChartType::Scatter);
        assert_eq!(chart.title, "Revenue vs income");

        let only_text = rows(&["Sector", "Price"], vec![vec![json!("Energy"), json!(3.0)]]);
        let fallback = select_chart(&request, &only_text).unwrap();
        assert_eq!(fallback.chart_type, ChartType::Bar);
    }

    #[test]
    fn test_no_numeric_fails() {
        let r = rows(&["Symbol"], vec![vec![json!("AAPL")]]);
        assert!(select_chart(&ChartRequest::default(), &r).is_err());
        assert!(select_chart(&ChartRequest::default(), &RowSet::default()).is_err());
    }
}
