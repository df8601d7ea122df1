//! 结果集：列名 + JSON 单元格

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 列下标，大小写不敏感
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// 取一列的数值；非数值单元格为 None（数字字符串会被解析）
    pub fn numeric_column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).and_then(cell_as_f64))
                .collect(),
        )
    }

    /// 取一列的文本表示
    pub fn text_column(&self, name: &str) -> Option<Vec<String>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).map(cell_to_string).unwrap_or_default())
                .collect(),
        )
    }

    /// 全部非空单元格都是数值的列
    pub fn is_numeric_column(&self, idx: usize) -> bool {
        let mut seen = false;
        for row in &self.rows {
            match row.get(idx) {
                Some(Value::Null) | None => {}
                Some(Value::Number(_)) => seen = true,
                Some(_) => return false,
            }
        }
        seen
    }
}

pub fn cell_as_f64(cell: &Value) -> Option<f64> {
    match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
}

pub fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) => crate::execution::format_number(f),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RowSet {
        RowSet::new(
            vec!["Symbol".into(), "Revenue".into()],
            vec![
                vec![json!("AAPL"), json!(394.0)],
                vec![json!("MSFT"), json!("212")],
                vec![json!("XYZ"), Value::Null],
            ],
        )
    }

    #[test]
    fn test_numeric_column_parses_strings() {
        let rows = sample();
        assert_eq!(
            rows.numeric_column("revenue").unwrap(),
            vec![Some(394.0), Some(212.0), None]
        );
        assert!(rows.numeric_column("missing").is_none());
    }

    #[test]
    fn test_is_numeric_column() {
        let rows = sample();
        assert!(!rows.is_numeric_column(0));
        // 字符串 "212" 使该列不再是纯数值列
        assert!(!rows.is_numeric_column(1));
        let clean = RowSet::new(vec!["x".into()], vec![vec![json!(1)], vec![Value::Null]]);
        assert!(clean.is_numeric_column(0));
    }

    #[test]
    fn test_cell_to_string() {
        assert_eq!(cell_to_string(&json!(394.0)), "394");
        assert_eq!(cell_to_string(&json!("AAPL")), "AAPL");
        assert_eq!(cell_to_string(&Value::Null), "");
    }
}
