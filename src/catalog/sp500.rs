//! 内置 S&P 500 数据集模式

use std::collections::BTreeSet;

use super::schema::{ColumnType, Operation, SchemaCatalog, SchemaEntry, TableSchema};

pub const SP500_TABLE: &str = "sp500_companies";

fn ops(list: &[Operation]) -> BTreeSet<Operation> {
    list.iter().copied().collect()
}

fn column(
    name: &str,
    column_type: ColumnType,
    unit: Option<&str>,
    description: &str,
    examples: &[&str],
) -> SchemaEntry {
    SchemaEntry {
        name: name.to_string(),
        column_type,
        unit: unit.map(String::from),
        description: description.to_string(),
        allowed_operations: column_type.default_operations(),
        examples: examples.iter().map(|s| s.to_string()).collect(),
    }
}

/// S&P 500 公司表：行情、基本面与行业分类
pub fn sp500_table() -> TableSchema {
    use ColumnType::*;

    let mut cik = column(
        "CIK",
        Numeric,
        None,
        "Central Index Key (SEC identifier)",
        &["320193", "789019"],
    );
    // 标识符，不参与聚合
    cik.allowed_operations.remove(&Operation::Aggregate);

    TableSchema {
        entry: SchemaEntry {
            name: SP500_TABLE.to_string(),
            column_type: Categorical,
            unit: None,
            description: "Financial information for S&P 500 companies including market data, fundamentals, and sector classification".to_string(),
            allowed_operations: ops(&[
                Operation::Read,
                Operation::Filter,
                Operation::Aggregate,
                Operation::Sort,
            ]),
            examples: Vec::new(),
        },
        columns: vec![
            column("Symbol", Text, None, "Stock ticker symbol", &["AAPL", "MSFT", "GOOGL"]),
            column(
                "Security",
                Text,
                None,
                "Company name or security description",
                &["Apple Inc.", "Microsoft Corporation"],
            ),
            column(
                "Sector",
                Categorical,
                None,
                "GICS sector classification",
                &["Information Technology", "Health Care", "Financials"],
            ),
            column(
                "Sub_Industry",
                Categorical,
                None,
                "GICS sub-industry classification",
                &["Technology Hardware, Storage & Peripherals", "Pharmaceuticals"],
            ),
            column(
                "Headquarters_Location",
                Text,
                None,
                "City and state of company headquarters",
                &["Cupertino, California", "Redmond, Washington"],
            ),
            column(
                "Date_added",
                Temporal,
                None,
                "Date when company was added to S&P 500 index",
                &["1982-11-30", "1994-06-01"],
            ),
            cik,
            column("Founded", Text, None, "Year company was founded", &["1976", "1975"]),
            column(
                "Market_Cap",
                Numeric,
                Some("USD (millions)"),
                "Market capitalization",
                &["2800000", "2400000"],
            ),
            column("Price", Numeric, Some("USD"), "Current stock price", &["178.25", "380.50"]),
            column(
                "Revenue",
                Numeric,
                Some("USD (millions)"),
                "Annual revenue",
                &["394328", "211915"],
            ),
            column(
                "Net_Income",
                Numeric,
                Some("USD (millions)"),
                "Annual net income",
                &["99803", "72361"],
            ),
            column("Employees", Numeric, Some("count"), "Number of employees", &["164000", "221000"]),
            column("PE_Ratio", Numeric, Some("ratio"), "Price-to-Earnings ratio", &["28.5", "32.1"]),
            column(
                "Dividend_Yield",
                Numeric,
                Some("percentage"),
                "Annual dividend yield as percentage",
                &["0.52", "0.75"],
            ),
        ],
    }
}

pub fn sp500_catalog() -> SchemaCatalog {
    SchemaCatalog::new(vec![sp500_table()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cik_not_aggregatable() {
        let catalog = sp500_catalog();
        assert!(!catalog.is_operation_allowed("sp500_companies.CIK", Operation::Aggregate));
        assert!(catalog.is_operation_allowed("sp500_companies.CIK", Operation::Filter));
    }

    #[test]
    fn test_sector_is_categorical() {
        let table = sp500_table();
        assert_eq!(table.column("sector").unwrap().column_type, ColumnType::Categorical);
        assert_eq!(table.columns.len(), 15);
    }
}
