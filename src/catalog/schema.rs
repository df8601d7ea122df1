//! 模式目录：表 / 列的静态注册表
//!
//! 进程启动时加载一次，之后只读；所有组件只接受目录中存在的表名与列名。

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 列的声明类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Text,
    Categorical,
    /// 日期类（折线图判定依据）
    Temporal,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Numeric)
    }

    /// 可做有序比较（gt / lt 等）的类型
    pub fn is_ordered(&self) -> bool {
        matches!(self, ColumnType::Numeric | ColumnType::Temporal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Numeric => "numeric",
            ColumnType::Text => "text",
            ColumnType::Categorical => "categorical",
            ColumnType::Temporal => "temporal",
        }
    }

    /// 该类型列缺省允许的操作：数值与分类可聚合，文本与日期不可
    pub fn default_operations(&self) -> BTreeSet<Operation> {
        let mut ops: BTreeSet<Operation> = [Operation::Read, Operation::Filter, Operation::Sort].into();
        if matches!(self, ColumnType::Numeric | ColumnType::Categorical) {
            ops.insert(Operation::Aggregate);
        }
        ops
    }

    /// SQLite 建表时使用的存储类型
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Numeric => "REAL",
            _ => "TEXT",
        }
    }
}

/// 允许对条目执行的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Filter,
    Aggregate,
    Sort,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Filter => "filter",
            Operation::Aggregate => "aggregate",
            Operation::Sort => "sort",
        }
    }
}

/// 目录条目：一张表或一列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub unit: Option<String>,
    pub description: String,
    pub allowed_operations: BTreeSet<Operation>,
    #[serde(default)]
    pub examples: Vec<String>,
}

impl SchemaEntry {
    pub fn allows(&self, op: Operation) -> bool {
        self.allowed_operations.contains(&op)
    }

    /// 供 LLM 阅读的一行描述
    pub fn to_llm_description(&self) -> String {
        let mut desc = format!(
            "- {} ({}): {}",
            self.name,
            self.column_type.as_str(),
            self.description
        );
        if let Some(unit) = &self.unit {
            desc.push_str(&format!(" [Unit: {unit}]"));
        }
        if !self.examples.is_empty() {
            let examples: Vec<&str> = self.examples.iter().take(3).map(String::as_str).collect();
            desc.push_str(&format!(" [Examples: {}]", examples.join(", ")));
        }
        desc
    }
}

/// 单表模式：表级条目 + 有序列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub entry: SchemaEntry,
    pub columns: Vec<SchemaEntry>,
}

impl TableSchema {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// 列名查找，大小写不敏感
    pub fn column(&self, name: &str) -> Option<&SchemaEntry> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Schema entry not found: {0}")]
    NotFound(String),
    #[error("Catalog load failed: {0}")]
    Load(String),
}

/// 模式目录（只读）
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|t| (t.entry.name.to_lowercase(), t))
                .collect(),
        }
    }

    /// 从 JSON 文件加载（内容为 TableSchema 数组）
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CatalogError::Load(format!("{}: {e}", path.as_ref().display())))?;
        let tables: Vec<TableSchema> =
            serde_json::from_str(&data).map_err(|e| CatalogError::Load(e.to_string()))?;
        Ok(Self::new(tables))
    }

    /// 按名称查找条目：`table` 或 `table.column`
    pub fn lookup(&self, name: &str) -> Result<&SchemaEntry, CatalogError> {
        let not_found = || CatalogError::NotFound(name.to_string());
        match name.split_once('.') {
            Some((table, column)) => self
                .table(table)
                .and_then(|t| t.column(column))
                .ok_or_else(not_found),
            None => self.table(name).map(|t| &t.entry).ok_or_else(not_found),
        }
    }

    pub fn is_operation_allowed(&self, entry_name: &str, op: Operation) -> bool {
        self.lookup(entry_name).map(|e| e.allows(op)).unwrap_or(false)
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    /// 所有可被引用的名字（表名与 `table.column`），交给意图抽取器
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for table in self.tables.values() {
            names.push(table.name().to_string());
            for column in &table.columns {
                names.push(format!("{}.{}", table.name(), column.name));
            }
        }
        names
    }

    /// 完整模式描述，拼入 planner / intent prompt
    pub fn describe_for_llm(&self) -> String {
        let mut out = String::new();
        for table in self.tables.values() {
            out.push_str(&format!("Table: {}\n", table.name()));
            out.push_str(&format!("Description: {}\n", table.entry.description));
            out.push_str("\nColumns:\n");
            for column in &table.columns {
                out.push_str(&column.to_llm_description());
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sp500_catalog;

    #[test]
    fn test_lookup_table_and_column() {
        let catalog = sp500_catalog();
        assert!(catalog.lookup("sp500_companies").is_ok());
        let revenue = catalog.lookup("sp500_companies.revenue").unwrap();
        assert_eq!(revenue.name, "Revenue");
        assert_eq!(revenue.column_type, ColumnType::Numeric);
    }

    #[test]
    fn test_lookup_missing() {
        let catalog = sp500_catalog();
        assert_eq!(
            catalog.lookup("sp500_companies.ebitda"),
            Err(CatalogError::NotFound("sp500_companies.ebitda".to_string()))
        );
        assert!(catalog.lookup("orders").is_err());
    }

    #[test]
    fn test_operation_allowed() {
        let catalog = sp500_catalog();
        assert!(catalog.is_operation_allowed("sp500_companies.Revenue", Operation::Aggregate));
        assert!(!catalog.is_operation_allowed("sp500_companies.Security", Operation::Aggregate));
        assert!(!catalog.is_operation_allowed("sp500_companies.nope", Operation::Read));
    }

    #[test]
    fn test_describe_for_llm_mentions_units() {
        let text = sp500_catalog().describe_for_llm();
        assert!(text.contains("Table: sp500_companies"));
        assert!(text.contains("- Revenue (numeric)"));
        assert!(text.contains("[Unit: USD (millions)]"));
    }

    #[test]
    fn test_json_file_roundtrip() {
        let catalog = sp500_catalog();
        let tables: Vec<TableSchema> = catalog.tables().cloned().collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, serde_json::to_string(&tables).unwrap()).unwrap();

        let loaded = SchemaCatalog::from_json_file(&path).unwrap();
        assert_eq!(loaded.names(), catalog.names());
    }
}
