//! 数据集导入：CSV → SQLite 表
//!
//! 表头规范化后与目录列（大小写不敏感）匹配，列类型取自目录；目录外的表头忽略。
//! 这是唯一的写路径，只在启动时执行；查询路径始终以只读方式打开数据库。

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use thiserror::Error;

use crate::catalog::{ColumnType, Operation, SchemaEntry, TableSchema};
use crate::data::sqlite::quote_ident;
use crate::data::SqliteDataSource;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("No CSV header matches a column of table '{0}'")]
    NoMatchingColumns(String),
}

/// 规范化表头：非字母数字字符替换为下划线，合并连续下划线并去掉首尾
pub fn normalize_column_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// 将 CSV 导入到 `table` 对应的 SQLite 表（先删后建），返回导入行数
/// 将 CSV 导入到 `table` 对应的 SQLite 表（先删后建），返回导入行数
pub fn load_csv(conn: &mut Connection, csv_path: &Path, table: &TableSchema) -> Result<usize, LoadError> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let headers = reader.headers()?.clone();

    // (CSV 下标, 目录列)
    let mapping: Vec<(usize, &SchemaEntry)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| {
            let name = normalize_column_name(h);
            match table.column(&name) {
                Some(entry) => Some((i, entry)),
                None => {
                    tracing::warn!("CSV column '{}' not in catalog, skipped", h);
                    None
                }
            }
        })
        .collect();

    if mapping.is_empty() {
        return Err(LoadError::NoMatchingColumns(table.name().to_string()));
    }

    let table_ident = quote_ident(table.name());
    let column_defs: Vec<String> = mapping
        .iter()
        .map(|(_, e)| format!("{} {}", quote_ident(&e.name), e.column_type.sql_type()))
        .collect();
    let column_names: Vec<String> = mapping.iter().map(|(_, e)| quote_ident(&e.name)).collect();

    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {table_ident}; CREATE TABLE {table_ident} ({});",
        column_defs.join(", ")
    ))?;

    let mut count = 0usize;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {table_ident} ({}) VALUES ({})",
            column_names.join(", "),
            vec!["?"; mapping.len()].join(", ")
        ))?;
        for record in reader.records() {
            let record = record?;
            let values: Vec<SqlValue> = mapping
                .iter()
                .map(|(i, entry)| cell_value(record.get(*i).unwrap_or(""), entry.column_type))
                .collect();
            stmt.execute(rusqlite::params_from_iter(values.iter()))?;
            count += 1;
        }
    }
    tx.commit()?;

    tracing::info!("Loaded {} rows into {}", count, table.name());
    Ok(count)
}

fn cell_value(raw: &str, column_type: ColumnType) -> SqlValue {
    let raw = raw.trim();
    if raw.is_empty() {
        return SqlValue::Null;
    }
    match column_type {
        ColumnType::Numeric => raw
            .replace(',', "")
            .parse::<f64>()
            .map(SqlValue::Real)
            .unwrap_or(SqlValue::Null),
        _ => SqlValue::Text(raw.to_string()),
    }
}

/// 从任意 CSV 推断单表模式：每列全部非空单元格可解析为数字则为 numeric，
/// 全部为 `YYYY-MM-DD` 则为 temporal，否则为 text；单位按列名猜测
pub fn catalog_from_csv(csv_path: &Path, table_name: &str) -> Result<TableSchema, LoadError> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(normalize_column_name).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(LoadError::NoMatchingColumns(table_name.to_string()));
    }

    let mut stats: Vec<ColumnStats> = headers.iter().map(|_| ColumnStats::default()).collect();
    let mut row_count = 0usize;
    for record in reader.records() {
        let record = record?;
        row_count += 1;
        for (i, column) in stats.iter_mut().enumerate() {
            column.observe(record.get(i).unwrap_or(""));
        }
    }

    let mut seen = BTreeSet::new();
    let columns = headers
        .into_iter()
        .zip(stats)
        .filter(|(name, _)| !name.is_empty() && seen.insert(name.to_lowercase()))
        .map(|(name, stats)| {
            let column_type = stats.column_type();
            SchemaEntry {
                unit: guess_unit(&name).map(String::from),
                description: name.replace('_', " "),
                allowed_operations: column_type.default_operations(),
                examples: stats.examples,
                column_type,
                name,
            }
        })
        .collect();

    let source = csv_path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    tracing::info!("Inferred schema for {} from {} ({} rows)", table_name, source, row_count);
    Ok(TableSchema {
        entry: SchemaEntry {
            name: table_name.to_string(),
            column_type: ColumnType::Categorical,
            unit: None,
            description: format!("Dataset imported from {source} ({row_count} rows)"),
            allowed_operations: [Operation::Read, Operation::Filter, Operation::Aggregate, Operation::Sort].into(),
            examples: Vec::new(),
        },
        columns,
    })
}

#[derive(Default)]
struct ColumnStats {
    non_empty: usize,
    numeric: usize,
    dates: usize,
    examples: Vec<String>,
}

impl ColumnStats {
    fn observe(&mut self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        self.non_empty += 1;
        if raw.replace(',', "").parse::<f64>().is_ok() {
            self.numeric += 1;
        } else if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
            self.dates += 1;
        }
        if self.examples.len() < 3 {
            self.examples.push(raw.to_string());
        }
    }

    fn column_type(&self) -> ColumnType {
        match self.non_empty {
            0 => ColumnType::Text,
            n if self.numeric == n => ColumnType::Numeric,
            n if self.dates == n => ColumnType::Temporal,
            _ => ColumnType::Text,
        }
    }
}

fn guess_unit(column: &str) -> Option<&'static str> {
    let lower = column.to_lowercase();
    if lower.contains("cap") || lower.contains("revenue") || lower.contains("income") {
        Some("USD (millions)")
    } else if lower.contains("price") {
        Some("USD")
    } else if lower.contains("ratio") {
        Some("ratio")
    } else if lower.contains("yield") {
        Some("percentage")
    } else {
        None
    }
}

/// 准备数据源：数据库文件不存在且提供了 CSV 时先导入，再以只读方式打开
pub fn prepare_database(
    db_path: &Path,
    csv_path: Option<&Path>,
    table: &TableSchema,
) -> anyhow::Result<SqliteDataSource> {
    if !db_path.exists() {
        let csv_path = csv_path
            .filter(|p| p.exists())
            .with_context(|| format!("Database {} missing and no dataset to load", db_path.display()))?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(db_path)
            .with_context(|| format!("Failed to create database {}", db_path.display()))?;
        load_csv(&mut conn, csv_path, table)
            .with_context(|| format!("Failed to load dataset {}", csv_path.display()))?;
    }
    SqliteDataSource::open_read_only(db_path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}
