//! 查询校验器
//!
//! 执行前按顺序校验：表存在 → 列存在 → 操作在 allowed_operations 中 → 类型兼容。
//! 只读由 QueryDescriptor 的封闭结构保证；校验通过得到 ValidatedQuery，数据源只接受这个类型。
//! 校验器从不接触数据源。

use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{ColumnType, Operation, SchemaCatalog, SchemaEntry, TableSchema};
use crate::query::descriptor::{FilterOp, Literal, QueryDescriptor};

/// 校验拒绝原因（均属 SchemaViolation，不重试）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryRejection {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Operation '{op}' not allowed on '{entry}'")]
    OperationNotAllowed { entry: String, op: &'static str },

    #[error("Type mismatch on '{column}': {reason}")]
    TypeMismatch { column: String, reason: String },

    #[error("Invalid query shape: {0}")]
    InvalidShape(String),
}

/// 通过校验的查询：字段均已规范为目录中的拼写
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    descriptor: QueryDescriptor,
}

impl ValidatedQuery {
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn table(&self) -> &str {
        &self.descriptor.table
    }

    /// 结果集列顺序：分组列、选取列、聚合别名
    pub fn output_columns(&self) -> Vec<String> {
        let d = &self.descriptor;
        let mut out: Vec<String> = Vec::new();
        for column in d.group_by.iter().chain(d.columns.iter()) {
            if !out.contains(column) {
                out.push(column.clone());
            }
        }
        out.extend(d.aggregations.iter().map(|a| a.output_name()));
        out
    }
}

pub struct QueryValidator {
    catalog: Arc<SchemaCatalog>,
    max_rows: u32,
}

impl QueryValidator {
    pub fn new(catalog: Arc<SchemaCatalog>, max_rows: u32) -> Self {
        Self {
            catalog,
            max_rows: max_rows.max(1),
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn validate(&self, query: &QueryDescriptor) -> Result<ValidatedQuery, QueryRejection> {
        // 1. 表存在
        let table = self
            .catalog
            .table(&query.table)
            .ok_or_else(|| QueryRejection::UnknownTable(query.table.clone()))?;

        let mut out = QueryDescriptor::new(table.name());

        // 2 + 3. 列存在且操作允许
        for column in &query.columns {
            let entry = self.column_for(table, column, Operation::Read)?;
            out.columns.push(entry.name.clone());
        }

        for predicate in &query.filters {
            let entry = self.column_for(table, &predicate.column, Operation::Filter)?;
            check_literal(entry, predicate.op, &predicate.value)?;
            let mut canonical = predicate.clone();
            canonical.column = entry.name.clone();
            out.filters.push(canonical);
        }

        for agg in &query.aggregations {
            let mut canonical = agg.clone();
            if agg.column == "*" {
                if agg.func.requires_numeric() {
                    return Err(QueryRejection::TypeMismatch {
                        column: "*".to_string(),
                        reason: format!("{} requires a numeric column", agg.func.as_str()),
                    });
                }
                self.check_table_op(table, Operation::Aggregate)?;
            } else {
                let entry = self.column_for(table, &agg.column, Operation::Aggregate)?;
                if agg.func.requires_numeric() && !entry.column_type.is_numeric() {
                    return Err(QueryRejection::TypeMismatch {
                        column: entry.name.clone(),
                        reason: format!("{} requires a numeric column", agg.func.as_str()),
                    });
                }
                canonical.column = entry.name.clone();
            }
            out.aggregations.push(canonical);
        }

        for column in &query.group_by {
            let entry = self.column_for(table, column, Operation::Aggregate)?;
            out.group_by.push(entry.name.clone());
        }

        let aliases: Vec<String> = out.aggregations.iter().map(|a| a.output_name()).collect();
        for order in &query.order_by {
            let mut canonical = order.clone();
            if let Some(alias) = aliases.iter().find(|a| a.eq_ignore_ascii_case(&order.column)) {
                canonical.column = alias.clone();
            } else {
                let entry = self.column_for(table, &order.column, Operation::Sort)?;
                canonical.column = entry.name.clone();
            }
            out.order_by.push(canonical);
        }

        // 聚合查询中的普通列必须出现在 group_by
        if !out.aggregations.is_empty() {
            if let Some(loose) = out.columns.iter().find(|c| !out.group_by.contains(c)) {
                return Err(QueryRejection::InvalidShape(format!(
                    "column '{loose}' must appear in group_by when aggregating"
                )));
            }
        } else if !out.group_by.is_empty() {
            return Err(QueryRejection::InvalidShape(
                "group_by requires at least one aggregation".to_string(),
            ));
        }

        // 未选列也未聚合：展开为全部可读列
        if out.columns.is_empty() && out.aggregations.is_empty() {
            self.check_table_op(table, Operation::Read)?;
            out.columns = table
                .columns
                .iter()
                .filter(|c| c.allows(Operation::Read))
                .map(|c| c.name.clone())
                .collect();
        }

        out.limit = Some(query.limit.unwrap_or(self.max_rows).min(self.max_rows));

        Ok(ValidatedQuery { descriptor: out })
    }

    fn column_for<'a>(
        &self,
        table: &'a TableSchema,
        column: &str,
        op: Operation,
    ) -> Result<&'a SchemaEntry, QueryRejection> {
        let entry = table.column(column).ok_or_else(|| QueryRejection::UnknownColumn {
            table: table.name().to_string(),
            column: column.to_string(),
        })?;
        self.check_table_op(table, op)?;
        if !entry.allows(op) {
            return Err(QueryRejection::OperationNotAllowed {
                entry: format!("{}.{}", table.name(), entry.name),
                op: op.as_str(),
            });
        }
        Ok(entry)
    }

    fn check_table_op(&self, table: &TableSchema, op: Operation) -> Result<(), QueryRejection> {
        if table.entry.allows(op) {
            Ok(())
        } else {
            Err(QueryRejection::OperationNotAllowed {
                entry: table.name().to_string(),
                op: op.as_str(),
            })
        }
    }
}

fn check_literal(entry: &SchemaEntry, op: FilterOp, value: &Literal) -> Result<(), QueryRejection> {
    let mismatch = |reason: &str| QueryRejection::TypeMismatch {
        column: entry.name.clone(),
        reason: reason.to_string(),
    };
    match (op, value) {
        (FilterOp::In, Literal::List(items)) => {
            if items.is_empty() {
                return Err(mismatch("'in' requires a non-empty list"));
            }
            if items.iter().any(|v| matches!(v, Literal::List(_))) {
                return Err(mismatch("nested lists are not allowed"));
            }
            Ok(())
        }
        (FilterOp::In, _) => Err(mismatch("'in' requires a list value")),
        (_, Literal::List(_)) => Err(mismatch("list values are only allowed with 'in'")),
        (FilterOp::Contains, Literal::Text(_)) if !entry.column_type.is_numeric() => Ok(()),
        (FilterOp::Contains, _) => Err(mismatch("'contains' requires a text column and text value")),
        (op, v) if op.is_ordered() => {
            if !entry.column_type.is_ordered() {
                return Err(mismatch("ordered comparison on a non-ordered column"));
            }
            match (entry.column_type, v) {
                (ColumnType::Numeric, Literal::Number(_)) => Ok(()),
                (ColumnType::Temporal, Literal::Text(_)) => Ok(()),
                _ => Err(mismatch("literal type does not match column type")),
            }
        }
        (_, Literal::Text(_)) if entry.column_type.is_numeric() => {
            Err(mismatch("text literal compared with a numeric column"))
        }
        _ => Ok(()),
    }
}
