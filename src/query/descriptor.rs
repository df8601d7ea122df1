//! 只读查询描述符
//!
//! Planner 只能提交这个封闭结构，不接受任何自由文本 SQL；未知字段在反序列化时直接拒绝。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 声明式只读查询：目标表、选取列、过滤、聚合、分组、排序、行数上限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryDescriptor {
    /// 目标表名（必须存在于模式目录）
    pub table: String,
    /// 选取的列；与 aggregations 同时为空时表示全部列
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Predicate>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl QueryDescriptor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            aggregations: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: FilterOp, value: Literal) -> Self {
        self.filters.push(Predicate {
            column: column.into(),
            op,
            value,
        });
        self
    }

    pub fn aggregate(mut self, func: AggregateFn, column: impl Into<String>) -> Self {
        self.aggregations.push(Aggregation {
            func,
            column: column.into(),
            alias: None,
        });
        self
    }

    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by.push(column.into());
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 过滤谓词：`column op value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Predicate {
    pub column: String,
    pub op: FilterOp,
    pub value: Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

impl FilterOp {
    /// 需要有序列类型（数值 / 日期）的比较
    pub fn is_ordered(&self) -> bool {
        matches!(self, FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte)
    }

    pub fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::In => "IN",
            FilterOp::Contains => "LIKE",
        }
    }
}

/// 过滤字面量：数字、文本或列表（仅 `in`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Literal {
    Number(f64),
    Text(String),
    List(Vec<Literal>),
}

impl Literal {
    pub fn text(value: impl Into<String>) -> Self {
        Literal::Text(value.into())
    }

    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Literal::List(values.into_iter().map(|v| Literal::Text(v.into())).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Aggregation {
    pub func: AggregateFn,
    /// 列名；`count` 可用 `*`
    pub column: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregation {
    /// 结果列名：显式 alias，否则 `func_column`（`count(*)` 为 `count`）
    pub fn output_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        if self.column == "*" {
            self.func.as_str().to_string()
        } else {
            format!("{}_{}", self.func.as_str(), self.column)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
        }
    }

    /// sum / avg 只对数值列有意义
    pub fn requires_numeric(&self) -> bool {
        matches!(self, AggregateFn::Sum | AggregateFn::Avg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}
