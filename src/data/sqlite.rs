//! SQLite 只读数据源
//!
//! ValidatedQuery 编译为单条参数化 SELECT：标识符加引号且只来自目录，字面量全部绑定为参数；
//! rusqlite 是同步接口，查询放到 spawn_blocking 中执行。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;

use crate::data::{DataSource, DataSourceError, RowSet};
use crate::query::{FilterOp, Literal, ValidatedQuery};

/// 共享的只读连接（同一请求的并发步骤共用，无写竞争）
#[derive(Clone)]
pub struct SqliteDataSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataSource {
    /// 以只读方式打开数据库文件
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, DataSourceError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| DataSourceError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// 复用已有连接（内存库 / 测试）
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl DataSource for SqliteDataSource {
    async fn run_read_only_query(&self, query: &ValidatedQuery) -> Result<RowSet, DataSourceError> {
        let (sql, params) = build_sql(query);
        let columns = query.output_columns();
        let conn = Arc::clone(&self.conn);

        tracing::debug!(sql = %sql, params = params.len(), "sqlite query");

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| DataSourceError::Unavailable("connection lock poisoned".to_string()))?;
            run(&conn, &sql, &params, columns)
        })
        .await
        .map_err(|e| DataSourceError::Transient(format!("query task aborted: {e}")))?
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

fn run(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    columns: Vec<String>,
) -> Result<RowSet, DataSourceError> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let width = stmt.column_count();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .map_err(map_sqlite_error)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            let cell = row.get_ref(i).map_err(map_sqlite_error)?;
            cells.push(to_json(cell));
        }
        out.push(cells);
    }
    Ok(RowSet::new(columns, out))
}

/// 忙 / 锁冲突视为暂时性错误，其余为查询错误
fn map_sqlite_error(err: rusqlite::Error) -> DataSourceError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            DataSourceError::Transient(err.to_string())
        }
        _ => DataSourceError::Query(err.to_string()),
    }
}

fn to_json(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn literal_param(value: &Literal) -> SqlValue {
    match value {
        Literal::Number(n) => SqlValue::Real(*n),
        Literal::Text(s) => SqlValue::Text(s.clone()),
        // 列表只出现在 IN 中，已展开
        Literal::List(_) => SqlValue::Null,
    }
}

/// 编译为参数化 SELECT
pub(crate) fn build_sql(query: &ValidatedQuery) -> (String, Vec<SqlValue>) {
    let d = query.descriptor();
    let mut params = Vec::new();

    let mut select = Vec::new();
    let mut plain: Vec<&String> = Vec::new();
    for column in d.group_by.iter().chain(d.columns.iter()) {
        if !plain.contains(&column) {
            plain.push(column);
        }
    }
    select.extend(plain.iter().map(|c| quote_ident(c)));
    for agg in &d.aggregations {
        let target = if agg.column == "*" {
            "*".to_string()
        } else {
            quote_ident(&agg.column)
        };
        select.push(format!(
            "{}({}) AS {}",
            agg.func.as_str().to_uppercase(),
            target,
            quote_ident(&agg.output_name())
        ));
    }

    let mut sql = format!("SELECT {} FROM {}", select.join(", "), quote_ident(&d.table));

    if !d.filters.is_empty() {
        let mut clauses = Vec::new();
        for p in &d.filters {
            let column = quote_ident(&p.column);
            match (&p.op, &p.value) {
                (FilterOp::In, Literal::List(items)) => {
                    let marks = vec!["?"; items.len()].join(", ");
                    params.extend(items.iter().map(literal_param));
                    clauses.push(format!("{column} IN ({marks})"));
                }
                (FilterOp::Contains, Literal::Text(s)) => {
                    let escaped = s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
                    params.push(SqlValue::Text(format!("%{escaped}%")));
                    clauses.push(format!("{column} LIKE ? ESCAPE '\\'"));
                }
                (op, value) => {
                    params.push(literal_param(value));
                    clauses.push(format!("{column} {} ?", op.sql()));
                }
            }
        }
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !d.group_by.is_empty() {
        let groups: Vec<String> = d.group_by.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
    }

    if !d.order_by.is_empty() {
        let orders: Vec<String> = d
            .order_by
            .iter()
            .map(|o| {
                format!(
                    "{} {}",
                    quote_ident(&o.column),
                    if o.descending { "DESC" } else { "ASC" }
                )
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
    }

    if let Some(limit) = d.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    (sql, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sp500_catalog;
    use crate::query::{AggregateFn, QueryDescriptor, QueryValidator};

    fn validator() -> QueryValidator {
        QueryValidator::new(Arc::new(sp500_catalog()), 50)
    }

    fn seeded() -> SqliteDataSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE sp500_companies ("Symbol" TEXT, "Sector" TEXT, "Revenue" REAL, "PE_Ratio" REAL);
            INSERT INTO sp500_companies VALUES ('AAPL', 'Information Technology', 394328, 28.5);
            INSERT INTO sp500_companies VALUES ('MSFT', 'Information Technology', 211915, 32.1);
            INSERT INTO sp500_companies VALUES ('JNJ', 'Health Care', 94943, 15.2);
            "#,
        )
        .unwrap();
        SqliteDataSource::from_connection(conn)
    }

    #[test]
    fn test_build_sql_parameterises_literals() {
        let q = QueryDescriptor::new("sp500_companies")
            .select(["Symbol"])
            .filter("Symbol", FilterOp::Eq, Literal::text("x'; DROP TABLE t; --"));
        let v = validator().validate(&q).unwrap();
        let (sql, params) = build_sql(&v);
        assert_eq!(
            sql,
            "SELECT \"Symbol\" FROM \"sp500_companies\" WHERE \"Symbol\" = ? LIMIT 50"
        );
        assert_eq!(params, vec![SqlValue::Text("x'; DROP TABLE t; --".into())]);
    }

    #[tokio::test]
    async fn test_lookup_query() {
        let ds = seeded();
        let q = QueryDescriptor::new("sp500_companies")
            .select(["Symbol", "Revenue"])
            .filter("Symbol", FilterOp::In, Literal::list(["AAPL", "MSFT"]))
            .order_by("Revenue", true);
        let v = validator().validate(&q).unwrap();
        let rows = ds.run_read_only_query(&v).await.unwrap();
        assert_eq!(rows.columns, vec!["Symbol", "Revenue"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows[0][0], Value::from("AAPL"));
        assert_eq!(rows.rows[1][1], Value::from(211915.0));
    }

    #[tokio::test]
    async fn test_grouped_aggregate() {
        let ds = seeded();
        let q = QueryDescriptor::new("sp500_companies")
            .select(["Sector"])
            .aggregate(AggregateFn::Count, "*")
            .group_by("Sector")
            .order_by("count", true);
        let v = validator().validate(&q).unwrap();
        let rows = ds.run_read_only_query(&v).await.unwrap();
        assert_eq!(rows.columns, vec!["Sector", "count"]);
        assert_eq!(rows.rows[0], vec![Value::from("Information Technology"), Value::from(2)]);
    }

    #[tokio::test]
    async fn test_contains_escapes_wildcards() {
        let ds = seeded();
        let q = QueryDescriptor::new("sp500_companies")
            .select(["Symbol"])
            .filter("Sector", FilterOp::Contains, Literal::text("%"));
        let v = validator().validate(&q).unwrap();
        let rows = ds.run_read_only_query(&v).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_read_only_file_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        let ds = SqliteDataSource::open_read_only(&path).unwrap();
        let conn = ds.conn.lock().unwrap();
        assert!(conn.execute("INSERT INTO t VALUES (2)", []).is_err());
    }
}
