//! 数据源层：只读查询接口、结果集、SQLite 实现与数据集导入
//!
//! 所有数据源实现 DataSource：只接受 ValidatedQuery，返回 RowSet 或 DataSourceError。

pub mod loader;
pub mod rows;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::query::ValidatedQuery;

pub use loader::{catalog_from_csv, load_csv, normalize_column_name, prepare_database, LoadError};
pub use rows::RowSet;
pub use sqlite::SqliteDataSource;

/// 数据源错误；Transient / Timeout 视为暂时性故障，可重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataSourceError {
    #[error("Transient data source error: {0}")]
    Transient(String),

    #[error("Data source timeout")]
    Timeout,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Data source unavailable: {0}")]
    Unavailable(String),
}

impl DataSourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DataSourceError::Transient(_) | DataSourceError::Timeout)
    }
}

/// 只读数据源：一次调用对应一次查询，连接可在同一请求的并发步骤间共享
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn run_read_only_query(&self, query: &ValidatedQuery) -> Result<RowSet, DataSourceError>;

    fn name(&self) -> &str {
        "data_source"
    }
}
