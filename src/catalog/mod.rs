//! 模式目录：可查询的表、列、类型与允许的操作

pub mod schema;
pub mod sp500;

pub use schema::{CatalogError, ColumnType, Operation, SchemaCatalog, SchemaEntry, TableSchema};
pub use sp500::{sp500_catalog, sp500_table, SP500_TABLE};
