//! 只读查询：描述符与校验器

pub mod descriptor;
pub mod validator;

pub use descriptor::{AggregateFn, Aggregation, FilterOp, Literal, OrderBy, Predicate, QueryDescriptor};
pub use validator::{QueryRejection, QueryValidator, ValidatedQuery};
