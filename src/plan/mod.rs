pub mod types;
pub mod graph;
pub mod scheduler;
pub mod schema;

pub use types::*;
pub use graph::DependencyGraph;
pub use scheduler::{PlanScheduler, ScheduledPlan};
pub use schema::plan_schema_json;
