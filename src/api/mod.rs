//! 传输层数据结构：请求 / 响应 DTO 与状态码映射（CLI 与 HTTP 服务共用）

pub mod dto;

pub use dto::{
    sample_status_code, status_code, HealthResponse, QueryRequest, QueryResponse, ResetRequest, ResetResponse,
    SampleQuery, SampleResponse,
};
