//! Sage - 多步查询执行核心
//!
//! 模块划分：
//! - **agents**: 意图抽取与计划生成（LLM / 规则 / 固定计划）
//! - **api**: 请求 / 响应 DTO 与状态码映射
//! - **catalog**: 模式目录（表、列、类型、允许的操作）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、请求状态机、恢复策略、会话注册表
//! - **data**: 只读数据源（SQLite）与数据集导入
//! - **execution**: 单步执行、计划运行、执行状态、分析 / 图表 / 合成
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话窗口与持久化
//! - **plan**: 计划类型、依赖图、校验与拓扑调度
//! - **query**: 只读查询描述符与校验器

pub mod agents;
pub mod api;
pub mod catalog;
pub mod config;
pub mod core;
pub mod data;
pub mod execution;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod query;

pub use crate::core::{Orchestrator, OrchestratorBuilder, RequestOutcome, RequestPhase};
