//! 核心编排层：错误与恢复、请求状态机、会话注册表、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session;
pub mod state;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{FailureReason, Orchestrator, RequestOutcome, ResponseMetadata, StepSummary};
pub use recovery::RecoveryEngine;
pub use session::{Session, SessionHandle, SessionId, SessionRegistry};
pub use state::{IllegalTransition, RequestLifecycle, RequestPhase};
