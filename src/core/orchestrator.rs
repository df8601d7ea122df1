//! 请求编排器
//!
//! 一次请求：意图抽取 → 计划（或澄清）→ 校验调度 → 执行非合成步骤 → 合成 → 追加对话。
//! ExecutionState 的生命周期归这里所有；步骤失败只作为状态中的记录，不会越过本模块向上抛出。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::agents::{IntentAnalysis, IntentExtractor, Planner};
use crate::catalog::SchemaCatalog;
use crate::core::session::{SessionId, SessionRegistry};
use crate::core::state::{RequestLifecycle, RequestPhase};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::data::RowSet;
use crate::execution::{
    ChartSpec, ExecutionState, FailureKind, PlanRunner, RecordedError, SharedState, StepContext,
    StepFailure, StepOutput,
};
use crate::memory::Turn;
use crate::plan::{
    ExecutionPlan, PlanScheduler, PlanStep, ScheduledPlan, StepId, StepKind, StepPayload, SynthesisSpec,
};

/// 请求失败原因（决定传输层的状态码）
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("The question is empty")]
    EmptyQuery,

    #[error("The plan was rejected: {0}")]
    PlanRejected(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Required data could not be retrieved (step '{step_id}'): {message}")]
    CriticalStep {
        step_id: StepId,
        kind: FailureKind,
        message: String,
    },

    #[error("The request exceeded its deadline of {0}ms")]
    Timeout(u64),

    #[error("The request was cancelled")]
    Cancelled,
}

/// 计划摘要中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub id: StepId,
    pub kind: StepKind,
    pub description: String,
    /// success / failed / skipped / not_run
    pub status: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub queries_executed: usize,
    pub rows_processed: usize,
    pub has_visualization: bool,
    pub intent: Option<String>,
}

/// 一次请求的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub session_id: SessionId,
    pub response: String,
    pub phase: RequestPhase,
    pub errors: Vec<RecordedError>,
    pub execution_plan_summary: Vec<StepSummary>,
    pub metadata: ResponseMetadata,
    pub chart: Option<ChartSpec>,
    pub failure: Option<FailureReason>,
    /// 请求结束时的执行状态快照（截止后已封存）
    #[serde(skip)]
    pub state: ExecutionState,
    #[serde(skip)]
    pub phases: Vec<RequestPhase>,
}

impl RequestOutcome {
    pub fn is_done(&self) -> bool {
        self.phase == RequestPhase::Done
    }
}

pub struct Orchestrator {
    catalog: Arc<SchemaCatalog>,
    intent: Arc<dyn IntentExtractor>,
    planner: Arc<dyn Planner>,
    runner: PlanRunner,
    scheduler: PlanScheduler,
    recovery: RecoveryEngine,
    sessions: Arc<SessionRegistry>,
    request_timeout: Duration,
}

/// 请求进行中的可变部分
struct Request {
    session_id: SessionId,
    lifecycle: RequestLifecycle,
    intent: Option<String>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        intent: Arc<dyn IntentExtractor>,
        planner: Arc<dyn Planner>,
        runner: PlanRunner,
        sessions: Arc<SessionRegistry>,
        request_timeout: Duration,
    ) -> Self {
        let recovery = *runner.executor().recovery();
        Self {
            catalog,
            intent,
            planner,
            runner,
            scheduler: PlanScheduler::new(),
            recovery,
            sessions,
            request_timeout,
        }
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// 数据集样例行（`GET /sample`）
    pub async fn sample(&self, table: &str, limit: u32) -> Result<RowSet, StepFailure> {
        self.runner.executor().sample(table, limit).await
    }

    pub async fn process_query(&self, session_id: Option<&str>, query: &str) -> RequestOutcome {
        self.process_query_with_cancel(session_id, query, CancellationToken::new())
            .await
    }

    /// 处理一次请求；`cancel` 触发时放弃进行中的步骤
    pub async fn process_query_with_cancel(
        &self,
        session_id: Option<&str>,
        query: &str,
        cancel: CancellationToken,
    ) -> RequestOutcome {
        let (session_id, session) = self.sessions.get_or_create(session_id).await;
        let mut req = Request {
            session_id,
            lifecycle: RequestLifecycle::new(),
            intent: None,
        };
        tracing::info!(session = %req.session_id, "Request received: {}", query);

        let query = query.trim();
        if query.is_empty() {
            return self.fail(req, FailureReason::EmptyQuery, None, None).await;
        }

        let deadline = Instant::now() + self.request_timeout;
        let conversation = session.lock().await.window.snapshot();
        let state = SharedState::new(ExecutionState::new(conversation.clone()));
        let ctx = StepContext::new(query);

        // 意图 + 计划
        let planned = timeout_at(deadline, self.acquire_plan(query, &conversation)).await;
        let (analysis, mut plan) = match planned {
            Ok(Ok(planned)) => planned,
            Ok(Err(reason)) => return self.fail(req, reason, None, None).await,
            Err(_) => return self.fail(req, self.timeout_reason(), None, Some(&state)).await,
        };
        req.intent = Some(analysis.intent.as_str().to_string());
        plan.ensure_synthesis();
        self.advance(&mut req, RequestPhase::Planned);

        let plan = match self.scheduler.schedule(&plan) {
            Ok(plan) => plan,
            Err(e) => {
                return self
                    .fail(req, FailureReason::PlanRejected(e.to_string()), None, Some(&state))
                    .await
            }
        };
        tracing::info!(order = ?plan.order(), "Plan scheduled");
        self.advance(&mut req, RequestPhase::Scheduled);

        // 非合成步骤；每完成一步再次进入 EXECUTING
        self.advance(&mut req, RequestPhase::Executing);
        let lifecycle = &mut req.lifecycle;
        let run = self.runner.run_steps_with(&plan, &state, &ctx, &cancel, |id| {
            tracing::debug!(step = %id, "Step finished");
            if let Err(e) = lifecycle.advance(RequestPhase::Executing) {
                tracing::error!("{}", e);
            }
        });
        match timeout_at(deadline, run).await {
            Ok(finished) => {
                if cancel.is_cancelled() {
                    state.seal().await;
                    return self.fail(req, FailureReason::Cancelled, Some(&plan), Some(&state)).await;
                }
                tracing::debug!(finished, "Execution phase complete");
            }
            Err(_) => return self.timed_out(req, &cancel, &plan, &state).await,
        }

        if let Some(reason) = self.critical_failure(&plan, &state).await {
            return self.fail(req, reason, Some(&plan), Some(&state)).await;
        }

        // 合成
        self.advance(&mut req, RequestPhase::Synthesizing);
        if timeout_at(deadline, self.runner.run_synthesis(&plan, &state, &ctx))
            .await
            .is_err()
        {
            return self.timed_out(req, &cancel, &plan, &state).await;
        }
        self.advance(&mut req, RequestPhase::Done);

        let snapshot = state.snapshot().await;
        let response = final_response(&plan, &snapshot);
        self.sessions
            .append_turn(&session, Turn::new(query, response.clone()))
            .await;
        self.outcome(req, response, None, Some(&plan), snapshot)
    }

    pub async fn reset(&self, session_id: &str) -> bool {
        self.sessions.reset(session_id).await
    }

    async fn acquire_plan(
        &self,
        query: &str,
        conversation: &[Turn],
    ) -> Result<(IntentAnalysis, ExecutionPlan), FailureReason> {
        let analysis = self
            .intent
            .extract(query, conversation, &self.catalog.names())
            .await
            .map_err(upstream)?;

        if analysis.needs_clarification() {
            tracing::info!(ambiguities = ?analysis.ambiguities, "Asking for clarification");
            let plan = ExecutionPlan::new(vec![clarification_step(&analysis)]);
            return Ok((analysis, plan));
        }

        let plan = self
            .planner
            .plan(query, &analysis, &self.catalog)
            .await
            .map_err(|e| match e {
                AgentError::JsonParseError(msg) => FailureReason::PlanRejected(msg),
                other => upstream(other),
            })?;
        Ok((analysis, plan))
    }

    /// 传递地供给合成步骤的检索步骤失败时，整个请求失败
    async fn critical_failure(&self, plan: &ScheduledPlan, state: &SharedState) -> Option<FailureReason> {
        state
            .read(|s| {
                plan.steps().iter().find_map(|step| {
                    let failure = s.result(&step.id)?.failure()?;
                    let action = self.recovery.settle(step.kind(), plan.feeds_synthesis(&step.id));
                    (action == RecoveryAction::Abort).then(|| FailureReason::CriticalStep {
                        step_id: step.id.clone(),
                        kind: failure.kind,
                        message: failure.message.clone(),
                    })
                })
            })
            .await
    }

    fn advance(&self, req: &mut Request, next: RequestPhase) {
        if let Err(e) = req.lifecycle.advance(next) {
            tracing::error!("{}", e);
        }
    }

    fn timeout_reason(&self) -> FailureReason {
        FailureReason::Timeout(self.request_timeout.as_millis() as u64)
    }

    async fn timed_out(
        &self,
        req: Request,
        cancel: &CancellationToken,
        plan: &ScheduledPlan,
        state: &SharedState,
    ) -> RequestOutcome {
        cancel.cancel();
        // 截止之后的任何写入都被丢弃
        state.seal().await;
        self.fail(req, self.timeout_reason(), Some(plan), Some(state)).await
    }

    async fn fail(
        &self,
        mut req: Request,
        reason: FailureReason,
        plan: Option<&ScheduledPlan>,
        state: Option<&SharedState>,
    ) -> RequestOutcome {
        req.lifecycle.fail(&reason.to_string());
        let snapshot = match state {
            Some(state) => state.snapshot().await,
            None => ExecutionState::default(),
        };
        let response = format!("I couldn't answer this question. {reason}");
        self.outcome(req, response, Some(reason), plan, snapshot)
    }

    fn outcome(
        &self,
        req: Request,
        response: String,
        failure: Option<FailureReason>,
        plan: Option<&ScheduledPlan>,
        state: ExecutionState,
    ) -> RequestOutcome {
        let execution_plan_summary = plan.map(|p| summarize(p, &state)).unwrap_or_default();
        let mut metadata = ResponseMetadata {
            intent: req.intent,
            ..Default::default()
        };
        let mut chart = None;
        for result in state.results() {
            match result.output() {
                Some(StepOutput::Rows(rows)) if result.kind == StepKind::Retrieval => {
                    metadata.queries_executed += 1;
                    metadata.rows_processed += rows.len();
                }
                Some(StepOutput::Chart(spec)) => {
                    metadata.has_visualization = true;
                    chart.get_or_insert_with(|| spec.clone());
                }
                _ => {}
            }
        }

        tracing::info!(
            session = %req.session_id,
            phase = %req.lifecycle.phase(),
            errors = state.errors().len(),
            "Request finished"
        );
        RequestOutcome {
            session_id: req.session_id,
            response,
            phase: req.lifecycle.phase(),
            errors: state.errors().to_vec(),
            execution_plan_summary,
            metadata,
            chart,
            failure,
            phases: req.lifecycle.history().to_vec(),
            state,
        }
    }
}

fn upstream(e: AgentError) -> FailureReason {
    FailureReason::Upstream(e.to_string())
}

fn clarification_step(analysis: &IntentAnalysis) -> PlanStep {
    let mut clarifications = analysis.ambiguities.clone();
    if clarifications.is_empty() {
        clarifications.push("Which companies, columns or time period are you asking about?".to_string());
    }
    let mut step = PlanStep::synthesis("clarify").describe("Ask the user for clarification");
    step.payload = StepPayload::Synthesis {
        synthesis: SynthesisSpec {
            instructions: None,
            clarifications,
        },
    };
    step
}

/// 最后一个合成步骤的文本
fn final_response(plan: &ScheduledPlan, state: &ExecutionState) -> String {
    plan.steps()
        .iter()
        .rev()
        .filter(|s| s.kind() == StepKind::Synthesis)
        .find_map(|s| state.successful_output(&s.id).and_then(StepOutput::text))
        .map(String::from)
        .unwrap_or_else(|| "I could not produce an answer from the available data.".to_string())
}

fn summarize(plan: &ScheduledPlan, state: &ExecutionState) -> Vec<StepSummary> {
    plan.steps()
        .iter()
        .map(|step| {
            let (status, attempts) = match state.result(&step.id) {
                None => ("not_run", 0),
                Some(r) => match r.failure() {
                    None => ("success", r.attempts),
                    Some(f) if f.kind == FailureKind::DependencyUnavailable => ("skipped", r.attempts),
                    Some(_) => ("failed", r.attempts),
                },
            };
            StepSummary {
                id: step.id.clone(),
                kind: step.kind(),
                description: step.description.clone(),
                status: status.to_string(),
                attempts,
            }
        })
        .collect()
}
