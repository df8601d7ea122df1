//! 单步执行器
//!
//! 执行一个计划步骤：只读取声明依赖的结果，结果与错误写回 ExecutionState；
//! 每次尝试受单步超时约束，暂时性失败按 RecoveryEngine 重试；每步输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::{RecoveryAction, RecoveryEngine};
use crate::data::{DataSource, RowSet};
use crate::execution::analysis::run_analysis;
use crate::execution::chart::select_chart;
use crate::execution::result::{FailureKind, StepFailure, StepOutput, StepResult};
use crate::execution::state::SharedState;
use crate::execution::synthesis::{Fact, SynthesisContext, Synthesizer, TemplateSynthesizer};
use crate::plan::{PlanStep, ScheduledPlan, StepId, StepKind, StepPayload, SynthesisSpec};
use crate::query::{QueryDescriptor, QueryValidator};

/// 请求级上下文（对所有步骤只读）
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub query: String,
}

impl StepContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into() }
    }
}

pub struct StepExecutor {
    validator: Arc<QueryValidator>,
    data_source: Arc<dyn DataSource>,
    synthesizer: Arc<dyn Synthesizer>,
    fallback: TemplateSynthesizer,
    recovery: RecoveryEngine,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        validator: Arc<QueryValidator>,
        data_source: Arc<dyn DataSource>,
        synthesizer: Arc<dyn Synthesizer>,
        recovery: RecoveryEngine,
        step_timeout: Duration,
    ) -> Self {
        Self {
            validator,
            data_source,
            synthesizer,
            fallback: TemplateSynthesizer::new(),
            recovery,
            step_timeout,
        }
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// 样例行：与检索步骤同一条校验 + 只读查询路径，不写入任何请求状态
    pub async fn sample(&self, table: &str, limit: u32) -> Result<RowSet, StepFailure> {
        let validated = self.validator.validate(&QueryDescriptor::new(table).limit(limit))?;
        let rows = timeout(self.step_timeout, self.data_source.run_read_only_query(&validated))
            .await
            .map_err(|_| StepFailure::new(FailureKind::Timeout, "sample query timed out"))??;
        tracing::debug!("Sampled {} rows from {}", rows.len(), validated.table());
        Ok(rows)
    }

    /// 执行一步并把结果写入状态；返回写入的结果
    pub async fn execute(
        &self,
        plan: &ScheduledPlan,
        step: &PlanStep,
        state: &SharedState,
        ctx: &StepContext,
    ) -> StepResult {
        let start = Instant::now();
        let result = match &step.payload {
            StepPayload::Synthesis { synthesis } => {
                self.run_synthesis(plan, step, synthesis, state, ctx).await
            }
            _ => match dependency_outputs(plan, step, state).await {
                Ok(inputs) => self.run_with_retry(step, &inputs, state).await,
                Err(failure) => {
                    state.record_error(&step.id, &failure, 0).await;
                    let failures = state.increment_retry(&step.id).await;
                    let action = self.recovery.handle(failure.kind, failures);
                    tracing::warn!(?action, "Skipping step '{}': {}", step.id, failure.message);
                    StepResult::failed(&step.id, step.kind(), 0, failure)
                }
            },
        };

        let outcome = match result.failure() {
            None => "ok",
            Some(f) => f.kind.as_str(),
        };
        let audit = serde_json::json!({
            "event": "step_audit",
            "step": step.id,
            "kind": step.kind().as_str(),
            "outcome": outcome,
            "attempts": result.attempts,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "step");

        state.record(result.clone()).await;
        result
    }

    async fn run_with_retry(
        &self,
        step: &PlanStep,
        inputs: &[(StepId, StepOutput)],
        state: &SharedState,
    ) -> StepResult {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match timeout(self.step_timeout, self.run_once(step, inputs)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepFailure::new(
                    FailureKind::Timeout,
                    format!("step timed out after {}ms", self.step_timeout.as_millis()),
                )),
            };

            let failure = match outcome {
                Ok(output) => return StepResult::success(&step.id, step.kind(), attempt, output),
                Err(failure) => failure,
            };

            state.record_error(&step.id, &failure, attempt).await;
            let failures = state.increment_retry(&step.id).await;
            match self.recovery.handle(failure.kind, failures) {
                RecoveryAction::Retry => {
                    tracing::warn!("Step '{}' attempt {} failed, retrying: {}", step.id, attempt, failure);
                }
                _ => {
                    tracing::warn!("Step '{}' failed: {}", step.id, failure);
                    return StepResult::failed(&step.id, step.kind(), attempt, failure);
                }
            }
        }
    }

    async fn run_once(&self, step: &PlanStep, inputs: &[(StepId, StepOutput)]) -> Result<StepOutput, StepFailure> {
        match &step.payload {
            StepPayload::Retrieval { query } => {
                // 校验失败时数据源不会被调用
                let validated = self.validator.validate(query)?;
                let rows = self.data_source.run_read_only_query(&validated).await?;
                tracing::debug!("Step '{}' retrieved {} rows", step.id, rows.len());
                Ok(StepOutput::Rows(rows))
            }
            StepPayload::Analysis { analysis } => {
                let sources: Vec<&StepId> = if analysis.sources.is_empty() {
                    inputs.iter().map(|(id, _)| id).collect()
                } else {
                    analysis.sources.iter().collect()
                };
                // 声明的来源必须存在且为表格结果，不做静默丢弃
                let tables = sources
                    .into_iter()
                    .map(|id| {
                        let (_, output) = inputs.iter().find(|(dep, _)| dep == id).ok_or_else(|| {
                            StepFailure::new(
                                FailureKind::Computation,
                                format!("analysis source '{id}' is not among the step's results"),
                            )
                        })?;
                        as_rowset(output).map(|rows| (id.clone(), rows)).ok_or_else(|| {
                            StepFailure::new(
                                FailureKind::Computation,
                                format!("analysis source '{id}' produced no tabular result"),
                            )
                        })
                    })
                    .collect::<Result<Vec<(StepId, RowSet)>, StepFailure>>()?;
                run_analysis(analysis, &tables)
                    .map(StepOutput::Analysis)
                    .map_err(|e| StepFailure::new(FailureKind::Computation, e))
            }
            StepPayload::Visualization { chart } => {
                let rows = inputs
                    .iter()
                    .find_map(|(_, output)| as_rowset(output))
                    .ok_or_else(|| StepFailure::new(FailureKind::Computation, "no tabular input to visualize"))?;
                select_chart(chart, &rows)
                    .map(StepOutput::Chart)
                    .map_err(|e| StepFailure::new(FailureKind::Computation, e))
            }
            StepPayload::Synthesis { .. } => Err(StepFailure::new(
                FailureKind::PlanStructure,
                "synthesis steps are not retried",
            )),
        }
    }

    /// 合成步骤：容忍失败的依赖，失败部分写入降级说明；合成器失败时回落到模板
    async fn run_synthesis(
        &self,
        plan: &ScheduledPlan,
        step: &PlanStep,
        spec: &SynthesisSpec,
        state: &SharedState,
        ctx: &StepContext,
    ) -> StepResult {
        let dependencies = plan.graph().transitive_dependencies(&step.id);
        let (facts, missing) = state
            .read(|s| {
                let mut facts = Vec::new();
                let mut missing = Vec::new();
                for dep in plan.steps().iter().filter(|p| dependencies.contains(&p.id)) {
                    match s.result(&dep.id) {
                        Some(r) => match (r.output(), r.failure()) {
                            (Some(output), _) => facts.push(Fact {
                                step_id: dep.id.clone(),
                                kind: dep.kind(),
                                description: dep.description.clone(),
                                output: output.clone(),
                            }),
                            (None, Some(f)) => missing.push(format!(
                                "{} ({}) could not be completed: {}",
                                describe(dep),
                                dep.kind().as_str(),
                                f.message
                            )),
                            (None, None) => {}
                        },
                        None => missing.push(format!("{} ({}) did not run", describe(dep), dep.kind().as_str())),
                    }
                }
                (facts, missing)
            })
            .await;

        let synthesis_ctx = SynthesisContext {
            query: ctx.query.clone(),
            facts,
            missing,
            clarifications: spec.clarifications.clone(),
            instructions: spec.instructions.clone(),
        };

        let synthesized = match timeout(self.step_timeout, self.synthesizer.synthesize(&synthesis_ctx)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("synthesis timed out after {}ms", self.step_timeout.as_millis())),
        };
        let text = match synthesized {
            Ok(text) => text,
            Err(message) => {
                let failure = StepFailure::new(FailureKind::SynthesisFault, message);
                tracing::warn!("Step '{}' degraded: {}", step.id, failure);
                state.record_error(&step.id, &failure, 1).await;
                self.fallback.render(&synthesis_ctx)
            }
        };

        StepResult::success(&step.id, StepKind::Synthesis, 1, StepOutput::Text { text })
    }
}

fn describe(step: &PlanStep) -> String {
    if step.description.is_empty() {
        format!("step '{}'", step.id)
    } else {
        format!("step '{}' ({})", step.id, step.description)
    }
}

fn as_rowset(output: &StepOutput) -> Option<RowSet> {
    match output {
        StepOutput::Rows(rows) => Some(rows.clone()),
        StepOutput::Analysis(analysis) if !analysis.values.is_empty() => Some(analysis.to_rowset()),
        _ => None,
    }
}

/// 直接依赖的成功输出（声明顺序）；任一依赖未完成或失败即 DependencyUnavailable
async fn dependency_outputs(
    plan: &ScheduledPlan,
    step: &PlanStep,
    state: &SharedState,
) -> Result<Vec<(StepId, StepOutput)>, StepFailure> {
    let deps = plan.graph().dependencies_of(&step.id).to_vec();
    state
        .read(|s| {
            deps.iter()
                .map(|dep| match s.result(dep) {
                    Some(r) => r.output().cloned().map(|o| (dep.clone(), o)).ok_or_else(|| {
                        StepFailure::new(
                            FailureKind::DependencyUnavailable,
                            format!("dependency '{dep}' failed"),
                        )
                    }),
                    None => Err(StepFailure::new(
                        FailureKind::DependencyUnavailable,
                        format!("dependency '{dep}' has not completed"),
                    )),
                })
                .collect()
        })
        .await
}
