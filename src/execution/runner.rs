//! 计划运行器
//!
//! 就绪队列驱动：入度为 0 的非合成步骤并发执行（Semaphore 限流），
//! 每个步骤到达终态后更新下游入度；全部非合成步骤结束后再顺序执行合成步骤。
//! 步骤 future 不 spawn，外层超时或取消时未完成的步骤随之丢弃。

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::execution::executor::{StepContext, StepExecutor};
use crate::execution::state::SharedState;
use crate::plan::{ScheduledPlan, StepId, StepKind};

pub struct PlanRunner {
    executor: Arc<StepExecutor>,
    permits: Arc<Semaphore>,
}

impl PlanRunner {
    pub fn new(executor: Arc<StepExecutor>, max_concurrent_steps: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent_steps.max(1))),
        }
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    /// 执行全部非合成步骤；返回已到达终态的步骤数
    pub async fn run_steps(
        &self,
        plan: &ScheduledPlan,
        state: &SharedState,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> usize {
        self.run_steps_with(plan, state, ctx, cancel, |_| {}).await
    }

    /// 同 run_steps；每个步骤到达终态后回调 `on_step`
    pub async fn run_steps_with(
        &self,
        plan: &ScheduledPlan,
        state: &SharedState,
        ctx: &StepContext,
        cancel: &CancellationToken,
        mut on_step: impl FnMut(&StepId) + Send,
    ) -> usize {
        let graph = plan.graph();
        let mut in_degree = graph.in_degree.clone();
        let mut in_flight = FuturesUnordered::new();

        for id in graph.ready_steps() {
            if !is_synthesis(plan, &id) {
                in_flight.push(self.run_one(plan, id, state, ctx));
            }
        }

        let mut finished = 0;
        loop {
            let done = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!("Plan run cancelled, abandoning in-flight steps");
                    break;
                }
                next = in_flight.next() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            finished += 1;
            on_step(&done);
            for id in graph.mark_completed(&mut in_degree, &done) {
                if !is_synthesis(plan, &id) {
                    in_flight.push(self.run_one(plan, id, state, ctx));
                }
            }
        }
        finished
    }

    /// 顺序执行合成步骤（拓扑序）
    pub async fn run_synthesis(&self, plan: &ScheduledPlan, state: &SharedState, ctx: &StepContext) {
        for step in plan.steps().iter().filter(|s| s.kind() == StepKind::Synthesis) {
            self.executor.execute(plan, step, state, ctx).await;
        }
    }

    async fn run_one(&self, plan: &ScheduledPlan, id: StepId, state: &SharedState, ctx: &StepContext) -> StepId {
        let Some(step) = plan.step(&id) else {
            return id;
        };
        // Semaphore 仅在关闭时返回错误，这里从不关闭
        let _permit = self.permits.acquire().await.ok();
        tracing::debug!("Executing step '{}'", id);
        self.executor.execute(plan, step, state, ctx).await;
        id
    }
}

fn is_synthesis(plan: &ScheduledPlan, id: &str) -> bool {
    plan.step(id).map(|s| s.kind() == StepKind::Synthesis).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sp500_catalog;
    use crate::core::RecoveryEngine;
    use crate::data::{DataSource, DataSourceError, RowSet};
    use crate::execution::state::ExecutionState;
    use crate::execution::synthesis::TemplateSynthesizer;
    use crate::plan::{ExecutionPlan, PlanScheduler, PlanStep};
    use crate::query::{QueryDescriptor, QueryValidator, ValidatedQuery};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// 记录每次查询开始与结束的表名（用列选择区分步骤）
    #[derive(Default)]
    struct RecordingSource {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DataSource for RecordingSource {
        async fn run_read_only_query(&self, q: &ValidatedQuery) -> Result<RowSet, DataSourceError> {
            let tag = q.descriptor().columns.join(",");
            self.events.lock().unwrap().push(format!("start {tag}"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.events.lock().unwrap().push(format!("end {tag}"));
            Ok(RowSet::new(vec!["Symbol".into()], vec![vec![json!("AAPL")]]))
        }
    }

    fn runner(source: Arc<RecordingSource>) -> PlanRunner {
        let executor = StepExecutor::new(
            Arc::new(QueryValidator::new(Arc::new(sp500_catalog()), 100)),
            source,
            Arc::new(TemplateSynthesizer::new()),
            RecoveryEngine::default(),
            Duration::from_secs(5),
        );
        PlanRunner::new(Arc::new(executor), 3)
    }

    fn fetch(id: &str, column: &str) -> PlanStep {
        PlanStep::retrieval(id, QueryDescriptor::new("sp500_companies").select([column]))
    }

    #[tokio::test]
    async fn test_dependent_starts_after_dependency_finishes() {
        let source = Arc::new(RecordingSource::default());
        let runner = runner(source.clone());
        let plan = PlanScheduler::new()
            .schedule(&ExecutionPlan::new(vec![
                fetch("a", "Symbol"),
                fetch("b", "Sector").depends_on(["a"]),
                fetch("c", "Sub_Industry"),
            ]))
            .unwrap();
        let state = SharedState::new(ExecutionState::default());
        let done = runner
            .run_steps(&plan, &state, &StepContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(done, 3);

        let events = source.events.lock().unwrap().clone();
        let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
        assert!(pos("end Symbol") < pos("start Sector"));
        // 独立步骤并发开始
        assert!(pos("start Sub_Industry") < pos("end Symbol"));
    }

    #[tokio::test]
    async fn test_each_finished_step_is_reported() {
        let source = Arc::new(RecordingSource::default());
        let runner = runner(source);
        let plan = PlanScheduler::new()
            .schedule(&ExecutionPlan::new(vec![
                fetch("a", "Symbol"),
                fetch("b", "Sector").depends_on(["a"]),
                PlanStep::synthesis("answer").depends_on(["b"]),
            ]))
            .unwrap();
        let state = SharedState::new(ExecutionState::default());
        let mut reported = Vec::new();
        let done = runner
            .run_steps_with(&plan, &state, &StepContext::default(), &CancellationToken::new(), |id| {
                reported.push(id.clone())
            })
            .await;
        assert_eq!(done, 2);
        assert_eq!(reported, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_synthesis_runs_only_in_second_phase() {
        let source = Arc::new(RecordingSource::default());
        let runner = runner(source);
        let plan = PlanScheduler::new()
            .schedule(&ExecutionPlan::new(vec![
                fetch("a", "Symbol"),
                PlanStep::synthesis("answer").depends_on(["a"]),
            ]))
            .unwrap();
        let state = SharedState::new(ExecutionState::default());
        let ctx = StepContext::new("list symbols");
        runner.run_steps(&plan, &state, &ctx, &CancellationToken::new()).await;
        assert!(state.read(|s| s.result("answer").is_none()).await);

        runner.run_synthesis(&plan, &state, &ctx).await;
        assert!(state.read(|s| s.result("answer").unwrap().is_success()).await);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_early() {
        let source = Arc::new(RecordingSource::default());
        let runner = runner(source);
        let plan = PlanScheduler::new()
            .schedule(&ExecutionPlan::new(vec![fetch("a", "Symbol")]))
            .unwrap();
        let state = SharedState::new(ExecutionState::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let done = runner.run_steps(&plan, &state, &StepContext::default(), &cancel).await;
        assert_eq!(done, 0);
    }
}
