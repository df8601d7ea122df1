//! 计划校验与调度
//!
//! 校验顺序：非空 → ID 唯一 → 依赖均已声明 → 分析来源均为依赖 → 无环 → 合成步骤为终点。
//! 任一项失败即拒绝，不执行任何步骤；本模块不做 I/O。

use std::collections::HashMap;

use crate::plan::graph::DependencyGraph;
use crate::plan::types::*;

/// 调度后的计划：步骤按拓扑序排列（同层按声明顺序）
#[derive(Debug, Clone)]
pub struct ScheduledPlan {
    steps: Vec<PlanStep>,
    graph: DependencyGraph,
}

impl ScheduledPlan {
    /// 拓扑序下的步骤
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 拓扑序下的步骤 ID
    pub fn order(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// 非合成步骤 / 合成步骤，各自保持拓扑序
    pub fn partition(&self) -> (Vec<&PlanStep>, Vec<&PlanStep>) {
        self.steps
            .iter()
            .partition(|s| s.kind() != StepKind::Synthesis)
    }

    /// `step` 是否（传递地）被某个合成步骤依赖
    pub fn feeds_synthesis(&self, step: &str) -> bool {
        self.steps
            .iter()
            .filter(|s| s.kind() == StepKind::Synthesis)
            .any(|s| self.graph.transitive_dependencies(&s.id).contains(step))
    }
}

/// 计划调度器
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanScheduler;

impl PlanScheduler {
    pub fn new() -> Self {
        Self
    }

    pub fn schedule(&self, plan: &ExecutionPlan) -> Result<ScheduledPlan, PlanError> {
        if plan.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let graph = DependencyGraph::new(&plan.steps)?;

        for step in &plan.steps {
            if let StepPayload::Analysis { analysis } = &step.payload {
                if let Some(source) = analysis
                    .sources
                    .iter()
                    .find(|s| !step.depends_on.contains(s))
                {
                    return Err(PlanError::UndeclaredSource {
                        step: step.id.clone(),
                        source_step: source.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            tracing::warn!("Rejected cyclic plan: {}", cycle.join(" -> "));
            return Err(PlanError::CyclicPlan(cycle));
        }

        for step in &plan.steps {
            if step.kind() != StepKind::Synthesis {
                continue;
            }
            if let Some(dependent) = graph.dependents(&step.id).first() {
                return Err(PlanError::SynthesisNotTerminal {
                    step: dependent.clone(),
                    synthesis: step.id.clone(),
                });
            }
        }

        let order = graph
            .topological_order()
            .ok_or_else(|| PlanError::CyclicPlan(Vec::new()))?;

        let mut by_id: HashMap<&str, &PlanStep> =
            plan.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let steps: Vec<PlanStep> = order
            .iter()
            .filter_map(|id| by_id.remove(id.as_str()).cloned())
            .collect();

        tracing::debug!(order = ?order, "Plan scheduled");
        Ok(ScheduledPlan { steps, graph })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryDescriptor;

    fn retrieval(id: &str) -> PlanStep {
        PlanStep::retrieval(id, QueryDescriptor::new("sp500_companies"))
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert_eq!(
            PlanScheduler::new().schedule(&ExecutionPlan::default()).unwrap_err(),
            PlanError::EmptyPlan
        );
    }

    #[test]
    fn test_schedule_reorders_by_dependencies() {
        let plan = ExecutionPlan::new(vec![
            PlanStep::synthesis("answer").depends_on(["diff"]),
            PlanStep::analysis("diff", AnalysisSpec::new(AnalysisOp::Difference, "Revenue"))
                .depends_on(["fetch"]),
            retrieval("fetch"),
        ]);
        let scheduled = PlanScheduler::new().schedule(&plan).unwrap();
        assert_eq!(scheduled.order(), vec!["fetch", "diff", "answer"]);
        assert!(scheduled.feeds_synthesis("fetch"));
        let (work, synth) = scheduled.partition();
        assert_eq!(work.len(), 2);
        assert_eq!(synth[0].id, "answer");
    }

    #[test]
    fn test_independent_steps_keep_declaration_order() {
        let plan = ExecutionPlan::new(vec![retrieval("b"), retrieval("a"), retrieval("c")]);
        let scheduled = PlanScheduler::new().schedule(&plan).unwrap();
        assert_eq!(scheduled.order(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let plan = ExecutionPlan::new(vec![
            retrieval("a").depends_on(["b"]),
            retrieval("b").depends_on(["a"]),
        ]);
        assert!(matches!(
            PlanScheduler::new().schedule(&plan),
            Err(PlanError::CyclicPlan(cycle)) if cycle.len() == 3
        ));
    }

    #[test]
    fn test_undeclared_analysis_source() {
        let mut spec = AnalysisSpec::new(AnalysisOp::Sum, "Revenue");
        spec.sources = vec!["other".into()];
        let plan = ExecutionPlan::new(vec![
            retrieval("fetch"),
            retrieval("other"),
            PlanStep::analysis("sum", spec).depends_on(["fetch"]),
        ]);
        assert_eq!(
            PlanScheduler::new().schedule(&plan).unwrap_err(),
            PlanError::UndeclaredSource {
                step: "sum".into(),
                source_step: "other".into()
            }
        );
    }

    #[test]
    fn test_synthesis_must_be_terminal() {
        let plan = ExecutionPlan::new(vec![
            retrieval("fetch"),
            PlanStep::synthesis("answer").depends_on(["fetch"]),
            PlanStep::visualization("chart", ChartRequest::default()).depends_on(["answer"]),
        ]);
        assert_eq!(
            PlanScheduler::new().schedule(&plan).unwrap_err(),
            PlanError::SynthesisNotTerminal {
                step: "chart".into(),
                synthesis: "answer".into()
            }
        );
    }
}
