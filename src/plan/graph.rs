//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；同入度时按声明顺序出队，保证结果稳定。

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::plan::types::*;

/// 计划依赖图
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// 声明顺序：步骤 ID -> 下标
    pub index: HashMap<StepId, usize>,
    /// 按声明顺序排列的步骤 ID
    pub ids: Vec<StepId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 反向邻接：步骤 ID -> 它的依赖
    pub dependencies: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 未完成的依赖数
    pub in_degree: HashMap<StepId, usize>,
}

impl DependencyGraph {
    /// 创建依赖图；重复 ID 与未声明的依赖直接拒绝
    pub fn new(steps: &[PlanStep]) -> Result<Self, PlanError> {
        let mut index = HashMap::new();
        let mut ids = Vec::with_capacity(steps.len());
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut dependencies: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
            ids.push(step.id.clone());
            adjacency.insert(step.id.clone(), Vec::new());
            in_degree.insert(step.id.clone(), 0);
        }

        for step in steps {
            let mut deps: Vec<StepId> = Vec::new();
            for dep_id in &step.depends_on {
                if !index.contains_key(dep_id) {
                    return Err(PlanError::DanglingDependency {
                        step: step.id.clone(),
                        dependency: dep_id.clone(),
                    });
                }
                // 重复声明的依赖只计一次
                if deps.contains(dep_id) {
                    continue;
                }
                deps.push(dep_id.clone());
                adjacency.entry(dep_id.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
            dependencies.insert(step.id.clone(), deps);
        }

        Ok(Self {
            index,
            ids,
            adjacency,
            dependencies,
            in_degree,
        })
    }

    /// 深度优先遍历 + 递归栈标记检测环；返回环上的步骤（首尾相同）
    pub fn find_cycle(&self) -> Option<Vec<StepId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            id: &StepId,
            marks: &mut HashMap<StepId, Mark>,
            stack: &mut Vec<StepId>,
        ) -> Option<Vec<StepId>> {
            marks.insert(id.clone(), Mark::OnStack);
            stack.push(id.clone());
            for next in graph.dependents(id) {
                match marks.get(next).copied().unwrap_or(Mark::Unvisited) {
                    Mark::OnStack => {
                        let start = stack.iter().position(|s| s == next).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, next, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks.insert(id.clone(), Mark::Done);
            None
        }

        let mut marks: HashMap<StepId, Mark> = HashMap::new();
        let mut stack = Vec::new();
        for id in &self.ids {
            if marks.get(id).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                if let Some(cycle) = visit(self, id, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// 拓扑序（Kahn）；多个步骤同时就绪时声明靠前者优先。存在环时返回 None
    pub fn topological_order(&self) -> Option<Vec<StepId>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BinaryHeap<Reverse<usize>> = self
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| in_degree.get(*id) == Some(&0))
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(Reverse(i)) = ready.pop() {
            let id = &self.ids[i];
            order.push(id.clone());
            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(self.index[dependent]));
                    }
                }
            }
        }

        (order.len() == self.ids.len()).then_some(order)
    }

    /// 直接下游
    pub fn dependents(&self, id: &str) -> &[StepId] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 直接依赖（去重，按声明顺序）
    pub fn dependencies_of(&self, id: &str) -> &[StepId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 传递依赖闭包（不含自身）
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<StepId> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<&StepId> = self.dependencies_of(id).iter().collect();
        while let Some(dep) = pending.pop() {
            if seen.insert(dep.clone()) {
                pending.extend(self.dependencies_of(dep).iter());
            }
        }
        seen
    }

    /// 获取初始可执行的步骤（入度为 0），按声明顺序
    pub fn ready_steps(&self) -> Vec<StepId> {
        self.ids
            .iter()
            .filter(|id| self.in_degree.get(*id) == Some(&0))
            .cloned()
            .collect()
    }

    /// 步骤到达终态后更新入度，返回新变为可执行的步骤（按声明顺序）
    pub fn mark_completed(&self, in_degree: &mut HashMap<StepId, usize>, completed: &str) -> Vec<StepId> {
        let mut newly_ready = Vec::new();
        for dependent in self.dependents(completed) {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    newly_ready.push(dependent.clone());
                }
            }
        }
        newly_ready.sort_by_key(|id| self.index.get(id).copied().unwrap_or(usize::MAX));
        newly_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryDescriptor;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::retrieval(id, QueryDescriptor::new("t")).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_graph_construction_sequential() {
        let graph = DependencyGraph::new(&[step("task1", &[]), step("task2", &["task1"])]).unwrap();
        assert_eq!(graph.in_degree.get("task1"), Some(&0));
        assert_eq!(graph.in_degree.get("task2"), Some(&1));
        assert_eq!(graph.ready_steps(), vec!["task1"]);
    }

    #[test]
    fn test_duplicate_dependency_counted_once() {
        let graph = DependencyGraph::new(&[step("a", &[]), step("b", &["a", "a"])]).unwrap();
        assert_eq!(graph.in_degree.get("b"), Some(&1));
    }

    #[test]
    fn test_dangling_and_duplicate_rejected() {
        assert_eq!(
            DependencyGraph::new(&[step("a", &["ghost"])]).unwrap_err(),
            PlanError::DanglingDependency {
                step: "a".into(),
                dependency: "ghost".into()
            }
        );
        assert_eq!(
            DependencyGraph::new(&[step("a", &[]), step("a", &[])]).unwrap_err(),
            PlanError::DuplicateStep("a".into())
        );
    }

    #[test]
    fn test_find_cycle() {
        let graph = DependencyGraph::new(&[
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ])
        .unwrap();
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert!(graph.topological_order().is_none());
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let graph = DependencyGraph::new(&[step("a", &["a"])]).unwrap();
        assert_eq!(graph.find_cycle(), Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn test_topological_tie_break_by_declaration() {
        // c 声明在前但依赖 b；a、b 无依赖
        let graph = DependencyGraph::new(&[
            step("c", &["b"]),
            step("b", &[]),
            step("a", &[]),
            step("d", &["a", "c"]),
        ])
        .unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn test_mark_completed_and_transitive() {
        let graph = DependencyGraph::new(&[
            step("r1", &[]),
            step("r2", &[]),
            step("an", &["r1", "r2"]),
            step("syn", &["an"]),
        ])
        .unwrap();
        let mut in_degree = graph.in_degree.clone();
        assert!(graph.mark_completed(&mut in_degree, "r1").is_empty());
        assert_eq!(graph.mark_completed(&mut in_degree, "r2"), vec!["an"]);

        let deps = graph.transitive_dependencies("syn");
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["an", "r1", "r2"]);
    }
}
