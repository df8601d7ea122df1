//! 执行状态
//!
//! 每个请求一份，只追加：结果日志（按完成顺序）、累计指标、错误列表、每步重试计数、
//! 本轮使用的对话窗口快照。并发步骤通过 SharedState 的互斥锁串行写入；
//! 请求截止后 seal()，之后的写入全部丢弃，调用方看到的状态保持一致。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::execution::result::{FailureKind, StepFailure, StepOutput, StepResult};
use crate::memory::Turn;
use crate::plan::StepId;

/// 记录在状态中的一次失败
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedError {
    pub step_id: StepId,
    pub kind: FailureKind,
    pub message: String,
    /// 第几次尝试（从 1 开始；依赖不可用时为 0）
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionState {
    results: Vec<StepResult>,
    #[serde(skip)]
    index: HashMap<StepId, usize>,
    metrics: BTreeMap<String, f64>,
    errors: Vec<RecordedError>,
    retries: BTreeMap<StepId, u32>,
    conversation: Vec<Turn>,
}

impl ExecutionState {
    pub fn new(conversation: Vec<Turn>) -> Self {
        Self {
            conversation,
            ..Default::default()
        }
    }

    /// 追加步骤结果；同一步骤只接受第一次写入
    pub fn record(&mut self, result: StepResult) -> bool {
        if self.index.contains_key(&result.step_id) {
            tracing::warn!("Result for step '{}' already recorded, ignored", result.step_id);
            return false;
        }
        if let Some(StepOutput::Analysis(analysis)) = result.output() {
            for (name, value) in &analysis.metrics {
                self.metrics.insert(format!("{}.{}", result.step_id, name), *value);
            }
        }
        self.index.insert(result.step_id.clone(), self.results.len());
        self.results.push(result);
        true
    }

    pub fn record_error(&mut self, step_id: &str, failure: &StepFailure, attempt: u32) {
        self.errors.push(RecordedError {
            step_id: step_id.to_string(),
            kind: failure.kind,
            message: failure.message.clone(),
            attempt,
        });
    }

    /// 增加并返回重试计数
    pub fn increment_retry(&mut self, step_id: &str) -> u32 {
        let count = self.retries.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.index.get(step_id).map(|&i| &self.results[i])
    }

    /// 成功步骤的输出；未完成或失败时为 None
    pub fn successful_output(&self, step_id: &str) -> Option<&StepOutput> {
        self.result(step_id).and_then(|r| r.output())
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn errors(&self) -> &[RecordedError] {
        &self.errors
    }

    pub fn retry_count(&self, step_id: &str) -> u32 {
        self.retries.get(step_id).copied().unwrap_or(0)
    }

    pub fn conversation(&self) -> &[Turn] {
        &self.conversation
    }
}

struct Inner {
    state: ExecutionState,
    sealed: bool,
}

/// 请求内共享的执行状态（单写者：互斥锁）
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<Inner>>,
}

impl SharedState {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { state, sealed: false })),
        }
    }

    /// 写入结果；已封存时丢弃并返回 false
    pub async fn record(&self, result: StepResult) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.sealed {
            tracing::debug!("State sealed, dropping result for '{}'", result.step_id);
            return false;
        }
        inner.state.record(result)
    }

    pub async fn record_error(&self, step_id: &str, failure: &StepFailure, attempt: u32) {
        let mut inner = self.inner.lock().await;
        if !inner.sealed {
            inner.state.record_error(step_id, failure, attempt);
        }
    }

    /// 封存后计数不再变化，返回当前值
    pub async fn increment_retry(&self, step_id: &str) -> u32 {
        let mut inner = self.inner.lock().await;
        if inner.sealed {
            return inner.state.retry_count(step_id);
        }
        inner.state.increment_retry(step_id)
    }

    /// 只读访问
    pub async fn read<R>(&self, f: impl FnOnce(&ExecutionState) -> R) -> R {
        let inner = self.inner.lock().await;
        f(&inner.state)
    }

    pub async fn seal(&self) {
        self.inner.lock().await.sealed = true;
    }

    pub async fn is_sealed(&self) -> bool {
        self.inner.lock().await.sealed
    }

    pub async fn snapshot(&self) -> ExecutionState {
        self.inner.lock().await.state.clone()
    }
}
