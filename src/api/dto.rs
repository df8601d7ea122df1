use serde::{Deserialize, Serialize};

use crate::core::{FailureReason, RequestOutcome, RequestPhase, ResponseMetadata, StepSummary};
use crate::data::RowSet;
use crate::execution::{ChartSpec, FailureKind, RecordedError, StepFailure};

/// `POST /query`
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `POST /reset`
#[derive(Debug, Clone, Deserialize)]
pub struct ResetRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetResponse {
    pub session_id: String,
    pub reset: bool,
}

/// `GET /sample?limit=`
#[derive(Debug, Clone, Deserialize)]
pub struct SampleQuery {
    #[serde(default = "default_sample_limit")]
    pub limit: u32,
}

fn default_sample_limit() -> u32 {
    5
}

/// 样例行：每行一个以列名为键的对象
#[derive(Debug, Clone, Serialize)]
pub struct SampleResponse {
    pub columns: Vec<String>,
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
}

impl From<RowSet> for SampleResponse {
    fn from(rows: RowSet) -> Self {
        let data: Vec<_> = rows
            .rows
            .into_iter()
            .map(|row| rows.columns.iter().cloned().zip(row).collect())
            .collect();
        Self {
            row_count: data.len(),
            columns: rows.columns,
            data,
        }
    }
}

/// 样例查询失败：目录不认识的表 422，其余 500
pub fn sample_status_code(failure: &StepFailure) -> u16 {
    match failure.kind {
        FailureKind::SchemaViolation => 422,
        FailureKind::Timeout => 504,
        _ => 500,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub response: String,
    pub errors: Vec<RecordedError>,
    pub execution_plan_summary: Vec<StepSummary>,
    pub phase: RequestPhase,
    pub session_id: String,
    pub metadata: ResponseMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl From<RequestOutcome> for QueryResponse {
    fn from(outcome: RequestOutcome) -> Self {
        Self {
            response: outcome.response,
            errors: outcome.errors,
            execution_plan_summary: outcome.execution_plan_summary,
            phase: outcome.phase,
            session_id: outcome.session_id,
            metadata: outcome.metadata,
            chart: outcome.chart,
            failure: outcome.failure,
        }
    }
}

/// 结果对应的 HTTP 状态码：完成（含降级）200，空问题 400，计划 / 校验拒绝 422，超时 504，其余 500
pub fn status_code(outcome: &RequestOutcome) -> u16 {
    match &outcome.failure {
        None => 200,
        Some(FailureReason::EmptyQuery) => 400,
        Some(FailureReason::PlanRejected(_)) => 422,
        Some(FailureReason::CriticalStep { kind, .. }) if *kind == FailureKind::SchemaViolation => 422,
        Some(FailureReason::Timeout(_)) => 504,
        Some(FailureReason::CriticalStep { .. })
        | Some(FailureReason::Upstream(_))
        | Some(FailureReason::Cancelled) => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionState;

    fn outcome(failure: Option<FailureReason>) -> RequestOutcome {
        RequestOutcome {
            session_id: "s".into(),
            response: "ok".into(),
            phase: if failure.is_some() { RequestPhase::Failed } else { RequestPhase::Done },
            errors: Vec::new(),
            execution_plan_summary: Vec::new(),
            metadata: ResponseMetadata::default(),
            chart: None,
            failure,
            state: ExecutionState::default(),
            phases: Vec::new(),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code(&outcome(None)), 200);
        assert_eq!(status_code(&outcome(Some(FailureReason::EmptyQuery))), 400);
        assert_eq!(status_code(&outcome(Some(FailureReason::PlanRejected("cycle".into())))), 422);
        assert_eq!(status_code(&outcome(Some(FailureReason::Timeout(30_000)))), 504);
        assert_eq!(
            status_code(&outcome(Some(FailureReason::CriticalStep {
                step_id: "fetch".into(),
                kind: FailureKind::TransientExecution,
                message: "connection reset".into()
            }))),
            500
        );
        assert_eq!(
            status_code(&outcome(Some(FailureReason::CriticalStep {
                step_id: "fetch".into(),
                kind: FailureKind::SchemaViolation,
                message: "unknown column".into()
            }))),
            422
        );
    }

    #[test]
    fn test_query_request_session_optional() {
        let req: QueryRequest = serde_json::from_str(r#"{"query": "Top 5 by revenue"}"#).unwrap();
        assert!(req.session_id.is_none());
    }

    #[test]
    fn test_response_shape() {
        let json = serde_json::to_value(QueryResponse::from(outcome(None))).unwrap();
        assert_eq!(json["phase"], "DONE");
        assert!(json.get("chart").is_none());
        assert!(json["execution_plan_summary"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_sample_response_records() {
        let rows = RowSet::new(
            vec!["Symbol".into(), "Revenue".into()],
            vec![
                vec![serde_json::json!("AAPL"), serde_json::json!(394.0)],
                vec![serde_json::json!("MSFT"), serde_json::json!(212.0)],
            ],
        );
        let json = serde_json::to_value(SampleResponse::from(rows)).unwrap();
        assert_eq!(json["row_count"], 2);
        assert_eq!(json["data"][1]["Symbol"], "MSFT");
        assert_eq!(json["columns"][0], "Symbol");

        let q: SampleQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.limit, 5);
        assert_eq!(
            sample_status_code(&StepFailure::new(FailureKind::SchemaViolation, "unknown table")),
            422
        );
    }
}
