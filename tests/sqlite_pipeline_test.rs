//! CSV 导入 SQLite 后经完整管线回答问题

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sage::agents::{FixedPlanner, RuleIntentExtractor};
    use sage::api::status_code;
    use sage::config::AppConfig;
    use sage::core::{OrchestratorBuilder, RequestPhase};
    use sage::plan::{AnalysisOp, AnalysisSpec, ExecutionPlan, PlanStep};
    use sage::query::{FilterOp, Literal, QueryDescriptor};

    const CSV: &str = "Symbol,Security,Sector,Revenue\n\
AAPL,Apple Inc.,Information Technology,394\n\
MSFT,Microsoft,Information Technology,212\n\
XOM,Exxon Mobil,Energy,\"413\"\n";

    fn plan() -> ExecutionPlan {
        ExecutionPlan::new(vec![
            PlanStep::retrieval(
                "fetch",
                QueryDescriptor::new("sp500_companies")
                    .select(["Symbol", "Revenue"])
                    .filter("Symbol", FilterOp::In, Literal::list(["AAPL", "MSFT"]))
                    .order_by("Revenue", true),
            ),
            PlanStep::analysis(
                "diff",
                AnalysisSpec::new(AnalysisOp::Difference, "Revenue").with_label("Symbol"),
            )
            .depends_on(["fetch"]),
        ])
    }

    #[tokio::test]
    async fn test_csv_dataset_answers_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("companies.csv");
        std::fs::write(&csv_path, CSV).unwrap();

        let mut config = AppConfig::default();
        config.data.dataset_path = csv_path;
        config.data.db_path = dir.path().join("sp500.db");
        config.data.sessions_dir = Some(dir.path().join("sessions"));

        let orch = OrchestratorBuilder::new(config)
            .with_planner(Arc::new(FixedPlanner::new(plan())))
            .with_intent_extractor(Arc::new(RuleIntentExtractor::new()))
            .build()
            .unwrap();

        let outcome = orch
            .process_query(Some("analyst"), "Compare AAPL vs MSFT revenue")
            .await;
        assert_eq!(outcome.phase, RequestPhase::Done);
        assert_eq!(status_code(&outcome), 200);
        assert_eq!(outcome.metadata.rows_processed, 2);
        assert_eq!(outcome.state.metrics()["diff.difference"], 182.0);
        assert!(outcome.response.contains("394"));
        assert!(outcome.response.contains("212"));
        assert!(!outcome.response.contains("413"));

        // 会话已落盘
        assert!(dir.path().join("sessions").join("analyst.json").exists());
    }

    #[tokio::test]
    async fn test_inferred_catalog_serves_sample_and_plan() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("funds.csv");
        std::fs::write(
            &csv_path,
            "Fund,Launch Date,Assets\nAlpha,2019-03-01,1250\nBeta,2020-11-15,980\nGamma,2021-06-30,400\n",
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.data.dataset_path = csv_path;
        config.data.db_path = dir.path().join("funds.db");
        config.data.table_name = "funds".to_string();
        config.data.infer_catalog = true;

        let plan = ExecutionPlan::new(vec![
            PlanStep::retrieval(
                "fetch",
                QueryDescriptor::new("funds")
                    .select(["Fund", "Assets"])
                    .filter("Fund", FilterOp::In, Literal::list(["Alpha", "Beta"])),
            ),
            PlanStep::analysis(
                "gap",
                AnalysisSpec::new(AnalysisOp::Difference, "Assets").with_label("Fund"),
            )
            .depends_on(["fetch"]),
        ]);
        let orch = OrchestratorBuilder::new(config)
            .with_planner(Arc::new(FixedPlanner::new(plan)))
            .with_intent_extractor(Arc::new(RuleIntentExtractor::new()))
            .build()
            .unwrap();

        let sample = orch.sample("funds", 2).await.unwrap();
        assert_eq!(sample.len(), 2);
        assert!(orch.sample("sp500_companies", 2).await.is_err());

        let outcome = orch.process_query(None, "Compare Alpha vs Beta assets").await;
        assert_eq!(outcome.phase, RequestPhase::Done);
        assert_eq!(outcome.state.metrics()["gap.difference"], 270.0);
    }
}
