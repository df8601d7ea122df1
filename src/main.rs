//! Sage 命令行
//!
//! 一次性提问：`sage "Compare AAPL and MSFT revenue"`；不带问题时逐行读取标准输入。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use sage::agents::{FixedPlanner, RuleIntentExtractor};
use sage::api::status_code;
use sage::config::load_config;
use sage::core::{Orchestrator, OrchestratorBuilder, RequestOutcome};

#[derive(Parser, Debug)]
#[command(name = "sage", version, about = "Ask analytical questions about a tabular dataset")]
struct Cli {
    /// 配置文件（缺省搜索 config/default.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 数据集 CSV（数据库不存在时导入）
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// SQLite 数据库文件
    #[arg(long)]
    db: Option<PathBuf>,

    /// 会话 ID（同一会话共享对话窗口）
    #[arg(long)]
    session: Option<String>,

    /// 固定计划 JSON：跳过 LLM，使用规则意图抽取
    #[arg(long)]
    plan: Option<PathBuf>,

    /// 问题；为空时进入交互模式
    query: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sage::observability::init();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.clone()).context("Failed to load configuration")?;
    if let Some(dataset) = cli.dataset {
        config.data.dataset_path = dataset;
    }
    if let Some(db) = cli.db {
        config.data.db_path = db;
    }

    let mut builder = OrchestratorBuilder::new(config);
    if let Some(path) = &cli.plan {
        let planner = FixedPlanner::from_json_file(path)
            .with_context(|| format!("Failed to load plan {}", path.display()))?;
        builder = builder
            .with_planner(Arc::new(planner))
            .with_intent_extractor(Arc::new(RuleIntentExtractor::new()));
    }
    let orchestrator = builder.build().context("Failed to initialise")?;

    if !cli.query.is_empty() {
        let query = cli.query.join(" ");
        let outcome = orchestrator.process_query(cli.session.as_deref(), &query).await;
        print_outcome(&outcome);
        if status_code(&outcome) != 200 {
            std::process::exit(1);
        }
        return Ok(());
    }

    interactive(&orchestrator, cli.session).await
}

async fn interactive(orchestrator: &Orchestrator, session: Option<String>) -> anyhow::Result<()> {
    let mut session = session;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("Ask a question (empty line or Ctrl+D to quit, /reset to clear the conversation).");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if line == "/reset" {
            if let Some(id) = &session {
                orchestrator.reset(id).await;
            }
            eprintln!("Conversation cleared.");
            continue;
        }
        let outcome = orchestrator.process_query(session.as_deref(), line).await;
        session.get_or_insert_with(|| outcome.session_id.clone());
        print_outcome(&outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &RequestOutcome) {
    println!("{}", outcome.response);
    for error in &outcome.errors {
        eprintln!(
            "  ! {} [{}] attempt {}: {}",
            error.step_id,
            error.kind.as_str(),
            error.attempt,
            error.message
        );
    }
    if let Some(chart) = &outcome.chart {
        eprintln!("  chart: {}", chart.describe());
    }
    eprintln!("  [{}]", outcome.phase);
}
