//! 编排器构建器：CLI 与 HTTP 服务共用的初始化逻辑
//!
//! 未显式注入的组件按配置创建：目录（内置或 JSON 文件）、SQLite 数据源、LLM 客户端、
//! 意图抽取器、Planner、合成器与会话注册表。测试通过 with_* 注入桩实现。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use crate::agents::{IntentExtractor, LlmIntentExtractor, LlmPlanner, Planner};
use crate::catalog::{sp500_catalog, SchemaCatalog};
use crate::config::AppConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::session::SessionRegistry;
use crate::core::RecoveryEngine;
use crate::data::{catalog_from_csv, prepare_database, DataSource};
use crate::execution::{LlmSynthesizer, PlanRunner, StepExecutor, Synthesizer, TemplateSynthesizer};
use crate::llm::{create_llm_client, LlmClient};
use crate::query::QueryValidator;

pub struct OrchestratorBuilder {
    config: AppConfig,
    catalog: Option<Arc<SchemaCatalog>>,
    llm: Option<Arc<dyn LlmClient>>,
    data_source: Option<Arc<dyn DataSource>>,
    intent: Option<Arc<dyn IntentExtractor>>,
    planner: Option<Arc<dyn Planner>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    sessions: Option<Arc<SessionRegistry>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            catalog: None,
            llm: None,
            data_source: None,
            intent: None,
            planner: None,
            synthesizer: None,
            sessions: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<SchemaCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_data_source(mut self, data_source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(data_source);
        self
    }

    pub fn with_intent_extractor(mut self, intent: Arc<dyn IntentExtractor>) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_catalog(&self) -> anyhow::Result<Arc<SchemaCatalog>> {
        if let Some(catalog) = &self.catalog {
            return Ok(catalog.clone());
        }
        match &self.config.data.catalog_path {
            Some(path) => {
                let catalog = SchemaCatalog::from_json_file(path)
                    .with_context(|| format!("Failed to load catalog {}", path.display()))?;
                Ok(Arc::new(catalog))
            }
            None if self.config.data.infer_catalog => {
                let data = &self.config.data;
                let table = catalog_from_csv(&data.dataset_path, &data.table_name)
                    .with_context(|| format!("Failed to infer catalog from {}", data.dataset_path.display()))?;
                Ok(Arc::new(SchemaCatalog::new(vec![table])))
            }
            None => Ok(Arc::new(sp500_catalog())),
        }
    }

    fn build_data_source(&self, catalog: &SchemaCatalog) -> anyhow::Result<Arc<dyn DataSource>> {
        if let Some(ds) = &self.data_source {
            return Ok(ds.clone());
        }
        let data = &self.config.data;
        let table = catalog
            .table(&data.table_name)
            .with_context(|| format!("Table '{}' is not in the catalog", data.table_name))?;
        let source = prepare_database(&data.db_path, Some(data.dataset_path.as_path()), table)?;
        tracing::info!("Data source ready: {}", data.db_path.display());
        Ok(Arc::new(source))
    }

    fn build_sessions(&self) -> Arc<SessionRegistry> {
        if let Some(sessions) = &self.sessions {
            return sessions.clone();
        }
        let app = &self.config.app;
        let registry = SessionRegistry::new(app.max_context_turns, app.session_timeout_secs);
        let registry = match &self.config.data.sessions_dir {
            Some(dir) => registry.with_persistence(dir),
            None => registry,
        };
        Arc::new(registry)
    }

    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let catalog = self.build_catalog()?;
        let data_source = self.build_data_source(&catalog)?;
        let sessions = self.build_sessions();

        // LLM 仅在有组件需要时创建
        let needs_llm = self.intent.is_none()
            || self.planner.is_none()
            || (self.synthesizer.is_none() && self.config.llm.llm_synthesis);
        let llm = match (&self.llm, needs_llm) {
            (Some(llm), _) => Some(llm.clone()),
            (None, true) => Some(create_llm_client(&self.config.llm)),
            (None, false) => None,
        };

        let intent = match (self.intent, &llm) {
            (Some(intent), _) => intent,
            (None, Some(llm)) => Arc::new(LlmIntentExtractor::new(llm.clone(), catalog.clone())),
            (None, None) => anyhow::bail!("no intent extractor configured"),
        };
        let planner = match (self.planner, &llm) {
            (Some(planner), _) => planner,
            (None, Some(llm)) => Arc::new(LlmPlanner::new(llm.clone())),
            (None, None) => anyhow::bail!("no planner configured"),
        };
        let synthesizer: Arc<dyn Synthesizer> = match (self.synthesizer, &llm) {
            (Some(s), _) => s,
            (None, Some(llm)) if self.config.llm.llm_synthesis => Arc::new(LlmSynthesizer::new(llm.clone())),
            _ => Arc::new(TemplateSynthesizer::new()),
        };

        let exec = &self.config.execution;
        let validator = Arc::new(QueryValidator::new(catalog.clone(), exec.max_rows));
        let executor = StepExecutor::new(
            validator,
            data_source,
            synthesizer,
            RecoveryEngine::new(exec.max_retries),
            exec.step_timeout(),
        );
        let runner = PlanRunner::new(Arc::new(executor), exec.max_concurrent_steps);

        Ok(Orchestrator::new(
            catalog,
            intent,
            planner,
            runner,
            sessions,
            exec.request_timeout(),
        ))
    }
}

/// 便捷函数：按配置文件路径创建构建器；加载失败时使用默认配置
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}
