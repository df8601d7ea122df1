//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SAGE__*` 覆盖（双下划线表示嵌套，如 `SAGE__EXECUTION__MAX_RETRIES=2`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub execution: ExecutionSection,
    pub data: DataSection,
    pub server: ServerSection,
}

/// [app] 段：应用名、对话窗口大小、会话过期时间
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话窗口保留轮数
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
    /// 会话空闲多久后回收（秒）
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: default_max_context_turns(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

fn default_max_context_turns() -> usize {
    10
}

fn default_session_timeout_secs() -> u64 {
    3600
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 是否用 LLM 润色最终回答（数字会被校验）
    #[serde(default)]
    pub llm_synthesis: bool,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_llm_timeout_secs(),
            llm_synthesis: false,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

/// [execution] 段：重试、截止时间、并发与行数上限
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    /// 暂时性失败的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 单个请求的截止时间（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 单次步骤尝试的超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    /// 单次查询返回行数上限
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            max_concurrent_steps: default_max_concurrent_steps(),
            max_rows: default_max_rows(),
        }
    }
}

impl ExecutionSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

fn default_max_retries() -> u32 {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_step_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_steps() -> usize {
    3
}

fn default_max_rows() -> u32 {
    1000
}

/// [data] 段：数据集、SQLite 文件、目录
#[derive(Debug, Clone, Deserialize)]
pub struct DataSection {
    /// 原始 CSV；数据库不存在时导入
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// 自定义目录（JSON）；未设置时使用内置 S&P 500 目录
    pub catalog_path: Option<PathBuf>,
    /// 未设置 catalog_path 时按数据集 CSV 推断目录，替代内置目录
    #[serde(default)]
    pub infer_catalog: bool,
    /// 会话持久化目录；未设置时不落盘
    pub sessions_dir: Option<PathBuf>,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            db_path: default_db_path(),
            table_name: default_table_name(),
            catalog_path: None,
            infer_catalog: false,
            sessions_dir: None,
        }
    }
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("data/sp500_companies.csv")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/sp500.db")
}

fn default_table_name() -> String {
    crate::catalog::SP500_TABLE.to_string()
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

/// 从 config 目录加载配置，环境变量 SAGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SAGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SAGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新读取默认配置文件与环境变量
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_context_turns, 10);
        assert_eq!(cfg.execution.max_retries, 1);
        assert_eq!(cfg.execution.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.data.table_name, "sp500_companies");
    }

    #[test]
    fn test_load_explicit_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[execution]\nmax_retries = 3\nmax_rows = 50\n\n[llm]\nprovider = \"mock\"\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.execution.max_retries, 3);
        assert_eq!(cfg.execution.max_rows, 50);
        assert_eq!(cfg.execution.step_timeout_secs, 10);
        assert_eq!(cfg.llm.provider, "mock");
    }

    #[test]
    fn test_reload_reads_default_file() {
        let cfg = reload_config().unwrap();
        assert_eq!(cfg.data.table_name, "sp500_companies");
        assert_eq!(cfg.execution.max_concurrent_steps, 3);
    }
}
