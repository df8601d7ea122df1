//! 可观测性：日志初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖；每个二进制启动时调用一次。

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // 重复初始化（如测试中多次调用）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
