//! 可观测性：tracing 日志初始化
//!
//! 日志写到 stderr，stdout 留给 JSON 事件流；RUST_LOG 优先于默认级别。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局 subscriber；重复调用（如测试中）静默忽略
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
