//! 可观测性：tracing 订阅器初始化
//!
//! 级别优先取 RUST_LOG，未设置时用配置里的 [app].log_level。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // 重复初始化（如测试里）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
