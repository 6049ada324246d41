//! clinic-assistant 服务入口
//!
//! 加载配置 → 初始化日志 → 构建会话存储 / 生成路由 / 对话控制器 →
//! 启动过期清理与渠道探活后台任务 → 提供 HTTP 接口，直到 Ctrl+C / SIGTERM。
//!
//! 常用环境变量:
//! - ASSISTANT__LLM__PROVIDER: openai / anthropic / google / deepseek / mock
//! - OPENAI_API_KEY / ANTHROPIC_API_KEY / GOOGLE_API_KEY / DEEPSEEK_API_KEY
//! - ASSISTANT__WHATSAPP__ACCESS_TOKEN, ASSISTANT__WHATSAPP__PHONE_NUMBER_ID
//!
//! 启动: cargo run -- [config.toml]

#[cfg(feature = "whatsapp")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Context;
    use clinic_assistant::config::load_config;
    use clinic_assistant::core::{ShutdownManager, ShutdownReason};
    use clinic_assistant::dialogue::{DialogueController, PromptTemplates};
    use clinic_assistant::integrations::routes::{create_router, AppState};
    use clinic_assistant::integrations::whatsapp::WhatsappConnector;
    use clinic_assistant::integrations::{ChannelConnector, OfflineChannel};
    use clinic_assistant::llm::GenerationRouter;
    use clinic_assistant::observability;
    use clinic_assistant::session::SessionStore;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    observability::init(&cfg.app.log_level);

    // 未知后端或缺少凭据：启动即失败
    let router = GenerationRouter::from_config(&cfg.llm)
        .context("Failed to initialize generation backend")?
        .with_history_window(cfg.app.recent_history_window);
    let router = Arc::new(router);

    let store = Arc::new(SessionStore::new(cfg.app.max_history, cfg.app.session_ttl()));
    let templates = Arc::new(PromptTemplates::load(cfg.app.prompts_dir.as_deref(), &cfg.clinic));
    let controller = Arc::new(DialogueController::new(
        store.clone(),
        router.clone(),
        templates,
        &cfg.clinic,
    ));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    store.spawn_eviction(
        Duration::from_secs(cfg.app.eviction_interval_secs.max(1)),
        shutdown.token(),
    );

    {
        let router = router.clone();
        tokio::spawn(async move {
            if router.test_connection().await {
                tracing::info!(provider = %router.kind(), "AI service connection test successful");
            } else {
                tracing::warn!(provider = %router.kind(), "AI service connection test failed");
            }
        });
    }

    let channel: Arc<dyn ChannelConnector> = match WhatsappConnector::from_config(&cfg.whatsapp) {
        Ok(connector) => {
            let connector = Arc::new(connector);
            let probe = connector.clone();
            let token = shutdown.token();
            tokio::spawn(async move {
                let monitor = probe.monitor().clone();
                monitor.run(probe.as_ref(), token).await;
            });
            connector
        }
        Err(e) => {
            tracing::warn!(error = %e, "WhatsApp not configured, outbound messages disabled");
            Arc::new(OfflineChannel)
        }
    };

    let state = Arc::new(AppState::new(
        controller,
        channel,
        cfg.whatsapp.verify_token.clone(),
        cfg.whatsapp.default_country_code.clone(),
    ));
    let app = create_router(state);

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(provider = %router.kind(), "Server listening on http://{}", addr);
    tracing::info!("Webhook URL: http://YOUR_HOST:{}/webhook", cfg.server.port);

    let token = shutdown.token();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(e) = served {
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
        return Err(e).context("HTTP server failed");
    }

    let reason = shutdown.reason().cloned().unwrap_or(ShutdownReason::UserInitiated);
    tracing::info!(?reason, "Server stopped");
    Ok(())
}

#[cfg(not(feature = "whatsapp"))]
fn main() {
    eprintln!("请使用 --features whatsapp 编译: cargo run --features whatsapp");
    std::process::exit(1);
}
