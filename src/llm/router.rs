//! 生成路由器
//!
//! 构造时按后端选择器 + 凭据解析出唯一一个后端（封闭枚举），之后每次调用都走它：
//! 截取最近 N 条历史、计时、加超时保护；后端错误原样保留其分类，超时归为 TransientError。
//! 路由器本身不重试。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, Secret};
use serde::Serialize;

use super::anthropic::AnthropicBackend;
use super::deepseek::create_deepseek_backend;
use super::google::GoogleBackend;
use super::mock::MockBackend;
use super::openai::OpenAiBackend;
use super::{GenerationBackend, GenerationRequest};
use crate::config::LlmSection;
use crate::core::{ConfigurationError, GenerationError};
use crate::dialogue::{PromptBundle, Stage};
use crate::memory::Turn;
use crate::session::UserProfile;

/// 默认发送给后端的近期历史条数
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// 支持的后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
    /// 本地联调，不需要凭据
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Google => "google",
            BackendKind::DeepSeek => "deepseek",
            BackendKind::Mock => "mock",
        }
    }

    /// 各后端约定的凭据环境变量
    pub fn credential_env(&self) -> Option<&'static str> {
        match self {
            BackendKind::OpenAi => Some("OPENAI_API_KEY"),
            BackendKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            BackendKind::Google => Some("GOOGLE_API_KEY"),
            BackendKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            BackendKind::Mock => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAi),
            "anthropic" => Ok(BackendKind::Anthropic),
            "google" | "gemini" => Ok(BackendKind::Google),
            "deepseek" => Ok(BackendKind::DeepSeek),
            "mock" => Ok(BackendKind::Mock),
            _ => Err(ConfigurationError::UnknownBackend(s.to_string())),
        }
    }
}

/// 健康检查里展示的后端信息
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub provider: BackendKind,
    pub adapter: &'static str,
    pub configured: bool,
}

pub struct GenerationRouter {
    kind: BackendKind,
    backend: Arc<dyn GenerationBackend>,
    timeout: Duration,
    history_window: usize,
}

impl GenerationRouter {
    /// 按选择器与凭据构造；未知选择器或缺少凭据立即失败
    pub fn new(
        selector: &str,
        credential: Option<Secret<String>>,
        llm: &LlmSection,
    ) -> Result<Self, ConfigurationError> {
        let kind: BackendKind = selector.parse()?;
        let timeout = llm.timeout();

        let backend: Arc<dyn GenerationBackend> = match kind {
            BackendKind::Mock => Arc::new(MockBackend),
            BackendKind::OpenAi => Arc::new(OpenAiBackend::new(
                &require_credential(credential, kind)?,
                llm.openai.clone(),
            )),
            BackendKind::DeepSeek => Arc::new(create_deepseek_backend(
                &require_credential(credential, kind)?,
                llm.deepseek.clone(),
            )),
            BackendKind::Anthropic => Arc::new(AnthropicBackend::new(
                require_credential(credential, kind)?,
                llm.anthropic.clone(),
                timeout,
            )?),
            BackendKind::Google => Arc::new(GoogleBackend::new(
                require_credential(credential, kind)?,
                llm.google.clone(),
                timeout,
            )?),
        };

        tracing::info!(provider = %kind, "Initializing generation backend");
        Ok(Self::with_backend(kind, backend, timeout))
    }

    /// 从 [llm] 段构造：凭据取 llm.api_key，缺省时读后端约定的环境变量
    pub fn from_config(llm: &LlmSection) -> Result<Self, ConfigurationError> {
        let kind: BackendKind = llm.provider.parse()?;
        let credential = llm.api_key.clone().or_else(|| {
            kind.credential_env()
                .and_then(|var| std::env::var(var).ok())
                .map(Secret::new)
        });
        Self::new(&llm.provider, credential, llm)
    }

    /// 直接注入后端实现
    pub fn with_backend(kind: BackendKind, backend: Arc<dyn GenerationBackend>, timeout: Duration) -> Self {
        Self {
            kind,
            backend,
            timeout,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider: self.kind,
            adapter: self.backend.name(),
            configured: true,
        }
    }

    /// 生成回复；history 为会话完整历史，这里只取最近 N 条交给后端
    pub async fn generate(&self, prompt: PromptBundle, history: &[Turn]) -> Result<String, GenerationError> {
        let recent = history[history.len().saturating_sub(self.history_window)..].to_vec();
        let request = GenerationRequest { prompt, recent };

        tracing::debug!(provider = %self.kind, "Processing message");
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.backend.generate_response(&request)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Transient(format!(
                "Generation timed out after {}s",
                self.timeout.as_secs_f32()
            ))),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::info!(provider = %self.kind, elapsed_ms, "AI response generated"),
            Err(e) => tracing::warn!(
                provider = %self.kind,
                elapsed_ms,
                kind = %e.kind(),
                error = %e,
                "Generation failed"
            ),
        }
        result
    }

    /// 连通性自检：要求后端只回复 "OK"
    pub async fn test_connection(&self) -> bool {
        let probe = PromptBundle {
            persona: String::new(),
            stage: Stage::Greeting,
            stage_guidance: String::new(),
            profile: UserProfile::default(),
            history: Vec::new(),
            current_text: "Responda apenas com \"OK\" se você está funcionando.".to_string(),
        };
        let turn = Turn::user(probe.current_text.clone());
        match self.generate(probe, &[turn]).await {
            Ok(text) => text.to_lowercase().contains("ok"),
            Err(e) => {
                tracing::error!(provider = %self.kind, error = %e, "Connection test failed");
                false
            }
        }
    }
}

fn require_credential(
    credential: Option<Secret<String>>,
    kind: BackendKind,
) -> Result<Secret<String>, ConfigurationError> {
    credential
        .filter(|k| !k.expose_secret().trim().is_empty())
        .ok_or_else(|| ConfigurationError::MissingCredential(kind.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::core::ErrorKind;

    /// 记录收到的请求并按脚本返回
    struct ScriptedBackend {
        reply: Result<String, GenerationError>,
        delay: Duration,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedBackend {
        fn new(reply: Result<String, GenerationError>) -> Self {
            Self {
                reply,
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn generate_response(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.seen.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn bundle(text: &str) -> PromptBundle {
        PromptBundle {
            persona: "p".into(),
            stage: Stage::Greeting,
            stage_guidance: "g".into(),
            profile: UserProfile::default(),
            history: vec![],
            current_text: text.into(),
        }
    }

    #[test]
    fn test_unknown_selector_fails_fast() {
        let err = GenerationRouter::new("unknown-provider", Some(Secret::new("k".into())), &LlmSection::default())
            .err()
            .unwrap();
        assert_eq!(err, ConfigurationError::UnknownBackend("unknown-provider".into()));
    }

    #[test]
    fn test_missing_credential_fails_fast() {
        for selector in ["openai", "anthropic", "google", "deepseek"] {
            let err = GenerationRouter::new(selector, None, &LlmSection::default()).err().unwrap();
            assert!(matches!(err, ConfigurationError::MissingCredential(_)));
        }
        let blank = GenerationRouter::new("anthropic", Some(Secret::new("  ".into())), &LlmSection::default());
        assert!(blank.is_err());
    }

    #[test]
    fn test_selector_resolves_variant() {
        let llm = LlmSection::default();
        let key = || Some(Secret::new("sk-test".to_string()));
        assert_eq!(GenerationRouter::new("OpenAI", key(), &llm).unwrap().info().adapter, "openai");
        assert_eq!(GenerationRouter::new("anthropic", key(), &llm).unwrap().info().adapter, "anthropic");
        assert_eq!(GenerationRouter::new("gemini", key(), &llm).unwrap().kind(), BackendKind::Google);
        assert_eq!(GenerationRouter::new("deepseek", key(), &llm).unwrap().info().adapter, "deepseek");
        assert_eq!(GenerationRouter::new("mock", None, &llm).unwrap().info().adapter, "mock");
    }

    #[tokio::test]
    async fn test_generate_passes_most_recent_window() {
        let backend = Arc::new(ScriptedBackend::new(Ok("ok".into())));
        let router = GenerationRouter::with_backend(BackendKind::Mock, backend.clone(), Duration::from_secs(5))
            .with_history_window(3);
        let history: Vec<Turn> = (0..6).map(|i| Turn::user(format!("m{}", i))).collect();

        assert_eq!(router.generate(bundle("m5"), &history).await.unwrap(), "ok");

        let seen = backend.seen.lock().unwrap();
        let contents: Vec<_> = seen[0].recent.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn test_backend_error_kind_preserved() {
        let backend = Arc::new(ScriptedBackend::new(Err(GenerationError::from_http_status(
            429,
            "Too Many Requests",
            Some(Duration::from_secs(20)),
        ))));
        let router = GenerationRouter::with_backend(BackendKind::OpenAi, backend, Duration::from_secs(5));
        let err = router.generate(bundle("oi"), &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let mut scripted = ScriptedBackend::new(Ok("late".into()));
        scripted.delay = Duration::from_secs(120);
        let router = GenerationRouter::with_backend(BackendKind::Anthropic, Arc::new(scripted), Duration::from_secs(30));
        let err = router.generate(bundle("oi"), &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let ok = GenerationRouter::with_backend(
            BackendKind::Mock,
            Arc::new(ScriptedBackend::new(Ok("OK".into()))),
            Duration::from_secs(5),
        );
        assert!(ok.test_connection().await);

        let failing = GenerationRouter::with_backend(
            BackendKind::Mock,
            Arc::new(ScriptedBackend::new(Err(GenerationError::Auth("bad".into())))),
            Duration::from_secs(5),
        );
        assert!(!failing.test_connection().await);
    }
}
