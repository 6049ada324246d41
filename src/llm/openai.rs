//! OpenAI 兼容 API 后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek 复用此实现。
//! 消息形态：system = 完整提示词，其后依次追加近期历史（role 标记）。
//! async_openai 默认会对 429 / 5xx 指数退避重试，这里关掉：每次调用只发一次请求，失败立即归类返回。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};

use crate::config::GenerationParams;
use crate::core::GenerationError;
use crate::llm::{GenerationBackend, GenerationRequest};
use crate::memory::Role;

/// OpenAI 兼容后端：持有 Client 与固定生成参数
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    params: GenerationParams,
    name: &'static str,
}

impl OpenAiBackend {
    pub fn new(api_key: &Secret<String>, params: GenerationParams) -> Self {
        Self::named("openai", api_key, params)
    }

    pub(crate) fn named(name: &'static str, api_key: &Secret<String>, params: GenerationParams) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key.expose_secret().clone());
        if let Some(url) = params.base_url.as_deref() {
            config = config.with_api_base(url);
        }

        let no_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Self {
            client: Client::with_config(config).with_backoff(no_retry),
            params,
            name,
        }
    }

    fn to_openai_messages(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::with_capacity(request.recent.len() + 1);
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.prompt.render())
                .build()?,
        ));

        for turn in &request.recent {
            let message = match turn.role {
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(turn.content.clone())
                        .build()?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.content.clone())
                        .build()?,
                ),
            };
            messages.push(message);
        }
        Ok(messages)
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, OpenAIError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.params.model)
            .messages(self.to_openai_messages(request)?)
            .max_completion_tokens(self.params.max_tokens)
            .temperature(self.params.temperature);
        if let Some(top_p) = self.params.top_p {
            args.top_p(top_p);
        }
        if let Some(p) = self.params.presence_penalty {
            args.presence_penalty(p);
        }
        if let Some(p) = self.params.frequency_penalty {
            args.frequency_penalty(p);
        }

        let response = self.client.chat().create(args.build()?).await?;

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn generate_response(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        tracing::debug!(backend = self.name, model = %self.params.model, "Sending request to OpenAI-compatible API");

        let content = self.complete(request).await.map_err(|e| {
            tracing::error!(backend = self.name, error = %e, "OpenAI API error");
            classify_openai_error(e)
        })?;

        let content = content.trim();
        if content.is_empty() {
            return Err(GenerationError::Unknown("Empty completion content".into()));
        }
        Ok(content.to_string())
    }
}

fn classify_openai_error(err: OpenAIError) -> GenerationError {
    match err {
        // 5xx 的响应体不保证是 JSON，async_openai 会把原文放进 message，type / code 均为空
        OpenAIError::ApiError(api) if api.r#type.is_none() && api.code.is_none() => {
            GenerationError::Transient(api.message)
        }
        OpenAIError::ApiError(api) => {
            classify_api_error(&api.message, api.code.as_deref(), api.r#type.as_deref())
        }
        OpenAIError::Reqwest(e) => GenerationError::from_transport(&e),
        other => GenerationError::Unknown(other.to_string()),
    }
}

/// 按 OpenAI 错误体里的 code / type / message 归类
pub(crate) fn classify_api_error(message: &str, code: Option<&str>, kind: Option<&str>) -> GenerationError {
    let lower = message.to_lowercase();
    match (code, kind) {
        (Some("insufficient_quota"), _) | (_, Some("insufficient_quota")) => {
            GenerationError::quota_exceeded(message)
        }
        _ if lower.contains("quota") => GenerationError::quota_exceeded(message),
        _ if lower.contains("rate limit") => GenerationError::rate_limited(message, parse_retry_hint(message)),
        (Some("invalid_api_key"), _) | (_, Some("authentication_error")) => {
            GenerationError::Auth(message.to_string())
        }
        _ if lower.contains("incorrect api key") || lower.contains("invalid api key") => {
            GenerationError::Auth(message.to_string())
        }
        (Some("rate_limit_exceeded"), _) | (_, Some("rate_limit_error")) => {
            GenerationError::rate_limited(message, parse_retry_hint(message))
        }
        (_, Some("server_error")) => GenerationError::Transient(message.to_string()),
        _ => GenerationError::Unknown(message.to_string()),
    }
}

/// 从错误文案里取等待建议："Please try again in 20s" / "in 1.5s" / "in 450ms" / "in 6m0s"
pub(crate) fn parse_retry_hint(message: &str) -> Option<Duration> {
    const MARKER: &str = "try again in ";
    let lower = message.to_lowercase();
    let rest = &lower[lower.find(MARKER)? + MARKER.len()..];

    let mut total = 0f64; // ms
    let mut matched = false;
    let mut chars = rest.chars().peekable();
    loop {
        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit() || *c == '.') {
            number.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c);
            chars.next();
        }
        let Ok(value) = number.parse::<f64>() else { break };
        let millis = match unit.as_str() {
            "ms" => value,
            "s" => value * 1_000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            _ => break,
        };
        total += millis;
        matched = true;
    }

    matched.then(|| Duration::from_millis(total.round() as u64))
}
