//! Anthropic Messages API 后端
//!
//! system 字段取结构化提示词中除当前消息外的部分；messages 为近期历史（role 标记），
//! 保证以 user 开头、相邻同角色合并、末条为本轮用户消息。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use crate::config::GenerationParams;
use crate::core::{parse_retry_after, ConfigurationError, GenerationError};
use crate::llm::{GenerationBackend, GenerationRequest};
use crate::memory::Role;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    client: Client,
    api_key: Secret<String>,
    params: GenerationParams,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    system: String,
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

impl AnthropicBackend {
    pub fn new(
        api_key: Secret<String>,
        params: GenerationParams,
        timeout: Duration,
    ) -> Result<Self, ConfigurationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigurationError::Invalid(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            params,
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/v1/messages",
            self.params
                .base_url
                .as_deref()
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
        )
    }

    fn build_request<'a>(&'a self, request: &GenerationRequest) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.params.model,
            max_tokens: self.params.max_tokens,
            temperature: self.params.temperature,
            top_p: self.params.top_p,
            top_k: self.params.top_k,
            system: request.prompt.system_text(),
            messages: shape_messages(request),
        }
    }
}

/// 近期历史 → Anthropic messages
fn shape_messages(request: &GenerationRequest) -> Vec<ApiMessage> {
    let mut messages: Vec<ApiMessage> = Vec::new();

    let turns = request
        .recent
        .iter()
        .skip_while(|t| t.role == Role::Assistant);
    for turn in turns {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push('\n');
                last.content.push_str(&turn.content);
            }
            _ => messages.push(ApiMessage {
                role,
                content: turn.content.clone(),
            }),
        }
    }

    let current = request.prompt.current_text.trim();
    let has_current = messages
        .last()
        .is_some_and(|m| m.role == "user" && m.content.ends_with(current));
    if !has_current && !current.is_empty() {
        match messages.last_mut() {
            Some(last) if last.role == "user" => {
                last.content.push('\n');
                last.content.push_str(current);
            }
            _ => messages.push(ApiMessage {
                role: "user",
                content: current.to_string(),
            }),
        }
    }

    if messages.is_empty() {
        messages.push(ApiMessage {
            role: "user",
            content: "Olá".to_string(),
        });
    }
    messages
}

fn extract_text(body: &str) -> Result<String, GenerationError> {
    let parsed: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::Unknown(format!("Malformed Anthropic response: {}", e)))?;

    let text = parsed
        .content
        .into_iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");

    let text = text.trim();
    if text.is_empty() {
        return Err(GenerationError::Unknown(
            "Anthropic response has no text content".into(),
        ));
    }
    Ok(text.to_string())
}

#[async_trait]
impl GenerationBackend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate_response(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        tracing::debug!(model = %self.params.model, "Sending request to Anthropic");

        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&self.build_request(request))
            .send()
            .await
            .map_err(|e| GenerationError::from_transport(&e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers().get("retry-after"));
        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::from_transport(&e))?;

        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %body, "Anthropic API error");
            return Err(GenerationError::from_http_status(status.as_u16(), &body, retry_after));
        }

        extract_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::dialogue::{PromptBundle, Stage};
    use crate::memory::Turn;
    use crate::session::UserProfile;

    fn request(recent: Vec<Turn>, current: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: PromptBundle {
                persona: "persona".into(),
                stage: Stage::Greeting,
                stage_guidance: "g".into(),
                profile: UserProfile::default(),
                history: vec![],
                current_text: current.into(),
            },
            recent,
        }
    }

    #[test]
    fn test_shape_drops_leading_assistant_and_keeps_current_last() {
        let req = request(
            vec![
                Turn::assistant("Olá!"),
                Turn::user("oi"),
                Turn::assistant("Como posso ajudar?"),
                Turn::user("quero agendar"),
            ],
            "quero agendar",
        );
        let messages = shape_messages(&req);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[2].content, "quero agendar");
    }

    #[test]
    fn test_shape_appends_missing_current_message() {
        let req = request(vec![Turn::user("oi"), Turn::assistant("Olá")], "tudo bem?");
        let messages = shape_messages(&req);
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("tudo bem?"));
        assert_eq!(messages.last().map(|m| m.role), Some("user"));
    }

    #[test]
    fn test_shape_never_empty() {
        let messages = shape_messages(&request(vec![], ""));
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_extract_text_joins_text_blocks() {
        let body = r#"{"content":[{"type":"text","text":"  Olá, "},{"type":"tool_use"},{"type":"text","text":"tudo bem?  "}]}"#;
        assert_eq!(extract_text(body).unwrap(), "Olá, tudo bem?");
    }

    #[test]
    fn test_malformed_payload_is_unknown() {
        assert_eq!(extract_text("not json").unwrap_err().kind(), ErrorKind::Unknown);
        assert_eq!(extract_text(r#"{"content":[]}"#).unwrap_err().kind(), ErrorKind::Unknown);
        assert_eq!(extract_text(r#"{"id":"x"}"#).unwrap_err().kind(), ErrorKind::Unknown);
    }
}
