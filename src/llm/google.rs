//! Google Gemini 后端（generateContent REST）
//!
//! Gemini 这里按单字符串调用：完整提示词 + 「Histórico Recente」段。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use crate::config::GenerationParams;
use crate::core::{parse_retry_after, ConfigurationError, GenerationError};
use crate::dialogue::render_turns;
use crate::llm::{GenerationBackend, GenerationRequest};

const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleBackend {
    client: Client,
    api_key: Secret<String>,
    params: GenerationParams,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GoogleBackend {
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

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.params
                .base_url
                .as_deref()
                .unwrap_or(GOOGLE_BASE_URL)
                .trim_end_matches('/'),
            self.params.model
        )
    }

    fn build_request(&self, request: &GenerationRequest) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part {
                    text: flatten_prompt(request),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.params.temperature,
                top_k: self.params.top_k,
                top_p: self.params.top_p,
                max_output_tokens: self.params.max_tokens,
            },
        }
    }
}

fn flatten_prompt(request: &GenerationRequest) -> String {
    let prompt = request.prompt.render();
    if request.recent.is_empty() {
        prompt
    } else {
        format!(
            "{}\n\nHistórico Recente:\n{}",
            prompt,
            render_turns(&request.recent).trim_end()
        )
    }
}

/// Gemini 的鉴权错误常以 400/403 + 文案出现，先于通用状态码映射判断
fn classify_google_error(status: u16, body: &str, retry_after: Option<Duration>) -> GenerationError {
    if body.contains("API key not valid") || body.contains("API_KEY_INVALID") || body.contains("PERMISSION_DENIED") {
        return GenerationError::Auth(body.to_string());
    }
    GenerationError::from_http_status(status, body, retry_after)
}

fn extract_text(body: &str) -> Result<String, GenerationError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::Unknown(format!("Malformed Gemini response: {}", e)))?;

    let text = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let text = text.trim();
    if text.is_empty() {
        return Err(GenerationError::Unknown(
            "Gemini response has no candidate text".into(),
        ));
    }
    Ok(text.to_string())
}

#[async_trait]
impl GenerationBackend for GoogleBackend {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn generate_response(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        tracing::debug!(model = %self.params.model, "Sending request to Google AI");

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
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
            tracing::error!(status = status.as_u16(), body = %body, "Google AI API error");
            return Err(classify_google_error(status.as_u16(), &body, retry_after));
        }

        extract_text(&body)
    }
}
