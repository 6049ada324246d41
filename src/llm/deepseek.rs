//! DeepSeek 后端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use secrecy::Secret;

use crate::config::GenerationParams;
use crate::llm::OpenAiBackend;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 后端；未配置 base_url 时使用官方端点
pub fn create_deepseek_backend(api_key: &Secret<String>, mut params: GenerationParams) -> OpenAiBackend {
    if params.base_url.is_none() {
        params.base_url = Some(DEEPSEEK_BASE_URL.to_string());
    }
    if params.model.trim().is_empty() {
        params.model = DEEPSEEK_CHAT.to_string();
    }
    OpenAiBackend::named("deepseek", api_key, params)
}
