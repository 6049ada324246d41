//! Mock 后端（本地联调用，无需 API）
//!
//! 取本轮用户消息回显，便于不接真实后端时跑通整条对话链路。

use async_trait::async_trait;

use crate::core::GenerationError;
use crate::llm::{GenerationBackend, GenerationRequest};

/// Mock 后端：回显用户本轮消息
#[derive(Debug, Default)]
pub struct MockBackend;

#[async_trait]
impl GenerationBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate_response(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let current = request.prompt.current_text.trim();
        let current = if current.is_empty() { "(sem mensagem)" } else { current };
        Ok(format!(
            "[{}] Recebi sua mensagem: {}",
            request.prompt.stage, current
        ))
    }
}
