//! 生成后端抽象
//!
//! 所有后端（OpenAI 兼容 / Anthropic / Google / Mock）实现 GenerationBackend：
//! 把结构化提示词与近期历史整理成各自的调用形态，裁剪返回文本，并把自身的失败归入统一分类。

use async_trait::async_trait;

use crate::core::GenerationError;
use crate::dialogue::PromptBundle;
use crate::memory::Turn;

/// 一次生成调用的输入
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: PromptBundle,
    /// 最近 N 条消息（含本轮用户消息，最旧在前）
    pub recent: Vec<Turn>,
}

/// 生成后端 trait；调用只挂起当前轮次，不阻塞其他身份
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// 后端名（日志与健康检查用）
    fn name(&self) -> &'static str;

    async fn generate_response(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}
