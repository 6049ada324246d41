//! clinic-assistant - 多轮对话预约助手
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、优雅关闭
//! - **memory**: 有上限的对话历史
//! - **session**: 会话模型与按 identity 加锁的会话存储
//! - **dialogue**: 阶段机、提示词组装、模板、单轮对话控制器
//! - **llm**: 生成后端抽象与实现（OpenAI / Anthropic / Google / DeepSeek / Mock）+ 路由器
//! - **integrations**: 渠道连接器、连接状态机、WhatsApp 与 HTTP 接口
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod dialogue;
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod session;

pub use dialogue::{DialogueController, InboundTurn, TurnReply};
pub use llm::GenerationRouter;
pub use session::SessionStore;
