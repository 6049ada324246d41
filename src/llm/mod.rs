//! 生成层：后端能力抽象与实现（OpenAI / Anthropic / Google / DeepSeek / Mock）+ 路由器

pub mod anthropic;
pub mod deepseek;
pub mod google;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use anthropic::AnthropicBackend;
pub use deepseek::{create_deepseek_backend, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use google::GoogleBackend;
pub use mock::MockBackend;
pub use openai::OpenAiBackend;
pub use router::{BackendKind, GenerationRouter, ProviderInfo, DEFAULT_HISTORY_WINDOW};
pub use traits::{GenerationBackend, GenerationRequest};
