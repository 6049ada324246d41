//! 对话层：阶段机、提示词组装、模板来源、单轮对话控制器

pub mod controller;
pub mod prompt;
pub mod stage;
pub mod template;

pub use controller::{DialogueController, InboundTurn, TurnReply};
pub use prompt::{render_turns, PromptBundle, CURRENT_MESSAGE_MARKER};
pub use stage::{next_stage, Stage};
pub use template::PromptTemplates;
