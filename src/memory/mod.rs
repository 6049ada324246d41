//! 短期记忆：按时间顺序、有长度上限的对话历史

pub mod conversation;

pub use conversation::{History, Role, Turn};
