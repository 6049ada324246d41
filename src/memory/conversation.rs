//! 短期记忆：对话历史
//!
//! 按到达顺序保留最近 N 条消息（user/assistant），超出时丢弃最旧的，供提示词拼装与 LLM 上下文使用。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// 拼进提示词时的角色标签
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "Paciente",
            Role::Assistant => "Assistente",
        }
    }
}

/// 单条消息；追加后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, Utc::now())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, Utc::now())
    }
}

/// 有界对话历史：最多 max_len 条，FIFO 剪枝
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub struct History {
    turns: Vec<Turn>,
    #[serde(skip)]
    max_len: usize,
}

impl History {
    pub fn new(max_len: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_len,
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.prune();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// 最近 n 条（按原顺序）
    pub fn recent(&self, n: usize) -> &[Turn] {
        &self.turns[self.turns.len().saturating_sub(n)..]
    }

    /// 超出 max_len 时丢弃最旧的消息
    fn prune(&mut self) {
        if self.turns.len() > self.max_len {
            let excess = self.turns.len() - self.max_len;
            self.turns.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_trims_oldest_first() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.push(Turn::user(format!("m{}", i)));
        }
        let contents: Vec<_> = history.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_recent_window() {
        let mut history = History::new(10);
        history.push(Turn::user("a"));
        history.push(Turn::assistant("b"));
        history.push(Turn::user("c"));
        assert_eq!(history.recent(2).len(), 2);
        assert_eq!(history.recent(2)[0].content, "b");
        assert_eq!(history.recent(50).len(), 3);
        assert_eq!(history.recent(1)[0].role, Role::User);
    }
}
