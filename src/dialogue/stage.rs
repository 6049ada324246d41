//! 对话阶段与阶段推进规则
//!
//! 关键词子串匹配（大小写不敏感），按规则表顺序求值，首个命中者生效；无命中则阶段不变。
//! 这是近似启发式而非意图分类器，可整体替换。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 对话阶段（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Greeting,
    InfoCollection,
    Scheduling,
    Confirmation,
    FollowUp,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Greeting,
        Stage::InfoCollection,
        Stage::Scheduling,
        Stage::Confirmation,
        Stage::FollowUp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::InfoCollection => "info_collection",
            Stage::Scheduling => "scheduling",
            Stage::Confirmation => "confirmation",
            Stage::FollowUp => "follow_up",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 规则检查哪一侧文本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    User,
    Assistant,
}

/// 一条阶段推进规则
#[derive(Debug)]
struct StageRule {
    from: Stage,
    source: Source,
    /// 是否要求已知用户姓名
    requires_name: bool,
    keywords: &'static [&'static str],
    to: Stage,
}

/// 规则表（顺序即优先级）。confirmation / follow_up 没有自动出口。
const RULES: &[StageRule] = &[
    StageRule {
        from: Stage::Greeting,
        source: Source::User,
        requires_name: false,
        keywords: &["agendar", "consulta", "marcar"],
        to: Stage::Scheduling,
    },
    StageRule {
        from: Stage::Greeting,
        source: Source::User,
        requires_name: false,
        keywords: &["valor", "preço", "quanto"],
        to: Stage::InfoCollection,
    },
    StageRule {
        from: Stage::InfoCollection,
        source: Source::User,
        requires_name: true,
        keywords: &["agendar", "marcar"],
        to: Stage::Scheduling,
    },
    StageRule {
        from: Stage::Scheduling,
        source: Source::Assistant,
        requires_name: false,
        keywords: &["agendado", "confirmado"],
        to: Stage::Confirmation,
    },
];

/// 根据本轮的用户与助手文本计算下一阶段（纯函数）
///
/// `name_known` 对应用户资料里是否已有姓名，info_collection → scheduling 需要它。
pub fn next_stage(current: Stage, user_text: &str, assistant_text: &str, name_known: bool) -> Stage {
    let user = user_text.to_lowercase();
    let assistant = assistant_text.to_lowercase();

    RULES
        .iter()
        .filter(|rule| rule.from == current)
        .filter(|rule| !rule.requires_name || name_known)
        .find(|rule| {
            let text = match rule.source {
                Source::User => &user,
                Source::Assistant => &assistant,
            };
            rule.keywords.iter().any(|k| text.contains(k))
        })
        .map(|rule| rule.to)
        .unwrap_or(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_to_scheduling() {
        let next = next_stage(
            Stage::Greeting,
            "Olá, gostaria de agendar uma consulta",
            "Claro!",
            false,
        );
        assert_eq!(next, Stage::Scheduling);
    }

    #[test]
    fn test_greeting_to_info_collection() {
        let next = next_stage(Stage::Greeting, "quanto custa uma limpeza?", "R$ 150", false);
        assert_eq!(next, Stage::InfoCollection);
    }

    #[test]
    fn test_scheduling_keywords_take_priority() {
        // 同时命中两组关键词时，规则表靠前者生效
        let next = next_stage(Stage::Greeting, "Quanto custa marcar?", "", false);
        assert_eq!(next, Stage::Scheduling);
    }

    #[test]
    fn test_case_insensitive_with_accents() {
        let next = next_stage(Stage::Greeting, "Qual o PREÇO?", "", false);
        assert_eq!(next, Stage::InfoCollection);
    }

    #[test]
    fn test_info_collection_requires_name() {
        assert_eq!(
            next_stage(Stage::InfoCollection, "quero marcar", "", false),
            Stage::InfoCollection
        );
        assert_eq!(
            next_stage(Stage::InfoCollection, "quero marcar", "", true),
            Stage::Scheduling
        );
    }

    #[test]
    fn test_scheduling_uses_assistant_text() {
        assert_eq!(
            next_stage(Stage::Scheduling, "ok, confirmado", "Vou verificar", true),
            Stage::Scheduling
        );
        assert_eq!(
            next_stage(Stage::Scheduling, "ok", "Sua consulta foi AGENDADA... agendado!", true),
            Stage::Confirmation
        );
    }

    #[test]
    fn test_terminal_stages_have_no_egress() {
        for stage in [Stage::Confirmation, Stage::FollowUp] {
            assert_eq!(next_stage(stage, "agendar marcar valor", "agendado", true), stage);
        }
    }

    #[test]
    fn test_no_match_keeps_stage_and_is_deterministic() {
        let a = next_stage(Stage::Greeting, "bom dia", "bom dia!", false);
        let b = next_stage(Stage::Greeting, "bom dia", "bom dia!", false);
        assert_eq!(a, Stage::Greeting);
        assert_eq!(a, b);
    }

    #[test]
    fn test_serialized_name_matches_as_str() {
        for stage in Stage::ALL {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, serde_json::Value::String(stage.as_str().to_string()));
        }
    }
}
