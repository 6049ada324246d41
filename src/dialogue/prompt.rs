//! 结构化提示词：人设、阶段引导、用户资料、历史与当前消息分字段保存
//!
//! 需要独立 system 字段的后端直接取 `system_text()`，不需要从拼好的字符串里再切分。

use std::fmt::Write;

use super::stage::Stage;
use crate::memory::Turn;
use crate::session::UserProfile;

const LABEL_STAGE: &str = "ESTÁGIO ATUAL DA CONVERSA";
const LABEL_PROFILE: &str = "DADOS DO USUÁRIO";
const LABEL_HISTORY: &str = "HISTÓRICO DA CONVERSA";
/// 当前消息分隔标记：flatten 后的字符串里它之前是 system 部分，之后是本轮消息
pub const CURRENT_MESSAGE_MARKER: &str = "MENSAGEM ATUAL DO PACIENTE:";
const NAME_UNKNOWN: &str = "Não informado";
const CLOSING: &str = "Por favor, responda de forma apropriada ao estágio atual da conversa e à mensagem do paciente.\nLembre-se de ser cordial, profissional e proativo.";

/// 一轮对话的提示词材料
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub persona: String,
    pub stage: Stage,
    pub stage_guidance: String,
    pub profile: UserProfile,
    /// 本轮之前的历史（最旧在前，不含刚追加的用户消息）
    pub history: Vec<Turn>,
    pub current_text: String,
}

impl PromptBundle {
    /// 除当前消息外的全部内容（人设 + 阶段 + 资料 + 历史）
    pub fn system_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.persona.trim());
        let _ = writeln!(out);
        let _ = writeln!(out, "{}: {}", LABEL_STAGE, self.stage);
        let _ = writeln!(out, "{}", self.stage_guidance.trim());
        let _ = writeln!(out);
        let _ = writeln!(out, "{}:", LABEL_PROFILE);
        let _ = writeln!(
            out,
            "- Nome: {}",
            self.profile.name.as_deref().unwrap_or(NAME_UNKNOWN)
        );
        let _ = writeln!(out, "- Telefone: {}", self.profile.contact);

        if !self.history.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}:", LABEL_HISTORY);
            out.push_str(&render_turns(&self.history));
        }
        out.trim_end().to_string()
    }

    /// 完整的单字符串提示词
    pub fn render(&self) -> String {
        format!(
            "{}\n\n{} {}\n\n{}",
            self.system_text(),
            CURRENT_MESSAGE_MARKER,
            self.current_text,
            CLOSING
        )
    }
}

/// 按「角色: 内容」逐行渲染
pub fn render_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}\n", t.role.label(), t.content))
        .collect()
}
