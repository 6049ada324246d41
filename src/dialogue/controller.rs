//! 单轮对话控制器
//!
//! 一轮对话的完整流程都在同一把会话锁内完成：
//! 取会话 → 合并资料 → 追加用户消息 → 组装提示词 → 调用生成路由 →
//! 成功则追加助手消息并推进阶段，失败则只保留用户消息并返回固定降级回复。
//! 控制器是每轮对话唯一的错误捕获边界，任何失败都不会逃出 `handle_turn`。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::prompt::PromptBundle;
use super::stage::{next_stage, Stage};
use super::template::PromptTemplates;
use crate::config::ClinicSection;
use crate::core::ErrorKind;
use crate::llm::GenerationRouter;
use crate::memory::{Role, Turn};
use crate::session::{SessionStore, SessionUpdate};

/// 渠道投递进来的一轮用户消息
#[derive(Debug, Clone)]
pub struct InboundTurn {
    pub identity: String,
    pub text: String,
    /// 渠道侧展示名（如 WhatsApp pushName），仅在资料里还没有名字时采用
    pub display_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundTurn {
    pub fn new(identity: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            text: text.into(),
            display_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// 一轮对话的结果：回复文本 + 本轮结束时的阶段；失败时带上错误类别
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub text: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorKind>,
    /// 限流 / 配额类失败的建议等待时间
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl TurnReply {
    pub fn is_fallback(&self) -> bool {
        self.failure.is_some()
    }
}

/// 降级回复，始终带人工联系电话
pub fn fallback_message(phone: &str) -> String {
    format!(
        "Desculpe, estou com dificuldades técnicas no momento. Por favor, tente novamente em alguns instantes ou entre em contato pelo telefone {}.",
        phone
    )
}

pub struct DialogueController {
    store: Arc<SessionStore>,
    router: Arc<GenerationRouter>,
    templates: Arc<PromptTemplates>,
    fallback: String,
}

impl DialogueController {
    pub fn new(
        store: Arc<SessionStore>,
        router: Arc<GenerationRouter>,
        templates: Arc<PromptTemplates>,
        clinic: &ClinicSection,
    ) -> Self {
        Self {
            store,
            router,
            templates,
            fallback: fallback_message(&clinic.phone),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<GenerationRouter> {
        &self.router
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// 处理一轮对话。同一 identity 的并发调用按到达顺序串行，不同 identity 并行。
    pub async fn handle_turn(&self, inbound: InboundTurn) -> TurnReply {
        let started = Instant::now();
        let identity = inbound.identity.as_str();

        // 1. 取会话并持锁到本轮结束；超时由路由器兜底，锁不会被卡住的调用长期占用
        let mut session = self.store.lock(identity).await;
        let stage = session.stage();
        tracing::debug!(identity, stage = %stage, "Processing inbound turn");

        // 2 + 3. 名字只在未知时采用展示名；追加用户消息
        let mut update = SessionUpdate::new().turn(Turn::new(
            Role::User,
            inbound.text.clone(),
            inbound.timestamp,
        ));
        if !session.profile().has_name() {
            if let Some(name) = inbound.display_name.as_deref() {
                update = update.name(name);
            }
        }
        session.apply(update);

        // 4. 提示词里的历史不含刚追加的这条
        let history = session.history().turns().to_vec();
        let prior = &history[..history.len().saturating_sub(1)];
        let bundle = PromptBundle {
            persona: self.templates.persona().to_string(),
            stage,
            stage_guidance: self.templates.stage_guidance(stage).to_string(),
            profile: session.profile().clone(),
            history: prior.to_vec(),
            current_text: inbound.text.clone(),
        };

        // 5. 路由器只取最近 N 条交给后端
        match self.router.generate(bundle, &history).await {
            // 6.
            Ok(text) => {
                let next = next_stage(stage, &inbound.text, &text, session.profile().has_name());
                let mut update = SessionUpdate::new().turn(Turn::assistant(text.clone()));
                if next != stage {
                    tracing::info!(identity, from = %stage, to = %next, "Conversation stage changed");
                    update = update.stage(next);
                }
                session.apply(update);

                tracing::info!(
                    identity,
                    stage = %next,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Turn completed"
                );
                TurnReply {
                    text,
                    stage: next,
                    failure: None,
                    retry_after: None,
                }
            }
            // 7.
            Err(e) => {
                tracing::error!(
                    identity,
                    stage = %stage,
                    kind = %e.kind(),
                    error = %e,
                    "Turn failed, replying with fallback"
                );
                TurnReply {
                    text: self.fallback.clone(),
                    stage,
                    failure: Some(e.kind()),
                    retry_after: e.retry_after(),
                }
            }
        }
    }
}
