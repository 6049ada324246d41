//! 会话数据模型：Session、UserProfile、AppointmentDraft 与局部更新 SessionUpdate

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dialogue::Stage;
use crate::memory::{History, Turn};

/// 用户资料。name 一旦已知就不会被降级为空。
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UserProfile {
    pub name: Option<String>,
    /// 联系方式（即会话的 identity）
    pub contact: String,
}

impl UserProfile {
    /// 合并名字：非空值覆盖（后写者胜），空值忽略
    pub fn merge_name(&mut self, name: Option<&str>) {
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            self.name = Some(name.to_string());
        }
    }

    pub fn has_name(&self) -> bool {
        self.name.is_some()
    }
}

/// 预约草稿：自由键值累加器，不做校验
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AppointmentDraft(BTreeMap<String, serde_json::Value>);

impl AppointmentDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// 浅合并，同名键后写者胜
    pub fn merge(&mut self, other: AppointmentDraft) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 单个身份的完整对话状态
#[derive(Clone, Debug, Serialize)]
pub struct Session {
    identity: String,
    #[serde(rename = "messages")]
    history: History,
    stage: Stage,
    profile: UserProfile,
    appointment: AppointmentDraft,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: impl Into<String>, max_history: usize, now: DateTime<Utc>) -> Self {
        let identity = identity.into();
        Self {
            profile: UserProfile {
                name: None,
                contact: identity.clone(),
            },
            identity,
            history: History::new(max_history),
            stage: Stage::default(),
            appointment: AppointmentDraft::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn appointment(&self) -> &AppointmentDraft {
        &self.appointment
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// 更新活跃时间（单调不减）
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// 空闲是否超过 ttl
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_activity) > ttl
    }

    /// 应用局部更新：字段浅合并，可选追加一条消息（追加后按上限剪枝）
    pub(crate) fn apply(&mut self, update: SessionUpdate, now: DateTime<Utc>) {
        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        self.profile.merge_name(update.name.as_deref());
        if let Some(draft) = update.appointment {
            self.appointment.merge(draft);
        }
        if let Some(turn) = update.turn {
            self.history.push(turn);
        }
        self.touch(now);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            identity: self.identity.clone(),
            stage: self.stage,
            history_len: self.history.len(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

/// 观测用的会话摘要
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub identity: String,
    pub stage: Stage,
    #[serde(rename = "messagesCount")]
    pub history_len: usize,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
}

/// 会话局部更新
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    pub stage: Option<Stage>,
    pub name: Option<String>,
    pub appointment: Option<AppointmentDraft>,
    pub turn: Option<Turn>,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn appointment(mut self, draft: AppointmentDraft) -> Self {
        self.appointment = Some(draft);
        self
    }

    pub fn turn(mut self, turn: Turn) -> Self {
        self.turn = Some(turn);
        self
    }
}
