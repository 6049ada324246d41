//! WhatsApp Cloud API 集成
//!
//! Webhook 接收消息（只处理文本），交给 DialogueController 处理后经 Cloud API 回复。
//! 连通性由对 Graph API 的探测驱动 `ConnectionMonitor`。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use super::channel::{ChannelConnector, ChannelError};
use super::connection::{ConnectionMonitor, ConnectionState, ConnectivityProbe, ReconnectPolicy};
use crate::config::WhatsappSection;
use crate::core::ConfigurationError;
use crate::dialogue::InboundTurn;

/// WhatsApp 单条消息长度限制 4096，留点余量
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Webhook 验证参数
#[derive(Debug, Deserialize)]
pub struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

impl WebhookVerifyQuery {
    /// 通过时返回 challenge
    pub fn verify(self, expected_token: &str) -> Option<String> {
        if self.mode.as_deref() == Some("subscribe")
            && self.verify_token.as_deref() == Some(expected_token)
        {
            Some(self.challenge.unwrap_or_default())
        } else {
            None
        }
    }
}

/// WhatsApp Webhook 请求体
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub object: Option<String>,
    pub entry: Option<Vec<WebhookEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    pub changes: Option<Vec<WebhookChange>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    pub value: Option<WebhookValue>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookValue {
    pub contacts: Option<Vec<WebhookContact>>,
    pub messages: Option<Vec<WebhookMessage>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookContact {
    pub profile: Option<WebhookProfile>,
    pub wa_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookProfile {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookMessage {
    pub from: String,
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub text: Option<WebhookText>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookText {
    pub body: String,
}

impl WebhookPayload {
    /// 取出所有文本消息，按 payload 内顺序；非文本 / 空文本 / 非 WhatsApp 对象一律忽略
    pub fn into_turns(self) -> Vec<InboundTurn> {
        if self.object.as_deref() != Some("whatsapp_business_account") {
            return Vec::new();
        }

        let mut turns = Vec::new();
        let changes = self
            .entry
            .into_iter()
            .flatten()
            .flat_map(|entry| entry.changes.into_iter().flatten());

        for change in changes {
            let Some(value) = change.value else { continue };
            let contacts = value.contacts.unwrap_or_default();

            for msg in value.messages.into_iter().flatten() {
                if msg.msg_type.as_deref() != Some("text") {
                    continue;
                }
                let Some(text) = msg.text.map(|t| t.body) else { continue };
                if text.trim().is_empty() {
                    continue;
                }

                let identity: String = msg.from.chars().filter(char::is_ascii_digit).collect();
                if identity.is_empty() {
                    continue;
                }
                let display_name = contacts
                    .iter()
                    .find(|c| c.wa_id.as_deref() == Some(msg.from.as_str()))
                    .or_else(|| contacts.first())
                    .and_then(|c| c.profile.as_ref())
                    .and_then(|p| p.name.clone());
                let timestamp = msg
                    .timestamp
                    .as_deref()
                    .and_then(|t| t.parse::<i64>().ok())
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now);

                turns.push(InboundTurn {
                    identity,
                    text,
                    display_name,
                    timestamp,
                });
            }
        }
        turns
    }
}

/// WhatsApp 发送消息 API 请求体
#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
    text: SendMessageText<'a>,
}

#[derive(Debug, Serialize)]
struct SendMessageText<'a> {
    body: &'a str,
}

/// 号码规范化：只保留数字，缺国家码时补上；没有任何数字返回 None
pub fn format_phone_number(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if digits.starts_with(country_code) {
        Some(digits)
    } else {
        Some(format!("{}{}", country_code, digits))
    }
}

/// 按字符数分段
pub fn chunk_message(body: &str, max_chars: usize) -> Vec<String> {
    if body.chars().count() <= max_chars {
        return vec![body.to_string()];
    }
    body.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

pub struct WhatsappConnector {
    client: Client,
    access_token: Secret<String>,
    phone_number_id: String,
    api_base: String,
    monitor: Arc<ConnectionMonitor>,
}

impl WhatsappConnector {
    pub fn from_config(cfg: &WhatsappSection) -> Result<Self, ConfigurationError> {
        let access_token = cfg
            .access_token
            .clone()
            .filter(|t| !t.expose_secret().trim().is_empty())
            .ok_or_else(|| ConfigurationError::MissingCredential("whatsapp.access_token".into()))?;
        let phone_number_id = cfg
            .phone_number_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ConfigurationError::MissingCredential("whatsapp.phone_number_id".into()))?;

        Ok(Self {
            client: Client::new(),
            access_token,
            phone_number_id,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            monitor: Arc::new(ConnectionMonitor::new(ReconnectPolicy::from_config(cfg))),
        })
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    async fn send_chunk(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        let url = format!("{}/{}/messages", self.api_base, self.phone_number_id);
        let req = SendMessageRequest {
            messaging_product: "whatsapp",
            to,
            msg_type: "text",
            text: SendMessageText { body },
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&req)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelConnector for WhatsappConnector {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    fn state(&self) -> ConnectionState {
        self.monitor.state()
    }

    fn restart(&self) -> bool {
        self.monitor.restart();
        true
    }

    async fn send(&self, identity: &str, text: &str) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let to: String = identity.chars().filter(char::is_ascii_digit).collect();
        if to.is_empty() {
            return Err(ChannelError::InvalidRecipient(identity.to_string()));
        }

        for chunk in chunk_message(text, MAX_MESSAGE_CHARS) {
            self.send_chunk(&to, &chunk).await?;
        }
        tracing::info!(to = %to, chars = text.chars().count(), "WhatsApp message sent");
        Ok(())
    }
}

#[async_trait]
impl ConnectivityProbe for WhatsappConnector {
    /// 读取电话号码对象，验证令牌与号码 ID 可用
    async fn probe(&self) -> Result<(), ChannelError> {
        let url = format!("{}/{}", self.api_base, self.phone_number_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ChannelError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}
