//! 渠道连接器抽象
//!
//! 对话核心只依赖三件事：发送、是否在线、（未认证时的）配对凭据。
//! 入站消息由具体渠道自行接收后交给 DialogueController。

use async_trait::async_trait;
use thiserror::Error;

use super::connection::ConnectionState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Channel API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Channel transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 未认证时的配对凭据（如二维码内容）；Cloud API 由令牌认证，没有这一步
    fn pairing_artifact(&self) -> Option<String> {
        None
    }

    /// 放弃重连后由运维触发重新连接；不支持时返回 false
    fn restart(&self) -> bool {
        false
    }

    async fn send(&self, identity: &str, text: &str) -> Result<(), ChannelError>;
}

/// 未配置渠道时的占位实现：始终离线，发送失败
#[derive(Debug, Default)]
pub struct OfflineChannel;

#[async_trait]
impl ChannelConnector for OfflineChannel {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Disconnected
    }

    async fn send(&self, _identity: &str, _text: &str) -> Result<(), ChannelError> {
        Err(ChannelError::NotConnected)
    }
}
