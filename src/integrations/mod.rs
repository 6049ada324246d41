//! 外部集成：渠道连接器抽象、连接状态机、WhatsApp Cloud API 与 HTTP 运维接口
//!
//! WhatsApp 与 HTTP 部分需要 `whatsapp` feature（axum）与公网 Webhook 域名。

pub mod channel;
pub mod connection;

#[cfg(feature = "whatsapp")]
pub mod routes;
#[cfg(feature = "whatsapp")]
pub mod whatsapp;

pub use channel::{ChannelConnector, ChannelError, OfflineChannel};
pub use connection::{ConnectionEvent, ConnectionMachine, ConnectionMonitor, ConnectionState, ConnectivityProbe, ReconnectPolicy};
