//! 渠道连接状态机
//!
//! 状态：Disconnected → Connecting → Connected；探测失败回到 Disconnected 并按固定间隔重试，
//! 连续失败达到上限后进入 GivingUp，只有外部 restart 信号能把它拉回 Disconnected。
//! 状态转移是纯函数（`ConnectionMachine::apply`），驱动循环在 `ConnectionMonitor::run`。

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::channel::ChannelError;
use crate::config::WhatsappSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    GivingUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    ProbeSucceeded,
    ProbeFailed,
    Restart,
}

/// 重连策略：固定间隔 + 最大连续尝试次数
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// 已连接时的探活间隔
    pub keepalive: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &WhatsappSection) -> Self {
        Self {
            max_attempts: cfg.max_reconnect_attempts.max(1),
            delay: Duration::from_secs(cfg.reconnect_delay_secs),
            keepalive: Duration::from_secs(cfg.keepalive_secs.max(1)),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
            keepalive: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
}

impl ConnectionMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 当前这一轮重连已尝试的次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        self.state = match (self.state, event) {
            (_, Restart) => {
                self.attempts = 0;
                Disconnected
            }
            (Disconnected, Connect) => {
                self.attempts += 1;
                Connecting
            }
            (Connecting | Connected, ProbeSucceeded) => {
                self.attempts = 0;
                Connected
            }
            (Connecting, ProbeFailed) if self.attempts >= self.max_attempts => GivingUp,
            (Connecting | Connected, ProbeFailed) => Disconnected,
            (state, _) => state,
        };
        self.state
    }
}

/// 连通性探测（如对 Graph API 发一次请求）
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), ChannelError>;
}

/// 发布连接状态并响应 restart 信号
pub struct ConnectionMonitor {
    state_tx: watch::Sender<ConnectionState>,
    restart: Notify,
    policy: ReconnectPolicy,
}

impl ConnectionMonitor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            restart: Notify::new(),
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// 请求重新连接（GivingUp 时唯一的出口）
    pub fn restart(&self) {
        tracing::info!("Connection restart requested");
        self.restart.notify_one();
    }

    fn publish(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!(?previous, ?state, "Channel connection state changed");
        }
    }

    /// 驱动状态机直到 token 取消
    pub async fn run(&self, probe: &dyn ConnectivityProbe, token: CancellationToken) {
        let mut machine = ConnectionMachine::new(self.policy.max_attempts);

        loop {
            match machine.state() {
                ConnectionState::Disconnected => {
                    self.publish(machine.apply(ConnectionEvent::Connect));
                    tracing::info!(
                        attempt = machine.attempts(),
                        max_attempts = self.policy.max_attempts,
                        "Connecting channel"
                    );
                }
                ConnectionState::Connecting => {
                    let result = tokio::select! {
                        _ = token.cancelled() => break,
                        result = probe.probe() => result,
                    };
                    let state = machine.apply(probe_event(result));
                    self.publish(state);
                    match state {
                        ConnectionState::Disconnected => {
                            if !self.pause(self.policy.delay, &token, &mut machine).await {
                                break;
                            }
                        }
                        ConnectionState::GivingUp => {
                            tracing::error!("Max reconnection attempts reached, waiting for restart");
                        }
                        _ => {}
                    }
                }
                ConnectionState::Connected => {
                    if !self.pause(self.policy.keepalive, &token, &mut machine).await {
                        break;
                    }
                    if machine.state() != ConnectionState::Connected {
                        continue;
                    }
                    let result = tokio::select! {
                        _ = token.cancelled() => break,
                        result = probe.probe() => result,
                    };
                    self.publish(machine.apply(probe_event(result)));
                }
                ConnectionState::GivingUp => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.restart.notified() => {
                            self.publish(machine.apply(ConnectionEvent::Restart));
                        }
                    }
                }
            }
        }

        self.publish(ConnectionState::Disconnected);
        tracing::debug!("Connection monitor stopped");
    }

    /// 等待一段时间；期间收到 restart 则立即应用。返回 false 表示已关闭。
    async fn pause(&self, duration: Duration, token: &CancellationToken, machine: &mut ConnectionMachine) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
            _ = self.restart.notified() => {
                self.publish(machine.apply(ConnectionEvent::Restart));
                true
            }
        }
    }
}

fn probe_event(result: Result<(), ChannelError>) -> ConnectionEvent {
    match result {
        Ok(()) => ConnectionEvent::ProbeSucceeded,
        Err(e) => {
            tracing::warn!(error = %e, "Channel connectivity probe failed");
            ConnectionEvent::ProbeFailed
        }
    }
}
