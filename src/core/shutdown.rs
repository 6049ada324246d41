//! 优雅关闭
//!
//! HTTP 服务、过期清理任务与渠道探活循环共用一个 CancellationToken；
//! 第一次触发关闭时记录原因，服务退出后由入口打印。

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    /// 后台任务据此退出
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复调用只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    /// Ctrl+C 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down gracefully...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, shutting down gracefully...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins_and_token_cancelled() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert_eq!(manager.reason(), None);

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::FatalError("late".into()));

        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(&ShutdownReason::Signal));
    }
}
