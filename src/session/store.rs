//! 会话存储
//!
//! 每个 identity 一个 `Arc<Mutex<Slot>>`：一轮对话持有该锁完成完整的读-改-写，
//! 同一身份的后续轮次在锁上按请求顺序排队（tokio Mutex 公平 FIFO），不同身份互不阻塞。
//! 过期清理与显式删除也先拿同一把锁，再从表中摘除，并给槽位打上 evicted 标记，
//! 这样排在后面的等待者会发现槽位已失效并重新创建会话。

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::model::{Session, SessionSummary, SessionUpdate};

struct Slot {
    session: Session,
    evicted: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

/// 会话存储：进程内，生命周期与进程一致
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SlotRef>>,
    max_history: usize,
    ttl: chrono::Duration,
}

/// 持有某个 identity 的会话锁；drop 时释放
pub struct SessionGuard {
    slot: OwnedMutexGuard<Slot>,
}

impl SessionGuard {
    /// 在锁内应用局部更新，返回更新后的会话
    pub fn apply(&mut self, update: SessionUpdate) -> &Session {
        self.slot.session.apply(update, Utc::now());
        &self.slot.session
    }

    pub fn snapshot(&self) -> Session {
        self.slot.session.clone()
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.slot.session
    }
}

impl SessionStore {
    pub fn new(max_history: usize, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_history,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36500)),
        }
    }

    /// 获取 identity 的会话锁（不存在则创建），并刷新活跃时间
    pub async fn lock(&self, identity: &str) -> SessionGuard {
        loop {
            let slot = {
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(identity.to_string())
                    .or_insert_with(|| {
                        tracing::info!(identity, "New conversation session created");
                        Arc::new(Mutex::new(Slot {
                            session: Session::new(identity, self.max_history, Utc::now()),
                            evicted: false,
                        }))
                    })
                    .clone()
            };

            let mut guard = slot.lock_owned().await;
            if guard.evicted {
                // 等锁期间被清理，重新取
                continue;
            }
            guard.session.touch(Utc::now());
            return SessionGuard { slot: guard };
        }
    }

    /// 获取会话快照（不存在则创建），刷新活跃时间
    pub async fn get(&self, identity: &str) -> Session {
        self.lock(identity).await.snapshot()
    }

    /// 原子地应用局部更新
    pub async fn update(&self, identity: &str, update: SessionUpdate) -> Session {
        let mut guard = self.lock(identity).await;
        guard.apply(update).clone()
    }

    /// 只读查看，不创建、不刷新活跃时间
    pub async fn peek(&self, identity: &str) -> Option<Session> {
        let slot = self.sessions.read().await.get(identity).cloned()?;
        let guard = slot.lock().await;
        if guard.evicted {
            None
        } else {
            Some(guard.session.clone())
        }
    }

    /// 清理空闲超过 TTL 的会话，返回清理数量
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut cleared = 0;
        for (identity, slot) in self.slots().await {
            let mut guard = slot.lock().await;
            if guard.evicted || !guard.session.is_expired(now, self.ttl) {
                continue;
            }
            guard.evicted = true;
            self.detach(&identity, &slot).await;
            cleared += 1;
            tracing::info!(identity = %identity, "Cleared idle conversation session");
        }
        cleared
    }

    /// 显式删除（运维操作）
    pub async fn remove(&self, identity: &str) -> bool {
        let slot = {
            let sessions = self.sessions.read().await;
            sessions.get(identity).cloned()
        };
        let Some(slot) = slot else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.evicted {
            return false;
        }
        guard.evicted = true;
        self.detach(identity, &slot).await;
        tracing::info!(identity, "Conversation session cleared");
        true
    }

    /// 所有会话的摘要（按 identity 排序）
    ///
    /// 正在处理一轮对话的会话被跳过：只 try_lock，不等待后端调用结束。
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for (identity, slot) in self.slots().await {
            let Ok(guard) = slot.try_lock() else {
                tracing::debug!(identity = %identity, "Session busy, omitted from listing");
                continue;
            };
            if !guard.evicted {
                summaries.push(guard.session.summary());
            }
        }
        summaries.sort_by(|a, b| a.identity.cmp(&b.identity));
        summaries
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 后台定期清理过期会话，直到 token 取消
    pub fn spawn_eviction(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let cleared = store.evict_expired(Utc::now()).await;
                        if cleared > 0 {
                            tracing::info!(cleared, "Cleared expired conversation sessions");
                        }
                    }
                }
            }
            tracing::debug!("Session eviction task stopped");
        })
    }

    async fn slots(&self) -> Vec<(String, SlotRef)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// 仅当表中仍是同一个槽位时摘除（调用方已持有该槽位的锁）
    async fn detach(&self, identity: &str, slot: &SlotRef) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(identity).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            sessions.remove(identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::Stage;
    use crate::memory::Turn;

    fn store() -> SessionStore {
        SessionStore::new(4, Duration::from_secs(24 * 3600))
    }

    #[tokio::test]
    async fn test_get_is_idempotent_apart_from_activity() {
        let store = store();
        let first = store.get("5511").await;
        let second = store.get("5511").await;
        assert_eq!(first.identity(), second.identity());
        assert_eq!(first.created_at(), second.created_at());
        assert_eq!(first.stage(), second.stage());
        assert_eq!(first.history().len(), second.history().len());
        assert_eq!(first.profile(), second.profile());
        assert!(second.last_activity() >= first.last_activity());
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_trims_history_to_most_recent() {
        let store = store();
        for i in 0..7 {
            store
                .update("x", SessionUpdate::new().turn(Turn::user(format!("m{}", i))))
                .await;
        }
        let session = store.get("x").await;
        let contents: Vec<_> = session
            .history()
            .turns()
            .iter()
            .map(|t| t.content.clone())
            .collect();
        assert_eq!(contents, vec!["m3", "m4", "m5", "m6"]);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = store();
        store
            .update("x", SessionUpdate::new().stage(Stage::Scheduling).name("Ana"))
            .await;
        let session = store.update("x", SessionUpdate::new()).await;
        assert_eq!(session.stage(), Stage::Scheduling);
        assert_eq!(session.profile().name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_evict_expired_respects_ttl() {
        let store = store();
        store.get("idle").await;
        let now = Utc::now();

        assert_eq!(store.evict_expired(now + chrono::Duration::hours(23)).await, 0);
        assert!(store.peek("idle").await.is_some());

        assert_eq!(store.evict_expired(now + chrono::Duration::hours(25)).await, 1);
        assert!(store.peek("idle").await.is_none());
        assert_eq!(store.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_evicted_session_recreated_fresh() {
        let store = store();
        store
            .update("y", SessionUpdate::new().turn(Turn::user("oi")).name("Rui"))
            .await;
        store.evict_expired(Utc::now() + chrono::Duration::hours(25)).await;

        let fresh = store.get("y").await;
        assert!(fresh.history().is_empty());
        assert!(fresh.profile().name.is_none());
        assert_eq!(fresh.stage(), Stage::Greeting);
    }

    #[tokio::test]
    async fn test_eviction_waits_for_in_flight_turn() {
        let store = Arc::new(store());
        let mut guard = store.lock("busy").await;

        let sweeper = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .evict_expired(Utc::now() + chrono::Duration::hours(25))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!sweeper.is_finished());

        guard.apply(SessionUpdate::new().turn(Turn::user("ainda aqui")));
        drop(guard);

        assert_eq!(sweeper.await.unwrap(), 1);
        assert!(store.get("busy").await.history().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let store = store();
        store.get("b").await;
        store.get("a").await;

        let listed: Vec<_> = store.list().await.into_iter().map(|s| s.identity).collect();
        assert_eq!(listed, vec!["a", "b"]);

        assert!(store.remove("a").await);
        assert!(!store.remove("a").await);
        assert!(!store.remove("missing").await);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_skips_session_with_turn_in_flight() {
        let store = store();
        store.get("idle").await;
        let _guard = store.lock("busy").await;

        let listed = tokio::time::timeout(Duration::from_millis(200), store.list())
            .await
            .expect("list must not wait on a locked session");
        let identities: Vec<_> = listed.into_iter().map(|s| s.identity).collect();
        assert_eq!(identities, vec!["idle"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_eviction_task() {
        let store = Arc::new(SessionStore::new(4, Duration::ZERO));
        store.get("idle").await;
        let token = CancellationToken::new();
        let handle = store.spawn_eviction(Duration::from_secs(60), token.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.peek("idle").await.is_none());

        token.cancel();
        handle.await.unwrap();
    }
}
