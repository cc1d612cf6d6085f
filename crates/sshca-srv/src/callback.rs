//! Rendezvous between SSH sessions and browser OAuth callbacks.
//!
//! An SSH session registers a random `state`, prints a login URL carrying it
//! and waits on the returned receiver. When the browser completes the OAuth
//! dance, the HTTP callback hands the access token over by `state`.
//! Each session ends exactly once: delivered, expired or cancelled. Dropping
//! the sender is what tells a waiter its session is gone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use sshca_core::AccessToken;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long a registered session waits for its callback by default.
pub const DEFAULT_CALLBACK_TTL: Duration = Duration::from_secs(10 * 60);

/// How often the background sweeper purges expired sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Receives the access token for one registered session.
pub type CallbackReceiver = oneshot::Receiver<AccessToken>;

#[derive(Debug)]
struct PendingSession {
    tx: oneshot::Sender<AccessToken>,
    expires_at: Instant,
}

/// Maps pending OAuth `state` values to waiting SSH sessions.
#[derive(Debug)]
pub struct CallbackCoordinator {
    sessions: RwLock<HashMap<String, PendingSession>>,
    ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for CallbackCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_CALLBACK_TTL)
    }
}

impl CallbackCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            sweeper: Mutex::new(None),
        }
    }

    /// Register `state` with the default TTL.
    pub async fn register_session(&self, state: &str) -> CallbackReceiver {
        self.register_session_with_ttl(state, self.ttl).await
    }

    /// Register `state`, replacing any session already using it.
    pub async fn register_session_with_ttl(
        &self,
        state: &str,
        ttl: Duration,
    ) -> CallbackReceiver {
        let (tx, rx) = oneshot::channel();
        let pending = PendingSession {
            tx,
            expires_at: Instant::now() + ttl,
        };
        if self
            .sessions
            .write()
            .await
            .insert(state.to_string(), pending)
            .is_some()
        {
            debug!("replaced existing callback session");
        }
        rx
    }

    /// Deliver `token` to the session waiting on `state`.
    ///
    /// Returns false when no live session exists or its waiter has gone away.
    pub async fn handle_callback(&self, state: &str, token: AccessToken) -> bool {
        let Some(pending) = self.sessions.write().await.remove(state) else {
            return false;
        };
        if pending.expires_at <= Instant::now() {
            debug!("callback arrived for expired session");
            return false;
        }
        pending.tx.send(token).is_ok()
    }

    /// Cancel a session; its waiter observes closure.
    pub async fn unregister_session(&self, state: &str) {
        self.sessions.write().await.remove(state);
    }

    /// Remove expired sessions, returning how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, p)| p.expires_at <= now)
            .map(|(state, _)| state.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for state in expired {
            // Re-registered between the two locks: leave it alone.
            if sessions.get(&state).is_some_and(|p| p.expires_at <= now) {
                sessions.remove(&state);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired callback sessions");
        }
        removed
    }

    /// Start the periodic sweeper. Calling it again replaces the old task.
    pub async fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.sweep().await;
            }
        });
        if let Some(old) = self.sweeper.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Stop the sweeper and close every pending session.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        let mut sessions = self.sessions.write().await;
        let pending = sessions.len();
        sessions.clear();
        info!(pending, "callback coordinator shut down");
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> AccessToken {
        AccessToken::new(s)
    }

    #[tokio::test]
    async fn test_single_delivery() {
        let coordinator = CallbackCoordinator::default();
        let rx = coordinator.register_session("state1").await;

        assert!(coordinator.handle_callback("state1", token("t1")).await);
        assert_eq!(rx.await.unwrap().secret(), "t1");

        assert!(!coordinator.handle_callback("state1", token("t2")).await);
        assert!(coordinator.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_state() {
        let coordinator = CallbackCoordinator::default();
        assert!(!coordinator.handle_callback("nope", token("t")).await);
    }

    #[tokio::test]
    async fn test_expired_session_rejected() {
        let coordinator = CallbackCoordinator::default();
        let rx = coordinator
            .register_session_with_ttl("s", Duration::from_secs(1))
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!coordinator.handle_callback("s", token("t")).await);
        assert!(rx.await.is_err());
        assert!(coordinator.is_empty().await);
    }

    #[tokio::test]
    async fn test_dropped_waiter() {
        let coordinator = CallbackCoordinator::default();
        drop(coordinator.register_session("s").await);
        assert!(!coordinator.handle_callback("s", token("t")).await);
    }

    #[tokio::test]
    async fn test_reregistration_closes_old_receiver() {
        let coordinator = CallbackCoordinator::default();
        let old = coordinator.register_session("s").await;
        let new = coordinator.register_session("s").await;

        assert!(old.await.is_err());
        assert!(coordinator.handle_callback("s", token("t")).await);
        assert_eq!(new.await.unwrap().secret(), "t");
    }

    #[tokio::test]
    async fn test_sweep_unblocks_waiters() {
        let coordinator = CallbackCoordinator::default();
        let expired = coordinator
            .register_session_with_ttl("old", Duration::from_millis(10))
            .await;
        let _live = coordinator.register_session("new").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.sweep().await, 1);
        assert_eq!(coordinator.len().await, 1);
        assert!(expired.await.is_err());
    }

    #[tokio::test]
    async fn test_unregister() {
        let coordinator = CallbackCoordinator::default();
        let rx = coordinator.register_session("s").await;
        coordinator.unregister_session("s").await;
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let coordinator = Arc::new(CallbackCoordinator::default());
        coordinator.spawn_sweeper().await;
        let a = coordinator.register_session("a").await;
        let b = coordinator.register_session("b").await;

        coordinator.shutdown().await;
        assert!(a.await.is_err());
        assert!(b.await.is_err());
        assert!(coordinator.is_empty().await);
    }
}
