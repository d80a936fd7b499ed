use crate::errors::EngineError;
use crate::wizard::WizardSession;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

struct OwnedSession {
    owner: u64,
    touched: Instant,
    session: WizardSession,
}

impl OwnedSession {
    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.touched) > ttl
    }
}

/// Live wizard sessions, each owned by the caller that opened it. Sessions
/// belonging to someone else are reported as missing.
///
/// Sessions idle for longer than the TTL are dropped, and a caller holds at
/// most `per_owner` sessions; opening one more evicts their least recently
/// touched draft.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<Uuid, OwnedSession>>>,
    ttl: Duration,
    per_owner: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_limits(ttl_from_env(), per_owner_from_env())
    }

    pub fn with_limits(ttl: Duration, per_owner: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            per_owner: per_owner.max(1),
        }
    }

    pub async fn insert(&self, owner: u64, session: WizardSession) -> Uuid {
        let id = session.id;
        let now = Instant::now();
        let mut guard = self.inner.lock().await;

        let before = guard.len();
        guard.retain(|_, entry| !entry.expired(now, self.ttl));
        let expired = before - guard.len();
        if expired > 0 {
            info!(target: "rehoming.wizard", expired, "wizard_sessions_expired");
        }

        let mut owned: Vec<(Uuid, Instant)> = guard
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(id, entry)| (*id, entry.touched))
            .collect();
        if owned.len() >= self.per_owner {
            owned.sort_by_key(|(_, touched)| *touched);
            let excess = owned.len() + 1 - self.per_owner;
            for (evicted, _) in owned.into_iter().take(excess) {
                guard.remove(&evicted);
                info!(target: "rehoming.wizard", session = %evicted, "wizard_session_evicted");
            }
        }

        info!(target: "rehoming.wizard", session = %id, flow = ?session.flow(), "wizard_session_opened");
        guard.insert(
            id,
            OwnedSession {
                owner,
                touched: now,
                session,
            },
        );
        id
    }

    /// Runs `f` against the session while holding the lock. Never await
    /// inside `f`; split long calls into before/after steps instead.
    pub async fn with_session<R>(
        &self,
        id: Uuid,
        owner: u64,
        f: impl FnOnce(&mut WizardSession) -> R,
    ) -> Result<R, EngineError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let expired = match guard.get_mut(&id) {
            Some(entry) if entry.owner == owner => {
                if !entry.expired(now, self.ttl) {
                    entry.touched = now;
                    return Ok(f(&mut entry.session));
                }
                true
            }
            _ => false,
        };
        if expired {
            guard.remove(&id);
            info!(target: "rehoming.wizard", session = %id, "wizard_session_expired");
        }
        Err(EngineError::NotFound(format!("wizard session {id}")))
    }

    pub async fn remove(&self, id: Uuid, owner: u64) -> Result<(), EngineError> {
        let mut guard = self.inner.lock().await;
        match guard.get(&id) {
            Some(entry) if entry.owner == owner => {
                guard.remove(&id);
                info!(target: "rehoming.wizard", session = %id, "wizard_session_closed");
                Ok(())
            }
            _ => Err(EngineError::NotFound(format!("wizard session {id}"))),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

fn ttl_from_env() -> Duration {
    let secs = std::env::var("SESSION_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(6 * 60 * 60);
    Duration::from_secs(secs)
}

fn per_owner_from_env() -> usize {
    std::env::var("MAX_SESSIONS_PER_CALLER")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5)
}
