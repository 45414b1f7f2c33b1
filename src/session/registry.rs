//! Token-keyed session store
//!
//! Sessions are shared between the event consumer and the periodic jobs, so
//! each one sits behind its own mutex while the map itself takes a read-write
//! lock. Stale sessions are evicted by the sweep job rather than on access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::SearchSession;
use crate::soulseek::SearchToken;

/// Sessions with no in-flight download are dropped after this long.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);

pub type SharedSession = Arc<Mutex<SearchSession>>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SearchToken, SharedSession>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, session: SearchSession) -> SharedSession {
        let token = session.token.clone();
        let shared = Arc::new(Mutex::new(session));
        self.sessions.write().insert(token, shared.clone());
        shared
    }

    pub fn get(&self, token: &SearchToken) -> Option<SharedSession> {
        self.sessions.read().get(token).cloned()
    }

    pub fn remove(&self, token: &SearchToken) -> Option<SharedSession> {
        self.sessions.write().remove(token)
    }

    pub fn contains(&self, token: &SearchToken) -> bool {
        self.sessions.read().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of all live sessions, for tick-driven iteration. Holding the
    /// map lock while locking individual sessions invites deadlock, so
    /// callers iterate over this snapshot instead.
    pub fn snapshot(&self) -> Vec<(SearchToken, SharedSession)> {
        self.sessions
            .read()
            .iter()
            .map(|(t, s)| (t.clone(), s.clone()))
            .collect()
    }

    /// Drop sessions past the TTL that have nothing in flight. Sessions with
    /// an active download are kept regardless of age; the engine's own
    /// ceilings handle runaway downloads.
    pub fn sweep(&self, now: Instant) -> usize {
        let stale: Vec<SearchToken> = self
            .snapshot()
            .into_iter()
            .filter(|(_, shared)| {
                let session = shared.lock();
                now.saturating_duration_since(session.created_at) > self.ttl
                    && !session.has_active_download()
            })
            .map(|(token, _)| token)
            .collect();

        if stale.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write();
        let mut removed = 0;
        for token in stale {
            if sessions.remove(&token).is_some() {
                info!(token = %token, "Evicted stale search session");
                removed += 1;
            }
        }
        removed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}
