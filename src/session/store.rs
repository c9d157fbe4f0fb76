//! Session resolution and lifecycle.
//!
//! The store exclusively owns every live session: token and identity lookup,
//! the secondary field index, and TTL-driven eviction all run under its
//! lock. Sessions are never held under that lock while handlers run; the
//! store hands out `Arc<Session>` clones and the per-session mutex does the
//! serialization.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use super::index::FieldIndex;
use super::{ClientIdentity, Session, SessionCtx, SessionToken};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session capacity reached ({0})")]
    Capacity(usize),
}

/// Result of resolving an upgrade to a session.
pub(crate) struct Resolved {
    pub session: Arc<Session>,
    pub is_new: bool,
    /// Stale sessions displaced during resolution; the caller destroys them
    /// outside the store lock.
    pub expired: Vec<Arc<Session>>,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("is_new", &self.is_new)
            .field("expired_count", &self.expired.len())
            .finish()
    }
}

struct StoreInner {
    by_token: HashMap<SessionToken, Arc<Session>>,
    by_identity: HashMap<ClientIdentity, SessionToken>,
}

pub struct SessionStore {
    inner: RwLock<StoreInner>,
    index: Arc<FieldIndex>,
    ctx: Arc<SessionCtx>,
    max_sessions: usize,
}

impl SessionStore {
    pub(crate) fn new(ctx: Arc<SessionCtx>, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner {
                by_token: HashMap::new(),
                by_identity: HashMap::new(),
            }),
            index: ctx.index.clone(),
            ctx,
            max_sessions,
        })
    }

    /// Resolve an incoming connection to a session: resume by token, else
    /// reuse the identity's live session, else create. Expired sessions
    /// found along the way are unlinked and returned for destruction.
    pub(crate) fn resolve(
        &self,
        client_id: &str,
        device_id: &str,
        token: Option<&str>,
    ) -> Result<Resolved, StoreError> {
        let identity = ClientIdentity {
            client_id: client_id.to_string(),
            device_id: device_id.to_string(),
        };
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut inner = self.inner.write();

        if let Some(raw) = token {
            let key = SessionToken::parse(raw);
            if let Some(session) = inner.by_token.get(&key).cloned() {
                if session.is_evictable(now) {
                    remove_locked(&mut inner, &self.index, &session);
                    expired.push(session);
                } else if *session.identity() == identity {
                    debug!(session = %session.token(), "resumed session via token");
                    return Ok(Resolved {
                        session,
                        is_new: false,
                        expired,
                    });
                }
            }
        }

        if let Some(existing) = inner.by_identity.get(&identity).cloned() {
            if let Some(session) = inner.by_token.get(&existing).cloned() {
                if session.is_evictable(now) {
                    remove_locked(&mut inner, &self.index, &session);
                    expired.push(session);
                } else {
                    debug!(session = %session.token(), "reusing live session for identity");
                    return Ok(Resolved {
                        session,
                        is_new: false,
                        expired,
                    });
                }
            }
        }

        if self.max_sessions > 0 && inner.by_token.len() >= self.max_sessions {
            return Err(StoreError::Capacity(self.max_sessions));
        }
        let session = Session::new(SessionToken::generate(), identity.clone(), self.ctx.clone());
        inner.by_token.insert(session.token().clone(), session.clone());
        inner.by_identity.insert(identity, session.token().clone());
        info!(
            session = %session.token(),
            client = client_id,
            device = device_id,
            "created session"
        );
        Ok(Resolved {
            session,
            is_new: true,
            expired,
        })
    }

    pub fn get(&self, token: &SessionToken) -> Option<Arc<Session>> {
        self.inner.read().by_token.get(token).cloned()
    }

    /// Live sessions whose indexed field `key` equals `value`. Empty when
    /// the key was never indexed or nothing matches.
    pub fn find_by(&self, key: &str, value: &str) -> Vec<Arc<Session>> {
        let tokens = self.index.find(key, value);
        let inner = self.inner.read();
        tokens
            .iter()
            .filter_map(|token| inner.by_token.get(token).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_token.is_empty()
    }

    /// Unlink every session past its idle deadline and return them; the
    /// caller destroys each outside the store lock.
    pub(crate) fn reap(&self, now: Instant) -> Vec<Arc<Session>> {
        let mut inner = self.inner.write();
        let evictable: Vec<Arc<Session>> = inner
            .by_token
            .values()
            .filter(|session| session.is_evictable(now))
            .cloned()
            .collect();
        for session in &evictable {
            remove_locked(&mut inner, &self.index, session);
        }
        if !evictable.is_empty() {
            info!(count = evictable.len(), "evicting idle sessions");
        }
        evictable
    }

    /// Close and unbind a session's connection without deleting it; the
    /// idle-TTL clock starts immediately.
    pub async fn detach(&self, token: &SessionToken) {
        if let Some(session) = self.get(token) {
            session.detach_current().await;
        }
    }

    /// Remove one session from all indexes and destroy its state.
    pub async fn evict(&self, token: &SessionToken) {
        let session = {
            let mut inner = self.inner.write();
            inner.by_token.get(token).cloned().map(|session| {
                remove_locked(&mut inner, &self.index, &session);
                session
            })
        };
        if let Some(session) = session {
            session.evict().await;
        }
    }
}

fn remove_locked(inner: &mut StoreInner, index: &FieldIndex, session: &Arc<Session>) {
    inner.by_token.remove(session.token());
    if inner.by_identity.get(session.identity()) == Some(session.token()) {
        inner.by_identity.remove(session.identity());
    }
    index.remove_session(session.token());
}
