//! Secondary index over user-declared session fields.
//!
//! Maps (key, value) to the set of live session tokens whose indexed field
//! matches, plus a reverse map so a session's entries can be dropped in one
//! call at eviction. A key participates only when a session stored it with
//! `indexed = true`.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::SessionToken;

#[derive(Default)]
struct IndexInner {
    /// key -> value -> tokens
    forward: HashMap<String, HashMap<String, HashSet<SessionToken>>>,
    /// token -> key -> value currently indexed
    reverse: HashMap<SessionToken, HashMap<String, String>>,
}

#[derive(Default)]
pub struct FieldIndex {
    inner: RwLock<IndexInner>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `token` under (key, value), replacing any previous value the
    /// session had for that key.
    pub fn add(&self, token: &SessionToken, key: &str, value: &str) {
        let mut inner = self.inner.write();
        remove_entry(&mut inner, token, key);
        inner
            .forward
            .entry(key.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .insert(token.clone());
        inner
            .reverse
            .entry(token.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, token: &SessionToken, key: &str) {
        let mut inner = self.inner.write();
        remove_entry(&mut inner, token, key);
    }

    /// Drop every entry for a session.
    pub fn remove_session(&self, token: &SessionToken) {
        let mut inner = self.inner.write();
        let Some(keys) = inner.reverse.remove(token) else {
            return;
        };
        for (key, value) in keys {
            prune_forward(&mut inner.forward, token, &key, &value);
        }
    }

    pub fn find(&self, key: &str, value: &str) -> Vec<SessionToken> {
        let inner = self.inner.read();
        inner
            .forward
            .get(key)
            .and_then(|values| values.get(value))
            .map(|tokens| tokens.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn remove_entry(inner: &mut IndexInner, token: &SessionToken, key: &str) {
    let previous = inner
        .reverse
        .get_mut(token)
        .and_then(|keys| keys.remove(key));
    if let Some(value) = previous {
        prune_forward(&mut inner.forward, token, key, &value);
    }
}

fn prune_forward(
    forward: &mut HashMap<String, HashMap<String, HashSet<SessionToken>>>,
    token: &SessionToken,
    key: &str,
    value: &str,
) {
    if let Some(values) = forward.get_mut(key) {
        if let Some(tokens) = values.get_mut(value) {
            tokens.remove(token);
            if tokens.is_empty() {
                values.remove(value);
            }
        }
        if values.is_empty() {
            forward.remove(key);
        }
    }
}
