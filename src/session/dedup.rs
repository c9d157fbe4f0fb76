//! Inbound frame-id deduplication.
//!
//! Tracks the non-zero frame ids a session has already accepted so client
//! retransmissions execute the handler once. By default entries live for the
//! whole session; an optional age window bounds retention.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct DedupFilter {
    seen: HashSet<u64>,
    arrivals: VecDeque<(u64, Instant)>,
    window: Option<Duration>,
}

impl DedupFilter {
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            seen: HashSet::new(),
            arrivals: VecDeque::new(),
            window,
        }
    }

    /// Record an id. Returns false when the id was already present, i.e. the
    /// frame is a duplicate.
    pub fn insert(&mut self, id: u64, now: Instant) -> bool {
        self.prune(now);
        let fresh = self.seen.insert(id);
        if fresh {
            self.arrivals.push_back((id, now));
        }
        fresh
    }

    /// Drop entries older than the configured window. No-op when the filter
    /// retains for the session lifetime.
    pub fn prune(&mut self, now: Instant) {
        let Some(window) = self.window else { return };
        while let Some(&(id, seen_at)) = self.arrivals.front() {
            if now.duration_since(seen_at) <= window {
                break;
            }
            self.arrivals.pop_front();
            self.seen.remove(&id);
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.arrivals.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
