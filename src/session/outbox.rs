//! QoS1 outbox: in-flight outbound DATA frames awaiting ACK.
//!
//! Entries keep the fully encoded frame so retransmissions are
//! byte-identical. Iteration order is the order `send` was called, which is
//! what attach-time replay walks. The map is keyed by exact frame id and
//! makes no monotonicity assumption, so counter wrap-around is harmless.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::sched::TimerHandle;

#[derive(Debug)]
pub(crate) struct OutboxEntry {
    /// Encoded DATA frame, retransmitted verbatim.
    pub frame: Bytes,
    /// Retransmissions performed so far.
    pub attempts: u32,
    /// Pending retry timer.
    pub timer: TimerHandle,
    pub created_at: Instant,
}

#[derive(Debug)]
pub(crate) struct Outbox {
    entries: HashMap<u64, OutboxEntry>,
    order: VecDeque<u64>,
    limit: usize,
}

impl Outbox {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    pub fn is_full(&self) -> bool {
        self.limit > 0 && self.entries.len() >= self.limit
    }

    pub fn insert(&mut self, id: u64, entry: OutboxEntry) {
        if self.entries.insert(id, entry).is_none() {
            self.order.push_back(id);
        }
    }

    /// Remove an entry on ACK (or purge). Returns it so the caller can
    /// cancel the retry timer.
    pub fn remove(&mut self, id: u64) -> Option<OutboxEntry> {
        let entry = self.entries.remove(&id);
        if entry.is_some() {
            self.order.retain(|&queued| queued != id);
        }
        entry
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut OutboxEntry> {
        self.entries.get_mut(&id)
    }

    /// Frame ids in original send order, for replay.
    pub fn ids_in_order(&self) -> Vec<u64> {
        self.order.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything, yielding the timers that must be cancelled.
    pub fn drain_timers(&mut self) -> Vec<TimerHandle> {
        self.order.clear();
        self.entries
            .drain()
            .map(|(_, entry)| entry.timer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> OutboxEntry {
        OutboxEntry {
            frame: Bytes::from_static(b"frame"),
            attempts: 0,
            timer: crate::sched::tests_handle(),
            created_at: Instant::now(),
        }
    }

    #[test]
    fn test_order_preserved() {
        let mut outbox = Outbox::new(0);
        outbox.insert(5, entry());
        outbox.insert(2, entry());
        outbox.insert(9, entry());
        assert_eq!(outbox.ids_in_order(), vec![5, 2, 9]);

        outbox.remove(2);
        assert_eq!(outbox.ids_in_order(), vec![5, 9]);
    }

    #[test]
    fn test_capacity() {
        let mut outbox = Outbox::new(2);
        outbox.insert(1, entry());
        assert!(!outbox.is_full());
        outbox.insert(2, entry());
        assert!(outbox.is_full());
        outbox.remove(1);
        assert!(!outbox.is_full());
    }

    #[test]
    fn test_unbounded_when_limit_zero() {
        let mut outbox = Outbox::new(0);
        for id in 0..128 {
            outbox.insert(id, entry());
        }
        assert!(!outbox.is_full());
        assert_eq!(outbox.len(), 128);
    }

    #[test]
    fn test_drain_timers_empties() {
        let mut outbox = Outbox::new(0);
        outbox.insert(1, entry());
        outbox.insert(2, entry());
        let timers = outbox.drain_timers();
        assert_eq!(timers.len(), 2);
        assert!(outbox.is_empty());
        assert!(outbox.ids_in_order().is_empty());
    }
}
