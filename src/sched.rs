//! Process-global retry scheduler.
//!
//! One scheduler drives every timer in the server: QoS1 retransmissions,
//! QoS2 stage retries, and the periodic session TTL sweep. Deadlines live in
//! a binary min-heap (O(log N) insert and extract); cancellation is by
//! handle via a tombstone set so ACK paths never touch the heap. Fired tasks
//! are forwarded over a channel and re-enter the owning session's serialized
//! unit in the server's dispatch loop.

use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

use crate::core::time::Clock;
use crate::session::SessionToken;

/// Work item delivered when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTask {
    /// Retransmit a QoS1 outbox entry.
    Qos1Retry { token: SessionToken, frame_id: u64 },
    /// Drive the current stage of a QoS2 outbound transaction.
    Qos2OutboundRetry { token: SessionToken, frame_id: u64 },
    /// Drive the current stage of a QoS2 inbound transaction.
    Qos2InboundRetry { token: SessionToken, frame_id: u64 },
    /// Periodic session TTL sweep.
    Sweep,
}

/// Opaque cancellation handle returned by [`RetryScheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimerEntry {
    fire_at: Instant,
    handle: u64,
    task: TimerTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the std max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

struct SchedulerInner {
    heap: BinaryHeap<TimerEntry>,
    cancelled: HashSet<u64>,
}

/// Shared timer queue. `schedule` and `cancel` are callable from any task.
pub struct RetryScheduler {
    inner: Mutex<SchedulerInner>,
    notify: Notify,
    tx: mpsc::UnboundedSender<TimerTask>,
    next_handle: AtomicU64,
}

impl RetryScheduler {
    /// Create the scheduler and the receiving end of its fire channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimerTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            inner: Mutex::new(SchedulerInner {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
            }),
            notify: Notify::new(),
            tx,
            next_handle: AtomicU64::new(1),
        });
        (scheduler, rx)
    }

    pub fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.inner.lock();
            guard.heap.push(TimerEntry {
                fire_at: Instant::now() + delay,
                handle,
                task,
            });
        }
        self.notify.notify_one();
        TimerHandle(handle)
    }

    /// Cancel a pending timer. Cancelling an already-fired handle is a no-op.
    pub fn cancel(&self, handle: TimerHandle) {
        let mut guard = self.inner.lock();
        guard.cancelled.insert(handle.0);
    }

    /// Timers currently queued (fired and cancelled entries excluded lazily).
    pub fn pending(&self) -> usize {
        let guard = self.inner.lock();
        guard.heap.len().saturating_sub(guard.cancelled.len())
    }

    /// Timer loop: sleeps until the earliest deadline, pops everything due,
    /// and forwards the tasks. Runs until the owning server aborts it.
    pub async fn run<C: Clock>(self: Arc<Self>, clock: C) {
        loop {
            let next_deadline = {
                let guard = self.inner.lock();
                guard.heap.peek().map(|entry| entry.fire_at)
            };
            match next_deadline {
                None => self.notify.notified().await,
                Some(deadline) => {
                    let now = clock.now();
                    if deadline > now {
                        tokio::select! {
                            () = self.notify.notified() => continue,
                            () = clock.sleep(deadline - now) => {}
                        }
                    }
                    self.drain_due(clock.now());
                }
            }
        }
    }

    fn drain_due(&self, now: Instant) {
        loop {
            let fired = {
                let mut guard = self.inner.lock();
                let due = guard.heap.peek().is_some_and(|entry| entry.fire_at <= now);
                if !due {
                    break;
                }
                if let Some(entry) = guard.heap.pop() {
                    if guard.cancelled.remove(&entry.handle) {
                        None
                    } else {
                        Some(entry.task)
                    }
                } else {
                    None
                }
            };
            if let Some(task) = fired {
                if self.tx.send(task).is_err() {
                    // Receiver gone: server shutting down.
                    break;
                }
            }
        }
    }
}

/// Placeholder handle for unit tests that never drive the scheduler.
#[cfg(test)]
pub(crate) fn tests_handle() -> TimerHandle {
    TimerHandle(0)
}
