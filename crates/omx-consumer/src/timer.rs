//! One-shot deferred-action queue.
//!
//! The engine never invokes a client callback from inside a registration
//! call. Failure notifications (and the synthetic login refresh) are instead
//! parked here and fired from the dispatch cycle after a fixed delay, so the
//! caller always holds the returned handle before any callback runs.
//!
//! Cancellation is a logical flag: canceled entries are discarded lazily
//! when the queue head is next examined, never removed mid-scan.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};

/// Token returned by [`TimerQueue::schedule`], used to cancel the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Deadline-ordered queue of one-shot deferred payloads.
///
/// Ties on the deadline are broken by insertion order. `poll` returns due
/// payloads for the caller to execute — keeping execution outside the queue
/// lets the actions mutate the engine that owns it.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    payloads: AHashMap<u64, T>,
    canceled: AHashSet<u64>,
    next_seq: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            payloads: AHashMap::new(),
            canceled: AHashSet::new(),
            next_seq: 0,
        }
    }

    /// Schedule `payload` to become due `delay` from now.
    pub fn schedule(&mut self, delay: Duration, payload: T) -> TimerToken {
        self.schedule_at(Instant::now() + delay, payload)
    }

    /// Schedule `payload` with an absolute deadline.
    pub fn schedule_at(&mut self, deadline: Instant, payload: T) -> TimerToken {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((deadline, seq)));
        self.payloads.insert(seq, payload);
        TimerToken(seq)
    }

    /// Mark an entry canceled. A canceled entry is skipped at fire time and
    /// physically discarded the next time it reaches the queue head.
    /// Canceling an unknown or already-fired token is a no-op.
    pub fn cancel(&mut self, token: TimerToken) {
        if self.payloads.contains_key(&token.0) {
            self.canceled.insert(token.0);
        }
    }

    /// Pop every due, non-canceled payload in deadline order (ties in
    /// insertion order). The caller executes them.
    pub fn poll(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            let payload = self.payloads.remove(&seq);
            if self.canceled.remove(&seq) {
                continue;
            }
            if let Some(p) = payload {
                due.push(p);
            }
        }
        due
    }

    /// Time until the earliest live entry becomes due; `None` if the queue
    /// holds no live entries. Canceled heads are discarded here.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if self.canceled.remove(&seq) {
                self.heap.pop();
                self.payloads.remove(&seq);
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }
        None
    }

    /// Number of live (non-canceled) entries.
    pub fn len(&self) -> usize {
        self.payloads.len() - self.canceled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
