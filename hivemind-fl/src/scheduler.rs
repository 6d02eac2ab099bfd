//! Virtual-time timer queue
//!
//! The coordinator's background work (periodic sync, periodic aggregation
//! checks and one-shot round timeouts) is expressed as timers against the
//! injected clock. Whoever drives the coordinator pops the due timers; the
//! tokio task does it on an interval, tests do it after advancing a
//! `ManualClock`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use hivemind_common::ModelType;

/// What a timer does when it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Flush the experience buffer (periodic)
    Sync,
    /// Start rounds for models with queued updates (periodic)
    AggregationCheck,
    /// Hard deadline of one round (one-shot)
    RoundTimeout { model_type: ModelType, round_id: String },
}

#[derive(Debug)]
struct Timer {
    deadline_ms: u64,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the heap pops the earliest deadline, then the earliest scheduled
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timers ordered by deadline, ties in scheduling order
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Timer>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer firing at `deadline_ms`
    pub fn schedule(&mut self, deadline_ms: u64, kind: TimerKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Timer {
            deadline_ms,
            seq,
            kind,
        });
    }

    /// Removes and returns the earliest timer due at `now_ms`
    pub fn pop_due(&mut self, now_ms: u64) -> Option<(u64, TimerKind)> {
        if self.heap.peek()?.deadline_ms > now_ms {
            return None;
        }
        self.heap.pop().map(|t| (t.deadline_ms, t.kind))
    }

    /// Deadline of the earliest timer
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|t| t.deadline_ms)
    }

    /// Disarms every timer
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
