//! Deadline queue for sleeps and per-operation timeouts.
//!
//! An ordered set keyed by `(deadline, insertion sequence)`: earliest
//! deadline first, ties resolved in insertion order. Deadlines are
//! monotonic [`Instant`]s. Insert returns a [`TimerKey`] that cancels the
//! entry in O(log n).

use std::collections::BTreeMap;
use std::time::Instant;

use crate::completion::CompletionId;

/// Cancellation token for one timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    at: Instant,
    seq: u64,
}

/// Pending deadlines ordered by expiry time.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerKey, CompletionId>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Arms a deadline for the given completion.
    pub(crate) fn insert(&mut self, at: Instant, id: CompletionId) -> TimerKey {
        let key = TimerKey {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, id);
        key
    }

    /// Disarms a previously inserted entry. Returns false if it already
    /// fired or was cancelled.
    pub(crate) fn cancel(&mut self, key: &TimerKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Returns the earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(key, _)| key.at)
    }

    /// Pops the earliest entry whose deadline is at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(TimerKey, CompletionId)> {
        let (key, _) = self.entries.first_key_value()?;
        if key.at > now {
            return None;
        }
        self.entries.pop_first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(n: u32) -> CompletionId {
        CompletionId::from_u64(u64::from(n))
    }

    #[test]
    fn earliest_deadline_wins() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.insert(now + Duration::from_millis(200), id(1));
        timers.insert(now + Duration::from_millis(100), id(2));
        timers.insert(now + Duration::from_millis(150), id(3));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(100)));
        let (_, first) = timers.pop_due(now + Duration::from_millis(300)).unwrap();
        assert_eq!(first, id(2));
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let at = Instant::now() + Duration::from_millis(10);
        let mut timers = TimerQueue::new();
        timers.insert(at, id(1));
        timers.insert(at, id(2));

        let (_, a) = timers.pop_due(at).unwrap();
        let (_, b) = timers.pop_due(at).unwrap();
        assert_eq!(a, id(1));
        assert_eq!(b, id(2));
    }

    #[test]
    fn nothing_fires_before_its_deadline() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.insert(now + Duration::from_secs(60), id(1));
        assert!(timers.pop_due(now).is_none());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn cancel_disarms_exactly_once() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let key = timers.insert(now, id(1));
        assert!(timers.cancel(&key));
        assert!(!timers.cancel(&key));
        assert!(timers.pop_due(now).is_none());
    }
}
