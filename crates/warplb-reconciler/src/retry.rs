//! Retry queue with exponential backoff.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use warplb_statedb::{Object, Revision};

/// Exponential backoff bounded by `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): `min` doubled per
    /// earlier attempt, capped at `max`.
    pub fn duration(&self, attempt: u32) -> Duration {
        let mut delay = self.min;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }
}

/// What to redo when a retry becomes due.
pub(crate) enum RetryOp<T> {
    /// Re-run `update` if the row is still at `revision`.
    Update { revision: Revision },
    /// Re-run `delete` for a row that is gone from the table.
    Delete { object: Object<T> },
}

pub(crate) struct RetryEntry<T> {
    pub(crate) op: RetryOp<T>,
    pub(crate) attempts: u32,
    pub(crate) retry_at: Instant,
}

/// Failed objects keyed by primary key. At most one entry per key; a newer
/// failure replaces the older one.
pub(crate) struct RetryQueue<K, T> {
    backoff: Backoff,
    entries: BTreeMap<K, RetryEntry<T>>,
}

impl<K: Ord + Clone, T> RetryQueue<K, T> {
    pub(crate) fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            entries: BTreeMap::new(),
        }
    }

    /// Delay before attempt number `attempts`.
    pub(crate) fn delay(&self, attempts: u32) -> Duration {
        self.backoff.duration(attempts)
    }

    /// Schedule attempt number `attempts` for `key` and return its delay.
    pub(crate) fn schedule(&mut self, key: K, op: RetryOp<T>, attempts: u32, now: Instant) -> Duration {
        let delay = self.delay(attempts);
        self.entries.insert(
            key,
            RetryEntry {
                op,
                attempts,
                retry_at: now + delay,
            },
        );
        delay
    }

    pub(crate) fn clear(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub(crate) fn attempts(&self, key: &K) -> u32 {
        self.entries.get(key).map_or(0, |e| e.attempts)
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(K, RetryEntry<T>)> {
        let due: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.retry_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut taken: Vec<(K, RetryEntry<T>)> = due
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e)))
            .collect();
        taken.sort_by_key(|(_, e)| e.retry_at);
        taken
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.retry_at).min()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff {
            min: Duration::from_millis(10),
            max: Duration::from_millis(100),
        }
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let b = backoff();
        assert_eq!(b.duration(1), Duration::from_millis(10));
        assert_eq!(b.duration(2), Duration::from_millis(20));
        assert_eq!(b.duration(4), Duration::from_millis(80));
        assert_eq!(b.duration(5), Duration::from_millis(100));
        assert_eq!(b.duration(1000), Duration::from_millis(100));
    }

    #[test]
    fn repeated_failures_count_attempts() {
        let mut queue: RetryQueue<u32, ()> = RetryQueue::new(backoff());
        let now = Instant::now();

        assert_eq!(queue.schedule(1, RetryOp::Update { revision: 5 }, 1, now), Duration::from_millis(10));
        assert_eq!(queue.schedule(1, RetryOp::Update { revision: 6 }, 2, now), Duration::from_millis(20));
        assert_eq!(queue.attempts(&1), 2);
        assert_eq!(queue.len(), 1);

        queue.clear(&1);
        assert_eq!(queue.attempts(&1), 0);
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn take_due_leaves_future_entries() {
        let mut queue: RetryQueue<u32, ()> = RetryQueue::new(backoff());
        let now = Instant::now();
        queue.schedule(1, RetryOp::Update { revision: 1 }, 1, now);
        queue.schedule(2, RetryOp::Update { revision: 3 }, 2, now);

        let due = queue.take_due(now + Duration::from_millis(15));
        let keys: Vec<u32> = due.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(20)));
    }
}
