//! Time-related functionality useful for reactors.
use ferrite_net::time::{LocalDuration, LocalTime};

/// Manages timers and triggers timeouts.
pub struct TimeoutManager<K> {
    timeouts: Vec<(K, LocalTime)>,
}

impl<K> TimeoutManager<K> {
    /// Create a new timeout manager.
    pub fn new() -> Self {
        Self { timeouts: vec![] }
    }

    /// Return the number of timeouts being tracked.
    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    /// Check whether there are timeouts being tracked.
    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }

    /// Register a new timeout with an associated key and wake-up time.
    pub fn register(&mut self, key: K, time: LocalTime) {
        self.timeouts.push((key, time));
        self.timeouts.sort_unstable_by(|(_, a), (_, b)| b.cmp(a));
    }

    /// Get the minimum time duration we should wait for at least one timeout
    /// to be reached. Returns `None` if there are no timeouts.
    pub fn next(&self, now: LocalTime) -> Option<LocalDuration> {
        self.timeouts.last().map(|(_, t)| {
            if *t >= now {
                *t - now
            } else {
                LocalDuration::from_secs(0)
            }
        })
    }

    /// Given the current time, populate the input vector with the keys that
    /// have timed out.
    pub fn wake(&mut self, now: LocalTime, woken: &mut Vec<K>) {
        woken.clear();

        while let Some((k, t)) = self.timeouts.pop() {
            if now >= t {
                woken.push(k);
            } else {
                self.timeouts.push((k, t));
                break;
            }
        }
    }
}

impl<K> Default for TimeoutManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_in_order() {
        let mut tm = TimeoutManager::new();
        let now = LocalTime::from_secs(100_000);

        tm.register(0xA, now + LocalDuration::from_millis(8));
        tm.register(0xB, now + LocalDuration::from_millis(16));
        tm.register(0xC, now + LocalDuration::from_millis(64));
        tm.register(0xD, now + LocalDuration::from_millis(72));

        let mut timeouts = Vec::new();

        tm.wake(now, &mut timeouts);
        assert_eq!(timeouts, vec![]);
        assert_eq!(tm.len(), 4);

        tm.wake(now + LocalDuration::from_millis(9), &mut timeouts);
        assert_eq!(timeouts, vec![0xA]);
        assert_eq!(tm.len(), 3, "one timeout has expired");

        tm.wake(now + LocalDuration::from_millis(66), &mut timeouts);
        assert_eq!(timeouts, vec![0xB, 0xC]);
        assert_eq!(tm.len(), 1, "another two timeouts have expired");

        tm.wake(now + LocalDuration::from_millis(96), &mut timeouts);
        assert_eq!(timeouts, vec![0xD]);
        assert!(tm.is_empty(), "all timeouts have expired");
    }

    #[test]
    fn test_next_deadline() {
        let mut tm = TimeoutManager::new();
        let now = LocalTime::from_secs(100_000);

        assert!(tm.next(now).is_none());

        tm.register(0xA, now + LocalDuration::from_millis(16));
        tm.register(0xB, now + LocalDuration::from_millis(8));

        assert_eq!(tm.next(now), Some(LocalDuration::from_millis(8)));
        assert_eq!(
            tm.next(now + LocalDuration::from_millis(12)),
            Some(LocalDuration::from_secs(0)),
            "overdue timers don't make us wait"
        );
    }
}
