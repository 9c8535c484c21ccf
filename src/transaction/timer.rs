use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Mutex,
    time::{Duration, Instant},
};

struct WheelInner<T> {
    /// min-heap on (fire time, token); ties pop in arming order
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    /// payloads of timers that are still armed; cancellation removes the
    /// payload and leaves a tombstone in the heap for `poll` to skip
    live: HashMap<u64, T>,
    next_token: u64,
}

/// A polled timer service. The endpoint's timer loop calls `poll(now)`
/// on an interval and fans the due values out; `timeout` returns a token
/// that cancels the timer.
///
/// Cancellation is lazy: the heap entry stays behind and is discarded
/// when its fire time comes up, so cancel is a map removal and never
/// restructures the heap.
pub struct TimerWheel<T> {
    inner: Mutex<WheelInner<T>>,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        TimerWheel {
            inner: Mutex::new(WheelInner {
                queue: BinaryHeap::new(),
                live: HashMap::new(),
                next_token: 1,
            }),
        }
    }

    /// Armed timers, not counting cancelled tombstones.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, fire_at: Instant, value: T) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.queue.push(Reverse((fire_at, token)));
        inner.live.insert(token, value);
        token
    }

    pub fn cancel(&self, token: u64) -> Option<T> {
        self.inner.lock().unwrap().live.remove(&token)
    }

    /// Drain everything due at `now`, in fire-time order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        while let Some(Reverse((fire_at, token))) = inner.queue.peek().copied() {
            if fire_at > now {
                break;
            }
            inner.queue.pop();
            if let Some(value) = inner.live.remove(&token) {
                due.push(value);
            }
        }
        due
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_and_poll() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.timeout_at(now, "first");
        wheel.timeout_at(now + Duration::from_millis(900), "second");

        let due = wheel.poll(now + Duration::from_millis(100));
        assert_eq!(due, vec!["first"]);
        assert_eq!(wheel.len(), 1);

        let due = wheel.poll(now + Duration::from_secs(1));
        assert_eq!(due, vec!["second"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_cancel_leaves_no_live_timer() {
        let wheel = TimerWheel::new();
        let token = wheel.timeout(Duration::from_secs(30), "doomed");
        assert_eq!(wheel.cancel(token), Some("doomed"));
        assert_eq!(wheel.cancel(token), None);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_cancelled_tombstone_never_fires() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        let token = wheel.timeout_at(now, "cancelled");
        wheel.timeout_at(now, "kept");
        wheel.cancel(token);

        let due = wheel.poll(now + Duration::from_millis(1));
        assert_eq!(due, vec!["kept"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_same_instant_fires_in_arming_order() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.timeout_at(now, 1);
        wheel.timeout_at(now, 2);
        let due = wheel.poll(now);
        assert_eq!(due, vec![1, 2]);
    }

    #[test]
    fn test_rearmed_token_is_fresh() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        let first = wheel.timeout_at(now, "a");
        wheel.poll(now);
        let second = wheel.timeout_at(now, "b");
        assert_ne!(first, second, "tokens are never reused");
        // the fired token no longer cancels anything
        assert_eq!(wheel.cancel(first), None);
        assert_eq!(wheel.cancel(second), Some("b"));
    }
}
