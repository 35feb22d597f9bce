// src/ratelimit.rs — Sliding-window rate accounting

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One sliding window: at most `max_requests` admissions inside any
/// interval of `duration`. Stores the admission timestamps themselves, so
/// the bound holds exactly rather than in fixed-bucket approximation.
#[derive(Debug)]
struct RateWindow {
    duration: Duration,
    max_requests: usize,
    hits: VecDeque<Instant>,
}

impl RateWindow {
    fn new(duration: Duration, max_requests: usize) -> Self {
        Self {
            duration,
            max_requests,
            // hits never grows past max_requests
            hits: VecDeque::with_capacity(max_requests),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front) > self.duration {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn admits(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.hits.len() < self.max_requests
    }

    fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
    }

    /// When the oldest admission ages out. `None` while a slot is free.
    fn next_available(&self, now: Instant) -> Option<Instant> {
        if self.hits.len() < self.max_requests {
            return None;
        }
        self.hits.front().map(|&front| {
            let release = front + self.duration;
            release.max(now)
        })
    }
}

/// Composes several windows; admits only when every window admits, and
/// records in all of them or none. A limiter with zero windows admits
/// everything.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Vec<RateWindow>>,
}

impl RateLimiter {
    pub fn new<I>(windows: I) -> Self
    where
        I: IntoIterator<Item = (Duration, usize)>,
    {
        Self {
            windows: Mutex::new(
                windows
                    .into_iter()
                    .map(|(d, n)| RateWindow::new(d, n))
                    .collect(),
            ),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(std::iter::empty())
    }

    /// Would a request be admitted right now? Does not consume.
    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap();
        windows.iter_mut().all(|w| w.admits(now))
    }

    /// Admit-and-record under one critical section. Either every window
    /// records the admission or none does.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap();
        if !windows.iter_mut().all(|w| w.admits(now)) {
            return false;
        }
        for w in windows.iter_mut() {
            w.record(now);
        }
        true
    }

    /// Earliest instant at which every window could admit again. Best-effort
    /// hint for logging; selection never sleeps on it.
    pub fn next_available(&self) -> Option<Instant> {
        self.next_available_at(Instant::now())
    }

    pub fn next_available_at(&self, now: Instant) -> Option<Instant> {
        let mut windows = self.windows.lock().unwrap();
        windows
            .iter_mut()
            .filter_map(|w| {
                w.prune(now);
                w.next_available(now)
            })
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limiter(windows: &[(u64, usize)]) -> RateLimiter {
        RateLimiter::new(
            windows
                .iter()
                .map(|&(secs, n)| (Duration::from_secs(secs), n)),
        )
    }

    #[test]
    fn test_single_window_bound() {
        let l = limiter(&[(10, 2)]);
        let t0 = Instant::now();

        assert!(l.try_acquire_at(t0));
        assert!(l.try_acquire_at(t0 + Duration::from_secs(1)));
        assert!(!l.try_acquire_at(t0 + Duration::from_secs(2)));

        // First hit ages out 10s after t0
        assert!(!l.try_acquire_at(t0 + Duration::from_secs(9)));
        assert!(l.try_acquire_at(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_rate_safety_over_dense_traffic() {
        // Invariant: no 10s interval ever contains more than 3 admissions.
        let l = limiter(&[(10, 3)]);
        let t0 = Instant::now();
        let mut admitted: Vec<Duration> = Vec::new();

        // Request every 500ms for a minute
        for tick in 0..120u64 {
            let at = t0 + Duration::from_millis(tick * 500);
            if l.try_acquire_at(at) {
                admitted.push(Duration::from_millis(tick * 500));
            }
        }

        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t - start <= Duration::from_secs(10))
                .count();
            assert!(in_window <= 3, "window starting at {start:?} held {in_window}");
        }
        // And the limiter was not pathologically stingy
        assert!(admitted.len() >= 15);
    }

    #[test]
    fn test_multi_window_all_must_admit() {
        // Burst window of 2/1s plus a sustained window of 3/60s
        let l = limiter(&[(1, 2), (60, 3)]);
        let t0 = Instant::now();

        assert!(l.try_acquire_at(t0));
        assert!(l.try_acquire_at(t0));
        // Burst window refuses the third within one second
        assert!(!l.try_acquire_at(t0));
        // Burst window has recovered but the sustained window allows one more
        assert!(l.try_acquire_at(t0 + Duration::from_secs(2)));
        assert!(!l.try_acquire_at(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn test_refused_acquire_records_nowhere() {
        let l = limiter(&[(1, 1), (60, 3)]);
        let t0 = Instant::now();

        assert!(l.try_acquire_at(t0));
        // Refused by the burst window; must not consume the 60s window
        for _ in 0..10 {
            assert!(!l.try_acquire_at(t0));
        }

        // The sustained window still holds a single hit: two more spaced
        // acquisitions succeed, then it refuses on its own count of 3.
        assert!(l.try_acquire_at(t0 + Duration::from_secs(2)));
        assert!(l.try_acquire_at(t0 + Duration::from_secs(4)));
        assert!(!l.try_acquire_at(t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_check_does_not_consume() {
        let l = limiter(&[(10, 1)]);
        let t0 = Instant::now();

        assert!(l.check_at(t0));
        assert!(l.check_at(t0));
        assert!(l.try_acquire_at(t0));
        assert!(!l.check_at(t0));
    }

    #[test]
    fn test_next_available_hint() {
        let l = limiter(&[(10, 1), (60, 2)]);
        let t0 = Instant::now();

        assert_eq!(l.next_available_at(t0), None);
        assert!(l.try_acquire_at(t0));
        // 10s window is full; frees when the hit ages out
        assert_eq!(l.next_available_at(t0), Some(t0 + Duration::from_secs(10)));

        assert!(l.try_acquire_at(t0 + Duration::from_secs(11)));
        // Now the 60s window is also full; the max across windows wins
        assert_eq!(
            l.next_available_at(t0 + Duration::from_secs(12)),
            Some(t0 + Duration::from_secs(60))
        );
    }

    #[test]
    fn test_unlimited_always_admits() {
        let l = RateLimiter::unlimited();
        let t0 = Instant::now();
        for _ in 0..1000 {
            assert!(l.try_acquire_at(t0));
        }
        assert_eq!(l.next_available_at(t0), None);
    }
}
