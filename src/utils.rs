use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

/// Tracks event statistics, with both *all-time* counters and a
/// *sliding 1 s window* rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of events
    pub n_events: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    events: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since `t_begin`, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the last window, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Events in the last window, per second
    pub fn event_rate(&self) -> f64 {
        self.events.len() as f64 / self.window.as_secs_f64().max(1e-6)
    }

    /// Record an event of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();

        self.total_size += size;
        self.n_events += 1;

        self.events.push_back((now, size));
        self.bytes_in_window += size;
        self.evict(now);
    }

    /// Drop window entries older than the window. Called on every
    /// increment; call it directly when idle so the rate decays.
    pub fn evict(&mut self, now: Instant) {
        while let Some(&(ts, sz)) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_events = 0;
        self.t_begin = Instant::now();

        self.events.clear();
        self.bytes_in_window = 0;
    }
}

/// Lock a mutex, taking over the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll `check` every `interval` until it yields a value or `timeout`
/// passes. `check` always runs at least once.
pub fn poll_until<T>(
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(interval);
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_tracks_totals_and_window() {
        let mut counter = Counter::new();
        counter.increment(1024 * 1024);
        counter.increment(1024 * 1024);
        assert_eq!(counter.n_events, 2);
        assert_eq!(counter.total_size, 2 * 1024 * 1024);
        assert!((counter.rate() - 2.0).abs() < 1e-9);
        assert!((counter.event_rate() - 2.0).abs() < 1e-9);

        counter.evict(Instant::now() + Duration::from_secs(2));
        assert_eq!(counter.rate(), 0.0);
        assert_eq!(counter.n_events, 2);

        counter.reset();
        assert_eq!(counter.total_size, 0);
    }

    #[test]
    fn lock_survives_poison() {
        let m = Arc::new(Mutex::new(5));
        let m2 = Arc::clone(&m);
        let _ = thread::spawn(move || {
            let _guard = m2.lock().unwrap();
            panic!("poison it");
        })
        .join();
        assert!(m.is_poisoned());
        *lock(&m) += 1;
        assert_eq!(*lock(&m), 6);
    }

    #[test]
    fn poll_until_times_out_and_succeeds() {
        let mut calls = 0;
        let got = poll_until(Duration::from_millis(50), Duration::from_millis(1), || {
            calls += 1;
            (calls == 3).then_some(calls)
        });
        assert_eq!(got, Some(3));

        let none: Option<()> = poll_until(Duration::ZERO, Duration::from_millis(1), || None);
        assert!(none.is_none());
    }

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 kB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
