use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub idle_reset_window: Duration,
}

/// Sink health counters. CLOSED until consecutive failures reach the
/// threshold, then OPEN; while OPEN no attempt is made at all, so the idle
/// window is the sole recovery path (a success can only decrement the
/// counter while still CLOSED).
#[derive(Debug, Default)]
pub struct SinkHealth {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl SinkHealth {
    /// Gate called before every persistence attempt. Applies the idle-window
    /// reset first, then answers whether the breaker is CLOSED.
    pub fn allow_attempt(&mut self, now: Instant, settings: &BreakerSettings) -> bool {
        self.maybe_idle_reset(now, settings.idle_reset_window);
        self.consecutive_failures < settings.failure_threshold
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
    }

    /// A success decrements, never resets.
    pub fn record_success(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn maybe_idle_reset(&mut self, now: Instant, idle_reset_window: Duration) {
        if let Some(last_failure_at) = self.last_failure_at
            && now.saturating_duration_since(last_failure_at) >= idle_reset_window
        {
            self.consecutive_failures = 0;
            self.last_failure_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{BreakerSettings, SinkHealth};

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            idle_reset_window: Duration::from_secs(300),
        }
    }

    #[test]
    fn opens_exactly_at_the_failure_threshold() {
        let mut health = SinkHealth::default();
        let now = Instant::now();

        health.record_failure(now);
        health.record_failure(now);
        assert!(health.allow_attempt(now, &settings()));

        health.record_failure(now);
        assert!(!health.allow_attempt(now, &settings()));
    }

    #[test]
    fn success_decrements_but_never_resets() {
        let mut health = SinkHealth::default();
        let now = Instant::now();

        health.record_failure(now);
        health.record_failure(now);
        health.record_success();
        assert_eq!(health.consecutive_failures(), 1);

        health.record_success();
        health.record_success();
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn idle_window_is_the_only_recovery_path_while_open() {
        let mut health = SinkHealth::default();
        let opened_at = Instant::now();
        for _ in 0..3 {
            health.record_failure(opened_at);
        }
        assert!(!health.allow_attempt(opened_at, &settings()));

        // Still open just before the window elapses.
        let almost = opened_at + Duration::from_secs(299);
        assert!(!health.allow_attempt(almost, &settings()));

        // Window elapsed since the last failure: counter resets to zero.
        let later = opened_at + Duration::from_secs(300);
        assert!(health.allow_attempt(later, &settings()));
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn new_failures_restart_the_idle_window() {
        let mut health = SinkHealth::default();
        let start = Instant::now();
        for _ in 0..3 {
            health.record_failure(start);
        }

        let midway = start + Duration::from_secs(200);
        health.record_failure(midway);

        // 300s after the first failures but only 100s after the last one.
        let check = start + Duration::from_secs(300);
        assert!(!health.allow_attempt(check, &settings()));
    }
}
