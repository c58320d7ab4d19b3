use std::time::Duration;

use tokio::time::Instant;

use crate::config::CutoverMode;

/// Decides when the open window closes.
///
/// Time is measured on the tokio monotonic clock so tests can pause and
/// advance it. In [`CutoverMode::Timer`] the ingest loop additionally
/// sleeps until [`WindowScheduler::deadline`]; in [`CutoverMode::Flow`] the
/// deadline is only checked when a record arrives, so a quiet exporter can
/// hold a window open well past its period.
#[derive(Debug, Clone)]
pub struct WindowScheduler {
    period: Duration,
    mode: CutoverMode,
    window_start: Instant,
}

impl WindowScheduler {
    pub fn new(period: Duration, mode: CutoverMode, now: Instant) -> Self {
        Self {
            period,
            mode,
            window_start: now,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn mode(&self) -> CutoverMode {
        self.mode
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// When the open window is due to close.
    pub fn deadline(&self) -> Instant {
        self.window_start + self.period
    }

    /// Whether the open window has reached its period.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.period
    }

    /// Whether the ingest loop should wake up on the deadline by itself.
    pub fn uses_timer(&self) -> bool {
        self.mode == CutoverMode::Timer
    }

    /// Starts the next window at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_due_after_period() {
        let start = Instant::now();
        let sched = WindowScheduler::new(Duration::from_secs(60), CutoverMode::Timer, start);

        assert!(!sched.is_due(start));
        assert!(!sched.is_due(start + Duration::from_secs(59)));
        assert!(sched.is_due(start + Duration::from_secs(60)));
        assert!(sched.is_due(start + Duration::from_secs(600)));
        assert_eq!(sched.deadline(), start + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_moves_deadline() {
        let start = Instant::now();
        let mut sched = WindowScheduler::new(Duration::from_secs(10), CutoverMode::Flow, start);

        tokio::time::advance(Duration::from_secs(25)).await;
        let now = Instant::now();
        assert!(sched.is_due(now));

        sched.reset(now);
        assert!(!sched.is_due(now));
        assert_eq!(sched.window_start(), now);
        assert_eq!(sched.deadline(), now + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_before_start_is_not_due() {
        let start = Instant::now() + Duration::from_secs(5);
        let sched = WindowScheduler::new(Duration::from_secs(1), CutoverMode::Timer, start);
        assert!(!sched.is_due(Instant::now()));
    }

    #[test]
    fn test_timer_flag_follows_mode() {
        let now = Instant::now();
        assert!(WindowScheduler::new(Duration::from_secs(1), CutoverMode::Timer, now).uses_timer());
        assert!(!WindowScheduler::new(Duration::from_secs(1), CutoverMode::Flow, now).uses_timer());
    }
}
