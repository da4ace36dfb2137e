//! Watchdog decisions: force-disable a bypass whose engine died or went silent.

use std::time::{Duration, Instant};

pub const REASON_WATCHDOG_TIMEOUT: &str = "watchdog_timeout";
pub const REASON_ENGINE_DEAD: &str = "engine_dead";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogDecision {
    /// Bypass is off; nothing to watch.
    Idle,
    Healthy,
    /// Engine not running, still inside the grace period.
    Waiting,
    Disable(&'static str),
}

/// State carried between ticks.
#[derive(Debug, Default)]
pub struct Watchdog {
    not_running_since: Option<Instant>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// One tick. `last_metrics_event` is the last heartbeat while bypass was on.
    pub fn tick(
        &mut self,
        bypass_on: bool,
        engine_running: bool,
        last_metrics_event: Option<Instant>,
        now: Instant,
        stale: Duration,
        grace: Duration,
    ) -> WatchdogDecision {
        if !bypass_on {
            self.not_running_since = None;
            return WatchdogDecision::Idle;
        }
        if last_metrics_event.is_some_and(|at| now.saturating_duration_since(at) > stale) {
            return WatchdogDecision::Disable(REASON_WATCHDOG_TIMEOUT);
        }
        if engine_running {
            self.not_running_since = None;
            return WatchdogDecision::Healthy;
        }
        match self.not_running_since {
            None => {
                self.not_running_since = Some(now);
                WatchdogDecision::Waiting
            }
            Some(since) if now.saturating_duration_since(since) > grace => {
                self.not_running_since = None;
                WatchdogDecision::Disable(REASON_ENGINE_DEAD)
            }
            Some(_) => WatchdogDecision::Waiting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(120);
    const GRACE: Duration = Duration::from_secs(15);

    #[test]
    fn test_stale_heartbeat_disables() {
        let mut w = Watchdog::new();
        let now = Instant::now();
        let old = now - Duration::from_secs(121);
        assert_eq!(
            w.tick(true, true, Some(old), now, STALE, GRACE),
            WatchdogDecision::Disable(REASON_WATCHDOG_TIMEOUT)
        );
        let fresh = now - Duration::from_secs(10);
        assert_eq!(w.tick(true, true, Some(fresh), now, STALE, GRACE), WatchdogDecision::Healthy);
    }

    #[test]
    fn test_stopped_engine_gets_a_grace_period() {
        let mut w = Watchdog::new();
        let t0 = Instant::now();
        assert_eq!(w.tick(true, false, None, t0, STALE, GRACE), WatchdogDecision::Waiting);
        assert_eq!(
            w.tick(true, false, None, t0 + Duration::from_secs(10), STALE, GRACE),
            WatchdogDecision::Waiting
        );
        assert_eq!(
            w.tick(true, false, None, t0 + Duration::from_secs(16), STALE, GRACE),
            WatchdogDecision::Disable(REASON_ENGINE_DEAD)
        );
    }

    #[test]
    fn test_recovery_and_off_reset_grace_tracking() {
        let mut w = Watchdog::new();
        let t0 = Instant::now();
        w.tick(true, false, None, t0, STALE, GRACE);
        assert_eq!(
            w.tick(true, true, None, t0 + Duration::from_secs(5), STALE, GRACE),
            WatchdogDecision::Healthy
        );
        // Grace restarts after the engine came back.
        assert_eq!(
            w.tick(true, false, None, t0 + Duration::from_secs(20), STALE, GRACE),
            WatchdogDecision::Waiting
        );
        assert_eq!(w.tick(false, false, None, t0 + Duration::from_secs(60), STALE, GRACE), WatchdogDecision::Idle);
        assert_eq!(
            w.tick(true, false, None, t0 + Duration::from_secs(61), STALE, GRACE),
            WatchdogDecision::Waiting
        );
    }
}
