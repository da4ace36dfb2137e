//! Activation status: "is the bypass actually doing anything?"
//!
//! Derived fresh on every query from the latest metrics and elapsed times;
//! nothing here is stored between calls.

use std::time::Duration;

use serde::Serialize;

use crate::config::Tunables;
use crate::core::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivationStatus {
    Unknown,
    NoTraffic,
    NotActivated,
    Activated,
    EngineDead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationSnapshot {
    pub status: ActivationStatus,
    pub text: String,
    pub details: String,
}

impl ActivationSnapshot {
    fn new(status: ActivationStatus, text: &str, details: impl Into<String>) -> Self {
        Self {
            status,
            text: text.to_string(),
            details: details.into(),
        }
    }

    pub fn bypass_off() -> Self {
        Self::new(ActivationStatus::Unknown, "BYPASS OFF", "bypass off")
    }
}

/// Everything the evaluator looks at, captured by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct ActivationInputs<'a> {
    pub bypass_on: bool,
    pub engine_running: bool,
    /// Time since the last successful apply, if any.
    pub since_activation: Option<Duration>,
    /// Age of the last metrics snapshot, if any.
    pub metrics_age: Option<Duration>,
    pub metrics: Option<&'a MetricsSnapshot>,
}

pub fn evaluate(input: &ActivationInputs<'_>, t: &Tunables) -> ActivationSnapshot {
    use ActivationStatus::*;

    if !input.bypass_on {
        return ActivationSnapshot::bypass_off();
    }
    let past = |window: Duration| input.since_activation.is_some_and(|d| d >= window);

    if !input.engine_running && past(t.engine_grace) {
        return ActivationSnapshot::new(EngineDead, "ENGINE_DEAD", "engine is not running");
    }
    if let Some(age) = input.metrics_age.filter(|age| *age >= t.activation_stale) {
        return ActivationSnapshot::new(
            EngineDead,
            "ENGINE_DEAD",
            format!("no metrics update for {}s", age.as_secs()),
        );
    }
    let Some(m) = input.metrics else {
        return ActivationSnapshot::new(Unknown, "UNKNOWN", "no metrics snapshot yet");
    };

    if m.client_hellos_observed == 0 {
        if past(t.activation_no_traffic) {
            return ActivationSnapshot::new(
                NoTraffic,
                "NO_TRAFFIC",
                "no ClientHello on 443 yet; open an HTTPS site",
            );
        }
        return ActivationSnapshot::new(Unknown, "UNKNOWN", "waiting for TLS traffic");
    }

    if m.has_effect() {
        return ActivationSnapshot::new(
            Activated,
            "ACTIVATED",
            format!(
                "tls_handled={}, fragmented={}, udp443_dropped={}, rst443={}",
                m.tls_handled, m.client_hellos_fragmented, m.udp443_dropped, m.rst_dropped_relevant
            ),
        );
    }
    if past(t.activation_warmup) {
        return ActivationSnapshot::new(
            NotActivated,
            "NOT_ACTIVATED",
            "traffic seen but no strategy has acted on it",
        );
    }
    ActivationSnapshot::new(Unknown, "UNKNOWN", "warming up")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Option<Duration> {
        Some(Duration::from_secs(n))
    }

    fn on<'a>(metrics: Option<&'a MetricsSnapshot>, since: Option<Duration>) -> ActivationInputs<'a> {
        ActivationInputs {
            bypass_on: true,
            engine_running: true,
            since_activation: since,
            metrics_age: secs(1),
            metrics,
        }
    }

    #[test]
    fn test_bypass_off_wins_over_everything() {
        let input = ActivationInputs {
            bypass_on: false,
            engine_running: false,
            since_activation: secs(999),
            metrics_age: secs(999),
            metrics: None,
        };
        let s = evaluate(&input, &Tunables::default());
        assert_eq!(s.status, ActivationStatus::Unknown);
        assert_eq!(s.details, "bypass off");
    }

    #[test]
    fn test_engine_dead_after_grace_or_stale_metrics() {
        let t = Tunables::default();
        let mut input = on(None, secs(20));
        input.engine_running = false;
        assert_eq!(evaluate(&input, &t).status, ActivationStatus::EngineDead);

        // Inside the grace window a stopped engine is not yet dead.
        input.since_activation = secs(3);
        assert_eq!(evaluate(&input, &t).status, ActivationStatus::Unknown);

        let mut stale = on(None, secs(1));
        stale.metrics_age = secs(121);
        assert_eq!(evaluate(&stale, &t).status, ActivationStatus::EngineDead);
    }

    #[test]
    fn test_traffic_ladder() {
        let t = Tunables::default();
        let idle = MetricsSnapshot::default();
        assert_eq!(evaluate(&on(Some(&idle), secs(5)), &t).status, ActivationStatus::Unknown);
        assert_eq!(evaluate(&on(Some(&idle), secs(16)), &t).status, ActivationStatus::NoTraffic);

        let seen = MetricsSnapshot {
            client_hellos_observed: 4,
            ..MetricsSnapshot::default()
        };
        assert_eq!(evaluate(&on(Some(&seen), secs(5)), &t).status, ActivationStatus::Unknown);
        assert_eq!(evaluate(&on(Some(&seen), secs(16)), &t).status, ActivationStatus::NotActivated);

        let acting = MetricsSnapshot {
            client_hellos_fragmented: 1,
            ..seen
        };
        assert_eq!(evaluate(&on(Some(&acting), secs(1)), &t).status, ActivationStatus::Activated);
    }

    #[test]
    fn test_zero_windows_are_explicit() {
        let t = Tunables::from_lookup(|name| {
            (name == "DPIGUARD_ACTIVATION_NO_TRAFFIC_MS").then(|| "0".to_string())
        });
        let idle = MetricsSnapshot::default();
        assert_eq!(evaluate(&on(Some(&idle), secs(0)), &t).status, ActivationStatus::NoTraffic);
    }
}
