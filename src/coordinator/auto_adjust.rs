//! Feedback loops that retune options from live metrics.
//!
//! Both tuners are driven by the metrics tick, return at most one proposed
//! change per call, and stop proposing once their session is done. A proposal
//! is only a proposal: the coordinator re-applies it through its gate.

use std::time::{Duration, Instant};

use crate::config;
use crate::core::{MetricsSnapshot, TlsOptions, Verdict, VerdictColor};

/// Shrinks the Aggressive preset's smallest chunk when the DPI fights back.
#[derive(Debug, Default)]
pub struct AggressiveTuner {
    adjusted_down: bool,
    adjusted_up: bool,
    green_since: Option<Instant>,
}

impl AggressiveTuner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_adjust(&mut self, options: &TlsOptions, m: &MetricsSnapshot, verdict: &Verdict) -> Option<Vec<i64>> {
        self.try_adjust_at(options, m, verdict, Instant::now())
    }

    pub(crate) fn try_adjust_at(
        &mut self,
        options: &TlsOptions,
        m: &MetricsSnapshot,
        verdict: &Verdict,
        now: Instant,
    ) -> Option<Vec<i64>> {
        if !options.auto_adjust_aggressive || !options.is_aggressive_preset() {
            *self = Self::default();
            return None;
        }
        let min_size = config::MIN_FRAGMENT_SIZE as i64;
        let fragments = m.client_hellos_fragmented;

        // Early RST storm: drop the smallest chunk straight to the floor.
        if !self.adjusted_down
            && (5..=20).contains(&fragments)
            && m.rst_dropped_relevant > 2 * fragments
        {
            let mut sizes = floored(&options.fragment_sizes);
            let idx = index_of_min(&sizes)?;
            sizes[idx] = min_size;
            self.adjusted_down = true;
            tracing::info!("Aggressive auto-adjust: early RSTs, min chunk -> {min_size}");
            return Some(sizes);
        }

        if verdict.color == VerdictColor::Green {
            self.green_since.get_or_insert(now);
        } else {
            self.green_since = None;
        }

        let streak = Duration::from_secs(config::AGGRESSIVE_GREEN_STREAK_SECS);
        let green_long = self
            .green_since
            .is_some_and(|since| now.saturating_duration_since(since) > streak);
        if green_long && !self.adjusted_up {
            let mut sizes = floored(&options.fragment_sizes);
            let idx = index_of_min(&sizes)?;
            let shrunk = (sizes[idx] - 4).max(min_size);
            if shrunk < sizes[idx] {
                sizes[idx] = shrunk;
                self.adjusted_up = true;
                tracing::info!("Aggressive auto-adjust: stable green, min chunk -> {shrunk}");
                return Some(sizes);
            }
        }
        None
    }
}

fn floored(sizes: &[i64]) -> Vec<i64> {
    sizes
        .iter()
        .map(|&v| v.max(config::MIN_FRAGMENT_SIZE as i64))
        .collect()
}

fn index_of_min(sizes: &[i64]) -> Option<usize> {
    let min = *sizes.iter().min()?;
    sizes.iter().position(|&v| v == min)
}

/// Trials a few TTL-trick values and settles on the one with the fewest suspicious RSTs.
#[derive(Debug, Default)]
pub struct AutoTtlTuner {
    candidates: Option<Vec<i64>>,
    index: usize,
    trial_since: Option<Instant>,
    best_ratio: Option<f64>,
    best_ttl: i64,
    completed: bool,
}

impl AutoTtlTuner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn try_adjust(&mut self, options: &TlsOptions, m: &MetricsSnapshot) -> Option<TlsOptions> {
        self.try_adjust_at(options, m, Instant::now())
    }

    pub(crate) fn try_adjust_at(&mut self, options: &TlsOptions, m: &MetricsSnapshot, now: Instant) -> Option<TlsOptions> {
        if !options.ttl_trick_enabled || !options.auto_ttl_enabled {
            *self = Self::default();
            return None;
        }
        if self.completed || m.client_hellos_observed < config::AUTO_TTL_MIN_OBSERVED {
            return None;
        }

        let current = options.ttl_trick_value;
        let candidates = match &self.candidates {
            Some(c) => c.clone(),
            None => {
                let c = build_candidates(current);
                self.candidates = Some(c.clone());
                self.index = 0;
                self.trial_since = Some(now);
                self.best_ttl = current;
                self.best_ratio = None;
                tracing::info!("Auto-TTL: starting trials with {:?}", c);
                if c[0] != current {
                    return Some(with_ttl(options, c[0]));
                }
                c
            }
        };

        let age = self
            .trial_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        let enough_data = m.client_hellos_fragmented >= 5 || m.tls_handled >= 3;
        if !enough_data && age < Duration::from_secs(config::AUTO_TTL_TRIAL_SECS) {
            return None;
        }

        if m.client_hellos_fragmented > 0 {
            let ratio = score(m);
            if self.best_ratio.map_or(true, |best| ratio < best) {
                self.best_ratio = Some(ratio);
                self.best_ttl = current;
            }
        }

        self.index += 1;
        if let Some(&next) = candidates.get(self.index) {
            self.trial_since = Some(now);
            tracing::info!(
                "Auto-TTL: trying TTL={next} (best so far {} at {:.2})",
                self.best_ttl,
                self.best_ratio.unwrap_or(f64::INFINITY)
            );
            return Some(with_ttl(options, next));
        }

        self.completed = true;
        tracing::info!("Auto-TTL: done, best TTL={}", self.best_ttl);
        (self.best_ttl != current).then(|| with_ttl(options, self.best_ttl))
    }
}

/// Lower is better.
pub fn score(m: &MetricsSnapshot) -> f64 {
    let fragments = m.client_hellos_fragmented.max(1) as f64;
    (m.rst_suspicious as f64 + 1.0) / (fragments + 1.0)
}

fn build_candidates(current: i64) -> Vec<i64> {
    let mut out = vec![current.clamp(1, 255)];
    for v in config::AUTO_TTL_CANDIDATES {
        let v = v as i64;
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

fn with_ttl(options: &TlsOptions, ttl: i64) -> TlsOptions {
    TlsOptions {
        ttl_trick_value: ttl,
        ..options.clone()
    }
}
