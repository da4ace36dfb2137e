//! Lock-free bypass counters and the traffic-light verdict.
//!
//! Loops increment counters with `Relaxed` ordering while the metrics-pull task
//! reads them; a snapshot is not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;

/// Counters written by the interception loops.
#[derive(Debug, Default)]
pub struct BypassMetrics {
    pub packets_processed: AtomicU64,
    pub rst_dropped: AtomicU64,
    /// RSTs from a TLS server port.
    pub rst_dropped_relevant: AtomicU64,
    /// RSTs whose TTL disagrees with the peer's learned baseline.
    pub rst_suspicious: AtomicU64,
    pub client_hellos_observed: AtomicU64,
    pub client_hellos_short: AtomicU64,
    pub client_hellos_non443: AtomicU64,
    pub client_hellos_no_sni: AtomicU64,
    pub client_hellos_fragmented: AtomicU64,
    pub tls_handled: AtomicU64,
    pub fakes_sent: AtomicU64,
    pub udp443_dropped: AtomicU64,
    pub redirected: AtomicU64,
    last_split_offset: AtomicUsize,
    last_split_segments: AtomicUsize,
    since: Mutex<Option<SystemTime>>,
}

impl BypassMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Remember the last split: first cut offset and number of segments.
    pub fn record_plan(&self, first_offset: usize, segments: usize) {
        self.last_split_offset.store(first_offset, Ordering::Relaxed);
        self.last_split_segments.store(segments, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for c in self.counters() {
            c.store(0, Ordering::Relaxed);
        }
        self.last_split_offset.store(0, Ordering::Relaxed);
        self.last_split_segments.store(0, Ordering::Relaxed);
        if let Ok(mut since) = self.since.lock() {
            *since = Some(SystemTime::now());
        }
    }

    fn counters(&self) -> [&AtomicU64; 13] {
        [
            &self.packets_processed,
            &self.rst_dropped,
            &self.rst_dropped_relevant,
            &self.rst_suspicious,
            &self.client_hellos_observed,
            &self.client_hellos_short,
            &self.client_hellos_non443,
            &self.client_hellos_no_sni,
            &self.client_hellos_fragmented,
            &self.tls_handled,
            &self.fakes_sent,
            &self.udp443_dropped,
            &self.redirected,
        ]
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let segments = self.last_split_segments.load(Ordering::Relaxed);
        let last_fragment_plan = if segments == 0 {
            "-".to_string()
        } else {
            format!(
                "{segments} segments @ {}",
                self.last_split_offset.load(Ordering::Relaxed)
            )
        };
        MetricsSnapshot {
            packets_processed: load(&self.packets_processed),
            rst_dropped: load(&self.rst_dropped),
            rst_dropped_relevant: load(&self.rst_dropped_relevant),
            rst_suspicious: load(&self.rst_suspicious),
            client_hellos_observed: load(&self.client_hellos_observed),
            client_hellos_short: load(&self.client_hellos_short),
            client_hellos_non443: load(&self.client_hellos_non443),
            client_hellos_no_sni: load(&self.client_hellos_no_sni),
            client_hellos_fragmented: load(&self.client_hellos_fragmented),
            tls_handled: load(&self.tls_handled),
            fakes_sent: load(&self.fakes_sent),
            udp443_dropped: load(&self.udp443_dropped),
            redirected: load(&self.redirected),
            last_fragment_plan,
            since: self.since.lock().ok().and_then(|s| *s),
            captured_at: SystemTime::now(),
        }
    }
}

/// Point-in-time copy of [`BypassMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub packets_processed: u64,
    pub rst_dropped: u64,
    pub rst_dropped_relevant: u64,
    pub rst_suspicious: u64,
    pub client_hellos_observed: u64,
    pub client_hellos_short: u64,
    pub client_hellos_non443: u64,
    pub client_hellos_no_sni: u64,
    pub client_hellos_fragmented: u64,
    pub tls_handled: u64,
    pub fakes_sent: u64,
    pub udp443_dropped: u64,
    pub redirected: u64,
    pub last_fragment_plan: String,
    pub since: Option<SystemTime>,
    pub captured_at: SystemTime,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            packets_processed: 0,
            rst_dropped: 0,
            rst_dropped_relevant: 0,
            rst_suspicious: 0,
            client_hellos_observed: 0,
            client_hellos_short: 0,
            client_hellos_non443: 0,
            client_hellos_no_sni: 0,
            client_hellos_fragmented: 0,
            tls_handled: 0,
            fakes_sent: 0,
            udp443_dropped: 0,
            redirected: 0,
            last_fragment_plan: "-".to_string(),
            since: None,
            captured_at: SystemTime::UNIX_EPOCH,
        }
    }
}

impl MetricsSnapshot {
    /// Any counter proving a strategy acted on relevant traffic.
    pub fn has_effect(&self) -> bool {
        self.tls_handled > 0
            || self.client_hellos_fragmented > 0
            || self.udp443_dropped > 0
            || self.rst_dropped_relevant > 0
            || self.rst_dropped > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerdictColor {
    Gray,
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub color: VerdictColor,
    pub text: String,
    pub reason: String,
}

impl Verdict {
    fn new(color: VerdictColor, text: &str, reason: String) -> Self {
        Self {
            color,
            text: text.to_string(),
            reason,
        }
    }

    pub fn inactive() -> Self {
        Self::new(VerdictColor::Gray, "bypass off", "no active filter".into())
    }
}

/// Classify how well the bypass is doing from one snapshot.
pub fn verdict(m: &MetricsSnapshot, threshold: usize, strategy: &str) -> Verdict {
    let fragments_raw = m.client_hellos_fragmented;
    // `client_hellos_observed` only counts hellos to the target port.
    let observed_443 = m.client_hellos_observed;

    if fragments_raw == 0 && observed_443 == 0 && m.client_hellos_non443 == 0 {
        return Verdict::new(
            VerdictColor::Gray,
            "no TLS on 443",
            "no ClientHello observed; open an HTTPS site and retry".into(),
        );
    }
    if observed_443 == 0 && m.client_hellos_non443 > 0 {
        return Verdict::new(
            VerdictColor::Gray,
            "TLS is not on 443",
            "bypass only acts on port 443; check proxy or VPN settings".into(),
        );
    }
    if fragments_raw == 0 && m.client_hellos_short > 0 && observed_443 > 0 {
        return Verdict::new(
            VerdictColor::Yellow,
            "ClientHello below threshold",
            format!("payload < threshold ({threshold}); lower it or pick the aggressive preset"),
        );
    }
    if fragments_raw == 0 {
        return Verdict::new(
            VerdictColor::Red,
            "bypass active but not applied",
            format!("strategy: {strategy}; enable Fragment/Disorder or change preset"),
        );
    }
    if fragments_raw < 10 {
        return Verdict::new(
            VerdictColor::Gray,
            "not enough TLS data",
            "fewer than 10 fragmentations so far".into(),
        );
    }

    let rst_effective = m.rst_dropped_relevant.saturating_sub(5);
    let ratio = rst_effective as f64 / fragments_raw as f64;
    if ratio > 4.0 {
        Verdict::new(
            VerdictColor::Red,
            "bypass not helping: many RSTs",
            format!("ratio={ratio:.2} > 4"),
        )
    } else if ratio > 1.5 {
        Verdict::new(
            VerdictColor::Yellow,
            "bypass partially working",
            format!("ratio={ratio:.2} > 1.5"),
        )
    } else {
        Verdict::new(
            VerdictColor::Green,
            "bypass working",
            format!("ratio={ratio:.2}"),
        )
    }
}
