//! Per-connection dedup state and probe-flow registry.
//!
//! `ConnTracker` answers "is this the first ClientHello of this flow" so that
//! one-shot strategies (fake, TTL decoy, HTTP split) fire at most once per
//! connection. Entries expire after an idle period and are swept periodically.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::codec::{ip_to_addr, ParsedPacket};
use crate::config;

/// Directional 4-tuple identifying one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub src_addr: u128,
    pub dst_addr: u128,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ConnectionKey {
    pub fn of(p: &ParsedPacket) -> Self {
        Self {
            src_addr: p.src_addr,
            dst_addr: p.dst_addr,
            src_port: p.src_port,
            dst_port: p.dst_port,
        }
    }

    pub fn from_sockets(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            src_addr: ip_to_addr(local.ip()),
            dst_addr: ip_to_addr(remote.ip()),
            src_port: local.port(),
            dst_port: remote.port(),
        }
    }
}

/// Thread-safe first-packet tracker. Keyed by connection, value is last-seen time.
#[derive(Debug, Default)]
pub struct ConnTracker {
    seen: DashMap<ConnectionKey, Instant>,
    http_split: DashMap<ConnectionKey, Instant>,
}

impl ConnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Touch `key`; returns true if it was not tracked yet.
    pub fn mark_seen(&self, key: ConnectionKey) -> bool {
        mark(&self.seen, key, Instant::now())
    }

    /// Like `mark_seen`, for the once-per-connection HTTP Host split.
    pub fn mark_http_split(&self, key: ConnectionKey) -> bool {
        mark(&self.http_split, key, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.seen.len() + self.http_split.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries idle for longer than `ttl` as of `now`. Returns how many were removed.
    pub fn sweep(&self, ttl: Duration, now: Instant) -> usize {
        let before = self.len();
        let fresh = |_: &ConnectionKey, last: &mut Instant| now.saturating_duration_since(*last) <= ttl;
        self.seen.retain(fresh);
        self.http_split.retain(fresh);
        before - self.len()
    }

    pub fn clear(&self) {
        self.seen.clear();
        self.http_split.clear();
    }

    /// Periodic idle sweep on the tokio runtime. Aborted by the engine on disable.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        let ttl = Duration::from_secs(config::CONNECTION_IDLE_TTL_SECS);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config::CONNECTION_SWEEP_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = tracker.sweep(ttl, Instant::now());
                if removed > 0 {
                    tracing::debug!("Connection tracker swept {removed} idle entries");
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn mark_at(&self, key: ConnectionKey, at: Instant) -> bool {
        mark(&self.seen, key, at)
    }
}

fn mark(map: &DashMap<ConnectionKey, Instant>, key: ConnectionKey, now: Instant) -> bool {
    let mut first = false;
    map.entry(key)
        .and_modify(|last| *last = now)
        .or_insert_with(|| {
            first = true;
            now
        });
    first
}

/// Flows opened by the outcome probe. Their packets are still mutated but
/// kept out of user-facing counters.
#[derive(Debug, Default)]
pub struct ProbeFlows {
    flows: DashMap<ConnectionKey, Instant>,
}

impl ProbeFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: ConnectionKey) {
        let ttl = Duration::from_millis(config::PROBE_FLOW_TTL_MS);
        self.register_until(key, Instant::now() + ttl);
    }

    fn register_until(&self, key: ConnectionKey, expires: Instant) {
        if self.flows.len() > config::PROBE_FLOW_SWEEP_THRESHOLD {
            let now = Instant::now();
            self.flows.retain(|_, exp| *exp > now);
        }
        self.flows.insert(key, expires);
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        match self.flows.get(key) {
            Some(exp) if *exp > Instant::now() => true,
            Some(_) => {
                self.flows.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> ConnectionKey {
        ConnectionKey {
            src_addr: 1,
            dst_addr: 2,
            src_port: port,
            dst_port: 443,
        }
    }

    #[test]
    fn test_mark_seen_is_true_once() {
        let t = ConnTracker::new();
        assert!(t.mark_seen(key(1)));
        assert!(!t.mark_seen(key(1)));
        assert!(t.mark_seen(key(2)));
        assert!(t.mark_http_split(key(1)));
        assert!(!t.mark_http_split(key(1)));
    }

    #[test]
    fn test_sweep_evicts_idle_entries() {
        let t = ConnTracker::new();
        let start = Instant::now();
        t.mark_at(key(1), start);
        t.mark_at(key(2), start + Duration::from_secs(200));

        let removed = t.sweep(Duration::from_secs(300), start + Duration::from_secs(301));
        assert_eq!(removed, 1);
        // The evicted flow counts as new again.
        assert!(t.mark_seen(key(1)));
        assert!(!t.mark_seen(key(2)));

        t.clear();
        assert!(t.is_empty());
    }

    #[test]
    fn test_probe_flow_expiry() {
        let flows = ProbeFlows::new();
        flows.register(key(9));
        assert!(flows.contains(&key(9)));
        assert!(!flows.contains(&key(8)));

        flows.register_until(key(7), Instant::now());
        assert!(!flows.contains(&key(7)));
        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn test_probe_flows_sweep_lazily_past_threshold() {
        let flows = ProbeFlows::new();
        let past = Instant::now();
        for port in 0..=config::PROBE_FLOW_SWEEP_THRESHOLD as u16 {
            flows.register_until(key(port), past);
        }
        flows.register(key(5000));
        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn test_key_from_sockets_matches_packet_orientation() {
        let local: SocketAddr = "192.168.1.10:50000".parse().unwrap();
        let remote: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let k = ConnectionKey::from_sockets(local, remote);
        assert_eq!(k.src_port, 50000);
        assert_eq!(k.dst_port, 443);
        assert_eq!(k.dst_addr, u32::from_be_bytes([93, 184, 216, 34]) as u128);
    }
}
