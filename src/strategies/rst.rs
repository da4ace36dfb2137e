//! TCP RST suppression.
//!
//! Every RST reaching this strategy is dropped. Non-RST packets (the filter
//! also diverts inbound SYN-ACKs) teach a per-peer TTL baseline; an RST whose
//! TTL strays from it was most likely injected by a middlebox. Baselines
//! expire after [`config::RST_BASELINE_TTL_SECS`] and the table never holds
//! more than [`config::RST_BASELINE_CAP`] peers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::PacketStrategy;
use crate::capture::{Packet, PacketHandle};
use crate::codec::ParsedPacket;
use crate::config;
use crate::core::BypassMetrics;

pub struct RstSuppressor {
    metrics: Arc<BypassMetrics>,
    /// Peer address -> (TTL, last seen).
    baselines: DashMap<u128, (u8, Instant)>,
}

impl RstSuppressor {
    pub fn new(metrics: Arc<BypassMetrics>) -> Self {
        Self {
            metrics,
            baselines: DashMap::new(),
        }
    }

    pub fn baseline(&self, peer: u128) -> Option<u8> {
        let (ttl, seen) = *self.baselines.get(&peer)?;
        (seen.elapsed() < baseline_ttl()).then_some(ttl)
    }

    pub fn baseline_count(&self) -> usize {
        self.baselines.len()
    }

    fn learn(&self, peer: u128, ttl: u8, now: Instant) {
        if self.baselines.len() >= config::RST_BASELINE_CAP && !self.baselines.contains_key(&peer) {
            self.baselines
                .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < baseline_ttl());
            if self.baselines.len() >= config::RST_BASELINE_CAP {
                let stalest = self
                    .baselines
                    .iter()
                    .min_by_key(|e| e.value().1)
                    .map(|e| *e.key());
                if let Some(stalest) = stalest {
                    self.baselines.remove(&stalest);
                }
            }
        }
        self.baselines.insert(peer, (ttl, now));
    }
}

fn baseline_ttl() -> Duration {
    Duration::from_secs(config::RST_BASELINE_TTL_SECS)
}

impl PacketStrategy for RstSuppressor {
    fn name(&self) -> &'static str {
        "rst"
    }

    fn process(&self, _io: &dyn PacketHandle, _packet: &Packet, parsed: &ParsedPacket) -> bool {
        if !parsed.is_tcp() {
            return false;
        }
        if !parsed.is_rst() {
            self.learn(parsed.src_addr, parsed.ttl, Instant::now());
            return false;
        }

        BypassMetrics::bump(&self.metrics.rst_dropped);
        if parsed.src_port == config::TLS_PORT {
            BypassMetrics::bump(&self.metrics.rst_dropped_relevant);
        }
        let suspicious = self
            .baseline(parsed.src_addr)
            .is_some_and(|base| base.abs_diff(parsed.ttl) > config::RST_TTL_TOLERANCE);
        if suspicious {
            BypassMetrics::bump(&self.metrics.rst_suspicious);
        }
        tracing::debug!(
            "RST dropped from {}:{} ttl={} suspicious={suspicious}",
            parsed.src_ip(),
            parsed.src_port,
            parsed.ttl
        );
        true
    }
}
