//! Outbound ClientHello gate in front of the mutation pipeline.

use std::sync::Arc;

use super::mutation::{self, MutationContext, MutationStrategy, Outcome};
use super::PacketStrategy;
use crate::capture::{send_fresh, Packet, PacketHandle};
use crate::codec::{self, tls, ParsedPacket};
use crate::core::{BypassMetrics, ConnTracker, ConnectionKey, ProbeFlows, Profile};

pub struct TlsMutator {
    profile: Arc<Profile>,
    metrics: Arc<BypassMetrics>,
    conntrack: Arc<ConnTracker>,
    probes: Arc<ProbeFlows>,
    pipeline: Option<Box<dyn MutationStrategy>>,
}

impl TlsMutator {
    pub fn new(
        profile: Arc<Profile>,
        metrics: Arc<BypassMetrics>,
        conntrack: Arc<ConnTracker>,
        probes: Arc<ProbeFlows>,
    ) -> Self {
        let pipeline = mutation::build(profile.tls_strategy);
        Self {
            profile,
            metrics,
            conntrack,
            probes,
            pipeline,
        }
    }

    /// Copy of the ClientHello with a short TTL, sent ahead of the real one.
    fn send_ttl_decoy(&self, io: &dyn PacketHandle, packet: &Packet, parsed: &ParsedPacket, ttl: u8, count: bool) {
        let mut data = packet.data.clone();
        if !codec::set_ttl(&mut data, parsed.version, ttl) {
            return;
        }
        if send_fresh(io, packet.derive(data)) && count {
            BypassMetrics::bump(&self.metrics.fakes_sent);
        }
    }
}

impl PacketStrategy for TlsMutator {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn process(&self, io: &dyn PacketHandle, packet: &Packet, parsed: &ParsedPacket) -> bool {
        if !parsed.is_tcp() || parsed.payload_len == 0 {
            return false;
        }
        let payload = parsed.payload(&packet.data);
        if !tls::is_client_hello(payload) {
            return false;
        }
        let key = ConnectionKey::of(parsed);
        let count = !self.probes.contains(&key);
        let m = &self.metrics;

        if parsed.dst_port != self.profile.target_port {
            if count {
                BypassMetrics::bump(&m.client_hellos_non443);
            }
            return false;
        }
        if count {
            BypassMetrics::bump(&m.client_hellos_observed);
        }
        if payload.len() < self.profile.fragment_threshold {
            if count {
                BypassMetrics::bump(&m.client_hellos_short);
            }
            return false;
        }
        if tls::find_sni(payload).is_none() && count {
            BypassMetrics::bump(&m.client_hellos_no_sni);
        }

        let is_first = self.conntrack.mark_seen(key);
        if is_first {
            if let Some(ttl) = self.profile.ttl_trick {
                self.send_ttl_decoy(io, packet, parsed, ttl, count);
            }
        }

        let Some(pipeline) = &self.pipeline else {
            return false;
        };
        let ctx = MutationContext {
            io,
            packet,
            parsed,
            profile: &self.profile,
            metrics: m,
            is_first,
            count,
        };
        match pipeline.process(&ctx) {
            Outcome::Consumed => {
                if count {
                    BypassMetrics::bump(&m.client_hellos_fragmented);
                    BypassMetrics::bump(&m.tls_handled);
                }
                tracing::debug!(
                    "ClientHello mutated ({}) for {}:{}",
                    self.profile.tls_strategy.as_str(),
                    parsed.dst_ip(),
                    parsed.dst_port
                );
                true
            }
            Outcome::Injected => {
                if count {
                    BypassMetrics::bump(&m.tls_handled);
                }
                false
            }
            Outcome::Untouched => false,
        }
    }
}
