//! QUIC (UDP/443) blackholing.

use std::sync::Arc;

use super::PacketStrategy;
use crate::capture::{Packet, PacketHandle};
use crate::codec::ParsedPacket;
use crate::config;
use crate::core::{BypassMetrics, Profile};

pub struct Udp443Dropper {
    profile: Arc<Profile>,
    metrics: Arc<BypassMetrics>,
}

impl Udp443Dropper {
    pub fn new(profile: Arc<Profile>, metrics: Arc<BypassMetrics>) -> Self {
        Self { profile, metrics }
    }

    fn should_drop(&self, parsed: &ParsedPacket) -> bool {
        if self.profile.drop_udp443_global {
            return true;
        }
        match parsed.dst_ipv4() {
            Some(dst) => self.profile.udp443_targets.binary_search(&dst).is_ok(),
            // Selective mode only tracks IPv4 targets; drop IPv6 QUIC outright.
            None => true,
        }
    }
}

impl PacketStrategy for Udp443Dropper {
    fn name(&self) -> &'static str {
        "udp443"
    }

    fn process(&self, _io: &dyn PacketHandle, _packet: &Packet, parsed: &ParsedPacket) -> bool {
        if !self.profile.drop_udp443 || !parsed.is_udp() || parsed.dst_port != config::TLS_PORT {
            return false;
        }
        if !self.should_drop(parsed) {
            return false;
        }
        BypassMetrics::bump(&self.metrics.udp443_dropped);
        tracing::trace!("UDP/443 dropped to {}", parsed.dst_ip());
        true
    }
}
