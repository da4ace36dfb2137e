//! Destination rewriting for redirect rules.

use std::sync::Arc;

use super::PacketStrategy;
use crate::capture::{send_fresh, Packet, PacketHandle};
use crate::codec::{self, ParsedPacket};
use crate::core::{BypassMetrics, Profile, RedirectRule};

pub struct Redirector {
    profile: Arc<Profile>,
    metrics: Arc<BypassMetrics>,
}

impl Redirector {
    pub fn new(profile: Arc<Profile>, metrics: Arc<BypassMetrics>) -> Self {
        Self { profile, metrics }
    }

    fn matching_rule(&self, parsed: &ParsedPacket) -> Option<&RedirectRule> {
        self.profile
            .enabled_redirects()
            .find(|r| r.protocol == parsed.transport && r.port == parsed.dst_port)
    }
}

impl PacketStrategy for Redirector {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn process(&self, io: &dyn PacketHandle, packet: &Packet, parsed: &ParsedPacket) -> bool {
        let Some(rule) = self.matching_rule(parsed) else {
            return false;
        };
        if !rule.allows(parsed.dst_ip()) {
            return false;
        }
        let mut data = packet.data.clone();
        if !codec::set_destination(&mut data, parsed, rule.redirect_ip, rule.target_port(parsed.dst_port)) {
            return false;
        }
        if !send_fresh(io, packet.derive(data)) {
            return false;
        }
        BypassMetrics::bump(&self.metrics.redirected);
        tracing::trace!("redirect '{}': {} -> {}", rule.name, parsed.dst_ip(), rule.redirect_ip);
        true
    }
}
