//! Plain-HTTP Host header split.

use std::sync::Arc;

use super::PacketStrategy;
use crate::capture::{send_fresh, Packet, PacketHandle};
use crate::codec::{self, tls, ParsedPacket};
use crate::config;
use crate::core::{BypassMetrics, ConnTracker, ConnectionKey};

/// Splits the first request carrying a `Host:` header into two segments,
/// with the cut after "Ho". Once per connection.
pub struct HttpHostSplitter {
    metrics: Arc<BypassMetrics>,
    conntrack: Arc<ConnTracker>,
}

impl HttpHostSplitter {
    pub fn new(metrics: Arc<BypassMetrics>, conntrack: Arc<ConnTracker>) -> Self {
        Self { metrics, conntrack }
    }
}

impl PacketStrategy for HttpHostSplitter {
    fn name(&self) -> &'static str {
        "http_host"
    }

    fn process(&self, io: &dyn PacketHandle, packet: &Packet, parsed: &ParsedPacket) -> bool {
        if !parsed.is_tcp() || parsed.dst_port != config::HTTP_PORT || parsed.payload_len == 0 {
            return false;
        }
        let payload = parsed.payload(&packet.data);
        let Some(host_at) = tls::find_http_host(payload) else {
            return false;
        };
        let split = host_at + 2;
        if split >= payload.len() {
            return false;
        }
        if !self.conntrack.mark_http_split(ConnectionKey::of(parsed)) {
            return false;
        }
        let (Some(head), Some(tail)) = (
            codec::build_segment(&packet.data, parsed, 0, split),
            codec::build_segment(&packet.data, parsed, split, payload.len() - split),
        ) else {
            return false;
        };
        send_fresh(io, packet.derive(head));
        send_fresh(io, packet.derive(tail));
        BypassMetrics::bump(&self.metrics.tls_handled);
        tracing::debug!("HTTP Host split at {split} for {}", parsed.dst_ip());
        true
    }
}
