//! Per-packet bypass strategies.
//!
//! A loop runs its strategy list in order on every parsed packet. A strategy
//! returns `true` ("handled") when it has taken responsibility for the
//! original packet: dropped it or replaced it with packets it sent itself.
//! The loop re-injects the original only if no strategy handled it.
//!
//! - [`TlsMutator`]: ClientHello gating, TTL decoy and the [`mutation`] pipeline
//! - [`RstSuppressor`]: drops TCP RSTs and scores them against a TTL baseline
//! - [`Udp443Dropper`]: blackholes QUIC so clients fall back to TCP/TLS
//! - [`HttpHostSplitter`]: splits plain-HTTP requests inside the `Host` header
//! - [`Redirector`]: rewrites destinations for redirect rules

pub mod http;
pub mod mutation;
pub mod redirect;
pub mod rst;
pub mod tls;
pub mod udp;

pub use http::HttpHostSplitter;
pub use redirect::Redirector;
pub use rst::RstSuppressor;
pub use tls::TlsMutator;
pub use udp::Udp443Dropper;

use crate::capture::{Packet, PacketHandle};
use crate::codec::ParsedPacket;

pub trait PacketStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns true if the original packet must not be re-injected.
    fn process(&self, io: &dyn PacketHandle, packet: &Packet, parsed: &ParsedPacket) -> bool;
}
