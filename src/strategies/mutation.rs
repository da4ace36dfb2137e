//! ClientHello mutations: fake, split (fragment / disorder) and their composites.

use crate::capture::{send_fresh, send_logged, Packet, PacketHandle};
use crate::codec::{self, tls, ParsedPacket};
use crate::config;
use crate::core::{BypassMetrics, Profile, TlsStrategy};

/// What a mutation did with the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// Nothing sent.
    Untouched,
    /// Extra packets sent; the original must still go out.
    Injected,
    /// The original was replaced by sent segments and must be dropped.
    Consumed,
}

pub struct MutationContext<'a> {
    pub io: &'a dyn PacketHandle,
    pub packet: &'a Packet,
    pub parsed: &'a ParsedPacket,
    pub profile: &'a Profile,
    pub metrics: &'a BypassMetrics,
    /// First ClientHello seen on this connection.
    pub is_first: bool,
    /// False for outcome-probe flows.
    pub count: bool,
}

pub trait MutationStrategy: Send + Sync {
    fn process(&self, ctx: &MutationContext<'_>) -> Outcome;
}

/// Mutation pipeline for a TLS strategy; `None` for [`TlsStrategy::None`].
pub fn build(kind: TlsStrategy) -> Option<Box<dyn MutationStrategy>> {
    let split = |reverse| Box::new(Split { reverse }) as Box<dyn MutationStrategy>;
    match kind {
        TlsStrategy::None => None,
        TlsStrategy::Fake => Some(Box::new(Fake)),
        TlsStrategy::Fragment => Some(split(false)),
        TlsStrategy::Disorder => Some(split(true)),
        TlsStrategy::FakeFragment => Some(Box::new(Composite(vec![Box::new(Fake), split(false)]))),
        TlsStrategy::FakeDisorder => Some(Box::new(Composite(vec![Box::new(Fake), split(true)]))),
    }
}

/// Decoy ClientHello with a rewound sequence number and a short TTL, once per connection.
pub struct Fake;

impl MutationStrategy for Fake {
    fn process(&self, ctx: &MutationContext<'_>) -> Outcome {
        if !ctx.is_first {
            return Outcome::Untouched;
        }
        let ip = ctx.parsed.ip_header_len;
        let mut data = ctx.packet.data.clone();
        if !codec::sub_tcp_seq(&mut data, ip, config::FAKE_SEQ_OFFSET)
            || !codec::set_ttl(&mut data, ctx.parsed.version, ctx.profile.fake_ttl)
        {
            return Outcome::Untouched;
        }
        let mut fake = ctx.packet.derive(data);
        ctx.io.calc_checksums(&mut fake);
        if ctx.profile.bad_checksum {
            codec::invert_tcp_checksum(&mut fake.data, ip);
        }
        if !send_logged(ctx.io, &fake) {
            return Outcome::Untouched;
        }
        if ctx.count {
            BypassMetrics::bump(&ctx.metrics.fakes_sent);
        }
        tracing::trace!("fake sent: ttl={}, bad_checksum={}", ctx.profile.fake_ttl, ctx.profile.bad_checksum);
        Outcome::Injected
    }
}

/// Split the payload into segments and send them in order, or reversed for disorder.
pub struct Split {
    pub reverse: bool,
}

impl MutationStrategy for Split {
    fn process(&self, ctx: &MutationContext<'_>) -> Outcome {
        let payload = ctx.parsed.payload(&ctx.packet.data);
        let Some(plan) = split_plan(payload, ctx.profile) else {
            return Outcome::Untouched;
        };
        let mut segments = Vec::with_capacity(plan.len());
        for slice in &plan {
            match codec::build_segment(&ctx.packet.data, ctx.parsed, slice.offset, slice.len) {
                Some(seg) => segments.push(seg),
                None => return Outcome::Untouched,
            }
        }
        if self.reverse {
            segments.reverse();
        }
        for seg in segments {
            send_fresh(ctx.io, ctx.packet.derive(seg));
        }
        if ctx.count {
            ctx.metrics.record_plan(plan[0].len, plan.len());
        }
        Outcome::Consumed
    }
}

/// Runs every member in order; the strongest outcome wins.
pub struct Composite(pub Vec<Box<dyn MutationStrategy>>);

impl MutationStrategy for Composite {
    fn process(&self, ctx: &MutationContext<'_>) -> Outcome {
        self.0
            .iter()
            .map(|m| m.process(ctx))
            .fold(Outcome::Untouched, Outcome::max)
    }
}

/// One payload slice; `offset` is also the sequence delta from the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub offset: usize,
    pub len: usize,
}

/// Cut plan for a ClientHello payload, or `None` if it cannot be split in two.
///
/// Several configured sizes produce size-based chunks plus a remainder. A single
/// size cuts once, in the middle of the SNI hostname when it can be located,
/// otherwise at `max(64, size)` capped to `len - 1`.
pub fn split_plan(payload: &[u8], profile: &Profile) -> Option<Vec<Slice>> {
    let len = payload.len();
    if len < 2 {
        return None;
    }
    if profile.fragment_sizes.len() > 1 {
        return sized_plan(len, &profile.fragment_sizes);
    }
    let cut = tls::sni_split_offset(payload).unwrap_or_else(|| {
        profile
            .first_fragment_size()
            .max(config::DEFAULT_FIRST_FRAGMENT_SIZE)
            .min(len - 1)
    });
    if cut == 0 || cut >= len {
        return None;
    }
    Some(vec![
        Slice { offset: 0, len: cut },
        Slice {
            offset: cut,
            len: len - cut,
        },
    ])
}

fn sized_plan(len: usize, sizes: &[usize]) -> Option<Vec<Slice>> {
    let mut plan = Vec::with_capacity(sizes.len() + 1);
    let mut consumed = 0;
    for &size in sizes.iter().filter(|&&s| s > 0) {
        if len - consumed <= size {
            break;
        }
        plan.push(Slice {
            offset: consumed,
            len: size,
        });
        consumed += size;
    }
    if consumed == 0 || consumed >= len {
        return None;
    }
    plan.push(Slice {
        offset: consumed,
        len: len - consumed,
    });
    Some(plan)
}
