//! Immutable engine configuration for one apply cycle.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::codec::Transport;
use crate::config;

/// How outbound ClientHellos are rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsStrategy {
    #[default]
    None,
    Fragment,
    Fake,
    FakeFragment,
    Disorder,
    FakeDisorder,
}

impl TlsStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fragment => "fragment",
            Self::Fake => "fake",
            Self::FakeFragment => "fake_fragment",
            Self::Disorder => "disorder",
            Self::FakeDisorder => "fake_disorder",
        }
    }

    pub fn sends_fake(self) -> bool {
        matches!(self, Self::Fake | Self::FakeFragment | Self::FakeDisorder)
    }

    pub fn splits(self) -> bool {
        !matches!(self, Self::None | Self::Fake)
    }

    /// Whether split segments go out last-first.
    pub fn reverses(self) -> bool {
        matches!(self, Self::Disorder | Self::FakeDisorder)
    }
}

/// Destination override for matching outbound flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub name: String,
    pub protocol: Transport,
    pub port: u16,
    pub redirect_ip: IpAddr,
    /// 0 keeps the original destination port.
    #[serde(default)]
    pub redirect_port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional destination allow-list, by hostname.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Addresses `hosts` resolved to when the engine was enabled.
    #[serde(skip)]
    pub resolved: Vec<IpAddr>,
}

fn default_true() -> bool {
    true
}

impl RedirectRule {
    pub fn target_port(&self, original: u16) -> u16 {
        if self.redirect_port == 0 {
            original
        } else {
            self.redirect_port
        }
    }

    /// A rule with an allow-list only applies to the resolved destinations.
    pub fn allows(&self, dst: IpAddr) -> bool {
        self.hosts.is_empty() || self.resolved.contains(&dst)
    }
}

/// Everything the engine needs to build filters and run strategies.
/// Built fresh on every apply and shared read-only with the loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub tls_strategy: TlsStrategy,
    /// Ordered chunk sizes, each at least `MIN_FRAGMENT_SIZE`.
    pub fragment_sizes: Vec<usize>,
    /// Minimum ClientHello payload length worth mutating.
    pub fragment_threshold: usize,
    pub fake_ttl: u8,
    pub bad_checksum: bool,
    pub target_port: u16,
    /// `None` applies to every flow on `target_port`.
    pub target: Option<IpAddr>,
    pub ttl_trick: Option<u8>,
    pub drop_rst: bool,
    pub drop_udp443: bool,
    pub drop_udp443_global: bool,
    /// Sorted selective UDP/443 destinations.
    pub udp443_targets: Vec<Ipv4Addr>,
    pub http_host_tricks: bool,
    pub redirect_rules: Vec<RedirectRule>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            tls_strategy: TlsStrategy::None,
            fragment_sizes: vec![config::DEFAULT_FIRST_FRAGMENT_SIZE],
            fragment_threshold: config::DEFAULT_FRAGMENT_THRESHOLD,
            fake_ttl: config::DEFAULT_FAKE_TTL,
            bad_checksum: false,
            target_port: config::TLS_PORT,
            target: None,
            ttl_trick: None,
            drop_rst: false,
            drop_udp443: false,
            drop_udp443_global: false,
            udp443_targets: Vec::new(),
            http_host_tricks: false,
            redirect_rules: Vec::new(),
        }
    }
}

impl Profile {
    pub fn first_fragment_size(&self) -> usize {
        self.fragment_sizes
            .first()
            .copied()
            .unwrap_or(config::DEFAULT_FIRST_FRAGMENT_SIZE)
    }

    pub fn needs_tls_handle(&self) -> bool {
        self.tls_strategy != TlsStrategy::None
            || self.ttl_trick.is_some()
            || self.http_host_tricks
            || self.drop_udp443
    }

    pub fn needs_rst_handle(&self) -> bool {
        self.drop_rst
    }

    pub fn enabled_redirects(&self) -> impl Iterator<Item = &RedirectRule> {
        self.redirect_rules.iter().filter(|r| r.enabled)
    }

    /// Whether enabling this profile would open any handle at all.
    pub fn is_active(&self) -> bool {
        self.needs_tls_handle()
            || self.needs_rst_handle()
            || self.enabled_redirects().next().is_some()
    }
}
