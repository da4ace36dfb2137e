//! User-facing bypass options, presets and named-strategy intake.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::config;
use crate::core::profile::{Profile, RedirectRule, TlsStrategy};
use crate::error::BypassError;

pub const PRESET_STANDARD: &str = "Standard";
pub const PRESET_MODERATE: &str = "Moderate";
pub const PRESET_AGGRESSIVE: &str = "Aggressive";

/// Options as selected by a user or a diagnosis collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub fragment: bool,
    pub disorder: bool,
    pub fake: bool,
    pub drop_rst: bool,
    /// Mutate ClientHellos even when no SNI can be parsed.
    pub allow_no_sni: bool,
    pub drop_udp443: bool,
    /// Only honored together with `drop_udp443`.
    pub drop_udp443_global: bool,
    pub http_host_tricks: bool,
    pub bad_checksum: bool,
    pub fragment_sizes: Vec<i64>,
    pub preset_name: String,
    pub auto_adjust_aggressive: bool,
    pub ttl_trick_enabled: bool,
    pub ttl_trick_value: i64,
    pub auto_ttl_enabled: bool,
    /// Pin the TLS filter to one destination.
    pub target_ip: Option<IpAddr>,
    pub redirect_rules: Vec<RedirectRule>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            fragment: false,
            disorder: false,
            fake: false,
            drop_rst: false,
            allow_no_sni: false,
            drop_udp443: false,
            drop_udp443_global: false,
            http_host_tricks: false,
            bad_checksum: false,
            fragment_sizes: vec![config::DEFAULT_FIRST_FRAGMENT_SIZE as i64],
            preset_name: PRESET_STANDARD.to_string(),
            auto_adjust_aggressive: false,
            ttl_trick_enabled: false,
            ttl_trick_value: config::DEFAULT_TTL_TRICK as i64,
            auto_ttl_enabled: false,
            target_ip: None,
            redirect_rules: Vec::new(),
        }
    }
}

impl TlsOptions {
    pub fn is_any_enabled(&self) -> bool {
        self.fragment
            || self.disorder
            || self.fake
            || self.drop_rst
            || self.allow_no_sni
            || self.drop_udp443
            || self.ttl_trick_enabled
            || self.http_host_tricks
            || self.bad_checksum
            || self.redirect_rules.iter().any(|r| r.enabled)
    }

    /// Clamp sizes and TTL into their valid ranges.
    pub fn normalize(mut self) -> Self {
        let mut sizes: Vec<i64> = self
            .fragment_sizes
            .iter()
            .copied()
            .filter(|&v| v > 0)
            .map(|v| v.max(config::MIN_FRAGMENT_SIZE as i64))
            .take(config::MAX_FRAGMENT_SIZES)
            .collect();
        if sizes.is_empty() {
            sizes.push(config::DEFAULT_FIRST_FRAGMENT_SIZE as i64);
        }
        self.fragment_sizes = sizes;

        if self.ttl_trick_value <= 0 {
            self.ttl_trick_value = config::DEFAULT_TTL_TRICK as i64;
        }
        self.ttl_trick_value = self.ttl_trick_value.min(255);
        self
    }

    /// First match wins.
    pub fn tls_strategy(&self) -> TlsStrategy {
        if self.disorder && self.fake {
            TlsStrategy::FakeDisorder
        } else if self.fragment && self.fake {
            TlsStrategy::FakeFragment
        } else if self.disorder {
            TlsStrategy::Disorder
        } else if self.fake {
            TlsStrategy::Fake
        } else if self.fragment {
            TlsStrategy::Fragment
        } else {
            TlsStrategy::None
        }
    }

    pub fn fragment_threshold(&self) -> usize {
        if self.allow_no_sni {
            1
        } else {
            config::DEFAULT_FRAGMENT_THRESHOLD
        }
    }

    pub fn min_chunk(&self) -> i64 {
        self.fragment_sizes.iter().copied().min().unwrap_or(0)
    }

    pub fn readable_strategy(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.fragment {
            parts.push("Fragment".into());
        }
        if self.disorder {
            parts.push("Disorder".into());
        }
        if self.fake {
            parts.push("Fake".into());
        }
        if self.drop_rst {
            parts.push("DROP RST".into());
        }
        if self.drop_udp443 {
            parts.push(if self.drop_udp443_global {
                "DROP UDP/443 (GLOBAL)".into()
            } else {
                "DROP UDP/443".into()
            });
        }
        if self.allow_no_sni {
            parts.push("AllowNoSNI".into());
        }
        if self.ttl_trick_enabled {
            parts.push(if self.auto_ttl_enabled {
                format!("AutoTTL({})", self.ttl_trick_value)
            } else {
                format!("TTL({})", self.ttl_trick_value)
            });
        }
        if self.http_host_tricks {
            parts.push("HTTP Host tricks".into());
        }
        if self.bad_checksum {
            parts.push("BadChecksum".into());
        }
        if parts.is_empty() {
            "Off".into()
        } else {
            parts.join(" + ")
        }
    }

    /// Build the engine profile. `udp443_targets` is used only in selective mode.
    pub fn to_profile(&self, udp443_targets: Vec<Ipv4Addr>) -> Profile {
        let drop_global = self.drop_udp443 && self.drop_udp443_global;
        Profile {
            tls_strategy: self.tls_strategy(),
            fragment_sizes: self
                .fragment_sizes
                .iter()
                .map(|&v| v.max(config::MIN_FRAGMENT_SIZE as i64) as usize)
                .collect(),
            fragment_threshold: self.fragment_threshold(),
            fake_ttl: config::DEFAULT_FAKE_TTL,
            bad_checksum: self.bad_checksum,
            target_port: config::TLS_PORT,
            target: self.target_ip,
            ttl_trick: self
                .ttl_trick_enabled
                .then(|| self.ttl_trick_value.clamp(1, 255) as u8),
            drop_rst: self.drop_rst,
            drop_udp443: self.drop_udp443,
            drop_udp443_global: drop_global,
            udp443_targets: if self.drop_udp443 && !drop_global {
                udp443_targets
            } else {
                Vec::new()
            },
            http_host_tricks: self.http_host_tricks,
            redirect_rules: self.redirect_rules.clone(),
        }
    }

    /// Named fragment preset. Matching is case-insensitive.
    pub fn preset(name: &str) -> Option<Self> {
        let (canonical, sizes): (&str, Vec<i64>) = if name.eq_ignore_ascii_case(PRESET_STANDARD) {
            (PRESET_STANDARD, vec![64])
        } else if name.eq_ignore_ascii_case(PRESET_MODERATE) {
            (PRESET_MODERATE, vec![96])
        } else if name.eq_ignore_ascii_case(PRESET_AGGRESSIVE) {
            (PRESET_AGGRESSIVE, vec![32, 32])
        } else {
            return None;
        };
        Some(Self {
            fragment: true,
            drop_rst: true,
            fragment_sizes: sizes,
            preset_name: canonical.to_string(),
            ..Self::default()
        })
    }

    pub fn is_aggressive_preset(&self) -> bool {
        self.preset_name.eq_ignore_ascii_case(PRESET_AGGRESSIVE)
    }

    /// Map a ranked strategy identifier plus its JSON parameter bag onto options.
    ///
    /// Recognized parameters: `fragment_sizes` (array of integers),
    /// `auto_adjust` (bool), `ttl` (integer), `preset` (string), `allow_no_sni` (bool).
    pub fn from_strategy(id: &str, params: &serde_json::Value) -> Result<Self, BypassError> {
        let mut opts = match params.get("preset").and_then(|v| v.as_str()) {
            Some(name) => Self::preset(name)
                .ok_or_else(|| BypassError::InvalidInput(format!("unknown preset '{name}'")))?,
            None => Self::default(),
        };
        // A preset only contributes sizes; the strategy id decides the technique.
        opts.fragment = false;
        opts.drop_rst = false;

        match id.to_ascii_uppercase().as_str() {
            "TLS_FRAGMENT" => opts.fragment = true,
            "TLS_DISORDER" => opts.disorder = true,
            "TLS_FAKE" => opts.fake = true,
            "TLS_FAKE_FRAGMENT" => {
                opts.fake = true;
                opts.fragment = true;
            }
            "TLS_FAKE_DISORDER" => {
                opts.fake = true;
                opts.disorder = true;
            }
            "DROP_RST" => opts.drop_rst = true,
            "DROP_UDP_443" => opts.drop_udp443 = true,
            "TTL_TRICK" => opts.ttl_trick_enabled = true,
            "HTTP_HOST_TRICKS" => opts.http_host_tricks = true,
            "BAD_CHECKSUM" => {
                opts.fake = true;
                opts.bad_checksum = true;
            }
            other => {
                return Err(BypassError::InvalidInput(format!("unknown strategy id '{other}'")));
            }
        }

        if let Some(sizes) = params.get("fragment_sizes").and_then(|v| v.as_array()) {
            opts.fragment_sizes = sizes.iter().filter_map(|v| v.as_i64()).collect();
        }
        if let Some(auto) = params.get("auto_adjust").and_then(|v| v.as_bool()) {
            opts.auto_adjust_aggressive = auto;
            if opts.ttl_trick_enabled {
                opts.auto_ttl_enabled = auto;
            }
        }
        if let Some(ttl) = params.get("ttl").and_then(|v| v.as_i64()) {
            opts.ttl_trick_value = ttl;
        }
        if let Some(allow) = params.get("allow_no_sni").and_then(|v| v.as_bool()) {
            opts.allow_no_sni = allow;
        }
        Ok(opts.normalize())
    }
}
