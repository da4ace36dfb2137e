//! Per-host cache of observed IPv4 addresses for selective UDP/443 dropping.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config;
use crate::core::dns::{resolve_with_timeout, HostResolver};

/// Host keys compare case-insensitively.
pub(crate) fn host_key(host: &str) -> Option<String> {
    let key = host.trim().to_ascii_lowercase();
    (!key.is_empty()).then_some(key)
}

pub struct ObservedIpCache {
    /// host -> (ip -> expiry)
    by_host: DashMap<String, HashMap<Ipv4Addr, Instant>>,
    ttl: Duration,
    cap: usize,
}

impl Default for ObservedIpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservedIpCache {
    pub fn new() -> Self {
        Self {
            by_host: DashMap::new(),
            ttl: Duration::from_secs(config::OBSERVED_IP_TTL_SECS),
            cap: config::OBSERVED_IP_CAP,
        }
    }

    /// Record one observed destination. Non-IPv4 and unspecified addresses are ignored.
    pub fn seed_ip(&self, host: &str, ip: IpAddr) {
        self.seed_at(host, [ip], Instant::now());
    }

    /// Seed from endpoint strings such as `1.2.3.4` or `1.2.3.4:443`.
    pub fn seed_endpoints(&self, host: &str, endpoints: &[String]) {
        let ips: Vec<IpAddr> = endpoints.iter().filter_map(|e| parse_endpoint(e)).collect();
        self.seed_at(host, ips, Instant::now());
    }

    pub fn snapshot(&self, host: &str) -> Vec<Ipv4Addr> {
        self.snapshot_at(host, Instant::now())
    }

    /// Cached addresses for `host`, or a single DNS resolve to seed a cold entry.
    pub async fn get_or_seed(&self, host: &str, resolver: &dyn HostResolver, timeout: Duration) -> Vec<Ipv4Addr> {
        let cached = self.snapshot(host);
        if !cached.is_empty() {
            return cached;
        }
        let resolved = resolve_with_timeout(resolver, host.trim(), timeout).await;
        if resolved.is_empty() {
            return Vec::new();
        }
        self.seed_at(host, resolved, Instant::now());
        self.snapshot(host)
    }

    pub(crate) fn seed_at(&self, host: &str, ips: impl IntoIterator<Item = IpAddr>, now: Instant) {
        let Some(key) = host_key(host) else {
            return;
        };
        let fresh: Vec<Ipv4Addr> = ips
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
                _ => None,
            })
            .collect();
        if fresh.is_empty() {
            return;
        }
        let until = now + self.ttl;
        let mut entry = self.by_host.entry(key).or_default();
        entry.retain(|_, expiry| *expiry >= now);
        for ip in fresh {
            entry.insert(ip, until);
        }
        if entry.len() > self.cap {
            let mut ordered: Vec<(Ipv4Addr, Instant)> = entry.iter().map(|(ip, at)| (*ip, *at)).collect();
            ordered.sort_by_key(|(_, at)| *at);
            let extra = ordered.len() - self.cap;
            for (ip, _) in ordered.into_iter().take(extra) {
                entry.remove(&ip);
            }
        }
    }

    pub(crate) fn snapshot_at(&self, host: &str, now: Instant) -> Vec<Ipv4Addr> {
        let Some(key) = host_key(host) else {
            return Vec::new();
        };
        let Some(mut entry) = self.by_host.get_mut(&key) else {
            return Vec::new();
        };
        entry.retain(|_, expiry| *expiry >= now);
        let mut ips: Vec<Ipv4Addr> = entry.keys().copied().collect();
        ips.sort();
        ips
    }
}

fn parse_endpoint(raw: &str) -> Option<IpAddr> {
    let s = raw.trim();
    if let Ok(ip) = s.parse() {
        return Some(ip);
    }
    if let Ok(sock) = s.parse::<std::net::SocketAddr>() {
        return Some(sock.ip());
    }
    let (host, _port) = s.rsplit_once(':')?;
    host.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns::testing::StaticResolver;
    use std::sync::atomic::Ordering;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_only_and_case_insensitive_hosts() {
        let cache = ObservedIpCache::new();
        cache.seed_ip("Example.COM ", v4("1.2.3.4"));
        cache.seed_ip("example.com", v4("2001:db8::1"));
        cache.seed_ip("example.com", v4("0.0.0.0"));
        assert_eq!(cache.snapshot("EXAMPLE.com"), vec![Ipv4Addr::new(1, 2, 3, 4)]);
        assert!(cache.snapshot("  ").is_empty());
    }

    #[test]
    fn test_endpoints_with_ports() {
        let cache = ObservedIpCache::new();
        cache.seed_endpoints(
            "h",
            &["5.6.7.8:443".into(), "1.1.1.1".into(), "[2001:db8::1]:443".into(), "junk".into()],
        );
        assert_eq!(cache.snapshot("h"), vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(5, 6, 7, 8)]);
    }

    #[test]
    fn test_expiry_and_cap_evict_earliest() {
        let cache = ObservedIpCache::new();
        let t0 = Instant::now();
        cache.seed_at("h", [v4("9.9.9.9")], t0);
        for i in 0..16u8 {
            cache.seed_at("h", [v4(&format!("10.0.0.{i}"))], t0 + Duration::from_secs(1 + i as u64));
        }
        let ips = cache.snapshot_at("h", t0 + Duration::from_secs(20));
        assert_eq!(ips.len(), 16);
        assert!(!ips.contains(&Ipv4Addr::new(9, 9, 9, 9)));

        let later = t0 + Duration::from_secs(config::OBSERVED_IP_TTL_SECS + 30);
        assert!(cache.snapshot_at("h", later).is_empty());
    }

    #[tokio::test]
    async fn test_cold_cache_resolves_once() {
        let cache = ObservedIpCache::new();
        let resolver = StaticResolver::default().with("cdn.example", &["3.3.3.3", "2001:db8::3"]);
        let t = Duration::from_millis(50);
        assert_eq!(cache.get_or_seed("cdn.example", &resolver, t).await, vec![Ipv4Addr::new(3, 3, 3, 3)]);
        assert_eq!(cache.get_or_seed("cdn.example", &resolver, t).await.len(), 1);
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
    }
}
