//! Small TTL-bounded set of currently relevant bypass targets.
//!
//! Several targets may be active at once and share one global filter; the
//! selective UDP/443 drop list is the union of their observed addresses.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::observed_ips::host_key;
use crate::config;
use crate::core::{TlsOptions, TlsStrategy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTargetPolicy {
    pub host_key: String,
    #[serde(skip)]
    pub last_applied: Option<Instant>,
    /// Endpoints such as `1.2.3.4:443`, passed in through
    /// `StateCoordinator::remember_active_target` or
    /// `StateCoordinator::update_active_target_candidates`.
    pub candidate_endpoints: Vec<String>,
    pub drop_udp443: bool,
    pub allow_no_sni: bool,
    pub http_host_tricks: bool,
    pub tls_strategy: TlsStrategy,
}

impl ActiveTargetPolicy {
    pub fn new(host: &str) -> Self {
        Self {
            host_key: host.trim().to_string(),
            last_applied: None,
            candidate_endpoints: Vec::new(),
            drop_udp443: false,
            allow_no_sni: false,
            http_host_tricks: false,
            tls_strategy: TlsStrategy::None,
        }
    }

    pub fn from_options(host: &str, options: &TlsOptions) -> Self {
        Self {
            drop_udp443: options.drop_udp443,
            allow_no_sni: options.allow_no_sni,
            http_host_tricks: options.http_host_tricks,
            tls_strategy: options.tls_strategy(),
            ..Self::new(host)
        }
    }
}

pub struct ActiveTargets {
    policies: Mutex<HashMap<String, ActiveTargetPolicy>>,
    cap: usize,
    ttl: Duration,
}

impl Default for ActiveTargets {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveTargets {
    pub fn new() -> Self {
        Self {
            policies: Mutex::new(HashMap::new()),
            cap: config::ACTIVE_TARGET_CAP,
            ttl: Duration::from_secs(config::ACTIVE_TARGET_TTL_SECS),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveTargetPolicy>> {
        self.policies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remember(&self, policy: ActiveTargetPolicy) {
        self.remember_at(policy, Instant::now());
    }

    pub(crate) fn remember_at(&self, mut policy: ActiveTargetPolicy, now: Instant) {
        let Some(key) = host_key(&policy.host_key) else {
            return;
        };
        policy.host_key = policy.host_key.trim().to_string();
        policy.last_applied.get_or_insert(now);

        let mut map = self.lock();
        self.prune(&mut map, now);
        map.insert(key, policy);
        self.enforce_cap(&mut map);
    }

    /// Replace the candidate endpoints of a target, adding it if unknown.
    pub fn update_candidates(&self, host: &str, endpoints: &[String]) {
        let Some(key) = host_key(host) else {
            return;
        };
        let mut endpoints: Vec<String> = endpoints
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        endpoints.dedup();
        if endpoints.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut map = self.lock();
        self.prune(&mut map, now);
        let entry = map.entry(key).or_insert_with(|| ActiveTargetPolicy::new(host));
        entry.candidate_endpoints = endpoints;
        entry.last_applied = Some(now);
        self.enforce_cap(&mut map);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Most recent first, with `preferred` moved to the front when present.
    pub fn snapshot(&self, preferred: Option<&str>) -> Vec<ActiveTargetPolicy> {
        self.snapshot_at(preferred, Instant::now())
    }

    pub(crate) fn snapshot_at(&self, preferred: Option<&str>, now: Instant) -> Vec<ActiveTargetPolicy> {
        let mut map = self.lock();
        self.prune(&mut map, now);
        let mut list: Vec<ActiveTargetPolicy> = map.values().cloned().collect();
        drop(map);
        list.sort_by(|a, b| b.last_applied.cmp(&a.last_applied));
        if let Some(want) = preferred.and_then(host_key) {
            if let Some(idx) = list.iter().position(|p| host_key(&p.host_key).as_deref() == Some(want.as_str())) {
                let item = list.remove(idx);
                list.insert(0, item);
            }
        }
        list
    }

    fn prune(&self, map: &mut HashMap<String, ActiveTargetPolicy>, now: Instant) {
        map.retain(|_, p| {
            p.last_applied
                .map_or(true, |at| now.saturating_duration_since(at) <= self.ttl)
        });
    }

    fn enforce_cap(&self, map: &mut HashMap<String, ActiveTargetPolicy>) {
        if map.len() <= self.cap {
            return;
        }
        let mut ordered: Vec<(String, Option<Instant>)> =
            map.iter().map(|(k, p)| (k.clone(), p.last_applied)).collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in ordered.into_iter().skip(self.cap) {
            map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[ActiveTargetPolicy]) -> Vec<&str> {
        list.iter().map(|p| p.host_key.as_str()).collect()
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let targets = ActiveTargets::new();
        let t0 = Instant::now();
        for (i, h) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            targets.remember_at(ActiveTargetPolicy::new(h), t0 + Duration::from_secs(i as u64));
        }
        let snap = targets.snapshot_at(None, t0 + Duration::from_secs(10));
        assert_eq!(hosts(&snap), vec!["e", "d", "c", "b"]);
    }

    #[test]
    fn test_ttl_expiry() {
        let targets = ActiveTargets::new();
        let t0 = Instant::now();
        targets.remember_at(ActiveTargetPolicy::new("old"), t0);
        targets.remember_at(ActiveTargetPolicy::new("new"), t0 + Duration::from_secs(600));
        let later = t0 + Duration::from_secs(config::ACTIVE_TARGET_TTL_SECS + 1);
        assert_eq!(hosts(&targets.snapshot_at(None, later)), vec!["new"]);
    }

    #[test]
    fn test_preferred_moves_to_front_case_insensitively() {
        let targets = ActiveTargets::new();
        let t0 = Instant::now();
        targets.remember_at(ActiveTargetPolicy::new("YouTube.com"), t0);
        targets.remember_at(ActiveTargetPolicy::new("steam.com"), t0 + Duration::from_secs(1));
        let snap = targets.snapshot_at(Some("youtube.COM"), t0 + Duration::from_secs(2));
        assert_eq!(hosts(&snap), vec!["YouTube.com", "steam.com"]);
    }

    #[test]
    fn test_update_candidates_adds_or_refreshes() {
        let targets = ActiveTargets::new();
        targets.update_candidates("x.example", &[" 1.2.3.4:443 ".into(), "".into()]);
        let snap = targets.snapshot(None);
        assert_eq!(snap[0].candidate_endpoints, vec!["1.2.3.4:443".to_string()]);

        targets.update_candidates("x.example", &[]);
        assert_eq!(targets.snapshot(None)[0].candidate_endpoints.len(), 1);
        targets.clear();
        assert!(targets.snapshot(None).is_empty());
    }

    #[test]
    fn test_policy_from_options() {
        let opts = TlsOptions {
            fragment: true,
            fake: true,
            drop_udp443: true,
            ..TlsOptions::default()
        };
        let p = ActiveTargetPolicy::from_options(" host ", &opts);
        assert_eq!(p.host_key, "host");
        assert_eq!(p.tls_strategy, TlsStrategy::FakeFragment);
        assert!(p.drop_udp443);
    }
}
