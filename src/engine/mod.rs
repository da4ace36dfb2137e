//! Bypass engine lifecycle: filters, handles, loops and connection state.
//!
//! ```text
//! Disabled -> Enabling -> Enabled -> Disabling -> Disabled
//!                 \           \
//!                  `-> Faulted -`-> Disabling -> Disabled
//! ```
//!
//! Only one handle set is open at a time. State, profile and loop ownership
//! live behind one mutex that is never held across an await or a join.
//! `enable`/`disable` are crate-private: the state coordinator is the only writer.

pub mod filter;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capture::loops::{spawn_loop, FaultHook, LoopHandle};
use crate::capture::{PacketDriver, PacketHandle};
use crate::config;
use crate::core::dns::{resolve_with_timeout, HostResolver, SystemResolver};
use crate::core::{BypassMetrics, ConnTracker, ConnectionKey, MetricsSnapshot, ProbeFlows, Profile};
use crate::error::BypassError;
use crate::strategies::{
    HttpHostSplitter, PacketStrategy, Redirector, RstSuppressor, TlsMutator, Udp443Dropper,
};
use filter::{HandleRole, HandleSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
    Faulted,
}

/// A loop died while the engine was enabled.
#[derive(Debug, Clone)]
pub struct EngineFault {
    pub loop_name: String,
    pub message: String,
}

struct Inner {
    state: EngineState,
    profile: Arc<Profile>,
    loops: Vec<LoopHandle>,
    stop: Arc<AtomicBool>,
    /// Bumped on every enable and disable; stale fault reports are ignored.
    generation: u64,
    sweeper: Option<JoinHandle<()>>,
}

struct EngineShared {
    driver: Arc<dyn PacketDriver>,
    resolver: Arc<dyn HostResolver>,
    inner: Mutex<Inner>,
    metrics: Arc<BypassMetrics>,
    conntrack: Arc<ConnTracker>,
    probes: Arc<ProbeFlows>,
    fault_tx: Mutex<Option<mpsc::UnboundedSender<EngineFault>>>,
}

impl EngineShared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_fault(&self, generation: u64, loop_name: &str, message: String) {
        {
            let mut inner = self.inner();
            if inner.generation != generation
                || !matches!(inner.state, EngineState::Enabling | EngineState::Enabled)
            {
                return;
            }
            inner.state = EngineState::Faulted;
        }
        tracing::error!("Engine faulted: loop '{loop_name}': {message}");
        let tx = self.fault_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(EngineFault {
                loop_name: loop_name.to_string(),
                message,
            });
        }
    }
}

/// Owns the open handles, loops and per-connection state.
pub struct BypassEngine {
    shared: Arc<EngineShared>,
}

impl BypassEngine {
    pub fn new(driver: Arc<dyn PacketDriver>) -> Self {
        Self::with_resolver(driver, Arc::new(SystemResolver))
    }

    pub fn with_resolver(driver: Arc<dyn PacketDriver>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                driver,
                resolver,
                inner: Mutex::new(Inner {
                    state: EngineState::Disabled,
                    profile: Arc::new(Profile::default()),
                    loops: Vec::new(),
                    stop: Arc::new(AtomicBool::new(false)),
                    generation: 0,
                    sweeper: None,
                }),
                metrics: Arc::new(BypassMetrics::new()),
                conntrack: Arc::new(ConnTracker::new()),
                probes: Arc::new(ProbeFlows::new()),
                fault_tx: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.inner().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Enabled
    }

    pub fn profile(&self) -> Arc<Profile> {
        Arc::clone(&self.shared.inner().profile)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn driver_name(&self) -> &'static str {
        self.shared.driver.name()
    }

    /// Exclude a flow opened by the outcome probe from user-facing counters.
    pub fn register_probe_flow(&self, key: ConnectionKey) {
        self.shared.probes.register(key);
    }

    /// Route loop faults to the returned receiver. Replaces any previous subscriber.
    pub(crate) fn subscribe_faults(&self) -> mpsc::UnboundedReceiver<EngineFault> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.fault_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Apply `profile`. An inactive profile disables the engine.
    pub(crate) async fn enable(&self, mut profile: Profile) -> Result<(), BypassError> {
        if !profile.is_active() {
            self.disable().await;
            return Ok(());
        }
        self.shared.driver.check_preconditions()?;

        let current = {
            let inner = self.shared.inner();
            (inner.state, Arc::clone(&inner.profile))
        };
        if current.0 == EngineState::Enabled && same_profile(&current.1, &profile) {
            tracing::debug!("Engine already enabled with this profile");
            return Ok(());
        }
        if current.0 != EngineState::Disabled {
            self.disable().await;
        }

        {
            let mut inner = self.shared.inner();
            inner.state = EngineState::Enabling;
            inner.generation += 1;
        }

        self.resolve_redirect_hosts(&mut profile).await;
        let profile = Arc::new(profile);

        let handles = match self.open_handles(&profile) {
            Ok(handles) => handles,
            Err(e) => {
                self.abort_enable(&e).await;
                return Err(e);
            }
        };

        let (stop, generation) = {
            let mut inner = self.shared.inner();
            inner.stop = Arc::new(AtomicBool::new(false));
            (Arc::clone(&inner.stop), inner.generation)
        };
        self.shared.metrics.reset();

        let mut loops = Vec::with_capacity(handles.len());
        for (spec, io) in handles {
            let strategies = self.strategies_for(spec.role, &profile);
            match spawn_loop(
                spec.role.as_str(),
                Arc::clone(&io),
                strategies,
                Arc::clone(&self.shared.metrics),
                Arc::clone(&stop),
                self.fault_hook(generation),
            ) {
                Ok(handle) => loops.push(handle),
                Err(e) => {
                    stop.store(true, Ordering::Relaxed);
                    io.shutdown();
                    for l in &loops {
                        l.io.shutdown();
                    }
                    self.abort_enable(&e).await;
                    return Err(e);
                }
            }
        }

        let sweeper = self.shared.conntrack.spawn_sweeper();
        let mut inner = self.shared.inner();
        inner.loops = loops;
        inner.sweeper = Some(sweeper);
        inner.profile = Arc::clone(&profile);
        // A loop may already have faulted; keep that.
        if inner.state == EngineState::Enabling {
            inner.state = EngineState::Enabled;
        }
        tracing::info!(
            "Engine enabled ({}): strategy={}, handles={}",
            self.shared.driver.name(),
            profile.tls_strategy.as_str(),
            inner.loops.len()
        );
        Ok(())
    }

    /// Idempotent; safe from any state, including `Faulted`.
    pub(crate) async fn disable(&self) {
        let (loops, sweeper) = {
            let mut inner = self.shared.inner();
            if matches!(inner.state, EngineState::Disabled | EngineState::Disabling) {
                return;
            }
            tracing::info!("Engine disabling from {:?}", inner.state);
            inner.state = EngineState::Disabling;
            inner.stop.store(true, Ordering::Relaxed);
            inner.generation += 1;
            (std::mem::take(&mut inner.loops), inner.sweeper.take())
        };

        for l in &loops {
            l.io.shutdown();
        }
        let timeout = Duration::from_millis(config::LOOP_JOIN_TIMEOUT_MS);
        for l in loops {
            l.join(timeout).await;
        }
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        self.shared.conntrack.clear();

        let mut inner = self.shared.inner();
        inner.profile = Arc::new(Profile::default());
        inner.state = EngineState::Disabled;
        tracing::info!("Engine disabled");
    }

    async fn abort_enable(&self, err: &BypassError) {
        tracing::error!("Engine enable failed: {err}");
        self.shared.inner().state = EngineState::Faulted;
        self.disable().await;
    }

    /// Open every handle the profile needs, or none of them.
    fn open_handles(&self, profile: &Profile) -> Result<Vec<(HandleSpec, Arc<dyn PacketHandle>)>, BypassError> {
        let mut opened: Vec<(HandleSpec, Arc<dyn PacketHandle>)> = Vec::new();
        for spec in filter::handle_specs(profile) {
            match self.shared.driver.open(&spec.filter, spec.priority) {
                Ok(io) => opened.push((spec, io)),
                Err(e) => {
                    tracing::warn!(
                        "Opening {} handle failed; rolling back {} open handle(s)",
                        spec.role.as_str(),
                        opened.len()
                    );
                    for (_, io) in &opened {
                        io.shutdown();
                    }
                    return Err(e);
                }
            }
        }
        Ok(opened)
    }

    fn strategies_for(&self, role: HandleRole, profile: &Arc<Profile>) -> Vec<Box<dyn PacketStrategy>> {
        let metrics = &self.shared.metrics;
        let mut list: Vec<Box<dyn PacketStrategy>> = Vec::new();
        match role {
            HandleRole::Rst => list.push(Box::new(RstSuppressor::new(Arc::clone(metrics)))),
            HandleRole::Tls => {
                if profile.drop_udp443 {
                    list.push(Box::new(Udp443Dropper::new(Arc::clone(profile), Arc::clone(metrics))));
                }
                if profile.http_host_tricks {
                    list.push(Box::new(HttpHostSplitter::new(
                        Arc::clone(metrics),
                        Arc::clone(&self.shared.conntrack),
                    )));
                }
                list.push(Box::new(TlsMutator::new(
                    Arc::clone(profile),
                    Arc::clone(metrics),
                    Arc::clone(&self.shared.conntrack),
                    Arc::clone(&self.shared.probes),
                )));
            }
            HandleRole::Redirect => {
                list.push(Box::new(Redirector::new(Arc::clone(profile), Arc::clone(metrics))))
            }
        }
        list
    }

    fn fault_hook(&self, generation: u64) -> FaultHook {
        let weak: Weak<EngineShared> = Arc::downgrade(&self.shared);
        Arc::new(move |name: &str, message: String| {
            if let Some(shared) = weak.upgrade() {
                shared.on_fault(generation, name, message);
            }
        })
    }

    /// Best-effort: failures and timeouts leave a rule's allow-list unresolved.
    async fn resolve_redirect_hosts(&self, profile: &mut Profile) {
        let timeout = Duration::from_millis(config::REDIRECT_DNS_TIMEOUT_MS);
        for rule in profile.redirect_rules.iter_mut().filter(|r| r.enabled) {
            rule.resolved.clear();
            for host in &rule.hosts {
                let ips = resolve_with_timeout(self.shared.resolver.as_ref(), host, timeout).await;
                if ips.is_empty() {
                    tracing::warn!("Redirect '{}': could not resolve {host}; skipped", rule.name);
                }
                rule.resolved.extend(
                    ips.into_iter()
                        .filter(|ip| same_family(ip, &rule.redirect_ip)),
                );
            }
        }
    }
}

fn same_family(a: &IpAddr, b: &IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Profiles compare equal ignoring resolved redirect addresses.
fn same_profile(active: &Profile, requested: &Profile) -> bool {
    let mut active = active.clone();
    for rule in &mut active.redirect_rules {
        rule.resolved.clear();
    }
    active == *requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockDriver;
    use crate::codec::fixtures::*;
    use crate::codec::{parse, Transport, TCP_ACK, TCP_PSH, TCP_RST, TCP_SYN};
    use crate::core::dns::testing::StaticResolver;
    use crate::core::{RedirectRule, TlsStrategy};

    fn engine() -> (BypassEngine, Arc<MockDriver>) {
        let driver = MockDriver::new();
        let engine = BypassEngine::with_resolver(
            Arc::clone(&driver) as Arc<dyn PacketDriver>,
            Arc::new(StaticResolver::default()),
        );
        (engine, driver)
    }

    fn fragment_profile() -> Profile {
        Profile {
            tls_strategy: TlsStrategy::Fragment,
            drop_rst: true,
            fragment_threshold: 1,
            ..Profile::default()
        }
    }

    #[tokio::test]
    async fn test_enable_opens_handles_and_runs_loops() {
        let (engine, driver) = engine();
        engine.enable(fragment_profile()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Enabled);
        assert_eq!(driver.open_count(), 2);

        let tls = driver.handle_with("tcp.DstPort == 443").unwrap();
        assert_eq!(tls.priority, 200);
        let hello = client_hello("example.com", 600);
        tls.push_packet(ipv4_tcp(CLIENT, SERVER, 50000, 443, 64, 1, TCP_ACK | TCP_PSH, &hello));
        assert!(tls.wait_for_sent(2, Duration::from_secs(2)));

        let rst = driver.handle_with("tcp.Rst").unwrap();
        rst.push_packet(ipv4_tcp(SERVER, CLIENT, 443, 50000, 64, 1, TCP_SYN | TCP_ACK, b""));
        rst.push_packet(ipv4_tcp(SERVER, CLIENT, 443, 50000, 5, 1, TCP_RST, b""));
        assert!(rst.wait_for_drain(Duration::from_secs(2)));
        assert!(rst.wait_for_sent(1, Duration::from_secs(2)));

        engine.disable().await;
        let m = engine.metrics_snapshot();
        assert_eq!(m.client_hellos_fragmented, 1);
        assert_eq!(m.rst_dropped, 1);
        assert_eq!(m.rst_suspicious, 1);
        // Only the SYN-ACK was re-injected.
        assert_eq!(rst.sent().len(), 1);
        assert!(driver.live_handles().is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_rolls_back_everything() {
        let (engine, driver) = engine();
        driver.fail_open_when("tcp.DstPort == 443");
        let err = engine.enable(fragment_profile()).await.unwrap_err();
        assert_eq!(err.kind(), "HandleOpen");
        assert_eq!(engine.state(), EngineState::Disabled);
        assert_eq!(driver.open_count(), 1);
        assert!(driver.live_handles().is_empty());
        assert_eq!(*engine.profile(), Profile::default());
    }

    #[tokio::test]
    async fn test_precondition_failure_opens_nothing() {
        let (engine, driver) = engine();
        driver.deny_privilege();
        let err = engine.enable(fragment_profile()).await.unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(driver.open_count(), 0);
        assert_eq!(engine.state(), EngineState::Disabled);
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let (engine, _driver) = engine();
        engine.disable().await;
        assert_eq!(engine.state(), EngineState::Disabled);

        engine.enable(fragment_profile()).await.unwrap();
        engine.disable().await;
        let after_first = (engine.state(), engine.profile());
        engine.disable().await;
        assert_eq!(engine.state(), after_first.0);
        assert_eq!(engine.profile(), after_first.1);
    }

    #[tokio::test]
    async fn test_same_profile_is_noop_and_new_profile_replaces() {
        let (engine, driver) = engine();
        engine.enable(fragment_profile()).await.unwrap();
        engine.enable(fragment_profile()).await.unwrap();
        assert_eq!(driver.open_count(), 2);

        let disorder = Profile {
            tls_strategy: TlsStrategy::Disorder,
            ..fragment_profile()
        };
        engine.enable(disorder).await.unwrap();
        assert_eq!(driver.open_count(), 4);
        assert_eq!(driver.live_handles().len(), 2);
        assert_eq!(engine.profile().tls_strategy, TlsStrategy::Disorder);
        engine.disable().await;
    }

    #[tokio::test]
    async fn test_inactive_profile_disables() {
        let (engine, driver) = engine();
        engine.enable(fragment_profile()).await.unwrap();
        engine.enable(Profile::default()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Disabled);
        assert!(driver.live_handles().is_empty());
    }

    #[tokio::test]
    async fn test_loop_panic_faults_engine_and_reports() {
        let (engine, driver) = engine();
        let mut faults = engine.subscribe_faults();
        engine.enable(fragment_profile()).await.unwrap();

        driver.handle_with("tcp.Rst").unwrap().push_panic();
        let fault = tokio::time::timeout(Duration::from_secs(2), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault.loop_name, "rst");
        assert_eq!(engine.state(), EngineState::Faulted);
        assert!(!engine.is_running());

        engine.disable().await;
        assert_eq!(engine.state(), EngineState::Disabled);
    }

    #[tokio::test]
    async fn test_redirect_hosts_resolved_best_effort() {
        let driver = MockDriver::new();
        let resolver = StaticResolver::default()
            .with("dns.example", &["1.1.1.1", "2606:4700::1111"])
            .with("gone.example", &[]);
        let engine = BypassEngine::with_resolver(
            Arc::clone(&driver) as Arc<dyn PacketDriver>,
            Arc::new(resolver),
        );
        let profile = Profile {
            redirect_rules: vec![RedirectRule {
                name: "dns".into(),
                protocol: Transport::Udp,
                port: 53,
                redirect_ip: "9.9.9.9".parse().unwrap(),
                redirect_port: 0,
                enabled: true,
                hosts: vec!["dns.example".into(), "gone.example".into()],
                resolved: Vec::new(),
            }],
            ..Profile::default()
        };
        engine.enable(profile).await.unwrap();
        let active = engine.profile();
        assert_eq!(active.redirect_rules[0].resolved, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);

        let io = driver.handle_with("udp.DstPort == 53").unwrap();
        io.push_packet(ipv4_udp(CLIENT, [1, 1, 1, 1], 4000, 53, b"q"));
        assert!(io.wait_for_sent(1, Duration::from_secs(2)));
        let out = parse(&io.sent_data()[0]).unwrap();
        assert_eq!(out.dst_ip(), "9.9.9.9".parse::<IpAddr>().unwrap());
        engine.disable().await;
    }
}
