//! State coordinator: the only writer of engine and profile state.
//!
//! Every apply and disable runs under one async gate, so profile mutations
//! are strictly serialized and a watchdog decision queues behind an apply in
//! flight. Around the gate sit the crash-recovery journal, the metrics pump
//! that feeds the auto-adjust tuners, the outcome probe and the event channel.
//!
//! Cancellation of an apply always lands in a previously valid state: before
//! the engine is touched the old profile stays active, afterwards the engine
//! is disabled.

pub mod activation;
pub mod active_targets;
pub mod auto_adjust;
pub mod journal;
pub mod observed_ips;
pub mod outcome;
pub mod telemetry;
pub mod watchdog;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::PacketDriver;
use crate::config::{self, Tunables};
use crate::core::dns::{HostResolver, SystemResolver};
use crate::core::metrics;
use crate::core::{ConnectionKey, MetricsSnapshot, Profile, TlsOptions};
use crate::engine::{BypassEngine, EngineState};
use crate::error::BypassError;

use activation::{ActivationInputs, ActivationSnapshot};
use active_targets::{ActiveTargetPolicy, ActiveTargets};
use auto_adjust::{AggressiveTuner, AutoTtlTuner};
use journal::SessionJournal;
use observed_ips::{host_key, ObservedIpCache};
use outcome::{FlowCallback, HttpsProber, OutcomeProber, OutcomeSnapshot};
use telemetry::{CoordinatorEvent, Telemetry};
use watchdog::{Watchdog, WatchdogDecision};

pub const REASON_CRASH_RECOVERY: &str = "crash_recovery";
pub const REASON_ENGINE_FAULT: &str = "engine_fault";
pub const REASON_SHUTDOWN: &str = "shutdown";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Timestamps the watchdog and the activation evaluator read.
#[derive(Default)]
struct Clock {
    last_activated: Option<Instant>,
    /// Last heartbeat while bypass was on.
    last_metrics_event: Option<Instant>,
    last_metrics: Option<(Instant, MetricsSnapshot)>,
}

struct OutcomeState {
    target_host: String,
    last: OutcomeSnapshot,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct Tuners {
    aggressive: AggressiveTuner,
    auto_ttl: AutoTtlTuner,
}

struct Shared {
    engine: BypassEngine,
    gate: tokio::sync::Mutex<()>,
    options: Mutex<TlsOptions>,
    tunables: Tunables,
    journal: SessionJournal,
    resolver: Arc<dyn HostResolver>,
    prober: Arc<dyn OutcomeProber>,
    observed_ips: ObservedIpCache,
    active_targets: ActiveTargets,
    telemetry: Telemetry,
    clock: Mutex<Clock>,
    outcome: Mutex<OutcomeState>,
    tuners: Mutex<Tuners>,
    watchdog: Mutex<Watchdog>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
    apply_delay: Option<Duration>,
}

pub struct CoordinatorBuilder {
    driver: Arc<dyn PacketDriver>,
    tunables: Option<Tunables>,
    journal_path: Option<PathBuf>,
    resolver: Option<Arc<dyn HostResolver>>,
    prober: Option<Arc<dyn OutcomeProber>>,
    apply_delay: Option<Duration>,
}

impl CoordinatorBuilder {
    /// Defaults to [`Tunables::from_env`].
    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = Some(tunables);
        self
    }

    /// Defaults to [`config::session_journal_path`].
    pub fn journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn OutcomeProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Pause every apply before it touches the engine.
    pub fn apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = Some(delay);
        self
    }

    pub fn smoke_mode(self) -> Self {
        self.apply_delay(Duration::from_millis(config::SMOKE_APPLY_DELAY_MS))
    }

    pub fn build(self) -> StateCoordinator {
        let tunables = self.tunables.unwrap_or_else(Tunables::from_env);
        let journal = SessionJournal::open(self.journal_path.unwrap_or_else(config::session_journal_path));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(SystemResolver));
        let prober = self.prober.unwrap_or_else(|| Arc::new(HttpsProber::new()));
        let engine = BypassEngine::with_resolver(self.driver, Arc::clone(&resolver));
        tracing::info!(
            "State coordinator ready: driver={}, journal={}",
            engine.driver_name(),
            journal.path().display()
        );
        StateCoordinator {
            shared: Arc::new(Shared {
                engine,
                gate: tokio::sync::Mutex::new(()),
                options: Mutex::new(TlsOptions::default()),
                tunables,
                journal,
                resolver,
                prober,
                observed_ips: ObservedIpCache::new(),
                active_targets: ActiveTargets::new(),
                telemetry: Telemetry::new(),
                clock: Mutex::new(Clock::default()),
                outcome: Mutex::new(OutcomeState {
                    target_host: String::new(),
                    last: OutcomeSnapshot::unknown("bypass off"),
                    cancel: None,
                }),
                tuners: Mutex::new(Tuners::default()),
                watchdog: Mutex::new(Watchdog::new()),
                tasks: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                apply_delay: self.apply_delay,
            }),
        }
    }
}

/// Cheap handle; clones share one coordinator. Background tasks hold only a
/// weak reference and stop once every handle is gone.
#[derive(Clone)]
pub struct StateCoordinator {
    shared: Arc<Shared>,
}

impl StateCoordinator {
    pub fn new(driver: Arc<dyn PacketDriver>) -> Self {
        Self::builder(driver).build()
    }

    pub fn builder(driver: Arc<dyn PacketDriver>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            driver,
            tunables: None,
            journal_path: None,
            resolver: None,
            prober: None,
            apply_delay: None,
        }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    // -- read side ---------------------------------------------------------

    pub fn engine_state(&self) -> EngineState {
        self.shared.engine.state()
    }

    pub fn driver_name(&self) -> &'static str {
        self.shared.engine.driver_name()
    }

    /// Profile the engine is currently running with.
    pub fn active_profile(&self) -> Arc<Profile> {
        self.shared.engine.profile()
    }

    pub fn options_snapshot(&self) -> TlsOptions {
        lock(&self.shared.options).clone()
    }

    /// Logically on: any option enabled, whether or not the engine runs.
    pub fn is_bypass_on(&self) -> bool {
        lock(&self.shared.options).is_any_enabled()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.engine.metrics_snapshot()
    }

    pub fn tunables(&self) -> &Tunables {
        &self.shared.tunables
    }

    pub fn journal(&self) -> &SessionJournal {
        &self.shared.journal
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.telemetry.subscribe()
    }

    pub fn activation_status_snapshot(&self) -> ActivationSnapshot {
        let bypass_on = self.is_bypass_on();
        let engine_running = self.shared.engine.is_running();
        let now = Instant::now();
        let clock = lock(&self.shared.clock);
        let inputs = ActivationInputs {
            bypass_on,
            engine_running,
            since_activation: clock.last_activated.map(|at| now.saturating_duration_since(at)),
            metrics_age: clock
                .last_metrics
                .as_ref()
                .map(|(at, _)| now.saturating_duration_since(*at)),
            metrics: clock.last_metrics.as_ref().map(|(_, m)| m),
        };
        activation::evaluate(&inputs, &self.shared.tunables)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Run crash recovery, then start the background tasks. Idempotent.
    ///
    /// If the journal shows the previous run died with bypass active, the
    /// bypass is force-disabled with reason `crash_recovery` before anything else.
    pub async fn initialize_on_startup(&self, cancel: &CancellationToken) -> Result<(), BypassError> {
        if self.shared.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let recover = self.shared.journal.startup_was_unclean_and_active();
        self.shared.journal.mark_session_started();
        if recover {
            tracing::warn!("Previous session ended uncleanly with bypass active; disabling");
            if let Err(e) = self.disable(REASON_CRASH_RECOVERY, cancel).await {
                self.shared.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        self.start_background();
        Ok(())
    }

    /// Must be called on graceful exit; its absence is what crash recovery detects.
    pub fn mark_clean_shutdown(&self) {
        self.shared.journal.mark_clean_shutdown("clean_shutdown");
        tracing::info!("Session marked clean");
    }

    /// Stop background tasks, disable the bypass and mark the session clean.
    pub async fn shutdown(&self) {
        self.stop_background();
        {
            let _gate = self.shared.gate.lock().await;
            self.disable_locked(REASON_SHUTDOWN).await;
        }
        self.mark_clean_shutdown();
    }

    /// Background tasks, in dependency order:
    /// 1. Fault listener (engine loop faults -> forced disable)
    /// 2. Metrics pump (snapshots, heartbeat, auto-adjust)
    /// 3. Watchdog (stale heartbeat / dead engine -> forced disable)
    fn start_background(&self) {
        let t = &self.shared.tunables;
        let mut tasks = Vec::with_capacity(3);
        tasks.push(self.start_fault_listener());
        tasks.push(self.start_periodic("metrics", t.metrics_interval, |c| async move {
            c.metrics_tick();
        }));
        tasks.push(self.start_periodic("watchdog", t.watchdog_tick, |c| async move {
            c.watchdog_tick().await;
        }));
        lock(&self.shared.tasks).extend(tasks);
        tracing::info!(
            "Background tasks started (metrics every {:?}, watchdog every {:?})",
            t.metrics_interval,
            t.watchdog_tick
        );
    }

    fn stop_background(&self) {
        for task in lock(&self.shared.tasks).drain(..) {
            task.abort();
        }
    }

    fn start_periodic<F, Fut>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(StateCoordinator) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        let period = config::timer_period(period);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(coordinator) = Self::upgrade(&weak) else {
                    break;
                };
                tick(coordinator).await;
            }
            tracing::debug!("{name} task stopped");
        })
    }

    fn start_fault_listener(&self) -> JoinHandle<()> {
        let mut faults = self.shared.engine.subscribe_faults();
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(fault) = faults.recv().await {
                let Some(coordinator) = Self::upgrade(&weak) else {
                    break;
                };
                coordinator.shared.telemetry.publish(CoordinatorEvent::EngineFault {
                    loop_name: fault.loop_name.clone(),
                    message: fault.message.clone(),
                });
                coordinator.disable_if_faulted().await;
            }
        })
    }

    async fn disable_if_faulted(&self) {
        let _gate = self.shared.gate.lock().await;
        // A queued report may belong to an engine that was already replaced.
        if self.shared.engine.state() != EngineState::Faulted {
            return;
        }
        tracing::warn!("Engine faulted; forcing disable");
        self.disable_locked(REASON_ENGINE_FAULT).await;
    }

    // -- mutations ---------------------------------------------------------

    async fn acquire_gate(&self, cancel: &CancellationToken) -> Result<tokio::sync::MutexGuard<'_, ()>, BypassError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BypassError::Cancelled),
            guard = self.shared.gate.lock() => Ok(guard),
        }
    }

    /// Apply `options`. All-off options disable the bypass.
    pub async fn apply(&self, options: TlsOptions, cancel: &CancellationToken) -> Result<(), BypassError> {
        let _gate = self.acquire_gate(cancel).await?;
        self.apply_locked(options, cancel).await
    }

    /// Disable, then apply `options`, as one operation under the gate.
    pub async fn disable_then_apply(&self, options: TlsOptions, cancel: &CancellationToken) -> Result<(), BypassError> {
        let _gate = self.acquire_gate(cancel).await?;
        self.disable_locked("preemptive_disable").await;
        self.apply_locked(options, cancel).await
    }

    /// Cancellation is honored only while waiting for the gate.
    pub async fn disable(&self, reason: &str, cancel: &CancellationToken) -> Result<(), BypassError> {
        let _gate = self.acquire_gate(cancel).await?;
        self.disable_locked(reason).await;
        Ok(())
    }

    async fn apply_locked(&self, options: TlsOptions, cancel: &CancellationToken) -> Result<(), BypassError> {
        let options = options.normalize();
        if cancel.is_cancelled() {
            return Err(BypassError::Cancelled);
        }

        let targets = if options.drop_udp443 && !options.drop_udp443_global {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BypassError::Cancelled),
                targets = self.selective_udp443_targets() => targets,
            }
        } else {
            Vec::new()
        };

        if let Some(delay) = self.shared.apply_delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Apply cancelled before the engine was touched");
                    return Err(BypassError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let result = self.shared.engine.enable(options.to_profile(targets)).await;
        if cancel.is_cancelled() {
            tracing::warn!("Apply cancelled mid-flight; disabling");
            self.disable_locked("apply_cancelled").await;
            return Err(BypassError::Cancelled);
        }
        if let Err(e) = result {
            tracing::error!("Apply failed: {e}");
            self.disable_locked("apply_failed").await;
            return Err(e);
        }

        let on = options.is_any_enabled();
        let strategy = options.readable_strategy();
        *lock(&self.shared.options) = options;
        {
            let mut clock = lock(&self.shared.clock);
            let now = Instant::now();
            *clock = Clock::default();
            if on {
                clock.last_activated = Some(now);
                clock.last_metrics_event = Some(now);
            }
        }
        *lock(&self.shared.watchdog) = Watchdog::new();

        let reason = if on {
            self.shared.journal.set_bypass_active(true, "apply");
            self.schedule_outcome_probe();
            "apply"
        } else {
            self.shared.journal.set_bypass_active(false, "apply_disable");
            self.cancel_outcome_probe();
            "apply_disable"
        };
        tracing::info!("Applied: {strategy} (engine {:?})", self.shared.engine.state());
        self.publish_state(reason);
        Ok(())
    }

    async fn disable_locked(&self, reason: &str) {
        self.shared.engine.disable().await;
        *lock(&self.shared.options) = TlsOptions::default();
        *lock(&self.shared.clock) = Clock::default();
        *lock(&self.shared.watchdog) = Watchdog::new();
        self.shared.journal.set_bypass_active(false, reason);
        self.cancel_outcome_probe();
        tracing::info!("Bypass disabled ({reason})");
        self.publish_state(reason);
    }

    fn publish_state(&self, reason: &str) {
        let options = self.options_snapshot();
        self.shared.telemetry.publish(CoordinatorEvent::StateChanged {
            state: self.shared.engine.state(),
            bypass_on: options.is_any_enabled(),
            strategy: options.readable_strategy(),
            reason: reason.to_string(),
        });
        self.shared.telemetry.publish_activation(self.activation_status_snapshot());
    }

    // -- watchdog & metrics --------------------------------------------------

    /// One watchdog pass. Waits for any apply in flight before deciding.
    pub async fn watchdog_tick(&self) -> WatchdogDecision {
        let _gate = self.shared.gate.lock().await;
        let bypass_on = self.is_bypass_on();
        if bypass_on {
            self.shared.journal.set_bypass_active(true, "bypass_active");
        }
        let last_event = lock(&self.shared.clock).last_metrics_event;
        let decision = lock(&self.shared.watchdog).tick(
            bypass_on,
            self.shared.engine.is_running(),
            last_event,
            Instant::now(),
            self.shared.tunables.watchdog_stale,
            self.shared.tunables.engine_grace,
        );
        match decision {
            WatchdogDecision::Disable(reason) => {
                tracing::warn!("Watchdog forcing disable: {reason}");
                self.disable_locked(reason).await;
            }
            WatchdogDecision::Waiting => tracing::debug!("Watchdog: engine not running yet"),
            WatchdogDecision::Idle | WatchdogDecision::Healthy => {}
        }
        decision
    }

    /// Pull metrics, publish them, refresh the heartbeat and run the tuners.
    fn metrics_tick(&self) {
        if !self.shared.engine.is_running() {
            self.shared.telemetry.publish_activation(self.activation_status_snapshot());
            return;
        }
        let snapshot = self.shared.engine.metrics_snapshot();
        let options = self.options_snapshot();
        let on = options.is_any_enabled();
        {
            let mut clock = lock(&self.shared.clock);
            let now = Instant::now();
            clock.last_metrics = Some((now, snapshot.clone()));
            if on {
                clock.last_metrics_event = Some(now);
            }
        }
        if on {
            self.shared.journal.touch_heartbeat("metrics");
        }

        let verdict = metrics::verdict(&snapshot, options.fragment_threshold(), &options.readable_strategy());
        let proposal = {
            let mut tuners = lock(&self.shared.tuners);
            match tuners.aggressive.try_adjust(&options, &snapshot, &verdict) {
                Some(sizes) => Some(TlsOptions {
                    fragment_sizes: sizes,
                    ..options.clone()
                }),
                None => tuners.auto_ttl.try_adjust(&options, &snapshot),
            }
        };
        self.shared.telemetry.publish(CoordinatorEvent::Metrics { snapshot, verdict });
        self.shared.telemetry.publish_activation(self.activation_status_snapshot());

        if let Some(adjusted) = proposal {
            let weak = Arc::downgrade(&self.shared);
            tokio::spawn(async move {
                let Some(coordinator) = Self::upgrade(&weak) else {
                    return;
                };
                if let Err(e) = coordinator.reapply_adjusted(&options, adjusted).await {
                    tracing::warn!("Auto-adjust re-apply failed: {e}");
                }
            });
        }
    }

    /// Re-apply a tuner proposal unless the options changed since it was made.
    pub(crate) async fn reapply_adjusted(&self, expected: &TlsOptions, adjusted: TlsOptions) -> Result<bool, BypassError> {
        let _gate = self.shared.gate.lock().await;
        let unchanged = *lock(&self.shared.options) == *expected;
        if !unchanged {
            tracing::debug!("Options changed since the auto-adjust proposal; dropping it");
            return Ok(false);
        }
        tracing::info!("Auto-adjust re-apply: {}", adjusted.readable_strategy());
        self.apply_locked(adjusted, &CancellationToken::new()).await?;
        Ok(true)
    }

    // -- targets -------------------------------------------------------------

    pub fn remember_active_target(&self, policy: ActiveTargetPolicy) {
        if !policy.candidate_endpoints.is_empty() {
            self.shared
                .observed_ips
                .seed_endpoints(&policy.host_key, &policy.candidate_endpoints);
        }
        self.shared.active_targets.remember(policy);
    }

    pub fn update_active_target_candidates(&self, host: &str, endpoints: &[String]) {
        self.shared.observed_ips.seed_endpoints(host, endpoints);
        self.shared.active_targets.update_candidates(host, endpoints);
    }

    pub fn clear_active_targets(&self) {
        self.shared.active_targets.clear();
    }

    /// Most recent first, with the outcome target in front.
    pub fn active_targets_snapshot(&self) -> Vec<ActiveTargetPolicy> {
        let preferred = self.outcome_target_host();
        self.shared.active_targets.snapshot(Some(&preferred))
    }

    /// Record an observed destination of `host` and, when selective UDP/443
    /// dropping is running and the target set grew, re-apply with it.
    pub async fn refresh_udp443_from_observed_ip(
        &self,
        host: &str,
        ip: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<bool, BypassError> {
        self.update_active_target_candidates(host, &[ip.to_string()]);

        let _gate = self.acquire_gate(cancel).await?;
        let options = self.options_snapshot();
        if !options.drop_udp443 || options.drop_udp443_global || !self.shared.engine.is_running() {
            return Ok(false);
        }
        let targets = self.selective_udp443_targets().await;
        if self.shared.engine.profile().udp443_targets == targets {
            return Ok(false);
        }
        tracing::info!("Selective UDP/443 targets changed ({} address(es)); re-applying", targets.len());
        self.apply_locked(options, cancel).await?;
        Ok(true)
    }

    /// Sorted union of the observed addresses of every active target plus the
    /// outcome host. Cold entries get one DNS resolve each.
    async fn selective_udp443_targets(&self) -> Vec<Ipv4Addr> {
        let preferred = self.outcome_target_host();
        let mut hosts: Vec<String> = Vec::new();
        if !preferred.is_empty() {
            hosts.push(preferred.clone());
        }
        for policy in self.shared.active_targets.snapshot(Some(&preferred)) {
            if !policy.candidate_endpoints.is_empty() {
                self.shared
                    .observed_ips
                    .seed_endpoints(&policy.host_key, &policy.candidate_endpoints);
            }
            hosts.push(policy.host_key);
        }
        let mut seen = std::collections::HashSet::new();
        hosts.retain(|h| host_key(h).is_some_and(|k| seen.insert(k)));

        let timeout = Duration::from_millis(config::UDP443_DNS_TIMEOUT_MS);
        let mut ips = Vec::new();
        for host in &hosts {
            ips.extend(
                self.shared
                    .observed_ips
                    .get_or_seed(host, self.shared.resolver.as_ref(), timeout)
                    .await,
            );
        }
        ips.sort();
        ips.dedup();
        if ips.len() > config::UDP443_TARGET_CAP {
            tracing::warn!("Selective UDP/443 list truncated from {} to {}", ips.len(), config::UDP443_TARGET_CAP);
            ips.truncate(config::UDP443_TARGET_CAP);
        }
        tracing::debug!("Selective UDP/443 targets for {} host(s): {:?}", hosts.len(), ips);
        ips
    }

    // -- outcome probe -------------------------------------------------------

    pub fn set_outcome_target_host(&self, host: &str) {
        lock(&self.shared.outcome).target_host = host.trim().to_string();
    }

    pub fn outcome_target_host(&self) -> String {
        lock(&self.shared.outcome).target_host.clone()
    }

    pub fn outcome_status_snapshot(&self) -> OutcomeSnapshot {
        if !self.is_bypass_on() {
            return OutcomeSnapshot::unknown("bypass off");
        }
        lock(&self.shared.outcome).last.clone()
    }

    /// Probe now, against `host_override` or the configured target.
    pub async fn run_outcome_probe_now(
        &self,
        host_override: Option<&str>,
        timeout_override: Option<Duration>,
        cancel: &CancellationToken,
    ) -> OutcomeSnapshot {
        if !self.is_bypass_on() {
            return OutcomeSnapshot::unknown("bypass off");
        }
        let host = host_override
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.outcome_target_host());
        if host.is_empty() {
            return OutcomeSnapshot::unknown("no outcome target host");
        }
        let timeout = timeout_override.unwrap_or(self.shared.tunables.outcome_timeout);
        let snapshot = self.probe(&host, timeout, cancel.clone()).await;
        if !cancel.is_cancelled() {
            self.record_outcome(snapshot.clone());
        }
        snapshot
    }

    async fn probe(&self, host: &str, timeout: Duration, cancel: CancellationToken) -> OutcomeSnapshot {
        let weak = Arc::downgrade(&self.shared);
        let on_connected: FlowCallback = Arc::new(move |local, remote| {
            if let Some(shared) = weak.upgrade() {
                shared.engine.register_probe_flow(ConnectionKey::from_sockets(local, remote));
            }
        });
        self.shared.prober.probe(host, timeout, on_connected, cancel).await
    }

    fn record_outcome(&self, snapshot: OutcomeSnapshot) {
        lock(&self.shared.outcome).last = snapshot.clone();
        self.shared.telemetry.publish(CoordinatorEvent::Outcome(snapshot));
    }

    fn schedule_outcome_probe(&self) {
        let token = CancellationToken::new();
        let host = {
            let mut state = lock(&self.shared.outcome);
            if let Some(previous) = state.cancel.take() {
                previous.cancel();
            }
            if state.target_host.is_empty() {
                state.last = OutcomeSnapshot::unknown("no outcome target host");
                return;
            }
            state.cancel = Some(token.clone());
            state.last = OutcomeSnapshot::unknown("outcome probe pending");
            state.target_host.clone()
        };

        let weak = Arc::downgrade(&self.shared);
        let delay = self.shared.tunables.outcome_delay;
        let timeout = self.shared.tunables.outcome_timeout;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(coordinator) = Self::upgrade(&weak) else {
                return;
            };
            let snapshot = coordinator.probe(&host, timeout, token.clone()).await;
            if !token.is_cancelled() {
                coordinator.record_outcome(snapshot);
            }
        });
    }

    fn cancel_outcome_probe(&self) {
        let mut state = lock(&self.shared.outcome);
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        state.last = OutcomeSnapshot::unknown("bypass off");
    }

    #[cfg(test)]
    fn backdate_metrics_event(&self, by: Duration) {
        let mut clock = lock(&self.shared.clock);
        clock.last_metrics_event = Instant::now().checked_sub(by);
    }
}
