//! Centralized runtime constants and environment-tunable timings.
//!
//! Every interval, threshold and cap lives here so it can be found and adjusted
//! in one place. Timings that operators may need to change in the field are
//! also exposed through [`Tunables`], which reads `DPIGUARD_*` environment
//! variables. For every tunable, `0` is a valid explicit value; only an unset
//! or unparsable variable falls back to the default.

use std::path::PathBuf;
use std::time::Duration;

/// Default watchdog tick (milliseconds).
pub const WATCHDOG_TICK_MS: u64 = 60_000;

/// Metrics/heartbeat silence after which the watchdog force-disables (milliseconds).
pub const WATCHDOG_STALE_MS: u64 = 120_000;

/// Time an activated engine may spend not running before it is declared dead (milliseconds).
pub const ENGINE_GRACE_MS: u64 = 15_000;

/// Activation warm-up: no verdict of "not activated" before this elapses (milliseconds).
pub const ACTIVATION_WARMUP_MS: u64 = 15_000;

/// Activation: no relevant traffic for this long after activation reports `NoTraffic` (milliseconds).
pub const ACTIVATION_NO_TRAFFIC_MS: u64 = 15_000;

/// Activation: metrics snapshot older than this reports `EngineDead` (milliseconds).
pub const ACTIVATION_STALE_MS: u64 = 120_000;

/// Delay between an apply and the automatic outcome probe (milliseconds).
pub const OUTCOME_DELAY_MS: u64 = 12_000;

/// Total budget for one outcome probe (milliseconds).
pub const OUTCOME_TIMEOUT_MS: u64 = 6_000;

/// Interval at which the coordinator pulls engine metrics (milliseconds).
pub const METRICS_INTERVAL_MS: u64 = 2_000;

/// How long a probe flow stays excluded from user-facing counters (milliseconds).
pub const PROBE_FLOW_TTL_MS: u64 = 30_000;

/// Probe-flow map size above which expired entries are swept.
pub const PROBE_FLOW_SWEEP_THRESHOLD: usize = 64;

/// Idle time after which a tracked connection is forgotten (seconds).
pub const CONNECTION_IDLE_TTL_SECS: u64 = 300;

/// Interval of the connection-tracker sweep (seconds).
pub const CONNECTION_SWEEP_INTERVAL_SECS: u64 = 60;

/// Per-host DNS timeout when resolving redirect-rule hosts (milliseconds).
pub const REDIRECT_DNS_TIMEOUT_MS: u64 = 2_000;

/// Upper bound on waiting for one interception loop to exit on disable (milliseconds).
pub const LOOP_JOIN_TIMEOUT_MS: u64 = 2_000;

/// Back-off after a transient receive error (milliseconds).
pub const RECV_ERROR_BACKOFF_MS: u64 = 100;

/// Receive buffer size; large enough for any IP packet.
pub const RECV_BUFFER_SIZE: usize = 65_535;

/// Driver priority of the RST-suppression handle.
pub const PRIORITY_RST: i16 = 0;

/// Driver priority of the TLS-mutation handle.
pub const PRIORITY_TLS: i16 = 200;

/// Driver priority of the port-redirection handle.
pub const PRIORITY_REDIRECT: i16 = 0;

/// Port the TLS strategies act on.
pub const TLS_PORT: u16 = 443;

/// Port the HTTP Host tricks act on.
pub const HTTP_PORT: u16 = 80;

/// Default first-fragment size and fallback split offset (bytes).
pub const DEFAULT_FIRST_FRAGMENT_SIZE: usize = 64;

/// Default minimum payload length before a ClientHello is mutated (bytes).
pub const DEFAULT_FRAGMENT_THRESHOLD: usize = 128;

/// Smallest fragment chunk any plan may use (bytes).
pub const MIN_FRAGMENT_SIZE: usize = 4;

/// Largest number of configured fragment sizes.
pub const MAX_FRAGMENT_SIZES: usize = 4;

/// Amount subtracted from the sequence number of a fake packet.
pub const FAKE_SEQ_OFFSET: u32 = 10_000;

/// IP TTL of a fake packet. Empirically tuned; kept configurable per profile.
pub const DEFAULT_FAKE_TTL: u8 = 8;

/// Default TTL of the TTL-trick decoy.
pub const DEFAULT_TTL_TRICK: u8 = 3;

/// TTL deviation from the learned per-peer baseline that marks an RST as injected.
pub const RST_TTL_TOLERANCE: u8 = 2;

/// How long a learned peer TTL baseline stays valid (seconds).
pub const RST_BASELINE_TTL_SECS: u64 = 300;

/// Upper bound on the number of peers with a learned TTL baseline.
pub const RST_BASELINE_CAP: usize = 4096;

/// How far into a payload the HTTP `Host:` header is searched (bytes).
pub const HTTP_HOST_SEARCH_LIMIT: usize = 1024;

/// Per-host cap of the observed-IP cache.
pub const OBSERVED_IP_CAP: usize = 16;

/// Lifetime of an observed IP (seconds).
pub const OBSERVED_IP_TTL_SECS: u64 = 600;

/// Cap of the active-target set.
pub const ACTIVE_TARGET_CAP: usize = 4;

/// Lifetime of an active target (seconds).
pub const ACTIVE_TARGET_TTL_SECS: u64 = 1_200;

/// Deadline of the one DNS resolve that seeds a cold observed-IP entry (milliseconds).
pub const UDP443_DNS_TIMEOUT_MS: u64 = 1_500;

/// Upper bound on selective UDP/443 destinations in one profile.
pub const UDP443_TARGET_CAP: usize = 64;

/// Continuous green verdict required before the aggressive preset is tightened (seconds).
pub const AGGRESSIVE_GREEN_STREAK_SECS: u64 = 30;

/// Minimum observation window of one auto-TTL trial (seconds).
pub const AUTO_TTL_TRIAL_SECS: u64 = 12;

/// ClientHellos that must be observed before auto-TTL starts.
pub const AUTO_TTL_MIN_OBSERVED: u64 = 3;

/// Base TTL candidates trialled by auto-TTL.
pub const AUTO_TTL_CANDIDATES: [u8; 4] = [5, 10, 15, 20];

/// Capacity of the coordinator event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Artificial delay inserted into apply in smoke mode so cancellation races are reproducible (milliseconds).
pub const SMOKE_APPLY_DELAY_MS: u64 = 25;

/// Set to `1` to run the binary in smoke mode.
pub const SMOKE_ENV: &str = "DPIGUARD_SMOKE";

/// Environment variable overriding the session journal path.
pub const SESSION_PATH_ENV: &str = "DPIGUARD_SESSION_PATH";

/// Timings read once at coordinator construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    pub watchdog_tick: Duration,
    pub watchdog_stale: Duration,
    pub engine_grace: Duration,
    pub activation_warmup: Duration,
    pub activation_no_traffic: Duration,
    pub activation_stale: Duration,
    pub outcome_delay: Duration,
    pub outcome_timeout: Duration,
    pub metrics_interval: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            watchdog_tick: Duration::from_millis(WATCHDOG_TICK_MS),
            watchdog_stale: Duration::from_millis(WATCHDOG_STALE_MS),
            engine_grace: Duration::from_millis(ENGINE_GRACE_MS),
            activation_warmup: Duration::from_millis(ACTIVATION_WARMUP_MS),
            activation_no_traffic: Duration::from_millis(ACTIVATION_NO_TRAFFIC_MS),
            activation_stale: Duration::from_millis(ACTIVATION_STALE_MS),
            outcome_delay: Duration::from_millis(OUTCOME_DELAY_MS),
            outcome_timeout: Duration::from_millis(OUTCOME_TIMEOUT_MS),
            metrics_interval: Duration::from_millis(METRICS_INTERVAL_MS),
        }
    }
}

impl Tunables {
    /// Read every tunable from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read every tunable through `lookup`, so tests need not touch the real environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let ms = |name: &str, default: u64| {
            Duration::from_millis(parse_ms(lookup(name).as_deref()).unwrap_or(default))
        };
        Self {
            watchdog_tick: ms("DPIGUARD_WATCHDOG_TICK_MS", WATCHDOG_TICK_MS),
            watchdog_stale: ms("DPIGUARD_WATCHDOG_STALE_MS", WATCHDOG_STALE_MS),
            engine_grace: ms("DPIGUARD_ENGINE_GRACE_MS", ENGINE_GRACE_MS),
            activation_warmup: ms("DPIGUARD_ACTIVATION_WARMUP_MS", ACTIVATION_WARMUP_MS),
            activation_no_traffic: ms(
                "DPIGUARD_ACTIVATION_NO_TRAFFIC_MS",
                ACTIVATION_NO_TRAFFIC_MS,
            ),
            activation_stale: ms("DPIGUARD_ACTIVATION_STALE_MS", ACTIVATION_STALE_MS),
            outcome_delay: ms("DPIGUARD_OUTCOME_DELAY_MS", OUTCOME_DELAY_MS),
            outcome_timeout: ms("DPIGUARD_OUTCOME_TIMEOUT_MS", OUTCOME_TIMEOUT_MS),
            metrics_interval: ms("DPIGUARD_METRICS_INTERVAL_MS", METRICS_INTERVAL_MS),
        }
    }
}

/// Parse a millisecond override. `Some(0)` is a legitimate explicit value.
pub fn parse_ms(raw: Option<&str>) -> Option<u64> {
    raw?.trim().parse::<u64>().ok()
}

/// Timer periods must be non-zero; an explicit `0` means "as fast as possible".
pub fn timer_period(d: Duration) -> Duration {
    d.max(Duration::from_millis(1))
}

/// Location of the crash-recovery journal.
pub fn session_journal_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SESSION_PATH_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    default_state_dir().join("dpiguard").join("bypass_session.json")
}

fn default_state_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(dir) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(dir);
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".local").join("state");
        }
    }
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_ms_accepts_zero_explicitly() {
        assert_eq!(parse_ms(Some("0")), Some(0));
        assert_eq!(parse_ms(Some(" 250 ")), Some(250));
        assert_eq!(parse_ms(Some("-5")), None);
        assert_eq!(parse_ms(Some("abc")), None);
        assert_eq!(parse_ms(None), None);
    }

    #[test]
    fn test_tunables_default_when_unset() {
        let t = Tunables::from_lookup(|_| None);
        assert_eq!(t, Tunables::default());
        assert_eq!(t.watchdog_tick, Duration::from_secs(60));
        assert_eq!(t.watchdog_stale, Duration::from_secs(120));
        assert_eq!(t.engine_grace, Duration::from_secs(15));
    }

    #[test]
    fn test_tunables_zero_override_is_distinct_from_unset() {
        let env: HashMap<&str, &str> = [
            ("DPIGUARD_ACTIVATION_WARMUP_MS", "0"),
            ("DPIGUARD_OUTCOME_DELAY_MS", "1500"),
            ("DPIGUARD_WATCHDOG_STALE_MS", "garbage"),
        ]
        .into_iter()
        .collect();
        let t = Tunables::from_lookup(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(t.activation_warmup, Duration::ZERO);
        assert_eq!(t.outcome_delay, Duration::from_millis(1500));
        assert_eq!(t.watchdog_stale, Duration::from_millis(WATCHDOG_STALE_MS));
    }

    #[test]
    fn test_timer_period_never_zero() {
        assert_eq!(timer_period(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(timer_period(Duration::from_secs(2)), Duration::from_secs(2));
    }

    /// Compile-time sanity: all caps and sizes are positive.
    #[test]
    fn test_all_caps_positive() {
        const _: () = assert!(OBSERVED_IP_CAP > 0);
        const _: () = assert!(ACTIVE_TARGET_CAP > 0);
        const _: () = assert!(MAX_FRAGMENT_SIZES > 0);
        const _: () = assert!(MIN_FRAGMENT_SIZE > 0);
        const _: () = assert!(DEFAULT_FIRST_FRAGMENT_SIZE >= MIN_FRAGMENT_SIZE);
        const _: () = assert!(DEFAULT_FAKE_TTL > 0);
        const _: () = assert!(EVENT_CHANNEL_CAPACITY > 0);
    }
}
