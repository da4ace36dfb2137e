//! Core data model shared by the engine and the coordinator.
//!
//! - [`Profile`] / [`TlsStrategy`] / [`RedirectRule`]: immutable engine configuration
//! - [`TlsOptions`]: user-facing options, presets and named-strategy intake
//! - [`BypassMetrics`]: lock-free counters plus the verdict classifier
//! - [`ConnTracker`] / [`ProbeFlows`]: per-connection dedup and probe exclusion
//! - [`dns`]: best-effort resolution with a deadline

pub mod conntrack;
pub mod dns;
pub mod metrics;
pub mod options;
pub mod profile;

pub use conntrack::{ConnTracker, ConnectionKey, ProbeFlows};
pub use metrics::{BypassMetrics, MetricsSnapshot, Verdict, VerdictColor};
pub use options::TlsOptions;
pub use profile::{Profile, RedirectRule, TlsStrategy};
