//! dpiguard: in-flight TLS ClientHello mutation against DPI middleboxes.
//!
//! Layers, bottom up:
//! - [`codec`]: header parsing, ClientHello/SNI location, header rewrites
//! - [`strategies`]: per-packet mutation policies (split, disorder, fake, RST, QUIC, redirect)
//! - [`capture`]: the packet driver seam and the interception loops
//! - [`engine`]: handle/loop lifecycle for one active [`core::Profile`]
//! - [`coordinator`]: the single writer of engine state, with watchdog,
//!   crash-recovery journal, activation/outcome status and auto-adjust

pub mod capture;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod engine;
pub mod error;
pub mod strategies;

pub use coordinator::telemetry::CoordinatorEvent;
pub use coordinator::StateCoordinator;
pub use core::{Profile, TlsOptions, TlsStrategy};
pub use engine::EngineState;
pub use error::BypassError;

/// Install the panic hook and the `tracing` subscriber. Safe to call twice.
pub fn init_tracing() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in dpiguard: {info}");
        default_hook(info);
    }));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dpiguard=info".into()),
        )
        .try_init();
}
