//! `dpiguard [preset | strategy-id]`
//!
//! Runs crash recovery, applies the requested options and holds them until
//! Ctrl-C. A preset name (Standard, Moderate, Aggressive) or a strategy id
//! such as `TLS_FAKE_DISORDER` is accepted; the default is Standard.

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use dpiguard::capture::default_driver;
use dpiguard::{config, StateCoordinator, TlsOptions};

fn options_from_arg(arg: Option<&str>) -> anyhow::Result<TlsOptions> {
    let arg = arg.unwrap_or(dpiguard::core::options::PRESET_STANDARD);
    if let Some(preset) = TlsOptions::preset(arg) {
        return Ok(preset);
    }
    TlsOptions::from_strategy(arg, &serde_json::Value::Null)
        .with_context(|| format!("'{arg}' is neither a preset nor a strategy id"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dpiguard::init_tracing();

    let arg = std::env::args().nth(1);
    let options = options_from_arg(arg.as_deref())?;

    let mut builder = StateCoordinator::builder(default_driver());
    if std::env::var(config::SMOKE_ENV).is_ok_and(|v| v == "1") {
        tracing::info!("Smoke mode: applies are delayed by {}ms", config::SMOKE_APPLY_DELAY_MS);
        builder = builder.smoke_mode();
    }
    let coordinator = builder.build();

    let cancel = CancellationToken::new();
    coordinator.initialize_on_startup(&cancel).await?;

    if let Err(e) = coordinator.apply(options, &cancel).await {
        tracing::error!("Failed to enable bypass: {e}");
        coordinator.shutdown().await;
        return Err(e.into());
    }
    tracing::info!(
        "Bypass active: {} (Ctrl-C to stop)",
        coordinator.options_snapshot().readable_strategy()
    );

    let mut events = coordinator.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!("Ctrl-C handler failed: {e}");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        tracing::debug!("{line}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event log skipped {n} event(s)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Shutting down");
    coordinator.shutdown().await;
    Ok(())
}
