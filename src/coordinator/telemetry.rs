//! Coordinator event fan-out.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

use super::activation::{ActivationSnapshot, ActivationStatus};
use super::outcome::OutcomeSnapshot;
use crate::config;
use crate::core::{MetricsSnapshot, Verdict};
use crate::engine::EngineState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    StateChanged {
        state: EngineState,
        bypass_on: bool,
        strategy: String,
        reason: String,
    },
    Metrics {
        snapshot: MetricsSnapshot,
        verdict: Verdict,
    },
    Activation(ActivationSnapshot),
    Outcome(OutcomeSnapshot),
    EngineFault {
        loop_name: String,
        message: String,
    },
}

/// Broadcast publisher. Subscribers that fall behind lose the oldest events.
pub struct Telemetry {
    tx: broadcast::Sender<CoordinatorEvent>,
    last_activation: Mutex<Option<ActivationStatus>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(config::EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            last_activation: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CoordinatorEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    /// Publish only when the status differs from the last published one.
    pub fn publish_activation(&self, snapshot: ActivationSnapshot) {
        {
            let mut last = self.last_activation.lock().unwrap_or_else(PoisonError::into_inner);
            if *last == Some(snapshot.status) {
                return;
            }
            *last = Some(snapshot.status);
        }
        tracing::info!("Activation: {} ({})", snapshot.text, snapshot.details);
        self.publish(CoordinatorEvent::Activation(snapshot));
    }
}
