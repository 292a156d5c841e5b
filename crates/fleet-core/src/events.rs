//! In-process notification events.
//!
//! Components publish onto a shared broadcast channel; publishing never
//! fails even when nobody is subscribed.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the event channel.
pub const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    SiteOnline {
        site_id: String,
        address: Option<String>,
    },
    SiteOffline {
        site_id: String,
    },
    AlertRaised {
        site_id: String,
        alert_type: String,
        message: String,
    },
    CommandCompleted {
        command_id: String,
        site_id: String,
    },
    CommandFailed {
        command_id: String,
        site_id: String,
        error: String,
    },
    CommandTimedOut {
        command_id: String,
        site_id: String,
        timeout_secs: u64,
    },
    DeploymentFinished {
        deployment_id: String,
        status: String,
    },
    CanaryPhaseChanged {
        canary_id: String,
        phase: String,
    },
}

/// Cloneable publisher handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when there are no subscribers.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
