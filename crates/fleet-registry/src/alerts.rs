//! Site alerts — threshold evaluation and the alerting collaborator.

use async_trait::async_trait;
use tracing::warn;

use fleet_core::config::AlertConfig;
use fleet_core::protocol::HeartbeatMetrics;
use fleet_core::{EventBus, FleetEvent};
use fleet_state::{Alert, AlertType, StateStore};

/// Receives alerts raised by the registry.
///
/// Delivery is best-effort: the registry logs a failed `raise` and carries on.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Default sink: persists the alert row and publishes `AlertRaised`.
pub struct StoreAlertSink {
    state: StateStore,
    events: EventBus,
}

impl StoreAlertSink {
    pub fn new(state: StateStore, events: EventBus) -> Self {
        Self { state, events }
    }
}

#[async_trait]
impl AlertSink for StoreAlertSink {
    async fn raise(&self, alert: &Alert) -> anyhow::Result<()> {
        self.state.put_alert(alert)?;
        warn!(
            site_id = %alert.site_id,
            alert_type = alert.alert_type.as_str(),
            message = %alert.message,
            "alert raised"
        );
        self.events.publish(FleetEvent::AlertRaised {
            site_id: alert.site_id.clone(),
            alert_type: alert.alert_type.as_str().to_string(),
            message: alert.message.clone(),
        });
        Ok(())
    }
}

/// Metrics that breach the configured thresholds.
pub fn evaluate_thresholds(
    config: &AlertConfig,
    metrics: &HeartbeatMetrics,
) -> Vec<(AlertType, String)> {
    let mut breaches = Vec::new();

    if let Some(t) = metrics.temperature_c {
        if t > config.max_temperature_c {
            breaches.push((
                AlertType::HighTemperature,
                format!("temperature {t:.1}°C exceeds {:.1}°C", config.max_temperature_c),
            ));
        }
    }
    if let Some(d) = metrics.disk_percent {
        if d > config.max_disk_percent {
            breaches.push((
                AlertType::LowDisk,
                format!("disk usage {d:.1}% exceeds {:.1}%", config.max_disk_percent),
            ));
        }
    }
    if let Some(m) = metrics.memory_percent {
        if m > config.max_memory_percent {
            breaches.push((
                AlertType::HighMemory,
                format!("memory usage {m:.1}% exceeds {:.1}%", config.max_memory_percent),
            ));
        }
    }

    breaches
}
