//! Connection registry — the set of live site channels.
//!
//! A site has at most one live channel. A newer authenticated connection
//! for the same site replaces the older one; the older connection's
//! eventual disconnect is recognised by its connection id and ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use fleet_core::config::AlertConfig;
use fleet_core::protocol::{
    AuthenticateRequest, HeartbeatMetrics, LocalStateReport, OutboundMessage,
};
use fleet_core::{EventBus, FleetEvent, epoch_millis};
use fleet_state::{Alert, AlertType, HeartbeatSample, SiteId, StateStore};

use crate::alerts::{AlertSink, evaluate_thresholds};
use crate::auth::verify_credential;
use crate::error::{RegistryError, RegistryResult};

/// Catch-up procedure run when a site (re)authenticates.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn on_reconnect(&self, site_id: &str) -> anyhow::Result<()>;
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { connection_id: u64 },
    Rejected(String),
}

/// Tally of a fan-out send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub success_count: u32,
    pub failure_count: u32,
}

/// Outcome of comparing a site's reported configuration with the desired one.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSync {
    InSync,
    /// The site runs something else; `desired` should be pushed.
    Drift {
        desired: serde_json::Value,
        desired_hash: String,
    },
}

struct SiteChannel {
    connection_id: u64,
    sender: mpsc::UnboundedSender<OutboundMessage>,
    address: Option<String>,
}

/// Tracks which sites are connected right now and how to reach them.
pub struct ConnectionRegistry {
    state: StateStore,
    events: EventBus,
    alerts: Arc<dyn AlertSink>,
    alert_config: AlertConfig,
    /// Live channels: site_id → channel.
    channels: RwLock<HashMap<SiteId, SiteChannel>>,
    next_connection_id: AtomicU64,
    hooks: RwLock<Vec<Arc<dyn ReconnectHook>>>,
}

impl ConnectionRegistry {
    pub fn new(state: StateStore, events: EventBus, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            state,
            events,
            alerts,
            alert_config: AlertConfig::default(),
            channels: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Override heartbeat alert thresholds.
    pub fn with_alert_config(mut self, config: AlertConfig) -> Self {
        self.alert_config = config;
        self
    }

    /// Register a procedure to run on every successful authentication.
    pub async fn add_reconnect_hook(&self, hook: Arc<dyn ReconnectHook>) {
        debug!(hook = hook.name(), "reconnect hook registered");
        self.hooks.write().await.push(hook);
    }

    /// Authenticate a connecting site and register its channel.
    ///
    /// On rejection nothing is registered or persisted.
    pub async fn authenticate(
        &self,
        request: &AuthenticateRequest,
        address: Option<String>,
        sender: mpsc::UnboundedSender<OutboundMessage>,
    ) -> RegistryResult<AuthOutcome> {
        let site_id = request.site_id.as_str();

        let Some(site) = self.state.get_site(site_id)? else {
            warn!(%site_id, "authentication for unknown site");
            return Ok(AuthOutcome::Rejected("invalid credentials".to_string()));
        };
        if !verify_credential(&request.credential, &site.secret_hash) {
            warn!(%site_id, "authentication with bad credential");
            return Ok(AuthOutcome::Rejected("invalid credentials".to_string()));
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let _ = sender.send(OutboundMessage::Authenticated {
            site_id: site_id.to_string(),
        });

        let superseded = {
            let mut channels = self.channels.write().await;
            channels.insert(
                site_id.to_string(),
                SiteChannel {
                    connection_id,
                    sender,
                    address: address.clone(),
                },
            )
        };
        if let Some(old) = superseded {
            info!(%site_id, old_connection = old.connection_id, "previous connection superseded");
        }

        let now = epoch_millis();
        self.state.update_site(site_id, |s| {
            s.online = true;
            s.last_seen = Some(now);
            if address.is_some() {
                s.last_address = address.clone();
            }
        })?;

        info!(%site_id, connection_id, address = ?address, "site authenticated");
        self.events.publish(FleetEvent::SiteOnline {
            site_id: site_id.to_string(),
            address,
        });

        self.run_reconnect_hooks(site_id).await;
        Ok(AuthOutcome::Accepted { connection_id })
    }

    /// Spawn every reconnect hook as its own task.
    async fn run_reconnect_hooks(&self, site_id: &str) {
        let hooks = self.hooks.read().await.clone();
        for hook in hooks {
            let site_id = site_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = hook.on_reconnect(&site_id).await {
                    warn!(%site_id, hook = hook.name(), error = %e, "reconnect catch-up failed");
                }
            });
        }
    }

    /// Handle a closed connection.
    ///
    /// Returns `false` when `connection_id` no longer owns the site's slot
    /// (a newer connection superseded it); nothing changes in that case.
    pub async fn on_disconnect(&self, site_id: &str, connection_id: u64) -> bool {
        {
            let mut channels = self.channels.write().await;
            match channels.get(site_id) {
                Some(ch) if ch.connection_id == connection_id => {
                    channels.remove(site_id);
                }
                _ => {
                    debug!(%site_id, connection_id, "stale disconnect ignored");
                    return false;
                }
            }
        }

        let now = epoch_millis();
        if let Err(e) = self.state.update_site(site_id, |s| {
            s.online = false;
            s.last_seen = Some(now);
        }) {
            warn!(%site_id, error = %e, "failed to persist offline status");
        }

        info!(%site_id, connection_id, "site disconnected");
        self.events.publish(FleetEvent::SiteOffline {
            site_id: site_id.to_string(),
        });

        let alert = new_alert(site_id, AlertType::Offline, "site went offline".to_string(), now);
        if let Err(e) = self.alerts.raise(&alert).await {
            warn!(%site_id, error = %e, "failed to deliver offline alert");
        }
        true
    }

    /// Record a heartbeat and raise any threshold alerts.
    ///
    /// Returns the alert types actually raised (suppressed repeats excluded).
    pub async fn on_heartbeat(
        &self,
        site_id: &str,
        metrics: HeartbeatMetrics,
    ) -> RegistryResult<Vec<AlertType>> {
        let now = epoch_millis();
        let breaches = evaluate_thresholds(&self.alert_config, &metrics);

        let updated = self.state.update_site(site_id, |s| {
            s.online = true;
            s.last_seen = Some(now);
        })?;
        if updated.is_none() {
            return Err(RegistryError::UnknownSite(site_id.to_string()));
        }
        self.state.put_heartbeat(
            &HeartbeatSample {
                site_id: site_id.to_string(),
                recorded_at: now,
                metrics,
            },
            self.alert_config.heartbeat_retention,
        )?;
        debug!(%site_id, "heartbeat recorded");

        let window_ms = self.alert_config.suppression_secs * 1000;
        let mut raised = Vec::new();
        for (alert_type, message) in breaches {
            let recent = self
                .state
                .last_alert(site_id, alert_type)?
                .is_some_and(|a| now.saturating_sub(a.created_at) < window_ms);
            if recent {
                debug!(%site_id, alert_type = alert_type.as_str(), "alert suppressed");
                continue;
            }
            let alert = new_alert(site_id, alert_type, message, now);
            match self.alerts.raise(&alert).await {
                Ok(()) => raised.push(alert_type),
                Err(e) => warn!(%site_id, error = %e, "failed to deliver alert"),
            }
        }
        Ok(raised)
    }

    /// Store the configuration a site reports and compare it to the desired one.
    pub fn on_sync_local_state(
        &self,
        site_id: &str,
        report: &LocalStateReport,
    ) -> RegistryResult<ConfigSync> {
        let updated = self.state.update_site(site_id, |s| {
            s.reported_config_hash = Some(report.config_hash.clone());
            s.reported_config_at = Some(report.timestamp);
            match (&s.desired_config, &s.desired_config_hash) {
                (Some(desired), Some(hash)) if *hash != report.config_hash => {
                    ConfigSync::Drift {
                        desired: desired.clone(),
                        desired_hash: hash.clone(),
                    }
                }
                _ => ConfigSync::InSync,
            }
        })?;
        match updated {
            Some((_, sync)) => {
                if matches!(sync, ConfigSync::Drift { .. }) {
                    info!(%site_id, reported = %report.config_hash, "site configuration drifted");
                }
                Ok(sync)
            }
            None => Err(RegistryError::UnknownSite(site_id.to_string())),
        }
    }

    /// Whether the site has a live channel on this instance.
    pub async fn is_connected(&self, site_id: &str) -> bool {
        self.channels.read().await.contains_key(site_id)
    }

    /// Deliver a message. `false` when the site is not connected.
    pub async fn send(&self, site_id: &str, message: OutboundMessage) -> bool {
        let channels = self.channels.read().await;
        match channels.get(site_id) {
            Some(ch) => ch.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Send the same message to each site independently.
    pub async fn broadcast_to_group(
        &self,
        site_ids: &[SiteId],
        message: &OutboundMessage,
    ) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();
        for site_id in site_ids {
            if self.send(site_id, message.clone()).await {
                summary.success_count += 1;
            } else {
                summary.failure_count += 1;
            }
        }
        debug!(
            success = summary.success_count,
            failure = summary.failure_count,
            "group broadcast sent"
        );
        summary
    }

    /// Broadcast to every site whose row belongs to `group_id`.
    pub async fn broadcast_to_site_group(
        &self,
        group_id: &str,
        message: &OutboundMessage,
    ) -> RegistryResult<BroadcastSummary> {
        let members: Vec<SiteId> = self
            .state
            .list_sites_in_group(group_id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        Ok(self.broadcast_to_group(&members, message).await)
    }

    /// Ids of all connected sites.
    pub async fn connected_sites(&self) -> Vec<SiteId> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Observed address of a connected site.
    pub async fn address_of(&self, site_id: &str) -> Option<String> {
        self.channels
            .read()
            .await
            .get(site_id)
            .and_then(|ch| ch.address.clone())
    }
}

fn new_alert(site_id: &str, alert_type: AlertType, message: String, now: u64) -> Alert {
    Alert {
        id: uuid::Uuid::new_v4().to_string(),
        site_id: site_id.to_string(),
        alert_type,
        message,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::StoreAlertSink;
    use crate::auth::hash_credential;
    use fleet_state::Site;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_site(id: &str, group: Option<&str>) -> Site {
        Site {
            id: id.to_string(),
            name: format!("Venue {id}"),
            group_id: group.map(str::to_string),
            secret_hash: hash_credential("secret"),
            online: false,
            last_seen: None,
            last_address: None,
            pending_config_version: None,
            desired_config: None,
            desired_config_hash: None,
            reported_config_hash: None,
            reported_config_at: None,
            software_version: None,
            created_at: 1,
        }
    }

    fn setup() -> (StateStore, ConnectionRegistry) {
        let state = StateStore::open_in_memory().unwrap();
        let events = EventBus::new();
        let sink = Arc::new(StoreAlertSink::new(state.clone(), events.clone()));
        let registry = ConnectionRegistry::new(state.clone(), events, sink);
        (state, registry)
    }

    fn auth(site_id: &str, credential: &str) -> AuthenticateRequest {
        AuthenticateRequest {
            site_id: site_id.to_string(),
            credential: credential.to_string(),
        }
    }

    async fn connect(
        registry: &ConnectionRegistry,
        site_id: &str,
    ) -> (u64, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        match registry
            .authenticate(&auth(site_id, "secret"), Some("10.0.0.7:5000".to_string()), tx)
            .await
            .unwrap()
        {
            AuthOutcome::Accepted { connection_id } => (connection_id, rx),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct SignalHook {
        calls: Arc<AtomicUsize>,
        done: mpsc::UnboundedSender<&'static str>,
        fail: bool,
        name: &'static str,
    }

    #[async_trait]
    impl ReconnectHook for SignalHook {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_reconnect(&self, _site_id: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.done.send(self.name);
            if self.fail {
                anyhow::bail!("replay blew up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn authenticate_registers_and_marks_online() {
        let (state, registry) = setup();
        state.put_site(&test_site("s1", None)).unwrap();

        let (_, mut rx) = connect(&registry, "s1").await;

        assert!(registry.is_connected("s1").await);
        let site = state.get_site("s1").unwrap().unwrap();
        assert!(site.online);
        assert_eq!(site.last_address.as_deref(), Some("10.0.0.7:5000"));
        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundMessage::Authenticated { site_id: "s1".to_string() }
        );
    }

    #[tokio::test]
    async fn bad_credential_changes_nothing() {
        let (state, registry) = setup();
        state.put_site(&test_site("s1", None)).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = registry.authenticate(&auth("s1", "wrong"), None, tx).await.unwrap();

        assert!(matches!(outcome, AuthOutcome::Rejected(_)));
        assert!(!registry.is_connected("s1").await);
        assert!(!state.get_site("s1").unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn unknown_site_is_rejected() {
        let (_, registry) = setup();
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = registry.authenticate(&auth("ghost", "secret"), None, tx).await.unwrap();
        assert!(matches!(outcome, AuthOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn newer_connection_supersedes_older() {
        let (state, registry) = setup();
        state.put_site(&test_site("s1", None)).unwrap();

        let (first, _rx1) = connect(&registry, "s1").await;
        let (second, mut rx2) = connect(&registry, "s1").await;
        assert_ne!(first, second);
        let _ = rx2.recv().await;

        // The old connection closing must not evict the new one.
        assert!(!registry.on_disconnect("s1", first).await);
        assert!(registry.is_connected("s1").await);

        assert!(registry.send("s1", OutboundMessage::AuthError { message: "x".into() }).await);
        assert!(matches!(rx2.recv().await.unwrap(), OutboundMessage::AuthError { .. }));

        assert!(registry.on_disconnect("s1", second).await);
        assert!(!registry.is_connected("s1").await);
    }

    #[tokio::test]
    async fn disconnect_marks_offline_and_alerts() {
        let (state, registry) = setup();
        state.put_site(&test_site("s1", None)).unwrap();
        let (conn, _rx) = connect(&registry, "s1").await;

        assert!(registry.on_disconnect("s1", conn).await);

        assert!(!state.get_site("s1").unwrap().unwrap().online);
        let alerts = state.list_alerts_for_site("s1").unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Offline);
    }

    #[tokio::test]
    async fn send_to_disconnected_site_is_false() {
        let (_, registry) = setup();
        assert!(!registry.send("nobody", OutboundMessage::AuthError { message: "x".into() }).await);
    }

    #[tokio::test]
    async fn broadcast_counts_each_site() {
        let (state, registry) = setup();
        state.put_site(&test_site("a", Some("north"))).unwrap();
        state.put_site(&test_site("b", Some("north"))).unwrap();
        state.put_site(&test_site("c", Some("north"))).unwrap();
        let (_, _rx_a) = connect(&registry, "a").await;
        let (_, _rx_b) = connect(&registry, "b").await;

        let msg = OutboundMessage::Broadcast {
            topic: "score".to_string(),
            payload: serde_json::json!({"home": 2, "away": 1}),
        };
        let summary = registry.broadcast_to_site_group("north", &msg).await.unwrap();
        assert_eq!(summary, BroadcastSummary { success_count: 2, failure_count: 1 });
    }

    #[tokio::test]
    async fn heartbeat_alerts_are_suppressed_within_window() {
        let (state, registry) = setup();
        state.put_site(&test_site("s1", None)).unwrap();

        let hot = HeartbeatMetrics {
            temperature_c: Some(90.0),
            ..Default::default()
        };
        let first = registry.on_heartbeat("s1", hot.clone()).await.unwrap();
        assert_eq!(first, vec![AlertType::HighTemperature]);

        let second = registry.on_heartbeat("s1", hot).await.unwrap();
        assert!(second.is_empty());

        assert_eq!(state.list_heartbeats_for_site("s1", 10).unwrap().len(), 2);
        assert_eq!(state.list_alerts_for_site("s1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn alert_suppression_is_per_site() {
        let (state, registry) = setup();
        state.put_site(&test_site("s1", None)).unwrap();
        state.put_site(&test_site("s1:annex", None)).unwrap();

        let hot = HeartbeatMetrics {
            temperature_c: Some(95.0),
            ..Default::default()
        };
        let annex = registry.on_heartbeat("s1:annex", hot.clone()).await.unwrap();
        let main = registry.on_heartbeat("s1", hot).await.unwrap();
        assert_eq!(annex, vec![AlertType::HighTemperature]);
        assert_eq!(main, vec![AlertType::HighTemperature]);
    }

    #[tokio::test]
    async fn heartbeat_samples_respect_retention() {
        let state = StateStore::open_in_memory().unwrap();
        state.put_site(&test_site("s1", None)).unwrap();
        let events = EventBus::new();
        let sink = Arc::new(StoreAlertSink::new(state.clone(), events.clone()));
        let registry = ConnectionRegistry::new(state.clone(), events, sink).with_alert_config(
            AlertConfig {
                heartbeat_retention: 2,
                ..Default::default()
            },
        );

        for _ in 0..4 {
            registry.on_heartbeat("s1", HeartbeatMetrics::default()).await.unwrap();
        }
        assert_eq!(state.list_heartbeats_for_site("s1", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_site_errors() {
        let (_, registry) = setup();
        let err = registry.on_heartbeat("ghost", HeartbeatMetrics::default()).await;
        assert!(matches!(err, Err(RegistryError::UnknownSite(_))));
    }

    #[tokio::test]
    async fn config_drift_detected() {
        let (state, registry) = setup();
        let mut site = test_site("s1", None);
        site.desired_config = Some(serde_json::json!({"volume": 7}));
        site.desired_config_hash = Some("want".to_string());
        state.put_site(&site).unwrap();

        let drift = registry
            .on_sync_local_state(
                "s1",
                &LocalStateReport {
                    config: serde_json::json!({"volume": 3}),
                    config_hash: "have".to_string(),
                    timestamp: 42,
                },
            )
            .unwrap();
        assert!(matches!(drift, ConfigSync::Drift { ref desired_hash, .. } if desired_hash == "want"));

        let synced = registry
            .on_sync_local_state(
                "s1",
                &LocalStateReport {
                    config: serde_json::json!({"volume": 7}),
                    config_hash: "want".to_string(),
                    timestamp: 43,
                },
            )
            .unwrap();
        assert_eq!(synced, ConfigSync::InSync);
        assert_eq!(state.get_site("s1").unwrap().unwrap().reported_config_at, Some(43));
    }

    #[tokio::test]
    async fn failing_hook_does_not_block_others() {
        let (state, registry) = setup();
        state.put_site(&test_site("s1", None)).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for (name, fail) in [("queue", true), ("content", false), ("update", false)] {
            registry
                .add_reconnect_hook(Arc::new(SignalHook {
                    calls: calls.clone(),
                    done: done_tx.clone(),
                    fail,
                    name,
                }))
                .await;
        }

        let (_, _rx) = connect(&registry, "s1").await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let name = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(name);
        }
        seen.sort();
        assert_eq!(seen, vec!["content", "queue", "update"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
