//! Site WebSocket sessions.
//!
//! A connection must authenticate with its first frame. After that every
//! text frame is decoded into an [`InboundMessage`] and routed to the
//! component that owns it. Outbound traffic flows through the channel the
//! registry holds for the site, drained by a per-connection writer task.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fleet_core::protocol::{InboundMessage, OutboundMessage};
use fleet_deploy::ProgressReport;
use fleet_registry::{AuthOutcome, ConfigSync};
use fleet_state::DeploymentKind;

use crate::GatewayState;

/// GET /ws
///
/// The site address is the first `X-Forwarded-For` entry when a proxy sets
/// one, otherwise the TCP peer.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let address = Some(client_address(&headers, peer));
    ws.on_upgrade(move |socket| run_session(socket, state, address))
}

fn client_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| peer.ip().to_string(), str::to_string)
}

async fn run_session(mut socket: WebSocket, state: GatewayState, address: Option<String>) {
    let first = match tokio::time::timeout(state.auth_timeout, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => InboundMessage::decode(text.as_str()).ok(),
        Ok(_) => None,
        Err(_) => {
            debug!("connection did not authenticate in time");
            reject(&mut socket, "authentication timeout").await;
            return;
        }
    };
    let Some(InboundMessage::Authenticate(request)) = first else {
        reject(&mut socket, "authentication required").await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let connection_id = match state.registry.authenticate(&request, address, tx).await {
        Ok(AuthOutcome::Accepted { connection_id }) => connection_id,
        Ok(AuthOutcome::Rejected(message)) => {
            reject(&mut socket, &message).await;
            return;
        }
        Err(e) => {
            warn!(site_id = %request.site_id, error = %e, "authentication failed");
            reject(&mut socket, "authentication unavailable").await;
            return;
        }
    };
    let site_id = request.site_id;
    info!(%site_id, connection_id, "site session started");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match InboundMessage::decode(text.as_str()) {
                Ok(message) => handle_message(&state, &site_id, message).await,
                Err(e) => warn!(%site_id, error = %e, "malformed frame ignored"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%site_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    state.registry.on_disconnect(&site_id, connection_id).await;
    writer.abort();
    info!(%site_id, connection_id, "site session ended");
}

async fn reject(socket: &mut WebSocket, message: &str) {
    let frame = OutboundMessage::AuthError {
        message: message.to_string(),
    };
    if let Ok(text) = frame.encode() {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Route one decoded frame from an authenticated site.
pub(crate) async fn handle_message(state: &GatewayState, site_id: &str, message: InboundMessage) {
    let event = message.name();
    match message {
        InboundMessage::Authenticate(_) => {
            debug!(%site_id, "repeated authenticate ignored");
        }
        InboundMessage::Heartbeat(report) => {
            if let Err(e) = state.registry.on_heartbeat(site_id, report.metrics).await {
                warn!(%site_id, error = %e, "heartbeat not recorded");
            }
        }
        InboundMessage::CommandResult(result) => {
            if let Err(e) = state.dispatcher.on_result(site_id, result).await {
                warn!(%site_id, error = %e, "command result not recorded");
            }
        }
        InboundMessage::DeployProgress(progress) => {
            let deployment_id = match (progress.deployment_id, progress.video_id) {
                (Some(id), _) => Some(id),
                (None, Some(video_id)) => match state.deployments.find_active_for_resource(
                    DeploymentKind::Content,
                    site_id,
                    &video_id,
                ) {
                    Ok(found) => found.map(|d| d.id),
                    Err(e) => {
                        warn!(%site_id, error = %e, "deployment lookup failed");
                        None
                    }
                },
                (None, None) => None,
            };
            let Some(deployment_id) = deployment_id else {
                debug!(%site_id, "progress for unknown deployment ignored");
                return;
            };
            let report = ProgressReport {
                progress: progress.progress,
                completed: progress.completed,
                error: progress.error,
                ..Default::default()
            };
            if let Err(e) = state
                .deployments
                .update_progress(&deployment_id, site_id, report)
                .await
            {
                warn!(%site_id, %deployment_id, error = %e, "deploy progress not applied");
            }
        }
        InboundMessage::UpdateProgress(progress) => {
            let report = ProgressReport {
                progress: progress.progress,
                completed: progress.completed,
                error: progress.error,
                version: progress.version,
                ..Default::default()
            };
            if let Err(e) = state
                .deployments
                .update_progress(&progress.deployment_id, site_id, report)
                .await
            {
                warn!(%site_id, deployment_id = %progress.deployment_id, error = %e, "update progress not applied");
            }
        }
        InboundMessage::SyncLocalState(report) => {
            match state.registry.on_sync_local_state(site_id, &report) {
                Ok(ConfigSync::InSync) => {}
                Ok(ConfigSync::Drift {
                    desired,
                    desired_hash,
                }) => {
                    if let Err(e) = state.queue.push_config(site_id, desired, &desired_hash).await {
                        warn!(%site_id, error = %e, "config resync failed");
                    }
                }
                Err(e) => warn!(%site_id, error = %e, "local state not recorded"),
            }
        }
    }
    debug!(%site_id, event, "frame handled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::protocol::{AuthenticateRequest, HeartbeatMetrics, HeartbeatReport, LocalStateReport};
    use fleet_core::{EventBus, FleetConfig};
    use fleet_deploy::LocalObjectStorage;
    use fleet_registry::auth::hash_credential;
    use fleet_state::{Site, StateStore};
    use std::sync::Arc;

    async fn connected_site() -> (GatewayState, mpsc::UnboundedReceiver<OutboundMessage>) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_site(&Site {
                id: "s1".to_string(),
                name: "s1".to_string(),
                group_id: None,
                secret_hash: hash_credential("secret"),
                online: false,
                last_seen: None,
                last_address: None,
                pending_config_version: None,
                desired_config: Some(serde_json::json!({"volume": 7})),
                desired_config_hash: Some("want".to_string()),
                reported_config_hash: None,
                reported_config_at: None,
                software_version: None,
                created_at: 1,
            })
            .unwrap();
        let storage = Arc::new(LocalObjectStorage::new("/tmp/fleet-objects", "http://cdn.test"));
        let state =
            GatewayState::assemble(store, &FleetConfig::default(), storage, EventBus::new()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = AuthenticateRequest {
            site_id: "s1".to_string(),
            credential: "secret".to_string(),
        };
        let outcome = state.registry.authenticate(&request, None, tx).await.unwrap();
        assert!(matches!(outcome, AuthOutcome::Accepted { .. }));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::Authenticated { .. })
        ));
        (state, rx)
    }

    #[test]
    fn address_prefers_forwarded_header() {
        let peer: SocketAddr = "10.0.0.9:4411".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_address(&headers, peer), "10.0.0.9");

        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_address(&headers, peer), "203.0.113.7");

        headers.insert("x-forwarded-for", " ".parse().unwrap());
        assert_eq!(client_address(&headers, peer), "10.0.0.9");
    }

    #[tokio::test]
    async fn heartbeat_frame_is_recorded() {
        let (state, _rx) = connected_site().await;
        let message = InboundMessage::Heartbeat(HeartbeatReport {
            metrics: HeartbeatMetrics {
                cpu_percent: Some(12.0),
                ..Default::default()
            },
        });
        handle_message(&state, "s1", message).await;
        assert_eq!(state.store.list_heartbeats_for_site("s1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drifted_config_is_pushed_again() {
        let (state, mut rx) = connected_site().await;
        let message = InboundMessage::SyncLocalState(LocalStateReport {
            config: serde_json::json!({"volume": 3}),
            config_hash: "have".to_string(),
            timestamp: 5,
        });
        handle_message(&state, "s1", message).await;

        let site = state.store.get_site("s1").unwrap().unwrap();
        assert_eq!(site.reported_config_hash.as_deref(), Some("have"));
        assert!(site.pending_config_version.is_some());
        match rx.recv().await {
            Some(OutboundMessage::Command(envelope)) => {
                assert_eq!(envelope.data["configHash"], "want");
                assert_eq!(envelope.data["config"]["volume"], 7);
            }
            other => panic!("expected config command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_sync_config_sends_nothing() {
        let (state, mut rx) = connected_site().await;
        let message = InboundMessage::SyncLocalState(LocalStateReport {
            config: serde_json::json!({"volume": 7}),
            config_hash: "want".to_string(),
            timestamp: 5,
        });
        handle_message(&state, "s1", message).await;
        assert!(rx.try_recv().is_err());
    }
}
