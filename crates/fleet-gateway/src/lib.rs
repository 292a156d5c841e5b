//! fleet-gateway — the network face of Fleetgrid.
//!
//! Sites connect over a WebSocket at `/ws`; operators drive the fleet
//! through the REST API under `/api/v1`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness probe |
//! | GET | `/ws` | Site session (WebSocket upgrade) |
//! | GET/POST | `/api/v1/sites` | List / register sites |
//! | GET | `/api/v1/sites/{id}` | Site details with live `connected` flag |
//! | GET/POST | `/api/v1/sites/{id}/commands` | Command log / send-or-queue a command |
//! | GET/DELETE | `/api/v1/sites/{id}/pending` | List / clear queued commands |
//! | GET | `/api/v1/sites/{id}/alerts` | Alerts raised for a site |
//! | GET | `/api/v1/sites/{id}/heartbeats` | Recent heartbeat samples |
//! | PUT | `/api/v1/sites/{id}/config` | Set and push the desired configuration |
//! | POST | `/api/v1/groups/{id}/broadcast` | Pass-through broadcast to a group |
//! | POST | `/api/v1/artifacts` | Register a stored artifact |
//! | GET | `/api/v1/artifacts/{id}` | Artifact details |
//! | GET/POST | `/api/v1/deployments` | List / create-and-start deployments |
//! | GET | `/api/v1/deployments/{id}` | Deployment details |
//! | POST | `/api/v1/deployments/{id}/cancel` | Cancel a deployment |
//! | GET/POST | `/api/v1/canaries` | List / create canary rollouts |
//! | GET | `/api/v1/canaries/{id}` | Rollout with metrics |
//! | GET | `/api/v1/canaries/{id}/sites` | Per-site rollout status |
//! | POST | `/api/v1/canaries/{id}/start` | Deploy the canary wave |
//! | POST | `/api/v1/canaries/{id}/advance` | Evaluate and widen the rollout |
//! | POST | `/api/v1/canaries/{id}/rollback` | Roll the rollout back |

pub mod handlers;
pub mod rollout_handlers;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post, put};

use fleet_commands::{CommandDispatcher, CommandQueue};
use fleet_core::{EventBus, FleetConfig};
use fleet_deploy::{DeploymentOrchestrator, ObjectStorage, PendingDeploymentsHook};
use fleet_registry::{ConnectionRegistry, StoreAlertSink};
use fleet_rollout::CanaryDeploymentOrchestrator;
use fleet_state::{DeploymentKind, StateStore};

/// Shared state for gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub store: StateStore,
    pub events: EventBus,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub queue: Arc<CommandQueue>,
    pub deployments: Arc<DeploymentOrchestrator>,
    pub canaries: Arc<CanaryDeploymentOrchestrator>,
    /// Time a new connection has to authenticate.
    pub auth_timeout: Duration,
}

impl GatewayState {
    /// Build every control-plane component over `store` and wire them up.
    pub async fn assemble(
        store: StateStore,
        config: &FleetConfig,
        storage: Arc<dyn ObjectStorage>,
        events: EventBus,
    ) -> Self {
        let sink = Arc::new(StoreAlertSink::new(store.clone(), events.clone()));
        let registry = Arc::new(
            ConnectionRegistry::new(store.clone(), events.clone(), sink)
                .with_alert_config(config.alerts.clone()),
        );
        let dispatcher = Arc::new(CommandDispatcher::new(
            registry.clone(),
            store.clone(),
            events.clone(),
        ));
        let queue = Arc::new(CommandQueue::new(
            dispatcher.clone(),
            store.clone(),
            config.queue.clone(),
        ));
        let deployments = Arc::new(
            DeploymentOrchestrator::new(store.clone(), dispatcher.clone(), storage, events.clone())
                .with_max_retries(config.retry.max_retries),
        );
        let canaries = Arc::new(CanaryDeploymentOrchestrator::new(
            store.clone(),
            deployments.clone(),
            queue.clone(),
            events.clone(),
        ));

        dispatcher.add_observer(deployments.clone()).await;
        deployments.add_observer(canaries.clone()).await;

        registry.add_reconnect_hook(queue.clone()).await;
        for kind in [DeploymentKind::Content, DeploymentKind::Update] {
            registry
                .add_reconnect_hook(Arc::new(PendingDeploymentsHook::new(
                    deployments.clone(),
                    kind,
                )))
                .await;
        }

        Self {
            store,
            events,
            registry,
            dispatcher,
            queue,
            deployments,
            canaries,
            auth_timeout: Duration::from_secs(config.server.auth_timeout_secs),
        }
    }
}

/// Build the complete router (site sessions + REST API).
pub fn build_router(state: GatewayState) -> Router {
    let api_routes = Router::new()
        .route("/sites", get(handlers::list_sites).post(handlers::register_site))
        .route("/sites/{id}", get(handlers::get_site))
        .route(
            "/sites/{id}/commands",
            get(handlers::list_site_commands).post(handlers::send_command),
        )
        .route(
            "/sites/{id}/pending",
            get(handlers::list_pending).delete(handlers::clear_pending),
        )
        .route("/sites/{id}/alerts", get(handlers::list_alerts))
        .route("/sites/{id}/heartbeats", get(handlers::list_heartbeats))
        .route("/sites/{id}/config", put(handlers::push_config))
        .route("/groups/{id}/broadcast", post(handlers::broadcast_to_group))
        .route("/artifacts", post(handlers::register_artifact))
        .route("/artifacts/{id}", get(handlers::get_artifact))
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/cancel", post(handlers::cancel_deployment))
        .route(
            "/canaries",
            get(rollout_handlers::list_canaries).post(rollout_handlers::create_canary),
        )
        .route("/canaries/{id}", get(rollout_handlers::get_canary))
        .route("/canaries/{id}/sites", get(rollout_handlers::list_canary_sites))
        .route("/canaries/{id}/start", post(rollout_handlers::start_canary))
        .route("/canaries/{id}/advance", post(rollout_handlers::advance_canary))
        .route("/canaries/{id}/rollback", post(rollout_handlers::rollback_canary));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws", get(session::ws_handler))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
