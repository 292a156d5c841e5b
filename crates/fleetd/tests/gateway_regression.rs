//! Gateway regression tests.
//!
//! Drives the assembled control plane through the HTTP router: site
//! registration, commands for offline sites, configuration pushes,
//! deployments, and canary rollouts.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use fleet_core::{EventBus, FleetConfig};
use fleet_deploy::LocalObjectStorage;
use fleet_gateway::{GatewayState, build_router};
use fleet_state::StateStore;

async fn test_router() -> (Router, GatewayState) {
    let store = StateStore::open_in_memory().unwrap();
    let storage = Arc::new(LocalObjectStorage::new("/tmp/fleet-objects", "http://cdn.test"));
    let state = GatewayState::assemble(store, &FleetConfig::default(), storage, EventBus::new()).await;
    (build_router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn register_sites(router: &Router, group: &str, count: usize) {
    for i in 0..count {
        let req = json_request(
            "POST",
            "/api/v1/sites",
            json!({
                "id": format!("{group}-{i}"),
                "name": format!("{group} {i}"),
                "group_id": group,
                "credential": "secret",
            }),
        );
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
}

#[tokio::test]
async fn healthz_ok() {
    let (router, _) = test_router().await;
    let resp = router.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn list_sites_empty() {
    let (router, _) = test_router().await;
    let resp = router.oneshot(get("/api/v1/sites")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn offline_site_queues_restart_and_can_clear() {
    let (router, _) = test_router().await;
    register_sites(&router, "north", 1).await;

    let req = json_request(
        "POST",
        "/api/v1/sites/north-0/commands",
        json!({ "type": "restart_service", "priority": 3 }),
    );
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = router
        .clone()
        .oneshot(get("/api/v1/sites/north-0/pending"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let req = Request::builder()
        .method("DELETE")
        .uri("/api/v1/sites/north-0/pending")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(get("/api/v1/sites/north-0/pending"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn realtime_command_for_offline_site_conflicts() {
    let (router, _) = test_router().await;
    register_sites(&router, "north", 1).await;

    let req = json_request(
        "POST",
        "/api/v1/sites/north-0/commands",
        json!({ "type": "screenshot" }),
    );
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn command_for_unknown_site_is_not_found() {
    let (router, _) = test_router().await;
    let req = json_request(
        "POST",
        "/api/v1/sites/ghost/commands",
        json!({ "type": "restart_service" }),
    );
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_push_marks_site_pending() {
    let (router, state) = test_router().await;
    register_sites(&router, "north", 1).await;

    let req = json_request(
        "PUT",
        "/api/v1/sites/north-0/config",
        json!({ "config": { "volume": 4 } }),
    );
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["status"], "queued");

    let site = state.store.get_site("north-0").unwrap().unwrap();
    assert!(site.pending_config_version.is_some());
    assert!(site.desired_config_hash.is_some());
    assert_eq!(state.queue.list_pending_commands("north-0").unwrap().len(), 1);
}

#[tokio::test]
async fn deployment_to_offline_group_stays_pending() {
    let (router, _) = test_router().await;
    register_sites(&router, "east", 2).await;

    let req = json_request(
        "POST",
        "/api/v1/artifacts",
        json!({
            "id": "video-9",
            "kind": "content",
            "name": "halftime",
            "storage_path": "videos/halftime.mp4",
        }),
    );
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = json_request(
        "POST",
        "/api/v1/deployments",
        json!({
            "kind": "content",
            "resource_id": "video-9",
            "target_type": "group",
            "target_id": "east",
        }),
    );
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["sites"].as_object().unwrap().len(), 2);

    let resp = router
        .clone()
        .oneshot(get(&format!("/api/v1/deployments/{id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = json_request("POST", &format!("/api/v1/deployments/{id}/cancel"), json!({}));
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn deployment_of_missing_artifact_is_rejected() {
    let (router, _) = test_router().await;
    register_sites(&router, "east", 1).await;

    let req = json_request(
        "POST",
        "/api/v1/deployments",
        json!({
            "kind": "content",
            "resource_id": "nope",
            "target_type": "group",
            "target_id": "east",
        }),
    );
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn canary_lifecycle_over_http() {
    let (router, _) = test_router().await;
    register_sites(&router, "west", 10).await;

    let req = json_request(
        "POST",
        "/api/v1/artifacts",
        json!({
            "id": "pkg-5",
            "kind": "update",
            "name": "player",
            "storage_path": "packages/player-5.0.0.tar.gz",
            "version": "5.0.0",
        }),
    );
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = json_request(
        "POST",
        "/api/v1/canaries",
        json!({
            "deployment_type": "update",
            "resource_id": "pkg-5",
            "target_type": "group",
            "target_id": "west",
            "config": { "canary_percentage": 20, "auto_advance": false },
        }),
    );
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["current_phase"], "canary");
    assert_eq!(body["data"]["total_sites"], 10);

    let resp = router
        .clone()
        .oneshot(get(&format!("/api/v1/canaries/{id}/sites")))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let rows = body["data"].as_array().unwrap();
    assert_eq!(rows.len(), 10);
    let canary_rows = rows.iter().filter(|r| r["phase"] == "canary").count();
    assert_eq!(canary_rows, 2);

    let req = json_request(
        "POST",
        &format!("/api/v1/canaries/{id}/rollback"),
        json!({ "reason": "bad build" }),
    );
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["current_phase"], "rolled_back");
    assert_eq!(body["data"]["rollback_reason"], "bad build");

    let req = json_request("POST", &format!("/api/v1/canaries/{id}/advance"), json!({}));
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn canary_with_bad_percentage_is_rejected() {
    let (router, _) = test_router().await;
    register_sites(&router, "west", 3).await;

    let req = json_request(
        "POST",
        "/api/v1/canaries",
        json!({
            "deployment_type": "content",
            "resource_id": "anything",
            "target_type": "group",
            "target_id": "west",
            "config": { "canary_percentage": 0 },
        }),
    );
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
