use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use hostd_api::{AcceptedResponse, InstanceResponse, SampleResponse, TaskResponse};
use hostd_common::{DesiredState, ResourceSample, TaskStatus};
use hostd_core::{CoordinatorMetrics, SqliteStore, StateStore, TaskQueue, TaskReceiver};
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use crate::{create_app, AppState};

const GB: u64 = 1024 * 1024 * 1024;

struct TestServer {
    app: Router,
    store: Arc<SqliteStore>,
    // Dropping the receiver would close the transport and fail enqueues.
    _receiver: Arc<TaskReceiver>,
}

fn test_server() -> TestServer {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let metrics = Arc::new(CoordinatorMetrics::default());
    let (queue, receiver) = TaskQueue::with_channel(store.clone(), metrics.clone());
    let state = AppState {
        store: store.clone(),
        queue,
        metrics,
        docker: None,
        host_memory_bytes: 8 * GB,
    };
    TestServer {
        app: create_app(state),
        store,
        _receiver: receiver,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn create_request() -> serde_json::Value {
    json!({
        "name": "web-1",
        "owner": "owner-1",
        "image": "nginx:alpine",
        "memory_limit_bytes": 256u64 * 1024 * 1024,
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = test_server();

    let response = server.app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["components"]["store"], "healthy");
    assert_eq!(json["components"]["runtime"], "unconfigured");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_create_accepts_and_enqueues() {
    let server = test_server();

    let response = server
        .app
        .clone()
        .oneshot(post_json("/api/v1/instances", create_request()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let accepted: AcceptedResponse = body_json(response).await;
    assert_eq!(accepted.desired, DesiredState::Running);
    let task_id = accepted.task_id.expect("create task enqueued");

    // Desired state was recorded; no container work happened synchronously.
    let instance = server.store.get_instance(accepted.id).unwrap();
    assert_eq!(instance.desired, DesiredState::Running);
    assert!(instance.container_handle.is_none());

    let task = server.store.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_create_with_start_false_targets_stopped() {
    let server = test_server();

    let mut req = create_request();
    req["start"] = json!(false);
    let response = server
        .app
        .oneshot(post_json("/api/v1/instances", req))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let accepted: AcceptedResponse = body_json(response).await;
    assert_eq!(accepted.desired, DesiredState::Stopped);
}

#[tokio::test]
async fn test_create_rejects_invalid_specs() {
    let server = test_server();

    let mut empty_image = create_request();
    empty_image["image"] = json!("");
    let response = server
        .app
        .clone()
        .oneshot(post_json("/api/v1/instances", empty_image))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Memory limit past the host total fails admission.
    let mut over_memory = create_request();
    over_memory["memory_limit_bytes"] = json!(16u64 * GB);
    let response = server
        .app
        .clone()
        .oneshot(post_json("/api/v1/instances", over_memory))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Rejected requests leave no record behind.
    let instances = server.store.list_instances().unwrap();
    assert!(instances.is_empty());
}

#[tokio::test]
async fn test_list_and_get_instances() {
    let server = test_server();

    let response = server
        .app
        .clone()
        .oneshot(post_json("/api/v1/instances", create_request()))
        .await
        .unwrap();
    let accepted: AcceptedResponse = body_json(response).await;

    let response = server
        .app
        .clone()
        .oneshot(get("/api/v1/instances"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let instances: Vec<InstanceResponse> = body_json(response).await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id, accepted.id);
    assert_eq!(instances[0].image, "nginx:alpine");

    let response = server
        .app
        .clone()
        .oneshot(get(&format!("/api/v1/instances/{}", accepted.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .app
        .oneshot(get(&format!("/api/v1/instances/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lifecycle_intent_writes() {
    let server = test_server();

    let response = server
        .app
        .clone()
        .oneshot(post_json("/api/v1/instances", create_request()))
        .await
        .unwrap();
    let accepted: AcceptedResponse = body_json(response).await;
    let id = accepted.id;

    // Stop: 202 and desired flips, but nothing else happens synchronously.
    let response = server
        .app
        .clone()
        .oneshot(post_json(&format!("/api/v1/instances/{id}/stop"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server.store.get_instance(id).unwrap().desired,
        DesiredState::Stopped
    );

    // Start again.
    let response = server
        .app
        .clone()
        .oneshot(post_json(&format!("/api/v1/instances/{id}/start"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server.store.get_instance(id).unwrap().desired,
        DesiredState::Running
    );

    // Delete.
    let response = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/instances/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server.store.get_instance(id).unwrap().desired,
        DesiredState::Deleted
    );

    // The record stays queryable after the delete intent.
    let response = server
        .app
        .oneshot(get(&format!("/api/v1/instances/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_lifecycle_writes_on_unknown_instance_404() {
    let server = test_server();
    let id = Uuid::new_v4();

    let response = server
        .app
        .clone()
        .oneshot(post_json(&format!("/api/v1/instances/{id}/start"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = server
        .app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/instances/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sample_history() {
    let server = test_server();

    let response = server
        .app
        .clone()
        .oneshot(post_json("/api/v1/instances", create_request()))
        .await
        .unwrap();
    let accepted: AcceptedResponse = body_json(response).await;

    let now = Utc::now();
    for (age_secs, memory) in [(30i64, 100u64), (20, 200), (10, 300)] {
        server
            .store
            .append_sample(&ResourceSample {
                instance_id: accepted.id,
                sampled_at: now - ChronoDuration::seconds(age_secs),
                cpu_percent: 5.0,
                memory_bytes: memory,
                disk_bytes: 0,
            })
            .unwrap();
    }

    let response = server
        .app
        .clone()
        .oneshot(get(&format!(
            "/api/v1/instances/{}/samples?limit=2",
            accepted.id
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Most recent first, capped by the limit.
    let samples: Vec<SampleResponse> = body_json(response).await;
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].memory_bytes, 300);
    assert_eq!(samples[1].memory_bytes, 200);

    let response = server
        .app
        .oneshot(get(&format!("/api/v1/instances/{}/samples", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_task_history_and_metrics() {
    let server = test_server();

    let response = server
        .app
        .clone()
        .oneshot(post_json("/api/v1/instances", create_request()))
        .await
        .unwrap();
    let accepted: AcceptedResponse = body_json(response).await;

    let response = server
        .app
        .clone()
        .oneshot(get(&format!("/api/v1/instances/{}/tasks", accepted.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let tasks: Vec<TaskResponse> = body_json(response).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Pending);

    let response = server.app.oneshot(get("/api/v1/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let metrics: serde_json::Value = body_json(response).await;
    assert_eq!(metrics["tasks_enqueued"], 1);
    assert_eq!(metrics["tasks_failed"], 0);
}

#[tokio::test]
async fn test_invalid_json_is_a_bad_request() {
    let server = test_server();

    let response = server
        .app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/instances")
                .header("content-type", "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
