//! In-process HTTP tests over the axum router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::fake_engine;
use fabula_runtime::api::server::{HttpApiConfig, HttpApiServer};
use fabula_runtime::api::types::AppState;

fn test_server() -> HttpApiServer {
    let engine = fake_engine();
    let state = AppState {
        pipeline: engine.pipeline,
        telemetry: engine.telemetry,
        config: engine.config,
        start_time: std::time::Instant::now(),
    };
    HttpApiServer::with_state(
        HttpApiConfig {
            enable_tracing: false,
            enable_cors: false,
            ..HttpApiConfig::default()
        },
        state,
    )
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value, idempotency_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = idempotency_key {
        builder = builder.header("x-idempotency-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn create_session(server: &HttpApiServer) -> String {
    let response = server
        .router()
        .oneshot(post_json(
            "/api/v1/sessions",
            json!({"story_id": "campus_week_v1"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "active");
    assert_eq!(body["story_node_id"], "n_hub");
    assert_eq!(body["current_node"]["id"], "n_hub");
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_and_read_session() {
    let server = test_server();
    let session_id = create_session(&server).await;

    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["session_id"], session_id.as_str());
    assert_eq!(body["state_json"]["energy"], 80);
    assert_eq!(body["state_json"]["run_state"]["step_index"], 0);

    // The gated choice is visible but locked.
    let choices = body["current_node"]["choices"].as_array().unwrap();
    let confide = choices.iter().find(|c| c["id"] == "c_confide").unwrap();
    assert_eq!(confide["available"], false);
    assert_eq!(confide["locked_reason"]["code"], "NPC_GATE_TIER");
}

#[tokio::test]
async fn unknown_story_is_404_with_envelope() {
    let server = test_server();
    let response = server
        .router()
        .oneshot(post_json(
            "/api/v1/sessions",
            json!({"story_id": "missing_story"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn step_requires_idempotency_key() {
    let server = test_server();
    let session_id = create_session(&server).await;

    let response = server
        .router()
        .oneshot(post_json(
            &format!("/api/v1/sessions/{session_id}/step"),
            json!({"choice_id": "c_study"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["code"], "MISSING_IDEMPOTENCY_KEY");
}

#[tokio::test]
async fn step_and_replay_are_byte_identical() {
    let server = test_server();
    let session_id = create_session(&server).await;
    let uri = format!("/api/v1/sessions/{session_id}/step");

    let first = server
        .router()
        .oneshot(post_json(&uri, json!({"choice_id": "c_study"}), Some("k1")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    assert_eq!(first_body["executed_choice_id"], "c_study");
    assert_eq!(first_body["story_node_id"], "n_library");
    assert_eq!(first_body["fallback_used"], false);

    let second = server
        .router()
        .oneshot(post_json(&uri, json!({"choice_id": "c_study"}), Some("k1")))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;
    assert_eq!(first_body, second_body);

    // Replays are not counted as new steps.
    let snapshot = server.state().telemetry.snapshot();
    assert_eq!(snapshot.successful_steps, 1);
}

#[tokio::test]
async fn payload_mismatch_maps_to_409() {
    let server = test_server();
    let session_id = create_session(&server).await;
    let uri = format!("/api/v1/sessions/{session_id}/step");

    server
        .router()
        .oneshot(post_json(&uri, json!({"choice_id": "c_study"}), Some("k1")))
        .await
        .unwrap();
    let mismatch = server
        .router()
        .oneshot(post_json(&uri, json!({"choice_id": "c_work"}), Some("k1")))
        .await
        .unwrap();
    assert_eq!(mismatch.status(), StatusCode::CONFLICT);
    let body = body_json(mismatch).await;
    assert_eq!(body["detail"]["code"], "IDEMPOTENCY_PAYLOAD_MISMATCH");
}

#[tokio::test]
async fn invalid_and_locked_choices_map_to_422() {
    let server = test_server();
    let session_id = create_session(&server).await;
    let uri = format!("/api/v1/sessions/{session_id}/step");

    let invalid = server
        .router()
        .oneshot(post_json(&uri, json!({"choice_id": "c_ghost"}), Some("k1")))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(invalid).await["detail"]["code"], "INVALID_CHOICE");

    let locked = server
        .router()
        .oneshot(post_json(&uri, json!({"choice_id": "c_confide"}), Some("k2")))
        .await
        .unwrap();
    assert_eq!(locked.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(locked).await["detail"]["code"], "CHOICE_LOCKED");
}

#[tokio::test]
async fn bad_step_bodies_are_400() {
    let server = test_server();
    let session_id = create_session(&server).await;
    let uri = format!("/api/v1/sessions/{session_id}/step");

    let empty = server
        .router()
        .oneshot(post_json(&uri, json!({}), Some("k1")))
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(empty).await["detail"]["code"], "BAD_REQUEST");

    let both = server
        .router()
        .oneshot(post_json(
            &uri,
            json!({"choice_id": "c_study", "player_input": "study"}),
            Some("k2"),
        ))
        .await
        .unwrap();
    assert_eq!(both.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn streaming_endpoint_emits_full_event_sequence() {
    let server = test_server();
    let session_id = create_session(&server).await;

    let response = server
        .router()
        .oneshot(post_json(
            &format!("/api/v1/sessions/{session_id}/step/stream"),
            json!({"player_input": "sing off_topic"}),
            Some("k1"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    let positions: Vec<usize> = [
        "event: meta",
        "event: phase",
        "event: narrative_delta",
        "event: final",
        "event: done",
    ]
    .iter()
    .map(|marker| text.find(marker).unwrap_or_else(|| panic!("missing {marker} in {text}")))
    .collect();
    let mut ordered = positions.clone();
    ordered.sort_unstable();
    assert_eq!(positions, ordered, "events must arrive in order");
    assert!(text.contains("selection_start"));
    assert!(text.contains("narration_done"));
    assert!(text.contains("finalizing"));

    // Replay over the stream: meta -> replay -> final -> done.
    let replay = server
        .router()
        .oneshot(post_json(
            &format!("/api/v1/sessions/{session_id}/step/stream"),
            json!({"player_input": "sing off_topic"}),
            Some("k1"),
        ))
        .await
        .unwrap();
    let bytes = replay.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("event: replay"));
    assert!(text.contains("event: final"));
    assert!(!text.contains("event: phase"));
}

#[tokio::test]
async fn health_and_telemetry_endpoints() {
    let server = test_server();
    let session_id = create_session(&server).await;

    server
        .router()
        .oneshot(post_json(
            &format!("/api/v1/sessions/{session_id}/step"),
            json!({"choice_id": "c_study"}),
            Some("k1"),
        ))
        .await
        .unwrap();

    let health = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await["status"], "healthy");

    let telemetry = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/debug/telemetry")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(telemetry.status(), StatusCode::OK);
    let body = body_json(telemetry).await;
    assert_eq!(body["successful_steps"], 1);
    assert_eq!(body["failed_steps"], 0);
}

#[tokio::test]
async fn security_headers_are_present() {
    let server = test_server();
    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
}
