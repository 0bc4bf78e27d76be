//! End-to-end tests of the server authority's REST surface, driven through
//! an in-process router via `tower::ServiceExt::oneshot`, in the style of
//! `finance_atp`'s `tests/integration_api.rs`.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use sync_engine::server::config::Config;
use sync_engine::server::state::AppState;
use sync_engine::server::build_router;

fn test_config() -> Config {
    Config { bind_addr: "127.0.0.1:0".parse().unwrap(), database_path: ":memory:".to_string(), auth_token: None }
}

async fn router() -> axum::Router {
    let store = AppState::new_in_memory().unwrap();
    build_router(store, test_config())
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let parsed = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, parsed)
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let parsed = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, parsed)
}

fn event_json(event_id: &str, data_id: &str, op: &str, value: i64) -> Value {
    json!({
        "eventId": event_id,
        "repository": "user",
        "dataId": data_id,
        "operation": op,
        "createdAt": "2026-01-01T00:00:00Z",
        "data": {"id": data_id, "v": value},
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let app = router().await;
    let (status, body) = get_json(&app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["mongodb"], true);
    assert!(body["timestamp"].is_string());
    assert_eq!(body["activeConnections"].as_u64().unwrap(), 0);
}

/// S3 — idempotent retry: posting the same eventId twice yields the same
/// serverSequence and does not create a second event row.
#[tokio::test]
async fn posting_same_event_id_twice_is_idempotent() {
    let app = router().await;
    let ev = event_json("e1", "u1", "insert", 1);

    let (status1, body1) = post_json(&app, "/api/events/user", ev.clone()).await;
    assert_eq!(status1, StatusCode::CREATED);
    let seq1 = body1["serverSequence"].as_i64().unwrap();

    let (status2, body2) = post_json(&app, "/api/events/user", ev).await;
    assert_eq!(status2, StatusCode::CREATED);
    let seq2 = body2["serverSequence"].as_i64().unwrap();

    assert_eq!(seq1, seq2);

    let (_, events) = get_json(&app, "/api/events/user").await;
    assert_eq!(events["events"].as_array().unwrap().len(), 1);
}

/// Missing eventId on a single accept is rejected with 400.
#[tokio::test]
async fn missing_event_id_is_bad_request() {
    let app = router().await;
    let bad = json!({
        "repository": "user",
        "dataId": "u1",
        "operation": "insert",
        "createdAt": "2026-01-01T00:00:00Z",
    });
    let (status, _) = post_json(&app, "/api/events/user", bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// S4 — dedup-on-read: two events for the same dataId plus one for another
/// dataId collapse to one row per dataId, keeping the highest sequence.
#[tokio::test]
async fn dedup_on_read_keeps_latest_per_data_id() {
    let app = router().await;
    post_json(&app, "/api/events/user", event_json("e1", "u1", "insert", 1)).await;
    post_json(&app, "/api/events/user", event_json("e2", "u1", "update", 2)).await;
    post_json(&app, "/api/events/user", event_json("e3", "u2", "insert", 1)).await;

    let (status, body) = get_json(&app, "/api/events/user").await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);

    let u1 = events.iter().find(|e| e["dataId"] == "u1").unwrap();
    assert_eq!(u1["eventId"], "e2");
    assert_eq!(u1["data"]["v"], 2);

    let u2 = events.iter().find(|e| e["dataId"] == "u2").unwrap();
    assert_eq!(u2["eventId"], "e3");
}

/// S5 — counter_log is exempt from dedup-on-read and returned in
/// strictly descending sequence order.
#[tokio::test]
async fn counter_log_is_undeduped_and_descending() {
    let app = router().await;
    let ev = |id: &str, v: i64| {
        json!({
            "eventId": id,
            "repository": "counter_log",
            "dataId": "c",
            "operation": "insert",
            "createdAt": "2026-01-01T00:00:00Z",
            "data": {"id": "c", "v": v},
        })
    };
    post_json(&app, "/api/events/counter_log", ev("e1", 1)).await;
    post_json(&app, "/api/events/counter_log", ev("e2", 2)).await;
    post_json(&app, "/api/events/counter_log", ev("e3", 3)).await;

    let (status, body) = get_json(&app, "/api/events/counter_log?limit=100").await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 3);
    let sequences: Vec<i64> = events.iter().map(|e| e["serverSequence"].as_i64().unwrap()).collect();
    assert_eq!(sequences, vec![3, 2, 1]);
}

/// Sequences are strictly increasing for a fixed repository and never
/// reused, even across distinct dataIds.
#[tokio::test]
async fn sequences_are_monotone_and_never_reused() {
    let app = router().await;
    let (_, b1) = post_json(&app, "/api/events/user", event_json("e1", "u1", "insert", 1)).await;
    let (_, b2) = post_json(&app, "/api/events/user", event_json("e2", "u2", "insert", 1)).await;
    let (_, b3) = post_json(&app, "/api/events/user", event_json("e3", "u3", "insert", 1)).await;

    let seqs: Vec<i64> = [&b1, &b2, &b3].iter().map(|b| b["serverSequence"].as_i64().unwrap()).collect();
    assert!(seqs[0] < seqs[1]);
    assert!(seqs[1] < seqs[2]);
}

#[tokio::test]
async fn batch_push_accepts_every_event_and_lists_repository() {
    let app = router().await;
    let batch = json!({"events": [event_json("e1", "u1", "insert", 1), event_json("e2", "u2", "insert", 1)]});
    let (status, body) = post_json(&app, "/api/events/user/batch", batch).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["eventIds"].as_array().unwrap().len(), 2);

    let (status, repos) = get_json(&app, "/api/repositories").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(repos["count"].as_u64().unwrap(), 1);
    let names: Vec<&str> = repos["repositories"].as_array().unwrap().iter().map(|v| v["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"user"));
    let user = repos["repositories"].as_array().unwrap().iter().find(|r| r["name"] == "user").unwrap();
    assert_eq!(user["eventCount"].as_i64().unwrap(), 2);
    assert_eq!(user["maxSequence"].as_i64().unwrap(), 2);
}

#[tokio::test]
async fn event_not_found_is_404() {
    let app = router().await;
    let req = Request::builder().method("GET").uri("/api/events/user/does-not-exist").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_event_by_data_id_returns_latest() {
    let app = router().await;
    post_json(&app, "/api/events/user", event_json("e1", "u1", "insert", 1)).await;
    post_json(&app, "/api/events/user", event_json("e2", "u1", "update", 2)).await;

    let (status, body) = get_json(&app, "/api/events/user/byDataId/u1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["eventId"], "e2");
}
