//! REST surface of the server authority. Every handler here is a thin
//! adapter over [`AppState`] — validation and the actual sequencing logic
//! live there so the WebSocket accept path can share it.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::model::Event;
use crate::server::error::{ServerError, ServerResult};
use crate::server::state::{AppState, RepositorySummary};
use crate::server::ServerState;

/// Every path here is mounted under the `/api` base §6 fixes; the single
/// `/ws` upgrade route is the one exception, mounted by `server::build_router`.
pub fn router() -> Router<ServerState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/repositories", get(list_repositories))
        .route("/api/events/:repository", get(list_events).post(push_event))
        .route("/api/events/:repository/batch", post(push_events_batch))
        .route("/api/events/:repository/:event_id", get(get_event_by_id))
        .route("/api/events/:repository/byDataId/:data_id", get(get_event_by_data_id))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    mongodb: bool,
    #[serde(rename = "activeConnections")]
    active_connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let ok = state.health().await;
    Json(HealthResponse {
        status: if ok { "ok" } else { "degraded" },
        timestamp: chrono::Utc::now(),
        mongodb: ok,
        active_connections: state.active_connections(),
    })
}

#[derive(Serialize)]
struct RepositoriesResponse {
    repositories: Vec<RepositorySummary>,
    count: usize,
}

async fn list_repositories(State(state): State<AppState>) -> ServerResult<Json<RepositoriesResponse>> {
    let repositories = state.repository_summaries().await?;
    let count = repositories.len();
    Ok(Json(RepositoriesResponse { repositories, count }))
}

#[derive(Deserialize)]
struct ListEventsQuery {
    #[serde(rename = "afterSequence")]
    since_sequence: Option<i64>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct EventsResponse {
    events: Vec<Event>,
}

async fn list_events(
    State(state): State<AppState>,
    Path(repository): Path<String>,
    Query(q): Query<ListEventsQuery>,
) -> ServerResult<Json<EventsResponse>> {
    let events = state.events_for(&repository, q.since_sequence, q.limit).await?;
    Ok(Json(EventsResponse { events }))
}

async fn get_event_by_id(
    State(state): State<AppState>,
    Path((repository, event_id)): Path<(String, String)>,
) -> ServerResult<Json<Event>> {
    state.event_by_id(&repository, &event_id).await?.map(Json).ok_or(ServerError::EventNotFound)
}

async fn get_event_by_data_id(
    State(state): State<AppState>,
    Path((repository, data_id)): Path<(String, String)>,
) -> ServerResult<Json<Event>> {
    state.event_by_data_id(&repository, &data_id).await?.map(Json).ok_or(ServerError::EventNotFound)
}

#[derive(Serialize)]
struct AckResponse {
    #[serde(rename = "eventId")]
    event_id: String,
    #[serde(rename = "serverSequence")]
    server_sequence: i64,
}

async fn push_event(
    State(state): State<AppState>,
    Path(repository): Path<String>,
    Json(event): Json<Event>,
) -> ServerResult<(StatusCode, Json<AckResponse>)> {
    if event.event_id.is_empty() || event.data_id.is_empty() {
        return Err(ServerError::BadRequest("eventId and dataId are required".into()));
    }
    let event_id = event.event_id.clone();
    let sequence = state.accept_event(&repository, event).await?;
    Ok((StatusCode::CREATED, Json(AckResponse { event_id, server_sequence: sequence })))
}

#[derive(Deserialize)]
struct PushBatchRequest {
    events: Vec<Event>,
}

#[derive(Serialize)]
struct BatchAckResponse {
    #[serde(rename = "eventIds")]
    event_ids: Vec<String>,
    #[serde(rename = "serverSequences")]
    server_sequences: Vec<i64>,
}

async fn push_events_batch(
    State(state): State<AppState>,
    Path(repository): Path<String>,
    Json(req): Json<PushBatchRequest>,
) -> ServerResult<(StatusCode, Json<BatchAckResponse>)> {
    let mut event_ids = Vec::with_capacity(req.events.len());
    let mut server_sequences = Vec::with_capacity(req.events.len());
    for event in req.events {
        if event.event_id.is_empty() || event.data_id.is_empty() {
            return Err(ServerError::BadRequest("eventId and dataId are required".into()));
        }
        event_ids.push(event.event_id.clone());
        server_sequences.push(state.accept_event(&repository, event).await?);
    }
    Ok((StatusCode::CREATED, Json(BatchAckResponse { event_ids, server_sequences })))
}
