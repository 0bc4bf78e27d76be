//! The server authority: REST + WebSocket endpoints in front of
//! [`state::AppState`]'s sequenced event log.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

use axum::extract::FromRef;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use state::AppState;

#[derive(Clone)]
pub struct ServerState {
    pub store: AppState,
    pub config: Config,
}

impl FromRef<ServerState> for AppState {
    fn from_ref(input: &ServerState) -> Self {
        input.store.clone()
    }
}

impl FromRef<ServerState> for Config {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

pub fn build_router(store: AppState, config: Config) -> Router {
    let state = ServerState { store, config };
    routes::router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
