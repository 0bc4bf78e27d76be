//! The server side of the WebSocket sync channel: one task per connected
//! client, handling auth, push/pull, heartbeats, and fan-out of events
//! accepted from other clients.

use std::collections::HashSet;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::Event;
use crate::server::config::Config;
use crate::server::state::AppState;
use crate::server::ServerState;
use crate::sync::protocol::{ClientMessage, ServerMessage};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.store, state.config))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, config: Config) {
    let mut authenticated = false;
    let mut subscribed: HashSet<String> = HashSet::new();
    let (fanout_tx, mut fanout_rx) = mpsc::unbounded_channel::<Event>();

    state.connection_opened();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                let WsMessage::Text(txt) = msg else { continue };
                let parsed: Result<ClientMessage, _> = serde_json::from_str(&txt);
                let Ok(parsed) = parsed else {
                    let _ = send(&mut socket, &ServerMessage::Error { message: "malformed message".into(), code: Some("bad_request".into()) }).await;
                    continue;
                };

                match parsed {
                    ClientMessage::Auth { token, client_id } => {
                        let ok = config.auth_token.as_deref().map(|expected| expected == token).unwrap_or(true);
                        if ok {
                            authenticated = true;
                            let _ = send(&mut socket, &ServerMessage::AuthSuccess { client_id }).await;
                        } else {
                            let _ = send(&mut socket, &ServerMessage::Error { message: "invalid token".into(), code: Some("unauthorized".into()) }).await;
                            break;
                        }
                    }
                    _ if !authenticated => {
                        let _ = send(&mut socket, &ServerMessage::Error { message: "not authenticated".into(), code: Some("unauthorized".into()) }).await;
                    }
                    ClientMessage::PushEvent { repository, event } => {
                        match state.accept_event(&repository, event.clone()).await {
                            Ok(seq) => {
                                let _ = send(&mut socket, &ServerMessage::Ack { event_id: event.event_id, server_sequence: seq }).await;
                            }
                            Err(e) => {
                                let _ = send(&mut socket, &ServerMessage::Error { message: e.to_string(), code: None }).await;
                            }
                        }
                    }
                    ClientMessage::PushEventsBatch { repository, events } => {
                        let mut event_ids = Vec::with_capacity(events.len());
                        let mut server_sequences = Vec::with_capacity(events.len());
                        for event in events {
                            match state.accept_event(&repository, event.clone()).await {
                                Ok(seq) => {
                                    event_ids.push(event.event_id);
                                    server_sequences.push(seq);
                                }
                                Err(e) => {
                                    let _ = send(&mut socket, &ServerMessage::Error { message: e.to_string(), code: None }).await;
                                }
                            }
                        }
                        let _ = send(&mut socket, &ServerMessage::EventsReceived { event_ids, server_sequences }).await;
                    }
                    ClientMessage::RequestAllEvents { repository: Some(repository), limit } => {
                        ensure_subscribed(&state, &mut subscribed, &repository, &fanout_tx);
                        match state.events_for(&repository, None, limit).await {
                            Ok(events) => { let _ = send(&mut socket, &ServerMessage::Events { repository: repository.clone(), events }).await; }
                            Err(e) => { let _ = send(&mut socket, &ServerMessage::Error { message: e.to_string(), code: None }).await; }
                        }
                        let _ = send(&mut socket, &ServerMessage::SyncComplete { repository }).await;
                    }
                    // No repository named: the client has an empty "known
                    // repositories" set (§4.5.6) and wants everything this
                    // server currently has, repository by repository.
                    ClientMessage::RequestAllEvents { repository: None, limit } => {
                        match state.repositories().await {
                            Ok(repos) => {
                                for repository in repos {
                                    ensure_subscribed(&state, &mut subscribed, &repository, &fanout_tx);
                                    match state.events_for(&repository, None, limit).await {
                                        Ok(events) => { let _ = send(&mut socket, &ServerMessage::Events { repository: repository.clone(), events }).await; }
                                        Err(e) => { let _ = send(&mut socket, &ServerMessage::Error { message: e.to_string(), code: None }).await; }
                                    }
                                    let _ = send(&mut socket, &ServerMessage::SyncComplete { repository }).await;
                                }
                            }
                            Err(e) => { let _ = send(&mut socket, &ServerMessage::Error { message: e.to_string(), code: None }).await; }
                        }
                    }
                    ClientMessage::RequestEvents { repository, since_sequence } => {
                        ensure_subscribed(&state, &mut subscribed, &repository, &fanout_tx);
                        match state.events_for(&repository, Some(since_sequence), None).await {
                            Ok(events) => { let _ = send(&mut socket, &ServerMessage::Events { repository: repository.clone(), events }).await; }
                            Err(e) => { let _ = send(&mut socket, &ServerMessage::Error { message: e.to_string(), code: None }).await; }
                        }
                        let _ = send(&mut socket, &ServerMessage::SyncComplete { repository }).await;
                    }
                    ClientMessage::Ping { .. } => {
                        let _ = send(&mut socket, &ServerMessage::Pong { sent_at: chrono::Utc::now() }).await;
                    }
                    ClientMessage::EventsReceived { repository, count } => {
                        debug!(target: "sync_engine::server::ws", repository, count, "client confirmed applying remote batch");
                    }
                    ClientMessage::Auth { .. } => unreachable!(),
                }
            }
            Some(event) = fanout_rx.recv() => {
                let repository = event.repository.clone();
                let _ = send(&mut socket, &ServerMessage::Events { repository, events: vec![event] }).await;
            }
        }
    }
    state.connection_closed();
    debug!(target: "sync_engine::server::ws", "client disconnected");
}

fn ensure_subscribed(state: &AppState, subscribed: &mut HashSet<String>, repository: &str, fanout_tx: &mpsc::UnboundedSender<Event>) {
    if subscribed.contains(repository) {
        return;
    }
    subscribed.insert(repository.to_string());
    let mut rx = state.subscribe(repository);
    let tx = fanout_tx.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(txt) => socket.send(WsMessage::Text(txt)).await,
        Err(e) => {
            warn!(target: "sync_engine::server::ws", error = %e, "failed to serialize outgoing message");
            Ok(())
        }
    }
}
