//! `WsStrategy`: the WebSocket-backed [`SyncStrategy`].
//!
//! One background task owns the socket and drives the state machine
//! `Disconnected -> Connecting -> Authenticating -> Connected`, falling back
//! to `Reconnecting` on any read/write/heartbeat failure. Everything else
//! (`push_to_remote`, `pull_changes_to_local`, ...) talks to that task
//! through channels so callers never touch the socket directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::Event;
use crate::sync::protocol::{ClientMessage, ServerMessage};
use crate::sync::{ConnectionState, Credentials, PushOutcome, SyncHost, SyncStrategy};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
const AUTH_TIMEOUT: Duration = Duration::from_millis(1500);
const PONG_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PUSH_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: [Duration; 4] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(3),
];

/// The "the counter_log table is special" rule from the server's event
/// feed: rather than resuming from a cursor, a client always re-requests
/// the last few entries, since callers only ever care about the tail.
const COUNTER_LOG_REPOSITORY: &str = "counter_log";
const COUNTER_LOG_BACKFILL_LIMIT: i64 = 5;

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub token: String,
    pub client_id: String,
    /// How often the connection loop sends a `ping`. Defaults to 30s
    /// (`WsConfig::new`); the reconnect delay itself is not a single knob
    /// here (see `RECONNECT_BACKOFF`'s deviation note).
    pub heartbeat_interval: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            client_id: client_id.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct EventsReceivedNotice {
    event_ids: Vec<String>,
    server_sequences: Vec<i64>,
}

struct Inner {
    config: Mutex<WsConfig>,
    host: Mutex<Option<Arc<dyn SyncHost>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    inbound: Mutex<HashMap<String, VecDeque<Event>>>,
    acks: broadcast::Sender<EventsReceivedNotice>,
    cursors: Mutex<HashMap<String, i64>>,
    /// Repositories this process has seen at least one event for or been
    /// told about via `note_known_repository`; drives §4.5.6's "known
    /// repository set empty => single global request_all_events" rule.
    known_repositories: std::sync::Mutex<std::collections::HashSet<String>>,
    shutdown: Mutex<Option<mpsc::UnboundedSender<()>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A WebSocket sync client driving a single connection to the server
/// authority, multiplexing every repository the caller pushes or pulls.
#[derive(Clone)]
pub struct WsStrategy {
    inner: Arc<Inner>,
}

impl WsStrategy {
    pub fn new(config: WsConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (acks, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                host: Mutex::new(None),
                state_tx,
                state_rx,
                outbound_tx: Mutex::new(None),
                inbound: Mutex::new(HashMap::new()),
                acks,
                cursors: Mutex::new(HashMap::new()),
                known_repositories: std::sync::Mutex::new(std::collections::HashSet::new()),
                shutdown: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Installs the host callbacks (`onBuildSyncFilter`/`onSyncCompleted`/
    /// `onAuthenticationFailed`). Optional — a strategy with no host falls
    /// back to always requesting a full backfill and never rotating
    /// credentials on its own.
    pub async fn with_host(self, host: Arc<dyn SyncHost>) -> Self {
        *self.inner.host.lock().await = Some(host);
        self
    }

    /// §4.5.8: updates the credentials used on the *next* connection
    /// attempt, and if already `Connected`, re-sends `auth` immediately on
    /// the live socket rather than waiting for a reconnect.
    pub async fn update_credentials(&self, token: String, client_id: String) {
        {
            let mut cfg = self.inner.config.lock().await;
            cfg.token = token.clone();
            cfg.client_id = client_id.clone();
        }
        if self.latest_connection_state() == ConnectionState::Connected {
            let _ = self.send(ClientMessage::Auth { token, client_id }).await;
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        let _ = self.inner.state_tx.send(state);
    }

    /// Non-destructive look at whatever's currently buffered for
    /// `repository`, without draining it or triggering a fresh request.
    /// Useful for a caller that wants to observe the strategy's own
    /// automatic backfill landing rather than pulling on demand.
    pub async fn peek_inbound(&self, repository: &str) -> Vec<Event> {
        let inbound = self.inner.inbound.lock().await;
        inbound.get(repository).map(|q| q.iter().cloned().collect()).unwrap_or_default()
    }

    async fn push_inbound(&self, repository: &str, events: Vec<Event>) {
        let mut inbound = self.inner.inbound.lock().await;
        let buf = inbound.entry(repository.to_string()).or_default();
        buf.extend(events);
    }

    async fn run_once(&self) -> SyncResult<()> {
        let config = self.inner.config.lock().await.clone();

        self.set_state(ConnectionState::Connecting).await;
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&config.url))
            .await
            .map_err(|_| SyncError::ConnectionLost)??;
        let (mut write, mut read) = ws_stream.split();

        self.set_state(ConnectionState::Authenticating).await;
        let auth = ClientMessage::Auth { token: config.token.clone(), client_id: config.client_id.clone() };
        write.send(WsMessage::Text(serde_json::to_string(&auth)?)).await?;

        let auth_ack = tokio::time::timeout(AUTH_TIMEOUT, read.next()).await.map_err(|_| SyncError::AuthenticationFailed("timed out waiting for auth_success".into()));
        let auth_result = match auth_ack {
            Ok(Some(Ok(WsMessage::Text(txt)))) => match serde_json::from_str::<ServerMessage>(&txt) {
                Ok(ServerMessage::AuthSuccess { .. }) => Ok(()),
                Ok(ServerMessage::Error { message, .. }) => Err(SyncError::AuthenticationFailed(message)),
                _ => Err(SyncError::AuthenticationFailed("unexpected first message".into())),
            },
            Ok(_) => Err(SyncError::AuthenticationFailed("connection closed during auth".into())),
            Err(err) => Err(err),
        };
        if let Err(err) = auth_result {
            self.adopt_credentials_from_host().await;
            return Err(err);
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        *self.inner.outbound_tx.lock().await = Some(outbound_tx);

        self.set_state(ConnectionState::Connected).await;
        info!(target: "sync_engine::sync::ws", "connected and authenticated");

        self.request_backfill_for_known_repositories().await?;

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.tick().await; // first tick fires immediately
        let mut awaiting_pong = false;
        let mut pong_deadline = tokio::time::Instant::now() + PONG_TIMEOUT;

        loop {
            tokio::select! {
                _ = heartbeat.tick(), if !awaiting_pong => {
                    write.send(WsMessage::Text(serde_json::to_string(&ClientMessage::Ping { sent_at: chrono::Utc::now() })?)).await?;
                    awaiting_pong = true;
                    pong_deadline = tokio::time::Instant::now() + PONG_TIMEOUT;
                }
                _ = tokio::time::sleep_until(pong_deadline), if awaiting_pong => {
                    return Err(SyncError::PongTimeout);
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => write.send(WsMessage::Text(serde_json::to_string(&msg)?)).await?,
                        None => return Ok(()),
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(txt))) => {
                            awaiting_pong = awaiting_pong && !self.handle_server_message(&txt).await?;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => { write.send(WsMessage::Pong(payload)).await?; }
                        Some(Ok(WsMessage::Close(_))) | None => return Err(SyncError::ConnectionLost),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(SyncError::Transport(e)),
                    }
                }
            }
        }
    }

    /// Returns `true` if the message was a `pong`, so the caller can clear
    /// its awaiting-pong flag.
    async fn handle_server_message(&self, txt: &str) -> SyncResult<bool> {
        let msg: ServerMessage = serde_json::from_str(txt)?;
        match msg {
            ServerMessage::Pong { .. } => return Ok(true),
            ServerMessage::Events { repository, events } => {
                self.inner.known_repositories.lock().unwrap().insert(repository.clone());
                if let Some(last) = events.iter().filter_map(|e| e.server_sequence).max() {
                    self.inner.cursors.lock().await.insert(repository.clone(), last);
                }
                let count = events.len();
                let host = self.inner.host.lock().await.clone();
                if let Some(host) = &host {
                    host.on_sync_completed(&repository, &events).await;
                }
                self.push_inbound(&repository, events).await;
                self.send(ClientMessage::EventsReceived { repository, count }).await?;
            }
            ServerMessage::EventsReceived { event_ids, server_sequences } => {
                let _ = self.inner.acks.send(EventsReceivedNotice { event_ids, server_sequences });
            }
            ServerMessage::Ack { event_id, server_sequence } => {
                let _ = self.inner.acks.send(EventsReceivedNotice { event_ids: vec![event_id], server_sequences: vec![server_sequence] });
            }
            ServerMessage::SyncComplete { repository } => {
                debug!(target: "sync_engine::sync::ws", repository, "sync_complete");
            }
            ServerMessage::Error { message, code } => {
                warn!(target: "sync_engine::sync::ws", message, ?code, "server reported error");
            }
            ServerMessage::AuthSuccess { .. } => {}
        }
        Ok(false)
    }

    /// §4.5.6: an empty known-repository set gets one global
    /// `request_all_events`; otherwise each known repository is backfilled
    /// individually, deferring to `onBuildSyncFilter` when the host supplies
    /// one and falling back to a full request (capped for `counter_log`)
    /// when it doesn't.
    async fn request_backfill_for_known_repositories(&self) -> SyncResult<()> {
        let known: Vec<String> = {
            let guard = self.inner.known_repositories.lock().unwrap();
            guard.iter().cloned().collect()
        };
        if known.is_empty() {
            return self.send(ClientMessage::RequestAllEvents { repository: None, limit: None }).await;
        }

        let host = self.inner.host.lock().await.clone();
        for repository in known {
            let filter = match &host {
                Some(host) => host.on_build_sync_filter(&repository).await,
                None => None,
            };
            match filter.and_then(|f| f.since_sequence) {
                Some(since_sequence) => self.send(ClientMessage::RequestEvents { repository, since_sequence }).await?,
                None => self.send_full_backfill_for(&repository).await?,
            }
        }
        Ok(())
    }

    async fn send_full_backfill_for(&self, repository: &str) -> SyncResult<()> {
        let limit = (repository == COUNTER_LOG_REPOSITORY).then_some(COUNTER_LOG_BACKFILL_LIMIT);
        self.send(ClientMessage::RequestAllEvents { repository: Some(repository.to_string()), limit }).await
    }

    async fn send_request_for(&self, repository: &str, since_sequence: i64) -> SyncResult<()> {
        if repository == COUNTER_LOG_REPOSITORY {
            return self.send_full_backfill_for(repository).await;
        }
        self.send(ClientMessage::RequestEvents { repository: repository.to_string(), since_sequence }).await
    }

    async fn adopt_credentials_from_host(&self) {
        let host = self.inner.host.lock().await.clone();
        let Some(host) = host else { return };
        if let Some(Credentials { token, client_id }) = host.on_authentication_failed().await {
            let mut cfg = self.inner.config.lock().await;
            cfg.token = token;
            cfg.client_id = client_id;
            info!(target: "sync_engine::sync::ws", "adopted rotated credentials for next connection attempt");
        }
    }

    async fn send(&self, msg: ClientMessage) -> SyncResult<()> {
        let tx = self.inner.outbound_tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| SyncError::ConnectionLost),
            None => Err(SyncError::ConnectionLost),
        }
    }
}

#[async_trait]
impl SyncStrategy for WsStrategy {
    async fn start(&self) -> SyncResult<()> {
        if self.inner.task.lock().await.is_some() {
            return Ok(());
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        *self.inner.shutdown.lock().await = Some(shutdown_tx);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut attempt = 0usize;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        this.set_state(ConnectionState::Disconnected).await;
                        return;
                    }
                    result = this.run_once() => {
                        *this.inner.outbound_tx.lock().await = None;
                        match result {
                            Ok(()) => {
                                this.set_state(ConnectionState::Disconnected).await;
                                return;
                            }
                            Err(err) => {
                                warn!(target: "sync_engine::sync::ws", error = %err, "connection lost, reconnecting");
                                this.set_state(ConnectionState::Reconnecting).await;
                                let backoff = RECONNECT_BACKOFF[attempt.min(RECONNECT_BACKOFF.len() - 1)];
                                attempt += 1;
                                tokio::time::sleep(backoff).await;
                            }
                        }
                    }
                }
            }
        });
        *self.inner.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> SyncResult<()> {
        if let Some(tx) = self.inner.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.task.lock().await.take() {
            let _ = handle.await;
        }
        *self.inner.outbound_tx.lock().await = None;
        self.set_state(ConnectionState::Disconnected).await;
        Ok(())
    }

    async fn dispose(&self) -> SyncResult<()> {
        self.stop().await
    }

    async fn push_to_remote(&self, repository: &str, events: Vec<Event>) -> SyncResult<PushOutcome> {
        if events.is_empty() {
            return Ok(PushOutcome::Acked { event_ids: Vec::new(), server_sequences: Vec::new() });
        }
        if self.latest_connection_state() != ConnectionState::Connected {
            return Ok(PushOutcome::Deferred);
        }

        let expected_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
        let mut ack_rx = self.inner.acks.subscribe();
        self.send(ClientMessage::PushEventsBatch { repository: repository.to_string(), events }).await?;

        let deadline = tokio::time::Instant::now() + PUSH_ACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(PushOutcome::Deferred);
            }
            match tokio::time::timeout(remaining, ack_rx.recv()).await {
                Ok(Ok(notice)) if expected_ids.iter().all(|id| notice.event_ids.contains(id)) => {
                    return Ok(PushOutcome::Acked { event_ids: notice.event_ids, server_sequences: notice.server_sequences });
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(PushOutcome::Deferred),
                Err(_) => return Ok(PushOutcome::Deferred),
            }
        }
    }

    async fn pull_changes_to_local(&self, repository: &str) -> SyncResult<Vec<Event>> {
        if self.latest_connection_state() == ConnectionState::Connected {
            let since = *self.inner.cursors.lock().await.get(repository).unwrap_or(&0);
            self.send_request_for(repository, since).await.ok();
        }
        let mut inbound = self.inner.inbound.lock().await;
        Ok(inbound.remove(repository).map(|q| q.into_iter().collect()).unwrap_or_default())
    }

    fn connection_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    fn latest_connection_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    fn note_known_repository(&self, repository: &str) {
        self.inner.known_repositories.lock().unwrap().insert(repository.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncFilter;

    #[tokio::test]
    async fn starts_disconnected() {
        let strategy = WsStrategy::new(WsConfig::new("ws://127.0.0.1:1/ws", "t", "c"));
        assert_eq!(strategy.latest_connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn push_with_no_connection_defers() {
        let strategy = WsStrategy::new(WsConfig::new("ws://127.0.0.1:1/ws", "t", "c"));
        let outcome = strategy.push_to_remote("user", vec![Event::new_insert("user", "u1", serde_json::json!({"id": "u1"}))]).await.unwrap();
        assert_eq!(outcome, PushOutcome::Deferred);
    }

    #[tokio::test]
    async fn pull_with_no_connection_drains_buffered_only() {
        let strategy = WsStrategy::new(WsConfig::new("ws://127.0.0.1:1/ws", "t", "c"));
        let events = strategy.pull_changes_to_local("user").await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn note_known_repository_tracks_set() {
        let strategy = WsStrategy::new(WsConfig::new("ws://127.0.0.1:1/ws", "t", "c"));
        strategy.note_known_repository("user");
        assert!(strategy.inner.known_repositories.lock().unwrap().contains("user"));
    }

    struct RecordingHost {
        filter_calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyncHost for RecordingHost {
        async fn on_build_sync_filter(&self, repository: &str) -> Option<SyncFilter> {
            self.filter_calls.lock().unwrap().push(repository.to_string());
            Some(SyncFilter { since_sequence: Some(42) })
        }
    }

    #[tokio::test]
    async fn known_repository_backfill_consults_host_filter() {
        let strategy = WsStrategy::new(WsConfig::new("ws://127.0.0.1:1/ws", "t", "c"));
        let host = Arc::new(RecordingHost { filter_calls: std::sync::Mutex::new(Vec::new()) });
        let strategy = strategy.with_host(host.clone()).await;
        strategy.note_known_repository("user");

        // No outbound channel exists without a live connection, so the
        // eventual send fails, but the host must already have been asked.
        assert!(strategy.request_backfill_for_known_repositories().await.is_err());
        assert_eq!(host.filter_calls.lock().unwrap().as_slice(), ["user"]);
    }

    struct RotatingHost;

    #[async_trait]
    impl SyncHost for RotatingHost {
        async fn on_authentication_failed(&self) -> Option<Credentials> {
            Some(Credentials { token: "new-token".into(), client_id: "new-client".into() })
        }
    }

    #[tokio::test]
    async fn auth_failure_adopts_rotated_credentials_from_host() {
        let strategy = WsStrategy::new(WsConfig::new("ws://127.0.0.1:1/ws", "t", "c"));
        let strategy = strategy.with_host(Arc::new(RotatingHost)).await;
        strategy.adopt_credentials_from_host().await;
        let cfg = strategy.inner.config.lock().await;
        assert_eq!(cfg.token, "new-token");
        assert_eq!(cfg.client_id, "new-client");
    }
}
