//! The sync client: a pluggable [`SyncStrategy`] driving push/pull of events
//! between the local store and a server authority. [`ws`] implements the one
//! strategy the spec requires, a WebSocket-backed bidirectional channel.

pub mod protocol;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::SyncResult;
use crate::model::Event;

/// High-level connection phase exposed to callers, independent of any one
/// strategy's internal state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
}

/// Outcome of attempting to push one batch of pending events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Server acknowledged; `event_ids[i]` was assigned `server_sequences[i]`.
    Acked { event_ids: Vec<String>, server_sequences: Vec<i64> },
    /// Not connected right now; events remain pending for a later attempt.
    Deferred,
}

/// A pluggable transport for moving events between the local store and a
/// remote authority. The client drives one `SyncStrategy` per repository (or
/// a shared one multiplexing several), pushing pending events and applying
/// whatever the strategy pulls back.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    /// Begins connecting and stays running until `stop`/`dispose`.
    async fn start(&self) -> SyncResult<()>;

    /// Tears down the connection but leaves the strategy reusable via `start`.
    async fn stop(&self) -> SyncResult<()>;

    /// Releases resources permanently; the strategy cannot be restarted.
    async fn dispose(&self) -> SyncResult<()>;

    /// Pushes one repository's pending events to the remote authority.
    async fn push_to_remote(&self, repository: &str, events: Vec<Event>) -> SyncResult<PushOutcome>;

    /// Requests and returns events the local store hasn't seen yet.
    async fn pull_changes_to_local(&self, repository: &str) -> SyncResult<Vec<Event>>;

    /// A stream of connection-state transitions.
    fn connection_changes(&self) -> watch::Receiver<ConnectionState>;

    /// The state at the moment of the call, without waiting for a change.
    fn latest_connection_state(&self) -> ConnectionState;

    /// Tells the strategy a repository exists, so a fresh connection can
    /// request its backfill instead of lumping it into the "unknown
    /// repositories" initial-sync case. No-op for strategies that don't
    /// distinguish (e.g. a fake used in tests).
    fn note_known_repository(&self, _repository: &str) {}
}

/// `onBuildSyncFilter`'s opaque filter map, narrowed to the one key the
/// spec's own scenarios ever populate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncFilter {
    pub since_sequence: Option<i64>,
}

/// Credentials adopted for the *next* connection attempt, as returned by
/// `onAuthenticationFailed`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
    pub client_id: String,
}

/// The three host callbacks §6's configuration surface names. A host that
/// doesn't care about one just accepts the default (no filter override, no
/// post-sync side effect, no credential rotation on auth failure).
#[async_trait]
pub trait SyncHost: Send + Sync {
    async fn on_build_sync_filter(&self, _repository: &str) -> Option<SyncFilter> {
        None
    }

    async fn on_sync_completed(&self, _repository: &str, _events: &[Event]) {}

    async fn on_authentication_failed(&self) -> Option<Credentials> {
        None
    }
}
