//! `Client`: ties a [`LocalStore`], a set of declared [`Repository`]
//! handles, and one [`SyncStrategy`] together into the object applications
//! actually hold onto.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::{StoreResult, SyncResult};
use crate::model::{ConfigValue, Event};
use crate::repository::Repository;
use crate::store::LocalStore;
use crate::sync::{ConnectionState, PushOutcome, SyncStrategy};

pub struct Client {
    store: LocalStore,
    strategy: Arc<dyn SyncStrategy>,
    repositories: Arc<Mutex<HashMap<String, Arc<Repository>>>>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Client {
    pub fn new(store: LocalStore, strategy: Arc<dyn SyncStrategy>) -> Self {
        Self {
            store,
            strategy,
            repositories: Arc::new(Mutex::new(HashMap::new())),
            flush_task: Mutex::new(None),
        }
    }

    /// Opens the store, starts the sync strategy's connection loop, and
    /// begins watching for reconnection so pending events don't sit queued
    /// until something else happens to call `push_pending` (§4.5.5's
    /// "queue flush on reconnect"). Safe to call more than once. A failure
    /// to *ignite* the strategy (as opposed to a failure to connect, which
    /// the strategy's own reconnect loop handles) is logged and otherwise
    /// non-fatal: the store is usable offline regardless.
    pub async fn initialize(&self) -> StoreResult<()> {
        self.store.initialize().await?;
        // Subscribed before `start()` so the watcher's receiver captures the
        // strategy's initial `Disconnected` state and can't miss the very
        // first transition into `Connected` to a task that beat it to connecting.
        self.spawn_flush_on_reconnect().await;
        if let Err(err) = self.strategy.start().await {
            tracing::warn!(target: "sync_engine::client", error = %err, "sync strategy failed to start");
        }
        Ok(())
    }

    /// Drains every known repository's pending queue each time the
    /// connection transitions into `Connected`, whether that's the first
    /// connect or a reconnect after an outage.
    async fn spawn_flush_on_reconnect(&self) {
        let mut rx = self.strategy.connection_changes();
        let store = self.store.clone();
        let strategy = self.strategy.clone();
        let repositories = self.repositories.clone();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                if *rx.borrow() != ConnectionState::Connected {
                    continue;
                }
                let names: Vec<String> = repositories.lock().await.keys().cloned().collect();
                for name in names {
                    if let Err(err) = Self::flush_pending(&store, &strategy, &name).await {
                        tracing::warn!(target: "sync_engine::client", repository = %name, error = %err, "queue flush on reconnect failed");
                    }
                }
            }
        });
        *self.flush_task.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        if let Some(handle) = self.flush_task.lock().await.take() {
            handle.abort();
        }
        self.strategy.stop().await
    }

    pub async fn register_repository(&self, repository: Repository) -> Arc<Repository> {
        let name = repository.name().to_string();
        self.strategy.note_known_repository(&name);
        let handle = Arc::new(repository);
        self.repositories.lock().await.insert(name, handle.clone());
        handle
    }

    pub async fn repository(&self, name: &str) -> Option<Arc<Repository>> {
        self.repositories.lock().await.get(name).cloned()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Pushes every pending local event for `repository` through the
    /// active strategy. Acked events are stamped with their real server
    /// sequence and marked synced; anything else stays pending for the
    /// next attempt (no event is ever dropped on a push failure).
    pub async fn push_pending(&self, repository: &str) -> SyncResult<usize> {
        Self::flush_pending(&self.store, &self.strategy, repository).await
    }

    async fn flush_pending(store: &LocalStore, strategy: &Arc<dyn SyncStrategy>, repository: &str) -> SyncResult<usize> {
        let pending = store.get_pending_events(repository).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        match strategy.push_to_remote(repository, pending).await? {
            PushOutcome::Acked { event_ids, server_sequences } => {
                for (event_id, seq) in event_ids.iter().zip(server_sequences.iter()) {
                    store.mark_event_synced(repository, event_id, *seq).await?;
                }
                Ok(event_ids.len())
            }
            PushOutcome::Deferred => Ok(0),
        }
    }

    /// Pulls whatever the strategy has buffered for `repository` and
    /// applies each event in arrival order through the matching
    /// `Repository`, enforcing the onConflict policy declared there.
    pub async fn pull_changes(&self, repository: &str) -> SyncResult<usize> {
        let events = self.strategy.pull_changes_to_local(repository).await?;
        let repo = self.repository(repository).await;
        let count = events.len();
        for event in events {
            match &repo {
                Some(repo) => repo.apply_remote_event(event).await?,
                None => {
                    // No typed Repository registered (yet); still record the
                    // event so it's not silently lost once one is.
                    self.store.insert_event(repository, event).await?;
                }
            }
        }
        Ok(count)
    }

    pub async fn get_all_pending_events(&self, repository: &str) -> StoreResult<Vec<Event>> {
        self.store.get_pending_events(repository).await
    }

    pub fn connection_changes(&self) -> watch::Receiver<ConnectionState> {
        self.strategy.connection_changes()
    }

    pub fn latest_connection_state(&self) -> ConnectionState {
        self.strategy.latest_connection_state()
    }

    pub async fn set_key_value(&self, key: &str, value: ConfigValue) -> StoreResult<()> {
        self.store.set_config_value(key, value).await
    }

    pub async fn get_meta(&self, key: &str) -> StoreResult<Option<ConfigValue>> {
        self.store.get_config_value(key).await
    }
}
