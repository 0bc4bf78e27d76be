//! `LocalStore`: the async facade applications and the sync engine use.
//!
//! Wraps the blocking [`engine::StoreCore`] behind a mutex and drives it
//! from `spawn_blocking`, so the single suspension point for any store
//! operation is the blocking hop itself — matching the cooperative,
//! single-task-runner scheduling model the spec assumes for the client.

pub mod engine;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::model::{ConfigValue, Event, QueryRow};
use crate::query::Query;
use crate::schema::Schema;
use engine::StoreCore;

const LOG_TARGET: &str = "sync_engine::store";

struct OpenNamespace {
    core: StoreCore,
    /// Bumped (and watchers' streams torn down) whenever the namespace changes.
    generation: u64,
}

#[derive(Clone)]
pub struct LocalStore {
    base_dir: PathBuf,
    state: Arc<Mutex<Option<OpenNamespace>>>,
    watchers: Arc<std::sync::Mutex<HashMap<String, broadcast::Sender<u64>>>>,
}

impl LocalStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            state: Arc::new(Mutex::new(None)),
            watchers: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// In-memory store, handy for tests and embedded single-shot use.
    pub fn new_in_memory() -> Self {
        Self::new(PathBuf::from(":memory:"))
    }

    fn path_for_namespace(&self, namespace: &str) -> PathBuf {
        if self.base_dir.as_os_str() == ":memory:" {
            return self.base_dir.clone();
        }
        self.base_dir.join(format!("{namespace}.db"))
    }

    fn open_connection(&self, namespace: &str) -> StoreResult<Connection> {
        if self.base_dir.as_os_str() == ":memory:" {
            return Ok(Connection::open_in_memory()?);
        }
        let path = self.path_for_namespace(namespace);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Connection::open(path)?)
    }

    /// Idempotent: calling `initialize` twice just reuses the open namespace.
    pub async fn initialize(&self) -> StoreResult<()> {
        self.use_namespace("default").await
    }

    pub async fn close(&self) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        *guard = None;
        debug!(target: LOG_TARGET, "store closed");
        Ok(())
    }

    /// Switches to a disjoint storage space. Closes the active handle first
    /// and bumps the generation counter so in-flight `watch_query` streams
    /// bound to the old namespace complete.
    pub async fn use_namespace(&self, name: &str) -> StoreResult<()> {
        let conn = self.open_connection(name)?;
        let core = StoreCore::open(conn)?;
        let mut guard = self.state.lock().await;
        let next_gen = guard.as_ref().map(|n| n.generation + 1).unwrap_or(0);
        *guard = Some(OpenNamespace { core, generation: next_gen });
        self.watchers.lock().unwrap().clear();
        debug!(target: LOG_TARGET, namespace = name, generation = next_gen, "namespace switched");
        Ok(())
    }

    async fn with_core<R: Send + 'static>(&self, f: impl FnOnce(&mut StoreCore) -> StoreResult<R> + Send + 'static) -> StoreResult<R>
    where
        R: 'static,
    {
        let state = self.state.clone();
        let mut guard = state.lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let ns = guard.as_mut().ok_or(StoreError::NotInitialized)?;
            f(&mut ns.core)
        })
        .await
        .expect("store worker panicked")
    }

    fn notify(&self, repository: &str) {
        let watchers = self.watchers.lock().unwrap();
        if let Some(tx) = watchers.get(repository) {
            let _ = tx.send(0);
        }
    }

    pub async fn ensure_schema(&self, repository: &str, schema: Schema, id_field: &str) -> StoreResult<()> {
        let repository = repository.to_string();
        let id_field = id_field.to_string();
        self.with_core(move |core| core.ensure_schema(&repository, schema, &id_field)).await
    }

    pub async fn insert(&self, repository: &str, record: serde_json::Value, id_field: &str) -> StoreResult<String> {
        let repo = repository.to_string();
        let id_field = id_field.to_string();
        let id = self.with_core(move |core| core.upsert_record(&repo, &record, &id_field)).await?;
        self.notify(repository);
        Ok(id)
    }

    pub async fn update(&self, repository: &str, record: serde_json::Value, id_field: &str) -> StoreResult<String> {
        self.insert(repository, record, id_field).await
    }

    pub async fn delete(&self, repository: &str, id: &str) -> StoreResult<()> {
        let repo = repository.to_string();
        let id = id.to_string();
        self.with_core(move |core| core.delete_record(&repo, &id)).await?;
        self.notify(repository);
        Ok(())
    }

    pub async fn delete_all(&self, repository: &str) -> StoreResult<()> {
        let repo = repository.to_string();
        self.with_core(move |core| core.delete_all_records(&repo)).await?;
        self.notify(repository);
        Ok(())
    }

    pub async fn set_last_event_id(&self, repository: &str, id: &str, event_id: &str) -> StoreResult<()> {
        let repo = repository.to_string();
        let id = id.to_string();
        let event_id = event_id.to_string();
        self.with_core(move |core| core.set_last_event_id(&repo, &id, &event_id)).await
    }

    pub async fn insert_event(&self, repository: &str, event: Event) -> StoreResult<()> {
        let repo = repository.to_string();
        self.with_core(move |core| core.insert_event(&repo, &event)).await?;
        self.notify(repository);
        Ok(())
    }

    pub async fn update_event(&self, repository: &str, event: Event) -> StoreResult<()> {
        let repo = repository.to_string();
        self.with_core(move |core| core.update_event(&repo, &event)).await?;
        self.notify(repository);
        Ok(())
    }

    pub async fn delete_event(&self, repository: &str, event_id: &str) -> StoreResult<()> {
        let repo = repository.to_string();
        let event_id = event_id.to_string();
        self.with_core(move |core| core.delete_event(&repo, &event_id)).await?;
        self.notify(repository);
        Ok(())
    }

    pub async fn mark_event_synced(&self, repository: &str, event_id: &str, server_sequence: i64) -> StoreResult<()> {
        let repo = repository.to_string();
        let event_id = event_id.to_string();
        self.with_core(move |core| core.mark_event_synced(&repo, &event_id, server_sequence)).await?;
        self.notify(repository);
        Ok(())
    }

    pub async fn get_all(&self, repository: &str) -> StoreResult<Vec<serde_json::Value>> {
        let repo = repository.to_string();
        self.with_core(move |core| core.get_all(&repo)).await
    }

    pub async fn get_by_id(&self, repository: &str, id: &str) -> StoreResult<Option<serde_json::Value>> {
        let repo = repository.to_string();
        let id = id.to_string();
        self.with_core(move |core| core.get_by_id(&repo, &id)).await
    }

    pub async fn get_all_events(&self, repository: &str) -> StoreResult<Vec<Event>> {
        let repo = repository.to_string();
        self.with_core(move |core| core.get_all_events(&repo)).await
    }

    pub async fn get_pending_events(&self, repository: &str) -> StoreResult<Vec<Event>> {
        let repo = repository.to_string();
        self.with_core(move |core| core.get_pending_events(&repo)).await
    }

    pub async fn get_event_by_id(&self, repository: &str, event_id: &str) -> StoreResult<Option<Event>> {
        let repo = repository.to_string();
        let event_id = event_id.to_string();
        self.with_core(move |core| core.get_event_by_id(&repo, &event_id)).await
    }

    pub async fn get_event_by_data_id(&self, repository: &str, data_id: &str) -> StoreResult<Option<Event>> {
        let repo = repository.to_string();
        let data_id = data_id.to_string();
        self.with_core(move |core| core.get_event_by_data_id(&repo, &data_id)).await
    }

    /// The event `_lasteventId` on the record currently named by `data_id`
    /// points to, i.e. whatever was last actually applied to that record.
    pub async fn get_current_event(&self, repository: &str, data_id: &str) -> StoreResult<Option<Event>> {
        let repo = repository.to_string();
        let data_id = data_id.to_string();
        self.with_core(move |core| core.get_current_event(&repo, &data_id)).await
    }

    pub async fn query(&self, q: Query) -> StoreResult<Vec<QueryRow>> {
        self.with_core(move |core| core.query(&q)).await
    }

    /// One initial snapshot, then a new snapshot after every write touching
    /// `q.repository`, until the receiver is dropped or the namespace changes.
    pub fn watch_query(&self, q: Query) -> impl futures_util::Stream<Item = StoreResult<Vec<QueryRow>>> {
        let this = self.clone();
        async_stream::stream! {
            let generation_at_subscribe = {
                let guard = this.state.lock().await;
                guard.as_ref().map(|n| n.generation)
            };
            let mut rx = {
                let mut watchers = this.watchers.lock().unwrap();
                watchers
                    .entry(q.repository.clone())
                    .or_insert_with(|| broadcast::channel(64).0)
                    .subscribe()
            };

            yield this.query(q.clone()).await;

            loop {
                match rx.recv().await {
                    Ok(_) => {
                        let current_gen = {
                            let guard = this.state.lock().await;
                            guard.as_ref().map(|n| n.generation)
                        };
                        if current_gen != generation_at_subscribe {
                            return;
                        }
                        yield this.query(q.clone()).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        yield this.query(q.clone()).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }

    pub async fn set_config_value(&self, key: &str, value: ConfigValue) -> StoreResult<()> {
        let key = key.to_string();
        self.with_core(move |core| core.set_config_value(&key, &value)).await
    }

    pub async fn get_config_value(&self, key: &str) -> StoreResult<Option<ConfigValue>> {
        let key = key.to_string();
        self.with_core(move |core| core.get_config_value(&key)).await
    }

    pub async fn contains_config_key(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_core(move |core| core.contains_config_key(&key)).await
    }

    pub async fn remove_config(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.with_core(move |core| core.remove_config(&key)).await
    }

    pub async fn clear_config(&self) -> StoreResult<()> {
        self.with_core(move |core| core.clear_config()).await
    }

    pub async fn get_config_keys(&self) -> StoreResult<Vec<String>> {
        self.with_core(move |core| core.get_config_keys()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, SchemaField};
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn not_initialized_fails_closed() {
        let store = LocalStore::new_in_memory();
        let err = store.get_all("user").await.unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized));
    }

    #[tokio::test]
    async fn initialize_then_write_then_read() {
        let store = LocalStore::new_in_memory();
        store.initialize().await.unwrap();
        store
            .ensure_schema("user", Schema::new(vec![SchemaField::new("name", FieldType::Text)]), "id")
            .await
            .unwrap();
        store.insert("user", json!({"id": "u1", "name": "a"}), "id").await.unwrap();
        let all = store.get_all("user").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn watch_query_emits_on_write() {
        let store = LocalStore::new_in_memory();
        store.initialize().await.unwrap();
        store
            .ensure_schema("user", Schema::new(vec![SchemaField::new("name", FieldType::Text)]), "id")
            .await
            .unwrap();

        let stream = store.watch_query(Query::new("user").filter(crate::query::Filter::eq(
            "name",
            crate::query::FilterValue::Text("a".into()),
        )));
        tokio::pin!(stream);

        let initial = stream.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        store.insert("user", json!({"id": "u1", "name": "a"}), "id").await.unwrap();
        let after_insert = stream.next().await.unwrap().unwrap();
        assert_eq!(after_insert.len(), 1);

        store.insert("user", json!({"id": "u1", "name": "b"}), "id").await.unwrap();
        let after_update = stream.next().await.unwrap().unwrap();
        assert!(after_update.is_empty());
    }

    #[tokio::test]
    async fn use_namespace_isolates_data() {
        let store = LocalStore::new_in_memory();
        store.use_namespace("alice").await.unwrap();
        store.ensure_schema("user", Schema::new(vec![]), "id").await.unwrap();
        store.insert("user", json!({"id": "u1"}), "id").await.unwrap();

        store.use_namespace("bob").await.unwrap();
        // bob's namespace has no schema yet, ensure_schema required again.
        let err = store.get_all("user").await;
        assert!(err.is_err());
    }
}
