//! `Repository`: the typed, per-collection facade applications use instead
//! of calling `LocalStore` directly. Every write here is the atomic
//! "upsert the record row, append the event, stamp `_lasteventId`"
//! sequence the store's engine half assumes callers follow.

use std::sync::Arc;

use futures_util::Stream;
use serde_json::Value;

use crate::error::StoreResult;
use crate::merge::{ConflictPolicy, LastWriteWins};
use crate::model::{Event, QueryRow};
use crate::query::Query;
use crate::schema::Schema;
use crate::store::LocalStore;

/// Declares one repository's shape and identity field, and owns the
/// conflict policy applied when a pulled remote event collides with an
/// unsynced local write to the same `dataId`.
pub struct Repository {
    name: String,
    id_field: String,
    store: LocalStore,
    on_conflict: Arc<dyn ConflictPolicy>,
}

impl Repository {
    /// Declares the repository's schema against the store and returns a
    /// handle. Safe to call more than once with the same arguments.
    pub async fn declare(store: LocalStore, name: impl Into<String>, id_field: impl Into<String>, schema: Schema) -> StoreResult<Self> {
        let name = name.into();
        let id_field = id_field.into();
        store.ensure_schema(&name, schema, &id_field).await?;
        Ok(Self { name, id_field, store, on_conflict: Arc::new(LastWriteWins::default()) })
    }

    pub fn with_conflict_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.on_conflict = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn extract_id(&self, record: &Value) -> StoreResult<String> {
        record
            .get(&self.id_field)
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or(crate::error::StoreError::InvalidId)
    }

    /// Upserts `record`, appends the matching insert/update event, and
    /// stamps the row's `_lasteventId`. Returns the event appended, so
    /// callers that also drive a `SyncStrategy` can push it immediately.
    pub async fn upsert(&self, record: Value) -> StoreResult<Event> {
        let id = self.extract_id(&record)?;
        let existed = self.store.get_by_id(&self.name, &id).await?.is_some();
        self.store.insert(&self.name, record.clone(), &self.id_field).await?;
        let event = if existed {
            Event::new_update(&self.name, &id, record)
        } else {
            Event::new_insert(&self.name, &id, record)
        };
        self.store.insert_event(&self.name, event.clone()).await?;
        self.store.set_last_event_id(&self.name, &id, &event.event_id).await?;
        Ok(event)
    }

    pub async fn delete(&self, id: &str) -> StoreResult<Event> {
        self.store.delete(&self.name, id).await?;
        let event = Event::new_delete(&self.name, id);
        self.store.insert_event(&self.name, event.clone()).await?;
        self.store.set_last_event_id(&self.name, id, &event.event_id).await?;
        Ok(event)
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<Value>> {
        self.store.get_by_id(&self.name, id).await
    }

    pub async fn get_all(&self) -> StoreResult<Vec<Value>> {
        self.store.get_all(&self.name).await
    }

    pub async fn query(&self, q: Query) -> StoreResult<Vec<QueryRow>> {
        self.store.query(q).await
    }

    pub fn watch(&self, q: Query) -> impl Stream<Item = StoreResult<Vec<QueryRow>>> {
        self.store.watch_query(q)
    }

    /// Applies a remotely-pulled event to local state. If the record has
    /// an unsynced local event for the same `dataId`, the two are merged
    /// with `on_conflict` rather than letting the remote clobber the
    /// unsynced write outright. An event that arrives out of order (a late
    /// retry or a reordered WS delivery) whose `serverSequence` is behind
    /// the one already applied to the record never raises `_lasteventId`,
    /// even though its row data and event log entry are still recorded.
    pub async fn apply_remote_event(&self, event: Event) -> StoreResult<()> {
        let current = self.store.get_current_event(&self.name, &event.data_id).await?;
        let is_stale = match (event.server_sequence, current.as_ref().and_then(|e| e.server_sequence)) {
            (Some(incoming), Some(current)) => incoming < current,
            _ => false,
        };

        let pending_local = self.store.get_event_by_data_id(&self.name, &event.data_id).await?.filter(|e| e.sync_status == Some(crate::model::SyncStatus::Pending));

        match (&event.data, pending_local) {
            (Some(remote_data), Some(local_event)) if local_event.event_id != event.event_id => {
                let local_data = local_event.data.clone().unwrap_or(Value::Null);
                let merged = self.on_conflict.resolve(&local_data, remote_data);
                self.store.insert(&self.name, merged, &self.id_field).await?;
            }
            (Some(remote_data), _) => {
                self.store.insert(&self.name, remote_data.clone(), &self.id_field).await?;
            }
            (None, _) => {
                self.store.delete(&self.name, &event.data_id).await?;
            }
        }

        if !is_stale {
            self.store.set_last_event_id(&self.name, &event.data_id, &event.event_id).await?;
        }
        // idempotent: ON CONFLICT(eventId) DO NOTHING makes re-applying a
        // previously-seen remote event a no-op rather than a duplicate.
        self.store.insert_event(&self.name, event).await?;
        Ok(())
    }
}
