//! The server's own event log: every accepted event from every client,
//! stamped with a monotonic per-repository sequence number. This is
//! deliberately a separate schema from the embedded `LocalStore` — the
//! server is authority over ordering, not over per-client materialized
//! record state.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::model::{Event, Operation, SyncStatus};
use crate::server::error::{ServerError, ServerResult};

const MAX_SEQUENCE_RETRIES: u32 = 5;
const COUNTER_LOG_REPOSITORY: &str = "counter_log";

/// One row of `GET /api/repositories`'s listing.
#[derive(Debug, Clone, Serialize)]
pub struct RepositorySummary {
    pub name: String,
    #[serde(rename = "eventCount")]
    pub event_count: i64,
    #[serde(rename = "maxSequence")]
    pub max_sequence: i64,
}

/// One fan-out channel per repository, used to broadcast freshly-accepted
/// events to every other connected client's WebSocket session.
#[derive(Clone)]
pub struct AppState {
    conn: Arc<Mutex<Connection>>,
    broadcasts: Arc<std::sync::Mutex<std::collections::HashMap<String, broadcast::Sender<Event>>>>,
    active_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn open(database_path: impl AsRef<Path>) -> ServerResult<Self> {
        let conn = Connection::open(database_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS sequences (
                repository TEXT PRIMARY KEY,
                value INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS events (
                eventId TEXT PRIMARY KEY,
                repository TEXT NOT NULL,
                dataId TEXT NOT NULL,
                operation TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                createdAt INTEGER NOT NULL,
                data TEXT,
                UNIQUE(repository, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_events_repo_dataid ON events (repository, dataId);
            CREATE INDEX IF NOT EXISTS idx_events_repo_seq ON events (repository, sequence);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            broadcasts: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn new_in_memory() -> ServerResult<Self> {
        Self::open(":memory:")
    }

    /// A connected WS client registers itself on upgrade and deregisters on
    /// disconnect; `/api/health`'s `activeConnections` field reports this.
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, repository: &str) -> broadcast::Receiver<Event> {
        let mut map = self.broadcasts.lock().unwrap();
        map.entry(repository.to_string()).or_insert_with(|| broadcast::channel(256).0).subscribe()
    }

    fn publish(&self, repository: &str, event: &Event) {
        let map = self.broadcasts.lock().unwrap();
        if let Some(tx) = map.get(repository) {
            let _ = tx.send(event.clone());
        }
    }

    /// Accepts one event for `repository`, assigning it the next sequence
    /// number. Idempotent on `eventId`: re-submitting an already-accepted
    /// event returns its originally-assigned sequence rather than erroring.
    /// Retries the optimistic sequence bump a bounded number of times on a
    /// concurrent writer collision before giving up.
    pub async fn accept_event(&self, repository: &str, mut event: Event) -> ServerResult<i64> {
        let conn = self.conn.clone();
        let repository = repository.to_string();
        event.server_sequence = None;

        let (sequence, accepted_event) = tokio::task::spawn_blocking(move || -> ServerResult<(i64, Event)> {
            let mut conn = conn.blocking_lock();

            if let Some(seq) = conn
                .query_row("SELECT sequence FROM events WHERE eventId = ?1", [&event.event_id], |r| r.get::<_, i64>(0))
                .optional()?
            {
                return Ok((seq, event));
            }

            for attempt in 0..MAX_SEQUENCE_RETRIES {
                let tx = conn.transaction()?;
                let current: i64 = tx
                    .query_row("SELECT value FROM sequences WHERE repository = ?1", [&repository], |r| r.get(0))
                    .optional()?
                    .unwrap_or(0);
                let next = current + 1;

                let updated = tx.execute(
                    "INSERT INTO sequences (repository, value) VALUES (?1, ?2)
                     ON CONFLICT(repository) DO UPDATE SET value = ?2 WHERE value = ?3",
                    rusqlite::params![repository, next, current],
                )?;
                if updated == 0 {
                    // lost the race with a concurrent writer; retry with backoff
                    drop(tx);
                    std::thread::sleep(Duration::from_millis(10 * (attempt as u64 + 1)));
                    continue;
                }

                tx.execute(
                    "INSERT INTO events (eventId, repository, dataId, operation, sequence, createdAt, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(eventId) DO NOTHING",
                    rusqlite::params![
                        event.event_id,
                        repository,
                        event.data_id,
                        event.operation.as_str(),
                        next,
                        event.created_at.timestamp_millis(),
                        event.data.as_ref().map(|v| v.to_string()),
                    ],
                )?;
                tx.commit()?;
                event.server_sequence = Some(next);
                event.sync_status = None;
                return Ok((next, event));
            }
            Err(ServerError::SequenceConflict(repository))
        })
        .await
        .expect("sequence worker panicked")?;

        self.publish(&repository, &accepted_event);
        Ok(sequence)
    }

    pub async fn repositories(&self) -> ServerResult<Vec<String>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> ServerResult<Vec<String>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT DISTINCT repository FROM events ORDER BY repository")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .expect("repositories worker panicked")
    }

    /// `GET /api/repositories`'s listing: per-repository event count and
    /// high-water sequence, alongside the plain name list `repositories`
    /// returns for the sync protocol's own internal use.
    pub async fn repository_summaries(&self) -> ServerResult<Vec<RepositorySummary>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> ServerResult<Vec<RepositorySummary>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT repository, COUNT(*), MAX(sequence) FROM events GROUP BY repository ORDER BY repository",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(RepositorySummary { name: r.get(0)?, event_count: r.get(1)?, max_sequence: r.get(2)? })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(ServerError::from)
        })
        .await
        .expect("repository_summaries worker panicked")
    }

    /// Events for `repository`, deduplicated to the latest per `dataId` and
    /// ordered by sequence — except `counter_log`, which is append-only
    /// semantics the caller cares about in full and in descending order.
    pub async fn events_for(&self, repository: &str, since_sequence: Option<i64>, limit: Option<i64>) -> ServerResult<Vec<Event>> {
        let conn = self.conn.clone();
        let repository = repository.to_string();
        tokio::task::spawn_blocking(move || -> ServerResult<Vec<Event>> {
            let conn = conn.blocking_lock();
            let rows: Vec<Event> = if repository == COUNTER_LOG_REPOSITORY {
                let limit = limit.unwrap_or(5);
                let mut stmt = conn.prepare(
                    "SELECT eventId, dataId, operation, sequence, createdAt, data FROM events
                     WHERE repository = ?1 ORDER BY sequence DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![repository, limit], |r| row_to_event(&repository, r))?;
                rows.collect::<Result<Vec<_>, _>>()?
            } else {
                let since = since_sequence.unwrap_or(0);
                let mut stmt = conn.prepare(
                    "SELECT e.eventId, e.dataId, e.operation, e.sequence, e.createdAt, e.data
                     FROM events e
                     INNER JOIN (SELECT dataId, MAX(sequence) AS maxseq FROM events WHERE repository = ?1 GROUP BY dataId) latest
                     ON e.dataId = latest.dataId AND e.sequence = latest.maxseq
                     WHERE e.repository = ?1 AND e.sequence > ?2
                     ORDER BY e.sequence ASC",
                )?;
                let rows = stmt.query_map(rusqlite::params![repository, since], |r| row_to_event(&repository, r))?;
                let mut collected = rows.collect::<Result<Vec<_>, _>>()?;
                if let Some(limit) = limit {
                    collected.truncate(limit as usize);
                }
                collected
            };
            Ok(rows)
        })
        .await
        .expect("events_for worker panicked")
    }

    pub async fn event_by_id(&self, repository: &str, event_id: &str) -> ServerResult<Option<Event>> {
        let conn = self.conn.clone();
        let repository = repository.to_string();
        let event_id = event_id.to_string();
        tokio::task::spawn_blocking(move || -> ServerResult<Option<Event>> {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT eventId, dataId, operation, sequence, createdAt, data FROM events WHERE repository = ?1 AND eventId = ?2",
                rusqlite::params![repository, event_id],
                |r| row_to_event(&repository, r),
            )
            .optional()
            .map_err(ServerError::from)
        })
        .await
        .expect("event_by_id worker panicked")
    }

    pub async fn event_by_data_id(&self, repository: &str, data_id: &str) -> ServerResult<Option<Event>> {
        let conn = self.conn.clone();
        let repository = repository.to_string();
        let data_id = data_id.to_string();
        tokio::task::spawn_blocking(move || -> ServerResult<Option<Event>> {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT eventId, dataId, operation, sequence, createdAt, data FROM events
                 WHERE repository = ?1 AND dataId = ?2 ORDER BY sequence DESC LIMIT 1",
                rusqlite::params![repository, data_id],
                |r| row_to_event(&repository, r),
            )
            .optional()
            .map_err(ServerError::from)
        })
        .await
        .expect("event_by_data_id worker panicked")
    }

    /// `/api/health` reports the embedded store's reachability under the
    /// field name the wire contract fixes as `mongodb`, a historical name
    /// this deployment's clients already depend on.
    pub async fn health(&self) -> bool {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || conn.blocking_lock().query_row("SELECT 1", [], |_| Ok(())).is_ok())
            .await
            .unwrap_or(false)
    }
}

fn row_to_event(repository: &str, r: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let op_str: String = r.get(2)?;
    let created_ms: i64 = r.get(4)?;
    let data_str: Option<String> = r.get(5)?;
    Ok(Event {
        event_id: r.get(0)?,
        repository: repository.to_string(),
        data_id: r.get(1)?,
        operation: Operation::from_str(&op_str).unwrap_or(Operation::Update),
        created_at: Utc.timestamp_millis_opt(created_ms).single().unwrap_or_else(Utc::now),
        sync_status: None::<SyncStatus>,
        server_sequence: r.get(3)?,
        data: data_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_count_tracks_open_and_close() {
        let state = AppState::new_in_memory().unwrap();
        assert_eq!(state.active_connections(), 0);
        state.connection_opened();
        state.connection_opened();
        assert_eq!(state.active_connections(), 2);
        state.connection_closed();
        assert_eq!(state.active_connections(), 1);
    }

    #[tokio::test]
    async fn repository_summaries_report_count_and_max_sequence() {
        let state = AppState::new_in_memory().unwrap();
        state.accept_event("user", Event::new_insert("user", "u1", serde_json::json!({"id": "u1"}))).await.unwrap();
        state.accept_event("user", Event::new_insert("user", "u2", serde_json::json!({"id": "u2"}))).await.unwrap();

        let summaries = state.repository_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "user");
        assert_eq!(summaries[0].event_count, 2);
        assert_eq!(summaries[0].max_sequence, 2);
    }

    #[tokio::test]
    async fn accept_event_same_id_twice_is_idempotent() {
        let state = AppState::new_in_memory().unwrap();
        let event = Event::new_insert("user", "u1", serde_json::json!({"id": "u1"}));
        let seq1 = state.accept_event("user", event.clone()).await.unwrap();
        let seq2 = state.accept_event("user", event).await.unwrap();
        assert_eq!(seq1, seq2);
    }
}
