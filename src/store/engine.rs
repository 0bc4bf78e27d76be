//! Synchronous rusqlite-backed core of the local store.
//!
//! This is the part of `LocalStore` that actually touches disk. It holds no
//! async state at all — `store::LocalStore` wraps it in a mutex and drives
//! it from `spawn_blocking`, the same split `rostra-client-db` uses between
//! its blocking `redb` transactions and its async `Database` facade.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use crate::error::{StoreError, StoreResult};
use crate::model::{ConfigValue, Event, Operation, QueryRow, SyncStatus};
use crate::query::Query;
use crate::schema::{validate_field_name, validate_repository_name, Schema};

pub struct StoreCore {
    conn: Connection,
    schemas: HashMap<String, Schema>,
}

fn events_table(repository: &str) -> String {
    format!("{repository}__events")
}

impl StoreCore {
    pub fn open(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS metadata (
                k TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                v TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn, schemas: HashMap::new() })
    }

    pub fn ensure_schema(&mut self, repository: &str, schema: Schema, id_field: &str) -> StoreResult<()> {
        validate_repository_name(repository)?;
        validate_field_name(id_field).or_else(|_| {
            // idField is allowed to be "id" itself even though "id" is a
            // reserved *declared-field* name; it just names the existing PK.
            if id_field == "id" { Ok(()) } else { Err(StoreError::InvalidField(id_field.to_string())) }
        })?;
        for f in &schema.fields {
            validate_field_name(&f.name)?;
        }

        let mut cols = String::new();
        for f in &schema.fields {
            cols.push_str(&format!(", \"{}\" {}", f.name, f.field_type.sql_type()));
        }

        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{repository}" (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                _lasteventId TEXT
                {cols}
            );
            "#
        ))?;

        for f in &schema.fields {
            let idx_name = format!("idx_{repository}_{}", f.name);
            self.conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS \"{idx_name}\" ON \"{repository}\" (\"{}\");",
                f.name
            ))?;
        }

        let events_tbl = events_table(repository);
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{events_tbl}" (
                eventId TEXT PRIMARY KEY,
                dataId TEXT NOT NULL,
                operation TEXT NOT NULL,
                syncStatus TEXT NOT NULL DEFAULT 'pending',
                serverSequence INTEGER,
                createdAt INTEGER NOT NULL,
                data TEXT
            );
            CREATE INDEX IF NOT EXISTS "idx_{events_tbl}_dataId" ON "{events_tbl}" (dataId);
            CREATE INDEX IF NOT EXISTS "idx_{events_tbl}_status" ON "{events_tbl}" (syncStatus);
            "#
        ))?;

        self.schemas.insert(repository.to_string(), schema);
        Ok(())
    }

    fn schema_for(&self, repository: &str) -> StoreResult<&Schema> {
        self.schemas
            .get(repository)
            .ok_or_else(|| StoreError::InvalidField(format!("no schema declared for {repository}")))
    }

    // ---- record table -------------------------------------------------

    pub fn upsert_record(&mut self, repository: &str, record: &serde_json::Value, id_field: &str) -> StoreResult<String> {
        let id = extract_id(record, id_field)?;
        let schema = self.schema_for(repository)?.clone();

        let mut col_names = vec!["id".to_string(), "data".to_string()];
        let mut placeholders = vec!["?".to_string(), "?".to_string()];
        let mut values: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(id.clone()),
            rusqlite::types::Value::Text(record.to_string()),
        ];

        for f in &schema.fields {
            col_names.push(format!("\"{}\"", f.name));
            placeholders.push("?".to_string());
            values.push(field_value(record, &f.name, f.field_type));
        }

        let update_clause: Vec<String> = schema
            .fields
            .iter()
            .map(|f| format!("\"{}\" = excluded.\"{}\"", f.name, f.name))
            .chain(std::iter::once("data = excluded.data".to_string()))
            .collect();

        let sql = format!(
            "INSERT INTO \"{repository}\" ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            col_names.join(", "),
            placeholders.join(", "),
            update_clause.join(", "),
        );

        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(id)
    }

    pub fn set_last_event_id(&mut self, repository: &str, id: &str, event_id: &str) -> StoreResult<()> {
        self.conn.execute(
            &format!("UPDATE \"{repository}\" SET _lasteventId = ?1 WHERE id = ?2"),
            rusqlite::params![event_id, id],
        )?;
        Ok(())
    }

    /// Soft delete: row is retained with its payload untouched so that
    /// `includeDeleted` queries still have data to show; exclusion from
    /// normal queries comes from the event log's last operation.
    pub fn delete_record(&mut self, repository: &str, id: &str) -> StoreResult<()> {
        if id.is_empty() {
            return Err(StoreError::InvalidId);
        }
        let exists: Option<String> = self
            .conn
            .query_row(&format!("SELECT id FROM \"{repository}\" WHERE id = ?1"), [id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            self.conn.execute(
                &format!("INSERT INTO \"{repository}\" (id, data) VALUES (?1, ?2)"),
                rusqlite::params![id, "null"],
            )?;
        }
        Ok(())
    }

    pub fn delete_all_records(&mut self, repository: &str) -> StoreResult<()> {
        self.conn.execute(&format!("DELETE FROM \"{repository}\""), [])?;
        Ok(())
    }

    pub fn get_all(&self, repository: &str) -> StoreResult<Vec<serde_json::Value>> {
        let mut stmt = self.conn.prepare(&format!("SELECT data FROM \"{repository}\""))?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn get_by_id(&self, repository: &str, id: &str) -> StoreResult<Option<serde_json::Value>> {
        let data: Option<String> = self
            .conn
            .query_row(&format!("SELECT data FROM \"{repository}\" WHERE id = ?1"), [id], |r| r.get(0))
            .optional()?;
        Ok(match data {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    // ---- event log ------------------------------------------------------

    pub fn insert_event(&mut self, repository: &str, event: &Event) -> StoreResult<()> {
        if event.event_id.is_empty() || event.data_id.is_empty() {
            return Err(StoreError::InvalidEvent("eventId and dataId are required"));
        }
        let events_tbl = events_table(repository);
        self.conn.execute(
            &format!(
                "INSERT INTO \"{events_tbl}\" (eventId, dataId, operation, syncStatus, serverSequence, createdAt, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(eventId) DO NOTHING"
            ),
            rusqlite::params![
                event.event_id,
                event.data_id,
                event.operation.as_str(),
                event.sync_status.unwrap_or(SyncStatus::Pending).as_str(),
                event.server_sequence,
                event.created_at.timestamp_millis(),
                event.data.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn update_event(&mut self, repository: &str, event: &Event) -> StoreResult<()> {
        if event.event_id.is_empty() || event.data_id.is_empty() {
            return Err(StoreError::InvalidEvent("eventId and dataId are required"));
        }
        let events_tbl = events_table(repository);
        self.conn.execute(
            &format!(
                "UPDATE \"{events_tbl}\" SET dataId = ?2, operation = ?3, syncStatus = ?4,
                     serverSequence = ?5, data = ?6 WHERE eventId = ?1"
            ),
            rusqlite::params![
                event.event_id,
                event.data_id,
                event.operation.as_str(),
                event.sync_status.unwrap_or(SyncStatus::Pending).as_str(),
                event.server_sequence,
                event.data.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn delete_event(&mut self, repository: &str, event_id: &str) -> StoreResult<()> {
        if event_id.is_empty() {
            return Err(StoreError::InvalidEvent("eventId is required"));
        }
        let events_tbl = events_table(repository);
        self.conn
            .execute(&format!("DELETE FROM \"{events_tbl}\" WHERE eventId = ?1"), [event_id])?;
        Ok(())
    }

    pub fn mark_event_synced(&mut self, repository: &str, event_id: &str, server_sequence: i64) -> StoreResult<()> {
        let events_tbl = events_table(repository);
        self.conn.execute(
            &format!("UPDATE \"{events_tbl}\" SET syncStatus = 'synced', serverSequence = ?2 WHERE eventId = ?1"),
            rusqlite::params![event_id, server_sequence],
        )?;
        Ok(())
    }

    pub fn get_all_events(&self, repository: &str) -> StoreResult<Vec<Event>> {
        let events_tbl = events_table(repository);
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT eventId, dataId, operation, syncStatus, serverSequence, createdAt, data FROM \"{events_tbl}\" ORDER BY createdAt ASC"))?;
        let rows = stmt.query_map([], |r| row_to_event(repository, r))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_pending_events(&self, repository: &str) -> StoreResult<Vec<Event>> {
        let events_tbl = events_table(repository);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT eventId, dataId, operation, syncStatus, serverSequence, createdAt, data
             FROM \"{events_tbl}\" WHERE syncStatus = 'pending' ORDER BY createdAt ASC"
        ))?;
        let rows = stmt.query_map([], |r| row_to_event(repository, r))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_event_by_id(&self, repository: &str, event_id: &str) -> StoreResult<Option<Event>> {
        let events_tbl = events_table(repository);
        self.conn
            .query_row(
                &format!("SELECT eventId, dataId, operation, syncStatus, serverSequence, createdAt, data FROM \"{events_tbl}\" WHERE eventId = ?1"),
                [event_id],
                |r| row_to_event(repository, r),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn get_event_by_data_id(&self, repository: &str, data_id: &str) -> StoreResult<Option<Event>> {
        let events_tbl = events_table(repository);
        self.conn
            .query_row(
                &format!(
                    "SELECT eventId, dataId, operation, syncStatus, serverSequence, createdAt, data
                     FROM \"{events_tbl}\" WHERE dataId = ?1 ORDER BY createdAt DESC LIMIT 1"
                ),
                [data_id],
                |r| row_to_event(repository, r),
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// The event the record's own `_lasteventId` pointer names, rather than
    /// whichever event happens to sort last by `createdAt`. Unlike
    /// `get_event_by_data_id`, this can't be fooled by two events landing in
    /// the same millisecond.
    pub fn get_current_event(&self, repository: &str, data_id: &str) -> StoreResult<Option<Event>> {
        let events_tbl = events_table(repository);
        self.conn
            .query_row(
                &format!(
                    "SELECT e.eventId, e.dataId, e.operation, e.syncStatus, e.serverSequence, e.createdAt, e.data
                     FROM \"{repository}\" r
                     JOIN \"{events_tbl}\" e ON e.eventId = r._lasteventId
                     WHERE r.id = ?1"
                ),
                [data_id],
                |r| row_to_event(repository, r),
            )
            .optional()
            .map_err(StoreError::from)
    }

    // ---- queries --------------------------------------------------------

    pub fn query(&self, q: &Query) -> StoreResult<Vec<QueryRow>> {
        if q.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let indexed: Vec<String> = self
            .schemas
            .get(&q.repository)
            .map(|s| s.fields.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default();

        let events_tbl = events_table(&q.repository);
        let (where_sql, params) = q.compile_where(&indexed);
        let order_sql = q.compile_order_by(&indexed);

        // Joins on the record's own `_lasteventId` pointer rather than
        // re-deriving "latest" from `createdAt`, which two events appended
        // in the same millisecond would tie on and fan out into duplicate
        // rows for one `id`.
        let mut sql = format!(
            "SELECT r.id, r.data, le.eventId, le.operation, le.syncStatus, le.serverSequence, le.createdAt
             FROM \"{repo}\" r
             LEFT JOIN \"{events_tbl}\" le ON le.eventId = r._lasteventId",
            repo = q.repository,
        );
        // rewrite le.* aliases the compiled where clause expects (le_operation etc.)
        let where_sql = where_sql.replace("le_operation", "le.operation");
        sql.push_str(&format!(" WHERE {where_sql}"));
        sql.push_str(&order_sql);
        if let Some(limit) = q.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = q.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| {
            let data_str: String = r.get(1)?;
            let op_str: Option<String> = r.get(3)?;
            let status_str: Option<String> = r.get(4)?;
            let created_ms: Option<i64> = r.get(6)?;
            Ok(QueryRow {
                id: r.get(0)?,
                data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
                last_event_id: r.get(2)?,
                last_operation: op_str.and_then(|s| Operation::from_str(&s)),
                last_sync_status: status_str.and_then(|s| SyncStatus::from_str(&s)),
                last_server_sequence: r.get(5)?,
                last_created_at: created_ms.map(|ms| Utc.timestamp_millis_opt(ms).unwrap()),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- config key-value -------------------------------------------------

    pub fn set_config_value(&mut self, key: &str, value: &ConfigValue) -> StoreResult<()> {
        let v = match value {
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Int(i) => i.to_string(),
            ConfigValue::Double(d) => d.to_string(),
            ConfigValue::String(s) => s.clone(),
            ConfigValue::StringList(items) => serde_json::to_string(items)?,
        };
        self.conn.execute(
            "INSERT INTO metadata (k, type, v) VALUES (?1, ?2, ?3)
             ON CONFLICT(k) DO UPDATE SET type = excluded.type, v = excluded.v",
            rusqlite::params![key, value.type_tag(), v],
        )?;
        Ok(())
    }

    pub fn get_config_value(&self, key: &str) -> StoreResult<Option<ConfigValue>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row("SELECT type, v FROM metadata WHERE k = ?1", [key], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?;
        Ok(match row {
            None => None,
            Some((ty, v)) => match ty.as_str() {
                "bool" => v.parse::<bool>().ok().map(ConfigValue::Bool),
                "int" => v.parse::<i64>().ok().map(ConfigValue::Int),
                "double" => v.parse::<f64>().ok().map(ConfigValue::Double),
                "string" => Some(ConfigValue::String(v)),
                "string_list" => serde_json::from_str::<Vec<String>>(&v).ok().map(ConfigValue::StringList),
                // Mismatched/unknown type tag: treat as absent per spec.
                _ => None,
            },
        })
    }

    pub fn contains_config_key(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get_config_value(key)?.is_some())
    }

    pub fn remove_config(&mut self, key: &str) -> StoreResult<()> {
        self.conn.execute("DELETE FROM metadata WHERE k = ?1", [key])?;
        Ok(())
    }

    pub fn clear_config(&mut self) -> StoreResult<()> {
        self.conn.execute("DELETE FROM metadata", [])?;
        Ok(())
    }

    pub fn get_config_keys(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT k FROM metadata")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_event(repository: &str, r: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let op_str: String = r.get(2)?;
    let status_str: String = r.get(3)?;
    let created_ms: i64 = r.get(5)?;
    let data_str: Option<String> = r.get(6)?;
    Ok(Event {
        event_id: r.get(0)?,
        repository: repository.to_string(),
        data_id: r.get(1)?,
        operation: Operation::from_str(&op_str).unwrap_or(Operation::Update),
        created_at: to_datetime(created_ms),
        sync_status: SyncStatus::from_str(&status_str),
        server_sequence: r.get(4)?,
        data: data_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn extract_id(record: &serde_json::Value, id_field: &str) -> StoreResult<String> {
    record
        .get(id_field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(StoreError::InvalidId)
}

fn field_value(record: &serde_json::Value, name: &str, field_type: crate::schema::FieldType) -> rusqlite::types::Value {
    use crate::schema::FieldType;
    use rusqlite::types::Value;
    let Some(v) = record.get(name) else { return Value::Null };
    match field_type {
        FieldType::Text => v.as_str().map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null),
        FieldType::Integer => v.as_i64().map(Value::Integer).unwrap_or(Value::Null),
        FieldType::Boolean => v.as_bool().map(|b| Value::Integer(if b { 1 } else { 0 })).unwrap_or(Value::Null),
        FieldType::Real => v.as_f64().map(Value::Real).unwrap_or(Value::Null),
        FieldType::DateTime => v.as_i64().map(Value::Integer).unwrap_or(Value::Null),
        FieldType::Blob => v
            .as_str()
            .map(|s| Value::Blob(s.as_bytes().to_vec()))
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, SchemaField};
    use serde_json::json;

    fn open_core() -> StoreCore {
        StoreCore::open(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn ensure_schema_rejects_reserved_field() {
        let mut core = open_core();
        let schema = Schema::new(vec![SchemaField::new("data", FieldType::Text)]);
        assert!(core.ensure_schema("user", schema, "id").is_err());
    }

    #[test]
    fn upsert_then_get_by_id_roundtrips() {
        let mut core = open_core();
        core.ensure_schema("user", Schema::new(vec![SchemaField::new("name", FieldType::Text)]), "id").unwrap();
        let rec = json!({"id": "u1", "name": "a"});
        let id = core.upsert_record("user", &rec, "id").unwrap();
        assert_eq!(id, "u1");
        let got = core.get_by_id("user", "u1").unwrap().unwrap();
        assert_eq!(got["name"], "a");
    }

    #[test]
    fn upsert_missing_id_fails() {
        let mut core = open_core();
        core.ensure_schema("user", Schema::new(vec![]), "id").unwrap();
        let rec = json!({"name": "a"});
        assert!(matches!(core.upsert_record("user", &rec, "id"), Err(StoreError::InvalidId)));
    }

    #[test]
    fn insert_event_is_idempotent_on_event_id() {
        let mut core = open_core();
        core.ensure_schema("user", Schema::new(vec![]), "id").unwrap();
        let ev = Event::new_insert("user", "u1", json!({"id": "u1"}));
        core.insert_event("user", &ev).unwrap();
        core.insert_event("user", &ev).unwrap();
        assert_eq!(core.get_all_events("user").unwrap().len(), 1);
    }

    #[test]
    fn query_excludes_deleted_unless_requested() {
        let mut core = open_core();
        core.ensure_schema("user", Schema::new(vec![SchemaField::new("name", FieldType::Text)]), "id").unwrap();
        core.upsert_record("user", &json!({"id": "u1", "name": "a"}), "id").unwrap();
        let ins = Event::new_insert("user", "u1", json!({"id": "u1", "name": "a"}));
        core.insert_event("user", &ins).unwrap();
        core.set_last_event_id("user", "u1", &ins.event_id).unwrap();

        let del = Event::new_delete("user", "u1");
        core.insert_event("user", &del).unwrap();
        core.delete_record("user", "u1").unwrap();
        core.set_last_event_id("user", "u1", &del.event_id).unwrap();

        let visible = core.query(&Query::new("user")).unwrap();
        assert!(visible.is_empty());

        let with_deleted = core.query(&Query::new("user").include_deleted(true)).unwrap();
        assert_eq!(with_deleted.len(), 1);
    }
}
