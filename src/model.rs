//! Wire and storage types shared by the store, the client, and the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three operations an event can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Local-only sync state of an event. Never sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// An immutable fact describing one change to one record.
///
/// `sync_status` and `server_sequence` are local bookkeeping: a freshly
/// created event has neither confirmed; the server never sends `sync_status`
/// and always stamps `server_sequence` before this struct leaves its process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub repository: String,
    pub data_id: String,
    pub operation: Operation,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_status: Option<SyncStatus>,
    #[serde(default)]
    pub server_sequence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new_insert(repository: impl Into<String>, data_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            repository: repository.into(),
            data_id: data_id.into(),
            operation: Operation::Insert,
            created_at: Utc::now(),
            sync_status: Some(SyncStatus::Pending),
            server_sequence: None,
            data: Some(data),
        }
    }

    pub fn new_update(repository: impl Into<String>, data_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            repository: repository.into(),
            data_id: data_id.into(),
            operation: Operation::Update,
            created_at: Utc::now(),
            sync_status: Some(SyncStatus::Pending),
            server_sequence: None,
            data: Some(data),
        }
    }

    pub fn new_delete(repository: impl Into<String>, data_id: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            repository: repository.into(),
            data_id: data_id.into(),
            operation: Operation::Delete,
            created_at: Utc::now(),
            sync_status: Some(SyncStatus::Pending),
            server_sequence: None,
            data: None,
        }
    }
}

/// Materialized read of one record joined with its last-applied event's
/// metadata, as returned by `query`/`watch_query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRow {
    pub id: String,
    pub data: serde_json::Value,
    pub last_event_id: Option<String>,
    pub last_operation: Option<Operation>,
    pub last_sync_status: Option<SyncStatus>,
    pub last_server_sequence: Option<i64>,
    pub last_created_at: Option<DateTime<Utc>>,
}

/// Typed tag for values held in the config key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    StringList(Vec<String>),
}

impl ConfigValue {
    pub fn type_tag(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::Double(_) => "double",
            ConfigValue::String(_) => "string",
            ConfigValue::StringList(_) => "string_list",
        }
    }
}
