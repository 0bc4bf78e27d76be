//! Conflict resolution for records touched both locally and remotely.
//!
//! The default policy is last-writer-wins on `updatedAt`, ties broken in the
//! remote's favor (the server's copy has already been accepted by every
//! other client, so it is the safer default to converge on).

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A pluggable `onConflict` policy, matched on `Repository::on_conflict`.
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, local: &Value, remote: &Value) -> Value;
}

/// `updatedAt` must be an RFC3339 string field on the record for this
/// policy to compare meaningfully; records missing or failing to parse it
/// are treated as an epoch timestamp, so a well-formed peer always wins.
pub struct LastWriteWins {
    pub updated_at_field: String,
}

impl LastWriteWins {
    pub fn new(updated_at_field: impl Into<String>) -> Self {
        Self { updated_at_field: updated_at_field.into() }
    }

    fn updated_at(&self, record: &Value) -> DateTime<Utc> {
        record
            .get(&self.updated_at_field)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
    }
}

impl Default for LastWriteWins {
    fn default() -> Self {
        Self::new("updatedAt")
    }
}

impl ConflictPolicy for LastWriteWins {
    fn resolve(&self, local: &Value, remote: &Value) -> Value {
        if self.updated_at(local) > self.updated_at(remote) {
            local.clone()
        } else {
            remote.clone()
        }
    }
}

/// Remote always wins, regardless of timestamps. Useful for repositories
/// the server treats as its own source of truth (e.g. `counter_log`).
pub struct RemoteWins;

impl ConflictPolicy for RemoteWins {
    fn resolve(&self, _local: &Value, remote: &Value) -> Value {
        remote.clone()
    }
}

/// Local always wins. Rarely correct, but useful for client-private
/// repositories that happen to share a name with a remote stream.
pub struct LocalWins;

impl ConflictPolicy for LocalWins {
    fn resolve(&self, local: &Value, _remote: &Value) -> Value {
        local.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn newer_updated_at_wins() {
        let policy = LastWriteWins::default();
        let local = json!({"updatedAt": "2024-01-02T00:00:00Z", "v": "local"});
        let remote = json!({"updatedAt": "2024-01-01T00:00:00Z", "v": "remote"});
        assert_eq!(policy.resolve(&local, &remote)["v"], "local");
    }

    #[test]
    fn tie_resolves_to_remote() {
        let policy = LastWriteWins::default();
        let local = json!({"updatedAt": "2024-01-01T00:00:00Z", "v": "local"});
        let remote = json!({"updatedAt": "2024-01-01T00:00:00Z", "v": "remote"});
        assert_eq!(policy.resolve(&local, &remote)["v"], "remote");
    }

    #[test]
    fn missing_updated_at_loses_to_well_formed_peer() {
        let policy = LastWriteWins::default();
        let local = json!({"v": "local"});
        let remote = json!({"updatedAt": "2024-01-01T00:00:00Z", "v": "remote"});
        assert_eq!(policy.resolve(&local, &remote)["v"], "remote");
    }
}
