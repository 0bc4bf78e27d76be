//! Wire messages exchanged with the server authority over the WebSocket
//! connection. Every message carries a `type` discriminator so the peer can
//! dispatch without knowing the full set of variants up front.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Event;

/// Client -> server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    PushEvent {
        repository: String,
        event: Event,
    },
    PushEventsBatch {
        repository: String,
        events: Vec<Event>,
    },
    RequestAllEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        repository: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
    },
    RequestEvents {
        repository: String,
        #[serde(rename = "afterSequence")]
        since_sequence: i64,
    },
    EventsReceived {
        repository: String,
        count: usize,
    },
    Ping {
        #[serde(rename = "sentAt")]
        sent_at: DateTime<Utc>,
    },
}

/// Server -> client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    EventsReceived {
        #[serde(rename = "eventIds")]
        event_ids: Vec<String>,
        #[serde(rename = "serverSequences")]
        server_sequences: Vec<i64>,
    },
    Events {
        repository: String,
        events: Vec<Event>,
    },
    Ack {
        #[serde(rename = "eventId")]
        event_id: String,
        #[serde(rename = "serverSequence")]
        server_sequence: i64,
    },
    SyncComplete {
        repository: String,
    },
    Pong {
        #[serde(rename = "sentAt")]
        sent_at: DateTime<Utc>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trips_through_json() {
        let msg = ClientMessage::Auth { token: "t".into(), client_id: "c".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"auth\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        matches!(back, ClientMessage::Auth { .. });
    }

    #[test]
    fn server_message_error_has_optional_code() {
        let msg = ServerMessage::Error { message: "bad".into(), code: None };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("code"));
    }
}
