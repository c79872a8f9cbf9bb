//! PDU — the signed room event
//!
//! A PDU is immutable once signed: redaction overwrites the sensitive parts
//! of the content in place while preserving the event ID and the signatures
//! over the redacted form, so a redacted event still hashes into the DAG.

use ruma::{
    events::TimelineEventType, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId,
    ServerName,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A persistent data unit: one signed event in the room DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pdu {
    pub event_id: OwnedEventId,

    pub room_id: OwnedRoomId,

    pub sender: OwnedUserId,

    #[serde(rename = "type")]
    pub kind: TimelineEventType,

    /// Present iff this is a state event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    #[serde(default)]
    pub prev_events: Vec<OwnedEventId>,

    #[serde(default)]
    pub auth_events: Vec<OwnedEventId>,

    #[serde(default)]
    pub depth: u64,

    pub origin_server_ts: MilliSecondsSinceUnixEpoch,

    pub content: JsonValue,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<JsonValue>,
}

impl Pdu {
    /// Whether this event carries a state key and therefore contributes to
    /// the room state.
    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }

    /// Whether this event's state key is present and equal to `key`.
    pub fn state_key_equals(&self, key: &str) -> bool {
        self.state_key.as_deref() == Some(key)
    }

    /// The server part of the sender identifier.
    pub fn sender_server(&self) -> &ServerName {
        self.sender.server_name()
    }

    /// Redact this event in place.
    ///
    /// Strips the content down to the keys the redaction algorithm preserves
    /// for the event type, and drops `unsigned`. Event ID and signatures are
    /// kept so the event remains addressable inside the DAG.
    pub fn redact(&mut self) {
        let keep: &[&str] = match self.kind {
            TimelineEventType::RoomMember => &["membership"],
            TimelineEventType::RoomCreate => &["creator"],
            TimelineEventType::RoomJoinRules => &["join_rule"],
            TimelineEventType::RoomPowerLevels => &[
                "ban",
                "events",
                "events_default",
                "kick",
                "redact",
                "state_default",
                "users",
                "users_default",
            ],
            TimelineEventType::RoomAliases => &["aliases"],
            TimelineEventType::RoomHistoryVisibility => &["history_visibility"],
            _ => &[],
        };

        let mut redacted = Map::new();
        if let JsonValue::Object(content) = &self.content {
            for key in keep {
                if let Some(value) = content.get(*key) {
                    redacted.insert((*key).to_owned(), value.clone());
                }
            }
        }
        self.content = JsonValue::Object(redacted);
        self.unsigned = None;
    }

    /// A redacted copy of this event.
    pub fn to_redacted(&self) -> Self {
        let mut pdu = self.clone();
        pdu.redact();
        pdu
    }
}
