//! Numeric identifiers and store-level records
//!
//! The event store assigns a monotonic numeric identifier (NID) to every
//! unique event, room, event type and state key it sees. NIDs are the
//! internal currency of the store; event IDs are the external currency.
//! A handful of event types are so hot that their NIDs are reserved ahead
//! of time, so code can match on them without a lookup.

use ruma::RoomVersionId;
use serde::{Deserialize, Serialize};

use crate::pdu::Pdu;

/// Numeric identifier of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventNid(pub i64);

/// Numeric identifier of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomNid(pub i64);

/// Numeric identifier of an event type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventTypeNid(pub i64);

/// Numeric identifier of a state key string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventStateKeyNid(pub i64);

/// Numeric identifier of an immutable state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateSnapshotNid(pub i64);

impl EventTypeNid {
    pub const ROOM_CREATE: Self = Self(1);
    pub const ROOM_POWER_LEVELS: Self = Self(2);
    pub const ROOM_JOIN_RULES: Self = Self(3);
    pub const ROOM_THIRD_PARTY_INVITE: Self = Self(4);
    pub const ROOM_MEMBER: Self = Self(5);
    pub const ROOM_REDACTION: Self = Self(6);
    pub const ROOM_HISTORY_VISIBILITY: Self = Self(7);

    /// First NID handed out for event types without a reserved slot.
    pub const FIRST_DYNAMIC: Self = Self(8);
}

impl EventStateKeyNid {
    /// The empty state key. Message events also use this slot.
    pub const EMPTY: Self = Self(1);

    /// First NID handed out for state keys other than the empty one.
    pub const FIRST_DYNAMIC: Self = Self(2);
}

/// One active state slot: `(type, state_key) -> event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateEntry {
    pub event_type_nid: EventTypeNid,
    pub event_state_key_nid: EventStateKeyNid,
    pub event_nid: EventNid,
}

/// The store's knowledge of a room.
///
/// A stub room exists only as a placeholder: it has been referenced by some
/// event but never populated, and must be treated as unknown for backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_nid: RoomNid,
    pub room_version: RoomVersionId,
    pub is_stub: bool,
}

/// NIDs resolved for an event ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_nid: EventNid,
    pub room_nid: RoomNid,
}

/// An event as loaded from the store, with its NID and the snapshot of the
/// room state that held immediately before it (when known).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_nid: EventNid,
    pub before_state_snapshot: Option<StateSnapshotNid>,
    pub pdu: Pdu,
}
