// =============================================================================
// Tessera Rooms - Test Utilities Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   Fixture builders shared by unit and integration tests: a PDU builder
//   and a helper that stores events into a database while maintaining the
//   running room state, so every stored event carries a before-state
//   snapshot the way live ingestion would leave it.
//
// =============================================================================

use ruma::{
    events::TimelineEventType, EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, RoomId, UInt,
    UserId,
};
use serde_json::{json, Value as JsonValue};
use tessera_core::{EventNid, Pdu, RoomInfo, StateEntry};

use crate::{error::Result, storage::Database};

/// Starts building a message PDU with sane defaults.
pub fn pdu_builder(event_id: &str, room_id: &str, sender: &str) -> PduBuilder {
    PduBuilder {
        pdu: Pdu {
            event_id: EventId::parse(event_id)
                .expect("valid event ID in fixture")
                .to_owned(),
            room_id: RoomId::parse(room_id)
                .expect("valid room ID in fixture")
                .to_owned(),
            sender: UserId::parse(sender)
                .expect("valid user ID in fixture")
                .to_owned(),
            kind: TimelineEventType::RoomMessage,
            state_key: None,
            prev_events: vec![],
            auth_events: vec![],
            depth: 1,
            origin_server_ts: MilliSecondsSinceUnixEpoch(UInt::from(0u32)),
            content: json!({}),
            redacts: None,
            unsigned: None,
            signatures: None,
        },
    }
}

/// Builder for test PDUs.
pub struct PduBuilder {
    pdu: Pdu,
}

impl PduBuilder {
    pub fn kind(mut self, kind: TimelineEventType) -> Self {
        self.pdu.kind = kind;
        self
    }

    pub fn state_key(mut self, state_key: &str) -> Self {
        self.pdu.state_key = Some(state_key.to_owned());
        self
    }

    pub fn prev_events(mut self, event_ids: &[&str]) -> Self {
        self.pdu.prev_events = parse_ids(event_ids);
        self
    }

    pub fn auth_events(mut self, event_ids: &[&str]) -> Self {
        self.pdu.auth_events = parse_ids(event_ids);
        self
    }

    pub fn depth(mut self, depth: u64) -> Self {
        self.pdu.depth = depth;
        self.pdu.origin_server_ts =
            MilliSecondsSinceUnixEpoch(UInt::try_from(depth).expect("small depth in fixture"));
        self
    }

    pub fn content(mut self, content: JsonValue) -> Self {
        self.pdu.content = content;
        self
    }

    pub fn redacts(mut self, event_id: &str) -> Self {
        self.pdu.redacts = Some(
            EventId::parse(event_id)
                .expect("valid event ID in fixture")
                .to_owned(),
        );
        self
    }

    pub fn build(self) -> Pdu {
        self.pdu
    }
}

fn parse_ids(event_ids: &[&str]) -> Vec<OwnedEventId> {
    event_ids
        .iter()
        .map(|id| {
            EventId::parse(*id)
                .expect("valid event ID in fixture")
                .to_owned()
        })
        .collect()
}

/// Stores `pdu` with a before-state snapshot taken from `current_state`,
/// then advances `current_state` across the event. Mirrors what live
/// ingestion leaves behind, so backfill code paths can read state at any
/// stored event.
pub async fn store_event_with_state<D: Database + ?Sized>(
    db: &D,
    pdu: &Pdu,
    current_state: &mut Vec<StateEntry>,
) -> Result<(RoomInfo, EventNid)> {
    let info = db.get_or_create_room_info(pdu).await?;
    let event_type_nid = db.get_or_create_event_type_nid(&pdu.kind).await?;
    let event_state_key_nid = db
        .get_or_create_event_state_key_nid(pdu.state_key.as_deref())
        .await?;
    let event_nid = db
        .store_event(pdu, &info, event_type_nid, event_state_key_nid, vec![], false)
        .await?;

    let snapshot = db
        .add_state(info.room_nid, &[], current_state.clone())
        .await?;
    db.set_state(event_nid, snapshot).await?;

    if pdu.is_state_event() {
        match current_state.iter_mut().find(|entry| {
            entry.event_type_nid == event_type_nid
                && entry.event_state_key_nid == event_state_key_nid
        }) {
            Some(entry) => entry.event_nid = event_nid,
            None => current_state.push(StateEntry {
                event_type_nid,
                event_state_key_nid,
                event_nid,
            }),
        }
    }
    Ok((info, event_nid))
}
