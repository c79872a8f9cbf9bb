// =============================================================================
// Tessera Rooms - In-Memory Event Store
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   Reference implementation of the storage facade over process memory.
//   NIDs are handed out from per-namespace monotonic counters, with the
//   well-known event types and the empty state key pre-seeded so their NIDs
//   are stable across instances.
//
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use ruma::{
    events::TimelineEventType, OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, RoomId,
    RoomVersionId, UserId,
};
use tessera_core::{
    EventMetadata, EventNid, EventStateKeyNid, EventTypeNid, Pdu, RoomInfo, RoomNid, StateEntry,
    StateSnapshotNid, StoredEvent,
};

use crate::{
    auth,
    error::{Result, RoomsError},
    storage::Database,
};

struct EventRecord {
    pdu: Pdu,
    room_nid: RoomNid,
    event_type_nid: EventTypeNid,
    event_state_key_nid: EventStateKeyNid,
    before_state_snapshot: Option<StateSnapshotNid>,
    rejected: bool,
}

struct Inner {
    next_room_nid: i64,
    next_event_nid: i64,
    next_event_type_nid: i64,
    next_state_key_nid: i64,
    next_snapshot_nid: i64,
    rooms: HashMap<OwnedRoomId, RoomInfo>,
    event_ids: HashMap<OwnedEventId, EventMetadata>,
    events: HashMap<EventNid, EventRecord>,
    event_types: HashMap<String, EventTypeNid>,
    state_keys: HashMap<String, EventStateKeyNid>,
    snapshots: HashMap<StateSnapshotNid, Vec<StateEntry>>,
    /// redaction target -> the redacting event
    redactions: HashMap<OwnedEventId, OwnedEventId>,
    /// room -> member -> latest membership event
    memberships: HashMap<RoomNid, HashMap<OwnedUserId, EventNid>>,
}

impl Inner {
    fn seeded() -> Self {
        let event_types = [
            (TimelineEventType::RoomCreate, EventTypeNid::ROOM_CREATE),
            (
                TimelineEventType::RoomPowerLevels,
                EventTypeNid::ROOM_POWER_LEVELS,
            ),
            (
                TimelineEventType::RoomJoinRules,
                EventTypeNid::ROOM_JOIN_RULES,
            ),
            (
                TimelineEventType::RoomThirdPartyInvite,
                EventTypeNid::ROOM_THIRD_PARTY_INVITE,
            ),
            (TimelineEventType::RoomMember, EventTypeNid::ROOM_MEMBER),
            (
                TimelineEventType::RoomRedaction,
                EventTypeNid::ROOM_REDACTION,
            ),
            (
                TimelineEventType::RoomHistoryVisibility,
                EventTypeNid::ROOM_HISTORY_VISIBILITY,
            ),
        ]
        .into_iter()
        .map(|(kind, nid)| (kind.to_string(), nid))
        .collect();

        Self {
            next_room_nid: 1,
            next_event_nid: 1,
            next_event_type_nid: EventTypeNid::FIRST_DYNAMIC.0,
            next_state_key_nid: EventStateKeyNid::FIRST_DYNAMIC.0,
            next_snapshot_nid: 1,
            rooms: HashMap::new(),
            event_ids: HashMap::new(),
            events: HashMap::new(),
            event_types,
            state_keys: HashMap::from([(String::new(), EventStateKeyNid::EMPTY)]),
            snapshots: HashMap::new(),
            redactions: HashMap::new(),
            memberships: HashMap::new(),
        }
    }
}

/// In-memory event store.
pub struct MemoryDatabase {
    local_servers: Vec<OwnedServerName>,
    inner: Mutex<Inner>,
}

impl MemoryDatabase {
    /// Creates an empty store. `local_servers` drives the `local_only`
    /// membership filter.
    pub fn new(local_servers: Vec<OwnedServerName>) -> Self {
        Self {
            local_servers,
            inner: Mutex::new(Inner::seeded()),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.rooms.get(room_id).cloned())
    }

    async fn event_nids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, EventMetadata>> {
        let inner = self.inner.lock().unwrap();
        Ok(event_ids
            .iter()
            .filter_map(|id| inner.event_ids.get(id).map(|meta| (id.clone(), *meta)))
            .collect())
    }

    async fn events(
        &self,
        room_info: &RoomInfo,
        event_nids: &[EventNid],
    ) -> Result<Vec<StoredEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(event_nids
            .iter()
            .filter_map(|nid| {
                inner
                    .events
                    .get(nid)
                    .filter(|record| record.room_nid == room_info.room_nid)
                    .map(|record| StoredEvent {
                        event_nid: *nid,
                        before_state_snapshot: record.before_state_snapshot,
                        pdu: record.pdu.clone(),
                    })
            })
            .collect())
    }

    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[OwnedEventId],
        exclude_rejected: bool,
    ) -> Result<Vec<StateEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut entries = Vec::with_capacity(event_ids.len());
        let mut loaded = 0usize;
        for id in event_ids {
            let Some(meta) = inner.event_ids.get(id) else {
                continue;
            };
            let Some(record) = inner.events.get(&meta.event_nid) else {
                continue;
            };
            loaded += 1;
            if exclude_rejected && record.rejected {
                continue;
            }
            entries.push(StateEntry {
                event_type_nid: record.event_type_nid,
                event_state_key_nid: record.event_state_key_nid,
                event_nid: meta.event_nid,
            });
        }
        if loaded != event_ids.len() {
            return Err(RoomsError::MissingEvents {
                wanted: event_ids.len(),
                loaded,
            });
        }
        Ok(entries)
    }

    async fn state_entries_for_snapshot(
        &self,
        snapshot: StateSnapshotNid,
    ) -> Result<Vec<StateEntry>> {
        let inner = self.inner.lock().unwrap();
        inner
            .snapshots
            .get(&snapshot)
            .cloned()
            .ok_or_else(|| RoomsError::storage(format!("unknown state snapshot {}", snapshot.0)))
    }

    async fn add_state(
        &self,
        _room_nid: RoomNid,
        base_snapshots: &[StateSnapshotNid],
        entries: Vec<StateEntry>,
    ) -> Result<StateSnapshotNid> {
        let mut inner = self.inner.lock().unwrap();
        let mut slots: BTreeMap<(EventTypeNid, EventStateKeyNid), EventNid> = BTreeMap::new();
        for base in base_snapshots {
            let base_entries = inner.snapshots.get(base).cloned().ok_or_else(|| {
                RoomsError::storage(format!("unknown base snapshot {}", base.0))
            })?;
            for entry in base_entries {
                slots.insert(
                    (entry.event_type_nid, entry.event_state_key_nid),
                    entry.event_nid,
                );
            }
        }
        for entry in entries {
            slots.insert(
                (entry.event_type_nid, entry.event_state_key_nid),
                entry.event_nid,
            );
        }

        let snapshot = StateSnapshotNid(inner.next_snapshot_nid);
        inner.next_snapshot_nid += 1;
        let combined = slots
            .into_iter()
            .map(|((event_type_nid, event_state_key_nid), event_nid)| StateEntry {
                event_type_nid,
                event_state_key_nid,
                event_nid,
            })
            .collect();
        inner.snapshots.insert(snapshot, combined);
        Ok(snapshot)
    }

    async fn set_state(&self, event_nid: EventNid, snapshot: StateSnapshotNid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.snapshots.contains_key(&snapshot) {
            return Err(RoomsError::storage(format!(
                "unknown state snapshot {}",
                snapshot.0
            )));
        }
        let record = inner.events.get_mut(&event_nid).ok_or_else(|| {
            RoomsError::storage(format!("unknown event NID {}", event_nid.0))
        })?;
        record.before_state_snapshot = Some(snapshot);
        Ok(())
    }

    async fn get_or_create_room_info(&self, event: &Pdu) -> Result<RoomInfo> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.rooms.get_mut(&event.room_id) {
            // Storing an event into a stub room populates it.
            info.is_stub = false;
            return Ok(info.clone());
        }

        let room_version = if event.kind == TimelineEventType::RoomCreate
            && event.state_key_equals("")
        {
            event
                .content
                .get("room_version")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(RoomVersionId::V1)
        } else {
            RoomVersionId::V10
        };
        let info = RoomInfo {
            room_nid: RoomNid(inner.next_room_nid),
            room_version,
            is_stub: false,
        };
        inner.next_room_nid += 1;
        inner.rooms.insert(event.room_id.clone(), info.clone());
        Ok(info)
    }

    async fn get_or_create_event_type_nid(
        &self,
        event_type: &TimelineEventType,
    ) -> Result<EventTypeNid> {
        let mut inner = self.inner.lock().unwrap();
        let key = event_type.to_string();
        if let Some(nid) = inner.event_types.get(&key) {
            return Ok(*nid);
        }
        let nid = EventTypeNid(inner.next_event_type_nid);
        inner.next_event_type_nid += 1;
        inner.event_types.insert(key, nid);
        Ok(nid)
    }

    async fn get_or_create_event_state_key_nid(
        &self,
        state_key: Option<&str>,
    ) -> Result<EventStateKeyNid> {
        let mut inner = self.inner.lock().unwrap();
        let key = state_key.unwrap_or_default().to_owned();
        if let Some(nid) = inner.state_keys.get(&key) {
            return Ok(*nid);
        }
        let nid = EventStateKeyNid(inner.next_state_key_nid);
        inner.next_state_key_nid += 1;
        inner.state_keys.insert(key, nid);
        Ok(nid)
    }

    async fn store_event(
        &self,
        event: &Pdu,
        room_info: &RoomInfo,
        event_type_nid: EventTypeNid,
        event_state_key_nid: EventStateKeyNid,
        _auth_event_nids: Vec<EventNid>,
        rejected: bool,
    ) -> Result<EventNid> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(meta) = inner.event_ids.get(&event.event_id) {
            return Ok(meta.event_nid);
        }

        let event_nid = EventNid(inner.next_event_nid);
        inner.next_event_nid += 1;
        inner.event_ids.insert(
            event.event_id.clone(),
            EventMetadata {
                event_nid,
                room_nid: room_info.room_nid,
            },
        );
        inner.events.insert(
            event_nid,
            EventRecord {
                pdu: event.clone(),
                room_nid: room_info.room_nid,
                event_type_nid,
                event_state_key_nid,
                before_state_snapshot: None,
                rejected,
            },
        );

        if event.kind == TimelineEventType::RoomMember {
            if let Some(user) = event
                .state_key
                .as_deref()
                .and_then(|key| UserId::parse(key).ok())
            {
                inner
                    .memberships
                    .entry(room_info.room_nid)
                    .or_default()
                    .insert(user, event_nid);
            }
        }
        Ok(event_nid)
    }

    async fn maybe_redact_event(
        &self,
        _room_info: &RoomInfo,
        _event_nid: EventNid,
        event: &Pdu,
    ) -> Result<Option<Pdu>> {
        let mut inner = self.inner.lock().unwrap();

        // This event is a redaction: rewrite its target if we have it.
        if event.kind == TimelineEventType::RoomRedaction {
            if let Some(target_id) = event.redacts.clone() {
                inner
                    .redactions
                    .insert(target_id.clone(), event.event_id.clone());
                if let Some(meta) = inner.event_ids.get(&target_id).copied() {
                    if let Some(record) = inner.events.get_mut(&meta.event_nid) {
                        record.pdu.redact();
                        return Ok(Some(record.pdu.clone()));
                    }
                }
            }
            return Ok(None);
        }

        // A previously-stored redaction targets this event.
        if inner.redactions.contains_key(&event.event_id) {
            if let Some(meta) = inner.event_ids.get(&event.event_id).copied() {
                if let Some(record) = inner.events.get_mut(&meta.event_nid) {
                    record.pdu.redact();
                    return Ok(Some(record.pdu.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn get_membership_event_nids_for_room(
        &self,
        room_nid: RoomNid,
        joined_only: bool,
        local_only: bool,
    ) -> Result<Vec<EventNid>> {
        let inner = self.inner.lock().unwrap();
        let Some(members) = inner.memberships.get(&room_nid) else {
            return Ok(Vec::new());
        };
        let mut nids = Vec::new();
        for (user, event_nid) in members {
            if local_only
                && !self
                    .local_servers
                    .iter()
                    .any(|server| server == user.server_name())
            {
                continue;
            }
            if joined_only {
                let is_join = inner.events.get(event_nid).is_some_and(|record| {
                    auth::membership_of(&record.pdu)
                        == Some(ruma::events::room::member::MembershipState::Join)
                });
                if !is_join {
                    continue;
                }
            }
            nids.push(*event_nid);
        }
        nids.sort_unstable();
        Ok(nids)
    }
}
