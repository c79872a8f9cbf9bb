// =============================================================================
// Tessera Rooms - Storage Facade Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   The event store surface the room services are written against. Events,
//   rooms, event types and state keys are addressed by store-assigned NIDs;
//   implementations must make the get-or-create operations idempotent and
//   tolerate concurrent inserts of the same event.
//
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use ruma::{events::TimelineEventType, OwnedEventId, RoomId};
use tessera_core::{
    EventMetadata, EventNid, EventStateKeyNid, EventTypeNid, Pdu, RoomInfo, RoomNid, StateEntry,
    StateSnapshotNid, StoredEvent,
};

use crate::error::Result;

pub mod memory;

pub use memory::MemoryDatabase;

/// Read/write access to the room event store.
#[async_trait]
pub trait Database: Send + Sync {
    /// What we know about a room. `None` if the room was never referenced.
    async fn room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>>;

    /// Resolves event IDs to their NIDs. IDs unknown to the store are simply
    /// absent from the returned map.
    async fn event_nids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, EventMetadata>>;

    /// Loads stored events by NID. NIDs that cannot be loaded are absent
    /// from the result; callers detect the shortfall by length.
    async fn events(
        &self,
        room_info: &RoomInfo,
        event_nids: &[EventNid],
    ) -> Result<Vec<StoredEvent>>;

    /// The state entries contributed by the given state-event IDs.
    ///
    /// Errors with [`crate::error::RoomsError::MissingEvents`] if any ID is
    /// not in the store. Entries of events stored as rejected are silently
    /// dropped when `exclude_rejected` is set.
    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[OwnedEventId],
        exclude_rejected: bool,
    ) -> Result<Vec<StateEntry>>;

    /// The entries of a state snapshot.
    async fn state_entries_for_snapshot(
        &self,
        snapshot: StateSnapshotNid,
    ) -> Result<Vec<StateEntry>>;

    /// Persists a new immutable state snapshot built from the union of the
    /// given base snapshots and additional entries.
    async fn add_state(
        &self,
        room_nid: RoomNid,
        base_snapshots: &[StateSnapshotNid],
        entries: Vec<StateEntry>,
    ) -> Result<StateSnapshotNid>;

    /// Binds the snapshot of the state that held before an event.
    async fn set_state(&self, event_nid: EventNid, snapshot: StateSnapshotNid) -> Result<()>;

    /// Room info for the event's room, creating it on first contact.
    async fn get_or_create_room_info(&self, event: &Pdu) -> Result<RoomInfo>;

    /// NID for an event type string, assigning one if unseen.
    async fn get_or_create_event_type_nid(
        &self,
        event_type: &TimelineEventType,
    ) -> Result<EventTypeNid>;

    /// NID for a state key, assigning one if unseen. `None` (a message
    /// event) maps to the empty-state-key NID.
    async fn get_or_create_event_state_key_nid(
        &self,
        state_key: Option<&str>,
    ) -> Result<EventStateKeyNid>;

    /// Persists an event. Idempotent per event ID.
    #[allow(clippy::too_many_arguments)]
    async fn store_event(
        &self,
        event: &Pdu,
        room_info: &RoomInfo,
        event_type_nid: EventTypeNid,
        event_state_key_nid: EventStateKeyNid,
        auth_event_nids: Vec<EventNid>,
        rejected: bool,
    ) -> Result<EventNid>;

    /// Applies any redaction connected to `event`: if a stored redaction
    /// targets it, or it is itself a redaction of a stored event, the target
    /// is rewritten in place and its redacted form returned.
    async fn maybe_redact_event(
        &self,
        room_info: &RoomInfo,
        event_nid: EventNid,
        event: &Pdu,
    ) -> Result<Option<Pdu>>;

    /// NIDs of the room's current membership events. `joined_only` keeps
    /// only `join` memberships; `local_only` keeps only members on this
    /// store's local servers.
    async fn get_membership_event_nids_for_room(
        &self,
        room_nid: RoomNid,
        joined_only: bool,
        local_only: bool,
    ) -> Result<Vec<EventNid>>;
}
