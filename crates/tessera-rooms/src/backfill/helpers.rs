// =============================================================================
// Tessera Rooms - Backfill Helpers Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   DAG and state primitives shared by the backfill paths: the backwards
//   event-tree scan, bulk event loading with missing-event detection, and
//   state lookups at a point in the room's history.
//
// =============================================================================

use std::collections::HashSet;

use ruma::{
    events::room::{history_visibility::HistoryVisibility, member::MembershipState},
    OwnedEventId, ServerName, UserId,
};
use tessera_core::{
    EventNid, EventStateKeyNid, EventTypeNid, Pdu, RoomInfo, StateEntry, StoredEvent,
};
use tracing::{debug, info};

use crate::{
    auth,
    error::{Result, RoomsError},
    storage::Database,
};

/// Walks the room DAG backwards from `front`, collecting up to `limit`
/// events to return to `server_name`.
///
/// Returns the event NIDs in visit order (newest first) together with the
/// IDs of events the requesting server is not authorised to see in full,
/// which must be redacted on the way out. Prev-event IDs not in the store
/// mark the frontier of our knowledge and are skipped silently.
pub async fn scan_event_tree<D: Database + ?Sized>(
    db: &D,
    room_info: &RoomInfo,
    front: Vec<OwnedEventId>,
    visited: &mut HashSet<OwnedEventId>,
    limit: usize,
    server_name: &ServerName,
) -> Result<(Vec<EventNid>, HashSet<OwnedEventId>)> {
    let mut result_nids = Vec::with_capacity(limit.min(64));
    let mut redact_event_ids = HashSet::new();
    let mut server_in_room: Option<bool> = None;
    let mut front = front;

    'bfs: while !front.is_empty() {
        let mut next = Vec::new();
        for event_id in &front {
            if result_nids.len() == limit {
                break 'bfs;
            }
            if !visited.insert(event_id.clone()) {
                continue;
            }

            let nid_map = db.event_nids(std::slice::from_ref(event_id)).await?;
            let Some(meta) = nid_map.get(event_id) else {
                debug!(%event_id, "Scan reached a backwards extremity");
                continue;
            };
            let Some(stored) = db
                .events(room_info, &[meta.event_nid])
                .await?
                .into_iter()
                .next()
            else {
                continue;
            };

            let in_room = match server_in_room {
                Some(value) => value,
                None => {
                    let value = is_server_currently_in_room(db, room_info, server_name).await?;
                    server_in_room = Some(value);
                    value
                }
            };
            if !check_server_allowed_to_see_event(db, room_info, &stored, server_name, in_room)
                .await?
            {
                redact_event_ids.insert(stored.pdu.event_id.clone());
            }

            result_nids.push(meta.event_nid);
            for prev in &stored.pdu.prev_events {
                if !visited.contains(prev) {
                    next.push(prev.clone());
                }
            }
        }
        front = next;
    }

    Ok((result_nids, redact_event_ids))
}

/// Loads the given events, erroring with
/// [`RoomsError::MissingEvents`] when the store cannot produce all of them.
pub async fn load_events<D: Database + ?Sized>(
    db: &D,
    room_info: &RoomInfo,
    event_nids: &[EventNid],
) -> Result<Vec<StoredEvent>> {
    let events = db.events(room_info, event_nids).await?;
    if events.len() != event_nids.len() {
        return Err(RoomsError::MissingEvents {
            wanted: event_nids.len(),
            loaded: events.len(),
        });
    }
    Ok(events)
}

/// The state entries in effect immediately before the given event.
pub async fn state_before_event<D: Database + ?Sized>(
    db: &D,
    room_info: &RoomInfo,
    event_nid: EventNid,
) -> Result<Vec<StateEntry>> {
    let mut events = load_events(db, room_info, &[event_nid]).await?;
    let stored = events.remove(0);
    let snapshot = stored.before_state_snapshot.ok_or_else(|| {
        RoomsError::storage(format!(
            "no before-state snapshot recorded for event NID {}",
            event_nid.0
        ))
    })?;
    db.state_entries_for_snapshot(snapshot).await
}

/// The membership events among the given state entries.
pub async fn get_memberships_at_state<D: Database + ?Sized>(
    db: &D,
    room_info: &RoomInfo,
    state_entries: &[StateEntry],
    joined_only: bool,
) -> Result<Vec<StoredEvent>> {
    let member_nids: Vec<EventNid> = state_entries
        .iter()
        .filter(|entry| entry.event_type_nid == EventTypeNid::ROOM_MEMBER)
        .map(|entry| entry.event_nid)
        .collect();
    let events = db.events(room_info, &member_nids).await?;
    if !joined_only {
        return Ok(events);
    }
    Ok(events
        .into_iter()
        .filter(|stored| auth::membership_of(&stored.pdu) == Some(MembershipState::Join))
        .collect())
}

/// Whether `server_name` currently has a joined member in the room.
pub async fn is_server_currently_in_room<D: Database + ?Sized>(
    db: &D,
    room_info: &RoomInfo,
    server_name: &ServerName,
) -> Result<bool> {
    let nids = db
        .get_membership_event_nids_for_room(room_info.room_nid, true, false)
        .await?;
    let events = db.events(room_info, &nids).await?;
    Ok(events.iter().any(|stored| {
        stored
            .pdu
            .state_key
            .as_deref()
            .and_then(|key| UserId::parse(key).ok())
            .is_some_and(|user| user.server_name() == server_name)
    }))
}

/// Whether `server_name` may see the given event in full, judged from the
/// history visibility and memberships in the state before it.
///
/// Events with no recorded before-state fall back to the shared-visibility
/// default, admitting servers currently in the room.
pub async fn check_server_allowed_to_see_event<D: Database + ?Sized>(
    db: &D,
    room_info: &RoomInfo,
    stored: &StoredEvent,
    server_name: &ServerName,
    server_currently_in_room: bool,
) -> Result<bool> {
    let Some(snapshot) = stored.before_state_snapshot else {
        return Ok(server_currently_in_room);
    };
    let entries = db.state_entries_for_snapshot(snapshot).await?;
    let relevant_nids: Vec<EventNid> = entries
        .iter()
        .filter(|entry| {
            entry.event_type_nid == EventTypeNid::ROOM_HISTORY_VISIBILITY
                || entry.event_type_nid == EventTypeNid::ROOM_MEMBER
        })
        .map(|entry| entry.event_nid)
        .collect();
    let events = db.events(room_info, &relevant_nids).await?;
    let pdus: Vec<Pdu> = events.into_iter().map(|stored| stored.pdu).collect();
    Ok(auth::is_server_allowed(
        server_name,
        server_currently_in_room,
        &pdus,
    ))
}

/// All currently joined members, if our server may read the room's history
/// at the given state, together with the visibility that held there.
///
/// Restricting to `joined` is the safer stance on paths where the state
/// cannot be read at all.
pub(crate) async fn join_events_from_history_visibility<D: Database + ?Sized>(
    db: &D,
    room_info: &RoomInfo,
    state_entries: &[StateEntry],
    this_server: &ServerName,
) -> (HistoryVisibility, Result<Vec<StoredEvent>>) {
    let vis_nids: Vec<EventNid> = state_entries
        .iter()
        .filter(|entry| {
            entry.event_type_nid == EventTypeNid::ROOM_HISTORY_VISIBILITY
                && entry.event_state_key_nid == EventStateKeyNid::EMPTY
        })
        .map(|entry| entry.event_nid)
        .take(1)
        .collect();

    let stored = match db.events(room_info, &vis_nids).await {
        Ok(events) => events,
        Err(err) => return (HistoryVisibility::Joined, Err(err)),
    };
    let pdus: Vec<Pdu> = stored.into_iter().map(|stored| stored.pdu).collect();

    let visibility = auth::history_visibility_for_room(&pdus);
    if !auth::is_server_allowed(this_server, true, &pdus) {
        info!(
            ?visibility,
            "Room history not visible to us at this point"
        );
        return (visibility, Ok(Vec::new()));
    }

    let join_nids = match db
        .get_membership_event_nids_for_room(room_info.room_nid, true, false)
        .await
    {
        Ok(nids) => nids,
        Err(err) => return (visibility, Err(err)),
    };
    let events = match db.events(room_info, &join_nids).await {
        Ok(events) => events,
        Err(err) => return (visibility, Err(err)),
    };
    (visibility, Ok(events))
}
