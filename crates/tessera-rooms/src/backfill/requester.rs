// =============================================================================
// Tessera Rooms - Backfill Requester Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   The per-request composite driving a federated backfill: selects the
//   remote servers worth asking, tracks the room state immediately before
//   each event seen during the request, and resolves events from the local
//   store or from peers. One instance lives for exactly one backfill call
//   and is single-threaded; its caches carry no synchronisation.
//
// =============================================================================

use std::collections::{HashMap, HashSet};

use ruma::{
    events::{room::history_visibility::HistoryVisibility, TimelineEventType},
    EventId, OwnedEventId, OwnedServerName, RoomId, ServerName,
};
use tessera_core::{EventNid, Pdu, RoomInfo};
use tessera_federation::{
    FederatedStateProvider, FederationClient, Transaction,
};
use tracing::{debug, error, info, warn};

use crate::{
    backfill::helpers,
    error::{Result, RoomsError},
    storage::Database,
};

/// Cap on candidate servers tried per backfill request. Too low and we may
/// miss the one server that still holds the history; too high and we spend
/// the whole request walking dead servers.
pub const MAX_BACKFILL_SERVERS: usize = 5;

/// Per-request backfill state and capabilities.
pub struct BackfillRequester<'a, D: Database + ?Sized, C: FederationClient + ?Sized> {
    db: &'a D,
    client: &'a C,
    virtual_host: OwnedServerName,
    local_servers: Vec<OwnedServerName>,
    prefer_servers: HashSet<OwnedServerName>,
    /// successor event ID -> prev-event IDs that are backwards extremities
    bw_extrems: HashMap<OwnedEventId, Vec<OwnedEventId>>,
    room_info: RoomInfo,

    // per-request state
    pub(crate) servers: Vec<OwnedServerName>,
    pub(crate) event_id_to_before_state_ids: HashMap<OwnedEventId, Vec<OwnedEventId>>,
    pub(crate) event_id_map: HashMap<OwnedEventId, Pdu>,
    pub(crate) history_visibility: HistoryVisibility,
}

impl<'a, D: Database + ?Sized, C: FederationClient + ?Sized> BackfillRequester<'a, D, C> {
    pub fn new(
        db: &'a D,
        client: &'a C,
        room_info: RoomInfo,
        virtual_host: OwnedServerName,
        local_servers: Vec<OwnedServerName>,
        bw_extrems: HashMap<OwnedEventId, Vec<OwnedEventId>>,
        prefer_servers: Vec<OwnedServerName>,
    ) -> Self {
        Self {
            db,
            client,
            virtual_host,
            local_servers,
            prefer_servers: prefer_servers.into_iter().collect(),
            bw_extrems,
            room_info,
            servers: Vec::new(),
            event_id_to_before_state_ids: HashMap::new(),
            event_id_map: HashMap::new(),
            history_visibility: HistoryVisibility::Shared,
        }
    }

    fn is_local_server_name(&self, server: &ServerName) -> bool {
        self.local_servers.iter().any(|local| local == server)
    }

    /// The IDs of the state events in effect before `target`.
    ///
    /// Answers from the cache, the room-creation special case or a
    /// single-parent roll-forward when possible; otherwise asks the
    /// candidate servers for `/state_ids`.
    pub async fn state_ids_before_event(&mut self, target: &Pdu) -> Result<Vec<OwnedEventId>> {
        self.event_id_map
            .insert(target.event_id.clone(), target.clone());
        if let Some(ids) = self.event_id_to_before_state_ids.get(&target.event_id) {
            return Ok(ids.clone());
        }

        if target.prev_events.is_empty()
            && target.kind == TimelineEventType::RoomCreate
            && target.state_key_equals("")
        {
            info!(room_id = %target.room_id, "Backfilled to the beginning of the room");
            self.event_id_to_before_state_ids
                .insert(target.event_id.clone(), Vec::new());
            return Ok(Vec::new());
        }

        // With exactly one prev event whose before-state we already know, the
        // state can be rolled forward locally. Two or more prev events means
        // an unresolved fork, and an unknown prev event means a fresh
        // backwards extremity; both require /state_ids.
        if target.prev_events.len() == 1 {
            let prev_event_id = &target.prev_events[0];
            let prev = self.event_id_map.get(prev_event_id).cloned();
            let prev_state_ids = self.event_id_to_before_state_ids.get(prev_event_id).cloned();
            if let (Some(prev), Some(prev_state_ids)) = (prev, prev_state_ids) {
                if let Some(new_state_ids) =
                    self.calculate_new_state_ids(target, &prev, prev_state_ids)
                {
                    return Ok(new_state_ids);
                }
            }
        }

        info!(event_id = %target.event_id, "Requesting /state_ids at event");
        let servers = self.servers.clone();
        let mut last_err: Option<RoomsError> = None;
        for server in &servers {
            let provider = FederatedStateProvider {
                client: self.client,
                origin: &self.virtual_host,
                server,
            };
            match provider.state_ids_before_event(target).await {
                Ok(ids) => {
                    self.event_id_to_before_state_ids
                        .insert(target.event_id.clone(), ids.clone());
                    return Ok(ids);
                }
                Err(err) => {
                    warn!(%server, error = %err, "Failed to fetch /state_ids from server");
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RoomsError::NoServers(target.room_id.clone())))
    }

    /// Rolls the before-state of `prev` forward across it to produce the
    /// before-state of `target`.
    ///
    /// Returns `None` when entries of the previous state are unknown and no
    /// slot matched: a conflict cannot be ruled out, so the caller must fall
    /// back to federation.
    fn calculate_new_state_ids(
        &mut self,
        target: &Pdu,
        prev: &Pdu,
        prev_state_ids: Vec<OwnedEventId>,
    ) -> Option<Vec<OwnedEventId>> {
        let mut new_state_ids = prev_state_ids;
        let Some(prev_state_key) = prev.state_key.as_deref() else {
            // message event: the state is unchanged across it
            self.event_id_to_before_state_ids
                .insert(target.event_id.clone(), new_state_ids.clone());
            return Some(new_state_ids);
        };

        // The state before the target is the state before the prev event
        // plus the prev event itself, replacing its slot if present.
        let mut missing_state = false;
        let mut found_event = false;
        for id in new_state_ids.iter_mut() {
            let Some(ev) = self.event_id_map.get(id) else {
                missing_state = true;
                continue;
            };
            if ev.kind == prev.kind && ev.state_key.as_deref() == Some(prev_state_key) {
                *id = prev.event_id.clone();
                found_event = true;
                break;
            }
        }
        if !found_event && !missing_state {
            // every entry was visible and none matched, so this is new state
            new_state_ids.push(prev.event_id.clone());
            found_event = true;
        }

        if found_event {
            self.event_id_to_before_state_ids
                .insert(target.event_id.clone(), new_state_ids.clone());
            return Some(new_state_ids);
        }
        None
    }

    /// The state events in effect before `event`, as PDUs.
    ///
    /// Tries the local store in bulk first; only when the store cannot
    /// produce every requested event are the candidate servers asked.
    pub async fn state_before_event(
        &mut self,
        event: &Pdu,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, Pdu>> {
        match self.provide_events_local(event_ids).await {
            Ok(events) => {
                debug!(
                    fetched = events.len(),
                    wanted = event_ids.len(),
                    "Fetched state events from the database"
                );
                if events.len() == event_ids.len() {
                    let mut result = HashMap::with_capacity(events.len());
                    for ev in events {
                        self.event_id_map.insert(ev.event_id.clone(), ev.clone());
                        result.insert(ev.event_id.clone(), ev);
                    }
                    return Ok(result);
                }
            }
            Err(err) => {
                debug!(error = %err, "Failed to fetch state events from the database");
            }
        }

        let servers = self.servers.clone();
        let mut last_err: Option<RoomsError> = None;
        for server in &servers {
            let provider = FederatedStateProvider {
                client: self.client,
                origin: &self.virtual_host,
                server,
            };
            match provider.state_before_event(event, event_ids).await {
                Ok(result) => {
                    for (id, ev) in &result {
                        self.event_id_map.insert(id.clone(), ev.clone());
                    }
                    return Ok(result);
                }
                Err(err) => {
                    warn!(%server, error = %err, "Failed to fetch /state from server");
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RoomsError::NoServers(event.room_id.clone())))
    }

    /// Computes the ordered list of servers worth asking for history around
    /// `event_id`, which is a prev-event of a backwards extremity and
    /// therefore not in our store.
    ///
    /// Preferred servers come first, our own names are excluded and the list
    /// is capped at [`MAX_BACKFILL_SERVERS`]. An empty list fails the
    /// request. The history visibility observed at the successor is recorded
    /// on the requester.
    pub async fn servers_at_event(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Vec<OwnedServerName> {
        // The event itself is unknown to the store; use its known successor
        // to read the room state at that point.
        let mut successor: Option<OwnedEventId> = None;
        'find: for (successor_id, prev_event_ids) in &self.bw_extrems {
            for prev in prev_event_ids {
                if prev == event_id {
                    successor = Some(successor_id.clone());
                    break 'find;
                }
            }
        }
        let Some(successor) = successor else {
            error!(%event_id, "Failed to find successor of event to determine room state");
            return Vec::new();
        };

        let nid_map = match self.db.event_nids(std::slice::from_ref(&successor)).await {
            Ok(map) => map,
            Err(err) => {
                error!(event_id = %successor, error = %err, "Failed to get event NID for successor");
                return Vec::new();
            }
        };
        let Some(meta) = nid_map.get(&successor) else {
            error!(event_id = %successor, "Successor event is not in the store");
            return Vec::new();
        };
        if self.room_info.is_stub {
            error!(%room_id, "Room is only known as a stub");
            return Vec::new();
        }

        let state_entries =
            match helpers::state_before_event(self.db, &self.room_info, meta.event_nid).await {
                Ok(entries) => entries,
                Err(err) => {
                    error!(event_id = %successor, error = %err, "Failed to load state before event");
                    return Vec::new();
                }
            };

        // possibly include all currently joined servers, depending on
        // history visibility
        let (visibility, vis_events) = helpers::join_events_from_history_visibility(
            self.db,
            &self.room_info,
            &state_entries,
            &self.virtual_host,
        )
        .await;
        self.history_visibility = visibility;
        let member_events_from_vis = match vis_events {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "Failed to calculate servers from history visibility rules");
                return Vec::new();
            }
        };
        info!(
            count = member_events_from_vis.len(),
            "Including current members via history visibility"
        );

        let mut member_events = match helpers::get_memberships_at_state(
            self.db,
            &self.room_info,
            &state_entries,
            true,
        )
        .await
        {
            Ok(events) => events,
            Err(err) => {
                error!(event_id = %successor, error = %err, "Failed to get memberships before event");
                return Vec::new();
            }
        };
        member_events.extend(member_events_from_vis);

        let mut seen = HashSet::new();
        let mut servers = Vec::new();
        let mut others = Vec::new();
        for stored in &member_events {
            let server = stored.pdu.sender_server().to_owned();
            if !seen.insert(server.clone()) {
                continue;
            }
            if self.is_local_server_name(&server) {
                continue;
            }
            if self.prefer_servers.contains(&server) {
                servers.push(server);
            } else {
                others.push(server);
            }
        }
        servers.extend(others);
        servers.truncate(MAX_BACKFILL_SERVERS);

        self.servers = servers.clone();
        servers
    }

    /// Pass-through to the federation client's `/backfill`.
    pub async fn backfill(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        limit: usize,
        from_event_ids: &[OwnedEventId],
    ) -> Result<Transaction> {
        Ok(self
            .client
            .backfill(origin, server, room_id, limit, from_event_ids)
            .await?)
    }

    /// Bulk event lookup against the local store only.
    pub(crate) async fn provide_events_local(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<Vec<Pdu>> {
        let nid_map = self.db.event_nids(event_ids).await?;
        let event_nids: Vec<EventNid> = nid_map.values().map(|meta| meta.event_nid).collect();
        let events = self.db.events(&self.room_info, &event_nids).await?;
        Ok(events.into_iter().map(|stored| stored.pdu).collect())
    }
}
