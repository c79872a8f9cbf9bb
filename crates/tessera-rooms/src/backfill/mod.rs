// =============================================================================
// Tessera Rooms - Backfill Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   The backfill engine. Requests from remote servers are served from the
//   local room DAG; requests from our own (virtual) hosts pull history from
//   remote peers, verify it, and persist the events together with the room
//   state that held before each of them.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ruma::{OwnedEventId, RoomVersionId, ServerName};
use tessera_core::{Pdu, RoomInfo, RoomNid, StoredEvent};
use tessera_federation::{EventsLoader, FederationClient, PduVerifier, VerificationError};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    api::{PerformBackfillRequest, PerformBackfillResponse},
    config::BackfillConfig,
    error::{Result, RoomsError},
    storage::Database,
};

pub mod driver;
pub mod helpers;
pub mod requester;

pub use driver::{request_backfill, BackfillRequesterOps};
pub use requester::{BackfillRequester, MAX_BACKFILL_SERVERS};

/// Number of events requested from remote peers when backfilling for
/// ourselves, regardless of the caller's limit. Peers answering a request
/// this size hand over enough history that we do not fall back onto
/// `/state_ids` calls they may not serve; callers truncate.
pub const FEDERATION_BACKFILL_LIMIT: usize = 100;

/// The backfill engine.
pub struct Backfiller<D, C, V> {
    config: BackfillConfig,
    db: Arc<D>,
    client: Arc<C>,
    verifier: Arc<V>,
}

impl<D, C, V> Backfiller<D, C, V>
where
    D: Database,
    C: FederationClient,
    V: PduVerifier,
{
    /// Creates a new backfill engine
    pub fn new(
        config: BackfillConfig,
        db: Arc<D>,
        client: Arc<C>,
        verifier: Arc<V>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            db,
            client,
            verifier,
        })
    }

    /// Returns up to `request.limit` events of history for a room.
    ///
    /// Requests originating from one of our own server names are serviced by
    /// fetching history from remote peers; anything else is answered from
    /// the locally-known DAG, falling back to federation once if the local
    /// store turns out to be pruned.
    #[instrument(level = "debug", skip(self, request, response), fields(room_id = %request.room_id, server = %request.server_name))]
    pub async fn perform_backfill(
        &self,
        request: &PerformBackfillRequest,
        response: &mut PerformBackfillResponse,
    ) -> Result<()> {
        if self.config.is_local_server_name(&request.server_name) {
            // we are requesting the backfill ourselves, so we need to hit
            // federation
            return self.backfill_via_federation(request, response).await;
        }

        // someone else is requesting the backfill, service it from the DAG
        // we already have
        let info = self
            .db
            .room_info(&request.room_id)
            .await?
            .filter(|info| !info.is_stub)
            .ok_or_else(|| RoomsError::MissingRoom(request.room_id.clone()))?;

        let mut visited = HashSet::with_capacity(request.limit);
        let front = request.prev_event_ids.clone();
        let (result_nids, redact_event_ids) = helpers::scan_event_tree(
            self.db.as_ref(),
            &info,
            front,
            &mut visited,
            request.limit,
            &request.server_name,
        )
        .await?;

        // A missing event means our own copy of the DAG has been pruned;
        // recover the history from federation instead.
        let loaded = match helpers::load_events(self.db.as_ref(), &info, &result_nids).await {
            Ok(events) => events,
            Err(RoomsError::MissingEvents { wanted, loaded }) => {
                info!(
                    wanted,
                    loaded, "Local store is missing events, backfilling via federation"
                );
                return self.backfill_via_federation(request, response).await;
            }
            Err(err) => return Err(err),
        };

        for stored in loaded {
            let mut pdu = stored.pdu;
            if redact_event_ids.contains(&pdu.event_id) {
                pdu.redact();
            }
            response.events.push(pdu);
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, request, response), fields(room_id = %request.room_id))]
    async fn backfill_via_federation(
        &self,
        request: &PerformBackfillRequest,
        response: &mut PerformBackfillResponse,
    ) -> Result<()> {
        let info = self
            .db
            .room_info(&request.room_id)
            .await?
            .filter(|info| !info.is_stub)
            .ok_or_else(|| RoomsError::MissingRoom(request.room_id.clone()))?;

        let mut requester = BackfillRequester::new(
            self.db.as_ref(),
            self.client.as_ref(),
            info.clone(),
            request.virtual_host.clone(),
            self.config.local_server_names.clone(),
            request.backwards_extremities.clone(),
            self.config.prefer_servers.clone(),
        );

        let mut events = match driver::request_backfill(
            &mut requester,
            self.verifier.as_ref(),
            &request.virtual_host,
            &request.room_id,
            &info.room_version,
            &request.prev_event_ids,
            FEDERATION_BACKFILL_LIMIT,
        )
        .await
        {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "Federated backfill failed");
                return Err(err);
            }
        };
        info!(count = events.len(), "🔄 Backfilled events from federation");

        // auth checks have already been done, so persist the new events
        let (room_nid, backfilled) = persist_events(self.db.as_ref(), &mut events).await;

        for ev in &events {
            let Some(stored) = backfilled.get(&ev.event_id) else {
                continue;
            };
            let Some(room_nid) = room_nid else {
                continue;
            };

            // now assign the state that held before the event
            let Some(state_ids) = requester
                .event_id_to_before_state_ids
                .get(&ev.event_id)
                .cloned()
            else {
                // every returned event passed the state check of the PDU
                // checks, so a missing entry is a protocol violation
                error!(event_id = %ev.event_id, "No state IDs for backfilled event which passed PDU checks");
                continue;
            };

            let entries = match self.db.state_entries_for_event_ids(&state_ids, true).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(event_id = %ev.event_id, error = %err, "State events missing, attempting to fetch them");
                    self.fetch_and_store_missing_events(
                        &info.room_version,
                        &mut requester,
                        &state_ids,
                        &request.virtual_host,
                    )
                    .await;
                    // try again
                    self.db
                        .state_entries_for_event_ids(&state_ids, true)
                        .await
                        .map_err(|err| RoomsError::SnapshotAssignment {
                            event_id: ev.event_id.clone(),
                            reason: err.to_string(),
                        })?
                }
            };

            let snapshot = self
                .db
                .add_state(room_nid, &[], entries)
                .await
                .map_err(|err| RoomsError::SnapshotAssignment {
                    event_id: ev.event_id.clone(),
                    reason: err.to_string(),
                })?;
            self.db
                .set_state(stored.event_nid, snapshot)
                .await
                .map_err(|err| RoomsError::SnapshotAssignment {
                    event_id: ev.event_id.clone(),
                    reason: err.to_string(),
                })?;
        }

        response.events = events;
        response.history_visibility = requester.history_visibility.clone();
        Ok(())
    }

    /// Best-effort fetch and store of the missing events in `state_ids`.
    ///
    /// Never surfaces errors; the caller re-queries the store and fails only
    /// if the events are still missing.
    #[instrument(level = "debug", skip_all)]
    async fn fetch_and_store_missing_events(
        &self,
        room_version: &RoomVersionId,
        requester: &mut BackfillRequester<'_, D, C>,
        state_ids: &[OwnedEventId],
        virtual_host: &ServerName,
    ) {
        let servers = requester.servers.clone();

        let nid_map = match self.db.event_nids(state_ids).await {
            Ok(map) => map,
            Err(err) => {
                warn!(error = %err, "Cannot query missing events");
                return;
            }
        };
        let mut missing_map: HashMap<OwnedEventId, Option<Pdu>> = state_ids
            .iter()
            .filter(|id| !nid_map.contains_key(*id))
            .map(|id| (id.clone(), None))
            .collect();
        info!(
            missing = missing_map.len(),
            servers = servers.len(),
            "Fetching missing state events"
        );

        // Loop the servers in the outer loop, so a server that works keeps
        // getting used for the remaining events.
        for server in &servers {
            let unresolved: Vec<OwnedEventId> = missing_map
                .iter()
                .filter(|(_, ev)| ev.is_none())
                .map(|(id, _)| id.clone())
                .collect();
            if unresolved.is_empty() {
                break;
            }
            for event_id in unresolved {
                let tx = match self
                    .client
                    .get_event(virtual_host, server, &event_id)
                    .await
                {
                    Ok(tx) => tx,
                    Err(err) => {
                        warn!(%server, %event_id, error = %err, "Failed to get event from server");
                        continue;
                    }
                };
                let loader = EventsLoader::new(room_version.clone(), self.verifier.as_ref());
                let results = match loader.load_and_verify(tx.pdus, &mut *requester).await {
                    Ok(results) => results,
                    Err(err) => {
                        warn!(%server, %event_id, error = %err, "Failed to load and verify event");
                        continue;
                    }
                };
                debug!(%server, %event_id, count = results.len(), "Verified fetched PDUs");
                for result in results {
                    match &result.error {
                        None => {}
                        Some(err @ VerificationError::Signature(_)) => {
                            // The signature of the event might not be valid
                            // anymore, for example if the key ID was reused
                            // with a different signature.
                            error!(%event_id, error = %err, "Event failed PDU checks, storing anyway");
                        }
                        Some(err) => {
                            warn!(%event_id, error = %err, "Event failed PDU checks");
                            continue;
                        }
                    }
                    missing_map.insert(event_id.clone(), Some(result.pdu));
                }
            }
        }

        let mut new_events: Vec<Pdu> = missing_map.into_values().flatten().collect();
        info!(count = new_events.len(), "Persisting recovered state events");
        persist_events(self.db.as_ref(), &mut new_events).await;
    }
}

/// Persists a batch of already-verified events.
///
/// Per-event failures are logged and the event skipped; later events still
/// process. Events redacted on arrival are replaced in `events` so callers
/// return the redacted form. Returns the room NID of the last stored event
/// and the map of stored events for snapshot assignment.
pub(crate) async fn persist_events<D: Database + ?Sized>(
    db: &D,
    events: &mut [Pdu],
) -> (Option<RoomNid>, HashMap<OwnedEventId, StoredEvent>) {
    debug_assert!(
        events
            .windows(2)
            .all(|pair| pair[0].room_id == pair[1].room_id),
        "persist_events expects a single-room batch"
    );

    let mut room_nid: Option<RoomNid> = None;
    let mut backfilled: HashMap<OwnedEventId, StoredEvent> = HashMap::new();
    for i in 0..events.len() {
        let auth_event_ids = events[i].auth_events.clone();
        let nid_map = match db.event_nids(&auth_event_ids).await {
            // the backfill protocol guarantees auth events are provided
            Ok(map) => map,
            Err(err) => {
                error!(event_id = %events[i].event_id, error = %err, "Failed to find auth events");
                continue;
            }
        };
        let auth_event_nids = nid_map.values().map(|meta| meta.event_nid).collect();

        let info: RoomInfo = match db.get_or_create_room_info(&events[i]).await {
            Ok(info) => info,
            Err(err) => {
                error!(event_id = %events[i].event_id, error = %err, "Failed to get or create room NID");
                continue;
            }
        };
        if let Some(previous) = room_nid {
            if previous != info.room_nid {
                warn!(event_id = %events[i].event_id, "Backfill batch spans multiple rooms");
            }
        }
        room_nid = Some(info.room_nid);

        let event_type_nid = match db.get_or_create_event_type_nid(&events[i].kind).await {
            Ok(nid) => nid,
            Err(err) => {
                error!(event_id = %events[i].event_id, error = %err, "Failed to get or create event type NID");
                continue;
            }
        };
        let event_state_key_nid = match db
            .get_or_create_event_state_key_nid(events[i].state_key.as_deref())
            .await
        {
            Ok(nid) => nid,
            Err(err) => {
                error!(event_id = %events[i].event_id, error = %err, "Failed to get or create state key NID");
                continue;
            }
        };

        let event_nid = match db
            .store_event(
                &events[i],
                &info,
                event_type_nid,
                event_state_key_nid,
                auth_event_nids,
                false,
            )
            .await
        {
            Ok(nid) => nid,
            Err(err) => {
                error!(event_id = %events[i].event_id, error = %err, "Failed to persist event");
                continue;
            }
        };

        // If storing this event results in it being redacted, return the
        // redacted form. The event may instead be a redaction of another
        // event, which we don't care about here since that event is not part
        // of this backfill.
        match db.maybe_redact_event(&info, event_nid, &events[i]).await {
            Ok(Some(redacted)) if redacted.event_id == events[i].event_id => {
                events[i] = redacted;
            }
            Ok(_) => {}
            Err(err) => {
                error!(event_id = %events[i].event_id, error = %err, "Failed to redact event");
                continue;
            }
        }

        backfilled.insert(
            events[i].event_id.clone(),
            StoredEvent {
                event_nid,
                before_state_snapshot: None,
                pdu: events[i].clone(),
            },
        );
    }
    (room_nid, backfilled)
}
