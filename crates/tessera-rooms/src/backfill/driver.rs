// =============================================================================
// Tessera Rooms - Backfill Driver Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   The state machine that turns one federated backfill request into a
//   verified, state-annotated batch of events. It only speaks through the
//   capability set below, so the per-request composite stays the single
//   owner of all transient state.
//
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use ruma::{EventId, OwnedEventId, OwnedServerName, RoomId, RoomVersionId, ServerName};
use tessera_core::Pdu;
use tessera_federation::{
    EventProvider, EventsLoader, FederationClient, FederationError, PduVerifier, Transaction,
    VerificationError,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backfill::requester::BackfillRequester,
    error::{Result, RoomsError},
    storage::Database,
};

/// The capability set a backfill run needs from its per-request composite.
#[async_trait]
pub trait BackfillRequesterOps: EventProvider {
    /// State-event IDs in effect before `target` (cache, roll-forward or
    /// `/state_ids`).
    async fn state_ids_before_event(&mut self, target: &Pdu) -> Result<Vec<OwnedEventId>>;

    /// Full state events before `event` (local store in bulk, else peers).
    async fn state_before_event(
        &mut self,
        event: &Pdu,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, Pdu>>;

    /// Ordered candidate servers for history around `event_id`.
    async fn servers_at_event(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Vec<OwnedServerName>;

    /// `/backfill` pass-through.
    async fn backfill(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        limit: usize,
        from_event_ids: &[OwnedEventId],
    ) -> Result<Transaction>;
}

/// Requests history for a room from remote servers.
///
/// Selects candidate servers around the first usable frontier event, takes
/// the first server that answers `/backfill` with events, verifies the batch
/// in topological order and records the before-state of every surviving
/// event. Events failing auth checks are dropped; recoverable signature
/// mismatches are kept with a warning. An error is returned only when no
/// events could be obtained at all.
#[allow(clippy::too_many_arguments)]
#[instrument(level = "debug", skip(requester, verifier, from_event_ids), fields(%room_id, %origin))]
pub async fn request_backfill<R>(
    requester: &mut R,
    verifier: &dyn PduVerifier,
    origin: &ServerName,
    room_id: &RoomId,
    room_version: &RoomVersionId,
    from_event_ids: &[OwnedEventId],
    limit: usize,
) -> Result<Vec<Pdu>>
where
    R: BackfillRequesterOps + Send,
{
    let mut servers = Vec::new();
    for event_id in from_event_ids {
        servers = requester.servers_at_event(room_id, event_id).await;
        if !servers.is_empty() {
            break;
        }
    }
    if servers.is_empty() {
        return Err(RoomsError::NoServers(room_id.to_owned()));
    }

    let mut transaction: Option<Transaction> = None;
    let mut last_err: Option<RoomsError> = None;
    for server in &servers {
        match requester
            .backfill(origin, server, room_id, limit, from_event_ids)
            .await
        {
            Ok(tx) if !tx.pdus.is_empty() => {
                debug!(%server, count = tx.pdus.len(), "Server answered backfill");
                transaction = Some(tx);
                break;
            }
            Ok(_) => {
                warn!(%server, "Server answered backfill with no events");
            }
            Err(err) => {
                warn!(%server, error = %err, "Backfill request to server failed");
                last_err = Some(err);
            }
        }
    }
    let Some(transaction) = transaction else {
        return Err(
            last_err.unwrap_or_else(|| RoomsError::FederationExhausted(room_id.to_owned()))
        );
    };

    let loader = EventsLoader::new(room_version.clone(), verifier);
    let results = loader.load_and_verify(transaction.pdus, requester).await?;

    let mut events = Vec::with_capacity(results.len());
    let mut seeded_state = false;
    for result in results {
        match &result.error {
            None => {}
            Some(err @ VerificationError::Signature(_)) => {
                // Possibly a key ID reused with a different key; keeping the
                // event keeps the room DAG connected.
                error!(event_id = %result.pdu.event_id, error = %err, "Event failed PDU checks, storing anyway");
            }
            Some(err) => {
                warn!(event_id = %result.pdu.event_id, error = %err, "Event failed PDU checks");
                continue;
            }
        }

        let pdu = result.pdu;
        let state_ids = match requester.state_ids_before_event(&pdu).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(event_id = %pdu.event_id, error = %err, "Failed to establish state before event, dropping");
                last_err = Some(err);
                continue;
            }
        };

        // Seed the request's event map with the state at the oldest event of
        // the window, so the remaining events can roll forward locally.
        if !seeded_state && !state_ids.is_empty() {
            seeded_state = true;
            if let Err(err) = requester.state_before_event(&pdu, &state_ids).await {
                warn!(event_id = %pdu.event_id, error = %err, "Could not fetch state before the oldest backfilled event");
            }
        }

        events.push(pdu);
    }

    info!(count = events.len(), "Backfill produced events");
    if events.is_empty() {
        if let Some(err) = last_err {
            return Err(err);
        }
    }
    Ok(events)
}

#[async_trait]
impl<D: Database + ?Sized, C: FederationClient + ?Sized> EventProvider
    for BackfillRequester<'_, D, C>
{
    async fn provide_events(
        &mut self,
        _room_version: &RoomVersionId,
        event_ids: &[OwnedEventId],
    ) -> tessera_federation::Result<Vec<Pdu>> {
        self.provide_events_local(event_ids)
            .await
            .map_err(|err| FederationError::internal(err.to_string()))
    }
}

#[async_trait]
impl<D: Database + ?Sized, C: FederationClient + ?Sized> BackfillRequesterOps
    for BackfillRequester<'_, D, C>
{
    async fn state_ids_before_event(&mut self, target: &Pdu) -> Result<Vec<OwnedEventId>> {
        BackfillRequester::state_ids_before_event(self, target).await
    }

    async fn state_before_event(
        &mut self,
        event: &Pdu,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, Pdu>> {
        BackfillRequester::state_before_event(self, event, event_ids).await
    }

    async fn servers_at_event(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Vec<OwnedServerName> {
        BackfillRequester::servers_at_event(self, room_id, event_id).await
    }

    async fn backfill(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        limit: usize,
        from_event_ids: &[OwnedEventId],
    ) -> Result<Transaction> {
        BackfillRequester::backfill(self, origin, server, room_id, limit, from_event_ids).await
    }
}
