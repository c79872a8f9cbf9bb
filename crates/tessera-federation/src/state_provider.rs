// =============================================================================
// Tessera Federation - Federated State Provider Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// =============================================================================

use std::collections::HashMap;

use ruma::{OwnedEventId, ServerName};
use tessera_core::Pdu;
use tracing::{debug, instrument};

use crate::{client::FederationClient, error::Result};

/// Resolves room state at an event by asking a single remote server.
///
/// One provider is built per `(origin, server)` pair; callers iterate their
/// candidate servers, constructing a provider for each until one answers.
pub struct FederatedStateProvider<'a, C: FederationClient + ?Sized> {
    pub client: &'a C,
    pub origin: &'a ServerName,
    pub server: &'a ServerName,
}

impl<'a, C: FederationClient + ?Sized> FederatedStateProvider<'a, C> {
    /// The IDs of the state events in effect before `event`, via `/state_ids`.
    #[instrument(level = "debug", skip(self, event), fields(server = %self.server, event_id = %event.event_id))]
    pub async fn state_ids_before_event(&self, event: &Pdu) -> Result<Vec<OwnedEventId>> {
        let res = self
            .client
            .get_state_ids(self.origin, self.server, &event.room_id, &event.event_id)
            .await?;
        debug!(
            count = res.pdu_ids.len(),
            "Fetched state IDs before event from remote server"
        );
        Ok(res.pdu_ids)
    }

    /// The state events in effect before `event`, via `/state`.
    ///
    /// Returns every PDU the remote handed back keyed by event ID; the
    /// response may contain more than the `event_ids` asked for (the auth
    /// chain rides along) and callers keep what they need.
    #[instrument(level = "debug", skip(self, event, event_ids), fields(server = %self.server, event_id = %event.event_id))]
    pub async fn state_before_event(
        &self,
        event: &Pdu,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, Pdu>> {
        let res = self
            .client
            .get_state(self.origin, self.server, &event.room_id, &event.event_id)
            .await?;

        let mut result = HashMap::with_capacity(res.pdus.len() + res.auth_chain.len());
        for pdu in res.pdus.into_iter().chain(res.auth_chain) {
            result.insert(pdu.event_id.clone(), pdu);
        }
        debug!(
            returned = result.len(),
            requested = event_ids.len(),
            "Fetched state before event from remote server"
        );
        Ok(result)
    }
}
