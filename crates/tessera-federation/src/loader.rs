// =============================================================================
// Tessera Federation - Events Loader Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   Takes a batch of PDUs received from a remote server, orders it
//   topologically by prev-events, and runs each event through signature and
//   auth verification. Callers classify the per-event outcome: recoverable
//   signature mismatches may be kept, auth failures are dropped.
//
// =============================================================================

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use async_trait::async_trait;
use ruma::{OwnedEventId, RoomVersionId};
use tessera_core::Pdu;
use tracing::{debug, instrument, warn};

use crate::{
    error::{Result, VerificationError},
    verify::PduVerifier,
};

/// Bulk lookup of locally-known events, used to satisfy auth-event
/// references while verifying a batch.
#[async_trait]
pub trait EventProvider: Send {
    async fn provide_events(
        &mut self,
        room_version: &RoomVersionId,
        event_ids: &[OwnedEventId],
    ) -> Result<Vec<Pdu>>;
}

/// The verification outcome for one event of a batch.
#[derive(Debug)]
pub struct LoadResult {
    pub pdu: Pdu,
    pub error: Option<VerificationError>,
}

impl LoadResult {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Orders `pdus` so that every event appears after its prev-events.
///
/// Only edges within the batch count. Ties are broken by depth, then origin
/// timestamp, then event ID, so the output is deterministic; events on a
/// cycle (malformed input) are appended at the end in the same key order.
pub fn topological_order_by_prev_events(pdus: Vec<Pdu>) -> Vec<Pdu> {
    let index: HashMap<OwnedEventId, usize> = pdus
        .iter()
        .enumerate()
        .map(|(i, pdu)| (pdu.event_id.clone(), i))
        .collect();

    let mut in_degree = vec![0usize; pdus.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); pdus.len()];
    for (i, pdu) in pdus.iter().enumerate() {
        let unique_prevs: HashSet<&OwnedEventId> = pdu.prev_events.iter().collect();
        for prev in unique_prevs {
            if let Some(&parent) = index.get(prev) {
                if parent != i {
                    in_degree[i] += 1;
                    children[parent].push(i);
                }
            }
        }
    }

    let sort_key = |pdu: &Pdu| {
        (
            pdu.depth,
            u64::from(pdu.origin_server_ts.0),
            pdu.event_id.clone(),
        )
    };

    let mut ready = BinaryHeap::new();
    for (i, pdu) in pdus.iter().enumerate() {
        if in_degree[i] == 0 {
            ready.push(Reverse((sort_key(pdu), i)));
        }
    }

    let mut order = Vec::with_capacity(pdus.len());
    let mut placed = vec![false; pdus.len()];
    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(i);
        placed[i] = true;
        for &child in &children[i] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.push(Reverse((sort_key(&pdus[child]), child)));
            }
        }
    }

    if order.len() < pdus.len() {
        warn!(
            remaining = pdus.len() - order.len(),
            "Prev-event cycle in batch, appending remaining events by depth"
        );
        let mut leftover: Vec<usize> = (0..pdus.len()).filter(|&i| !placed[i]).collect();
        leftover.sort_by_key(|&i| sort_key(&pdus[i]));
        order.extend(leftover);
    }

    let mut slots: Vec<Option<Pdu>> = pdus.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

/// Verifies a batch of PDUs received from a remote server.
pub struct EventsLoader<'a> {
    room_version: RoomVersionId,
    verifier: &'a dyn PduVerifier,
}

impl<'a> EventsLoader<'a> {
    pub fn new(room_version: RoomVersionId, verifier: &'a dyn PduVerifier) -> Self {
        Self {
            room_version,
            verifier,
        }
    }

    /// Orders the batch topologically by prev-events and verifies each event.
    ///
    /// Auth-event references are satisfied from the batch itself first and
    /// from `provider` (local store) second; whatever can be found is handed
    /// to the verifier, which reports [`VerificationError::AuthChain`] when
    /// that is not enough.
    #[instrument(level = "debug", skip_all, fields(batch = pdus.len()))]
    pub async fn load_and_verify<P>(
        &self,
        pdus: Vec<Pdu>,
        provider: &mut P,
    ) -> Result<Vec<LoadResult>>
    where
        P: EventProvider + ?Sized,
    {
        let ordered = topological_order_by_prev_events(pdus);
        let mut known: HashMap<OwnedEventId, Pdu> = ordered
            .iter()
            .map(|pdu| (pdu.event_id.clone(), pdu.clone()))
            .collect();

        let mut results = Vec::with_capacity(ordered.len());
        for pdu in ordered {
            let mut auth_events = Vec::with_capacity(pdu.auth_events.len());
            let mut missing = Vec::new();
            for id in &pdu.auth_events {
                match known.get(id) {
                    Some(ev) => auth_events.push(ev.clone()),
                    None => missing.push(id.clone()),
                }
            }
            if !missing.is_empty() {
                match provider.provide_events(&self.room_version, &missing).await {
                    Ok(found) => {
                        for ev in found {
                            auth_events.push(ev.clone());
                            known.insert(ev.event_id.clone(), ev);
                        }
                    }
                    Err(err) => {
                        debug!(event_id = %pdu.event_id, error = %err, "Could not resolve auth events locally");
                    }
                }
            }

            let error = self
                .verifier
                .verify_pdu(&self.room_version, &pdu, &auth_events)
                .await
                .err();
            if let Some(err) = &error {
                debug!(event_id = %pdu.event_id, error = %err, "Event failed PDU checks");
            }
            results.push(LoadResult { pdu, error });
        }
        Ok(results)
    }
}
