// =============================================================================
// Tessera Rooms - Backfill API Types
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// =============================================================================

use std::collections::HashMap;

use ruma::{
    events::room::history_visibility::HistoryVisibility, OwnedEventId, OwnedRoomId,
    OwnedServerName,
};
use serde::{Deserialize, Serialize};
use tessera_core::Pdu;

/// Request for [`crate::backfill::Backfiller::perform_backfill`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformBackfillRequest {
    pub room_id: OwnedRoomId,

    /// The server asking for history. One of our own names means we are
    /// backfilling for ourselves.
    pub server_name: OwnedServerName,

    /// The local host name to originate outbound federation requests under.
    pub virtual_host: OwnedServerName,

    /// The frontier to walk backwards from.
    pub prev_event_ids: Vec<OwnedEventId>,

    /// Maximum number of events to return on the serve-from-local path.
    pub limit: usize,

    /// Backwards extremities of the room: each known successor event mapped
    /// to the prev-event IDs we do not have.
    #[serde(default)]
    pub backwards_extremities: HashMap<OwnedEventId, Vec<OwnedEventId>>,
}

/// Response for [`crate::backfill::Backfiller::perform_backfill`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformBackfillResponse {
    /// The backfilled events, topologically ordered on the federated path
    /// and newest-first on the local path.
    pub events: Vec<Pdu>,

    /// History visibility observed while selecting servers; only meaningful
    /// on the federated path.
    pub history_visibility: HistoryVisibility,
}

impl Default for PerformBackfillResponse {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            history_visibility: HistoryVisibility::Shared,
        }
    }
}
