// =============================================================================
// Tessera Federation - Wire Types Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   Response shapes for the Server-Server API v1 endpoints used by the
//   room server: /backfill, /event, /state_ids and /state.
//
// =============================================================================

use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedServerName};
use serde::{Deserialize, Serialize};
use tessera_core::Pdu;

/// A federation transaction: PDUs returned by a remote server.
///
/// Both `/backfill` and `/event` respond with this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// The server that produced this transaction
    pub origin: OwnedServerName,

    /// When the transaction was produced, on the origin's clock
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,

    /// The events themselves
    #[serde(default)]
    pub pdus: Vec<Pdu>,
}

/// Response to `/state_ids`: the room state before an event, as IDs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateIdsResponse {
    /// IDs of the state events in effect before the requested event
    #[serde(default)]
    pub pdu_ids: Vec<OwnedEventId>,

    /// IDs of the full auth chain of that state
    #[serde(default)]
    pub auth_chain_ids: Vec<OwnedEventId>,
}

/// Response to `/state`: the room state before an event, as full PDUs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomStateResponse {
    /// The state events in effect before the requested event
    #[serde(default)]
    pub pdus: Vec<Pdu>,

    /// The full auth chain of that state
    #[serde(default)]
    pub auth_chain: Vec<Pdu>,
}
