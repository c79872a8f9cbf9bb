// =============================================================================
// Tessera Rooms - Error Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// =============================================================================

use ruma::{OwnedEventId, OwnedRoomId};
use thiserror::Error;

use tessera_federation::FederationError;

/// Room service error types
#[derive(Error, Debug)]
pub enum RoomsError {
    /// The room is unknown to this server, or only known as a stub
    #[error("Missing room info for room {0}")]
    MissingRoom(OwnedRoomId),

    /// The store could not produce all requested events
    #[error("Missing events in the store: wanted {wanted}, loaded {loaded}")]
    MissingEvents { wanted: usize, loaded: usize },

    /// No remote server could be selected to backfill from
    #[error("No backfill servers available for room {0}")]
    NoServers(OwnedRoomId),

    /// Every candidate server failed to answer
    #[error("All backfill servers failed for room {0}")]
    FederationExhausted(OwnedRoomId),

    /// A state snapshot could not be assigned to a backfilled event
    #[error("Failed to assign state snapshot for event {event_id}: {reason}")]
    SnapshotAssignment {
        event_id: OwnedEventId,
        reason: String,
    },

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Outbound federation error
    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for room service operations
pub type Result<T> = std::result::Result<T, RoomsError>;

impl RoomsError {
    /// Creates a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
