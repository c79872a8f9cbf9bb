// =============================================================================
// Tessera Federation - Matrix Server-Server API Client Surface
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   Outbound federation for the Tessera homeserver: the client trait over
//   the Server-Server API endpoints the room server needs (backfill, event
//   and state retrieval), an HTTP implementation, a federated state
//   provider, and the event verification/loading pipeline applied to PDUs
//   received from remote servers.
//
// =============================================================================

pub mod client;
pub mod config;
pub mod error;
pub mod loader;
pub mod state_provider;
pub mod types;
pub mod verify;

pub use client::{FederationClient, HttpFederationClient};
pub use config::FederationConfig;
pub use error::{FederationError, Result, VerificationError};
pub use loader::{topological_order_by_prev_events, EventProvider, EventsLoader, LoadResult};
pub use state_provider::FederatedStateProvider;
pub use types::{RoomStateResponse, StateIdsResponse, Transaction};
pub use verify::PduVerifier;
