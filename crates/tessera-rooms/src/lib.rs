// =============================================================================
// Tessera Rooms Service Library
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   Room DAG services for the Tessera homeserver. The crate carries the
//   backfill engine (serving history to peers and recovering missing
//   history from them), the history-visibility rules applied on egress and
//   the event store surface everything is written against.
//
// =============================================================================

pub mod api;
pub mod auth;
pub mod backfill;
pub mod config;
pub mod error;
pub mod storage;
pub mod test_utils;

pub use api::{PerformBackfillRequest, PerformBackfillResponse};
pub use backfill::{Backfiller, FEDERATION_BACKFILL_LIMIT, MAX_BACKFILL_SERVERS};
pub use config::BackfillConfig;
pub use error::{Result, RoomsError};
pub use storage::{Database, MemoryDatabase};
