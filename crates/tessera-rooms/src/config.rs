// =============================================================================
// Tessera Rooms - Configuration Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// =============================================================================

use ruma::{OwnedServerName, ServerName};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoomsError};

/// Backfill engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Names this homeserver answers to: the default host plus any virtual
    /// hosts. Requests from one of these names are treated as our own and
    /// serviced via federation.
    pub local_server_names: Vec<OwnedServerName>,

    /// Servers to try before any other when backfilling
    #[serde(default)]
    pub prefer_servers: Vec<OwnedServerName>,
}

impl BackfillConfig {
    /// Creates a configuration for a single-host deployment
    pub fn new(server_name: OwnedServerName) -> Self {
        Self {
            local_server_names: vec![server_name],
            prefer_servers: Vec::new(),
        }
    }

    /// Whether `server` is one of our own (virtual) host names
    pub fn is_local_server_name(&self, server: &ServerName) -> bool {
        self.local_server_names.iter().any(|local| local == server)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.local_server_names.is_empty() {
            return Err(RoomsError::InvalidConfig(
                "local_server_names must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}
