// =============================================================================
// Tessera Federation - Configuration Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FederationError, Result};

/// Federation client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Request timeout for outbound federation calls
    pub request_timeout: Duration,

    /// User agent advertised to remote servers
    pub user_agent: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("tessera/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl FederationConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(FederationError::InvalidConfig(
                "request_timeout must be non-zero".to_owned(),
            ));
        }
        if self.user_agent.is_empty() {
            return Err(FederationError::InvalidConfig(
                "user_agent must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}
