// =============================================================================
// Tessera Federation - Error Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// =============================================================================

use ruma::OwnedServerName;
use thiserror::Error;

/// Federation-specific error types
#[derive(Error, Debug)]
pub enum FederationError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote server answered with a non-success status
    #[error("Server {server} returned status {status}")]
    Server { server: OwnedServerName, status: u16 },

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Event verification failure
    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for federation operations
pub type Result<T> = std::result::Result<T, FederationError>;

/// Per-event verification failure kinds.
///
/// The distinction matters to callers: a signature mismatch can be
/// recoverable (a key ID reused with a different key still leaves the room
/// DAG connected), while auth failures mean the event must be dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// Event signature did not verify against the origin's keys.
    #[error("Signature check failed: {0}")]
    Signature(String),

    /// One or more referenced auth events could not be validated.
    #[error("Auth chain check failed: {0}")]
    AuthChain(String),

    /// The event does not pass the auth rules given its auth events.
    #[error("Auth rules check failed: {0}")]
    AuthRules(String),

    /// The event is malformed beyond repair.
    #[error("Malformed event: {0}")]
    Invalid(String),
}

impl FederationError {
    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
