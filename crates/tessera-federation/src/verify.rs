// =============================================================================
// Tessera Federation - Event Verification Seam
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// =============================================================================

use async_trait::async_trait;
use ruma::RoomVersionId;
use tessera_core::Pdu;

use crate::error::VerificationError;

/// Signature and auth-rule checks for PDUs received over federation.
///
/// The cryptographic primitives and the room-version auth rules live behind
/// this trait; the backfill pipeline only consumes the classification of the
/// outcome (see [`VerificationError`]).
#[async_trait]
pub trait PduVerifier: Send + Sync {
    /// Verifies `pdu` for `room_version`.
    ///
    /// `auth_events` holds the referenced auth events that could be found
    /// locally or in the same batch; an implementation that cannot complete
    /// its auth checks with what is given reports
    /// [`VerificationError::AuthChain`].
    async fn verify_pdu(
        &self,
        room_version: &RoomVersionId,
        pdu: &Pdu,
        auth_events: &[Pdu],
    ) -> Result<(), VerificationError>;
}
