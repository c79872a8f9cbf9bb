//! Core types for Tessera
//!
//! This crate defines the fundamental types shared across the Tessera
//! homeserver crates: the PDU representation used on the wire and in the
//! room DAG, and the numeric identifiers (NIDs) that the event store hands
//! out for events, rooms, event types and state keys.
//!
//! The types here are based on the Matrix protocol specification and lean on
//! `ruma` for all external identifiers.

pub mod pdu;
pub mod types;

pub use pdu::Pdu;
pub use types::{
    EventMetadata, EventNid, EventStateKeyNid, EventTypeNid, RoomInfo, RoomNid, StateEntry,
    StateSnapshotNid, StoredEvent,
};
