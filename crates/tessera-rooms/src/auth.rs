// =============================================================================
// Tessera Rooms - History Visibility Auth Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   Decides what a remote server may learn about a room at a point in its
//   history, from the m.room.history_visibility and m.room.member state
//   events in effect there.
//
// =============================================================================

use ruma::{
    events::{
        room::{history_visibility::HistoryVisibility, member::MembershipState},
        TimelineEventType,
    },
    ServerName, UserId,
};
use tessera_core::Pdu;

/// The history visibility set by the given state events.
///
/// Defaults to `shared` when no `m.room.history_visibility` event is present
/// or its content does not parse.
pub fn history_visibility_for_room(events: &[Pdu]) -> HistoryVisibility {
    events
        .iter()
        .find(|pdu| {
            pdu.kind == TimelineEventType::RoomHistoryVisibility && pdu.state_key_equals("")
        })
        .and_then(|pdu| {
            pdu.content
                .get("history_visibility")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
        })
        .unwrap_or(HistoryVisibility::Shared)
}

/// Whether `server` may see the room's events given the state `events` in
/// effect at that point.
///
/// `server_currently_in_room` feeds the `shared` rule: shared history is
/// visible to servers that are in the room now, even if they were not then.
pub fn is_server_allowed(
    server: &ServerName,
    server_currently_in_room: bool,
    events: &[Pdu],
) -> bool {
    let visibility = history_visibility_for_room(events);

    if visibility == HistoryVisibility::WorldReadable {
        return true;
    }
    if any_user_on_server_with_membership(server, events, &MembershipState::Join) {
        return true;
    }
    if visibility == HistoryVisibility::Shared && server_currently_in_room {
        return true;
    }
    if visibility == HistoryVisibility::Invited
        && any_user_on_server_with_membership(server, events, &MembershipState::Invite)
    {
        return true;
    }
    false
}

/// The membership carried by a member event's content, if it parses.
pub fn membership_of(pdu: &Pdu) -> Option<MembershipState> {
    if pdu.kind != TimelineEventType::RoomMember {
        return None;
    }
    pdu.content
        .get("membership")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

fn any_user_on_server_with_membership(
    server: &ServerName,
    events: &[Pdu],
    membership: &MembershipState,
) -> bool {
    events.iter().any(|pdu| {
        pdu.kind == TimelineEventType::RoomMember
            && membership_of(pdu).as_ref() == Some(membership)
            && pdu
                .state_key
                .as_deref()
                .and_then(|key| UserId::parse(key).ok())
                .is_some_and(|user| user.server_name() == server)
    })
}
