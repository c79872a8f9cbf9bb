// =============================================================================
// Tessera Rooms - Backfill Integration Tests
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   End-to-end backfill scenarios over the in-memory store with a scripted
//   federation client: serving history to peers (with egress redaction),
//   recovering history from peers with state snapshot assignment, and
//   server selection under history visibility rules.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ruma::{
    events::{room::history_visibility::HistoryVisibility, TimelineEventType},
    room_id, server_name, EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedServerName,
    RoomId, RoomVersionId, ServerName, UInt,
};
use serde_json::json;
use tessera_core::{Pdu, StateEntry};
use tessera_federation::{
    FederationClient, FederationError, PduVerifier, RoomStateResponse, StateIdsResponse,
    Transaction, VerificationError,
};
use tessera_rooms::{
    backfill::requester::BackfillRequester,
    test_utils::{pdu_builder, store_event_with_state},
    BackfillConfig, Backfiller, Database, MemoryDatabase, PerformBackfillRequest,
    PerformBackfillResponse, RoomsError,
};

const ROOM: &str = "!history:local.example.com";

fn event_id(id: &str) -> OwnedEventId {
    EventId::parse(id).unwrap().to_owned()
}

fn transaction(origin: &ServerName, pdus: Vec<Pdu>) -> Transaction {
    Transaction {
        origin: origin.to_owned(),
        origin_server_ts: MilliSecondsSinceUnixEpoch(UInt::from(0u32)),
        pdus,
    }
}

/// Federation client answering from scripted tables and counting its calls.
#[derive(Default)]
struct ScriptedClient {
    backfill_by_server: HashMap<OwnedServerName, Transaction>,
    state_ids: HashMap<OwnedEventId, Vec<OwnedEventId>>,
    events: HashMap<OwnedEventId, Pdu>,
    calls: Mutex<usize>,
}

impl ScriptedClient {
    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl FederationClient for ScriptedClient {
    async fn backfill(
        &self,
        _origin: &ServerName,
        server: &ServerName,
        _room_id: &RoomId,
        _limit: usize,
        _from_event_ids: &[OwnedEventId],
    ) -> tessera_federation::Result<Transaction> {
        *self.calls.lock().unwrap() += 1;
        self.backfill_by_server
            .get(server)
            .cloned()
            .ok_or_else(|| FederationError::internal("no scripted backfill for server"))
    }

    async fn get_event(
        &self,
        _origin: &ServerName,
        server: &ServerName,
        event_id: &EventId,
    ) -> tessera_federation::Result<Transaction> {
        *self.calls.lock().unwrap() += 1;
        self.events
            .get(event_id)
            .map(|pdu| transaction(server, vec![pdu.clone()]))
            .ok_or_else(|| FederationError::internal("no scripted event"))
    }

    async fn get_state_ids(
        &self,
        _origin: &ServerName,
        _server: &ServerName,
        _room_id: &RoomId,
        event_id: &EventId,
    ) -> tessera_federation::Result<StateIdsResponse> {
        *self.calls.lock().unwrap() += 1;
        self.state_ids
            .get(event_id)
            .map(|ids| StateIdsResponse {
                pdu_ids: ids.clone(),
                auth_chain_ids: vec![],
            })
            .ok_or_else(|| FederationError::internal("no scripted state_ids"))
    }

    async fn get_state(
        &self,
        _origin: &ServerName,
        _server: &ServerName,
        _room_id: &RoomId,
        _event_id: &EventId,
    ) -> tessera_federation::Result<RoomStateResponse> {
        *self.calls.lock().unwrap() += 1;
        Err(FederationError::internal("no scripted state"))
    }
}

/// Verifier accepting everything.
struct AcceptAll;

#[async_trait]
impl PduVerifier for AcceptAll {
    async fn verify_pdu(
        &self,
        _room_version: &RoomVersionId,
        _pdu: &Pdu,
        _auth_events: &[Pdu],
    ) -> Result<(), VerificationError> {
        Ok(())
    }
}

/// Verifier failing scripted events with scripted error kinds.
#[derive(Default)]
struct ScriptedVerifier {
    failures: HashMap<OwnedEventId, VerificationError>,
}

#[async_trait]
impl PduVerifier for ScriptedVerifier {
    async fn verify_pdu(
        &self,
        _room_version: &RoomVersionId,
        pdu: &Pdu,
        _auth_events: &[Pdu],
    ) -> Result<(), VerificationError> {
        match self.failures.get(&pdu.event_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn config() -> BackfillConfig {
    BackfillConfig::new(server_name!("local.example.com").to_owned())
}

fn request(server_name: &ServerName, prev: &[&str], limit: usize) -> PerformBackfillRequest {
    PerformBackfillRequest {
        room_id: room_id!("!history:local.example.com").to_owned(),
        server_name: server_name.to_owned(),
        virtual_host: server_name!("local.example.com").to_owned(),
        prev_event_ids: prev.iter().map(|id| event_id(id)).collect(),
        limit,
        backwards_extremities: HashMap::new(),
    }
}

/// Stores a linear room with visibility `visibility`:
/// create <- alice join <- visibility <- $b msg <- bob join (requester
/// server) <- $c msg <- $d msg.
async fn build_linear_room<D: Database>(db: &D, visibility: &str) -> Vec<StateEntry> {
    let mut state = Vec::new();
    let events = [
        pdu_builder("$create:local.example.com", ROOM, "@alice:local.example.com")
            .kind(TimelineEventType::RoomCreate)
            .state_key("")
            .content(json!({"room_version": "10"}))
            .depth(1)
            .build(),
        pdu_builder("$alice:local.example.com", ROOM, "@alice:local.example.com")
            .kind(TimelineEventType::RoomMember)
            .state_key("@alice:local.example.com")
            .content(json!({"membership": "join"}))
            .prev_events(&["$create:local.example.com"])
            .depth(2)
            .build(),
        pdu_builder("$vis:local.example.com", ROOM, "@alice:local.example.com")
            .kind(TimelineEventType::RoomHistoryVisibility)
            .state_key("")
            .content(json!({"history_visibility": visibility}))
            .prev_events(&["$alice:local.example.com"])
            .depth(3)
            .build(),
        pdu_builder("$b:local.example.com", ROOM, "@alice:local.example.com")
            .content(json!({"msgtype": "m.text", "body": "before bob"}))
            .prev_events(&["$vis:local.example.com"])
            .depth(4)
            .build(),
        pdu_builder("$bob:requester.example.com", ROOM, "@bob:requester.example.com")
            .kind(TimelineEventType::RoomMember)
            .state_key("@bob:requester.example.com")
            .content(json!({"membership": "join"}))
            .prev_events(&["$b:local.example.com"])
            .depth(5)
            .build(),
        pdu_builder("$c:local.example.com", ROOM, "@alice:local.example.com")
            .content(json!({"msgtype": "m.text", "body": "after bob"}))
            .prev_events(&["$bob:requester.example.com"])
            .depth(6)
            .build(),
        pdu_builder("$d:local.example.com", ROOM, "@alice:local.example.com")
            .content(json!({"msgtype": "m.text", "body": "latest"}))
            .prev_events(&["$c:local.example.com"])
            .depth(7)
            .build(),
    ];
    for pdu in &events {
        store_event_with_state(db, pdu, &mut state).await.unwrap();
    }
    state
}

#[test_log::test(tokio::test)]
async fn local_dag_walk_returns_newest_events_without_federation() {
    let db = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    build_linear_room(db.as_ref(), "shared").await;

    let client = Arc::new(ScriptedClient::default());
    let backfiller = Backfiller::new(config(), db, client.clone(), Arc::new(AcceptAll)).unwrap();

    let request = request(
        server_name!("requester.example.com"),
        &["$d:local.example.com"],
        2,
    );
    let mut response = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut response)
        .await
        .unwrap();

    let ids: Vec<&str> = response
        .events
        .iter()
        .map(|pdu| pdu.event_id.as_str())
        .collect();
    assert_eq!(ids, vec!["$d:local.example.com", "$c:local.example.com"]);
    assert_eq!(client.calls(), 0, "no federation call expected");
    // events are returned in full
    assert_eq!(response.events[0].content["body"], "latest");
    assert_eq!(response.events[1].content["body"], "after bob");
}

#[test_log::test(tokio::test)]
async fn response_length_never_exceeds_limit() {
    let db = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    build_linear_room(db.as_ref(), "shared").await;

    let client = Arc::new(ScriptedClient::default());
    let backfiller = Backfiller::new(config(), db, client, Arc::new(AcceptAll)).unwrap();

    for limit in [0, 1, 3, 100] {
        let request = request(
            server_name!("requester.example.com"),
            &["$d:local.example.com"],
            limit,
        );
        let mut response = PerformBackfillResponse::default();
        backfiller
            .perform_backfill(&request, &mut response)
            .await
            .unwrap();
        assert!(response.events.len() <= limit);
    }
}

#[test_log::test(tokio::test)]
async fn events_invisible_to_requester_are_redacted_on_egress() {
    let db = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    // With visibility "joined", $b predates bob's join, so the requesting
    // server may not see it in full; $c and $d postdate the join.
    build_linear_room(db.as_ref(), "joined").await;

    let client = Arc::new(ScriptedClient::default());
    let backfiller = Backfiller::new(config(), db, client, Arc::new(AcceptAll)).unwrap();

    let request = request(
        server_name!("requester.example.com"),
        &["$d:local.example.com"],
        10,
    );
    let mut response = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut response)
        .await
        .unwrap();

    let by_id: HashMap<&str, &Pdu> = response
        .events
        .iter()
        .map(|pdu| (pdu.event_id.as_str(), pdu))
        .collect();
    let b = by_id["$b:local.example.com"];
    assert_eq!(b.content, json!({}), "pre-join event must be redacted");
    assert_eq!(by_id["$c:local.example.com"].content["body"], "after bob");
    assert_eq!(by_id["$d:local.example.com"].content["body"], "latest");
}

#[test_log::test(tokio::test)]
async fn unknown_room_fails_with_missing_room() {
    let db = Arc::new(MemoryDatabase::default());
    let client = Arc::new(ScriptedClient::default());
    let backfiller = Backfiller::new(config(), db, client, Arc::new(AcceptAll)).unwrap();

    let request = request(
        server_name!("requester.example.com"),
        &["$d:local.example.com"],
        5,
    );
    let mut response = PerformBackfillResponse::default();
    let err = backfiller
        .perform_backfill(&request, &mut response)
        .await
        .unwrap_err();
    assert!(matches!(err, RoomsError::MissingRoom(_)));
}

/// Stores the partial room a server that joined late would hold: bob's join
/// (as outlier state) and one message whose prev event is unknown.
async fn build_partial_room<D: Database>(db: &D) {
    let mut state = Vec::new();
    let bob_join = pdu_builder("$bobjoin:remote.example.com", ROOM, "@bob:remote.example.com")
        .kind(TimelineEventType::RoomMember)
        .state_key("@bob:remote.example.com")
        .content(json!({"membership": "join"}))
        .depth(8)
        .build();
    store_event_with_state(db, &bob_join, &mut state)
        .await
        .unwrap();
    let y = pdu_builder("$y:local.example.com", ROOM, "@bob:remote.example.com")
        .content(json!({"msgtype": "m.text", "body": "first held event"}))
        .prev_events(&["$x:remote.example.com"])
        .depth(9)
        .build();
    store_event_with_state(db, &y, &mut state).await.unwrap();
}

/// The history beyond our backwards extremity, as the remote server returns
/// it: the room's create event and two messages.
fn remote_history() -> Vec<Pdu> {
    let u = pdu_builder("$u:remote.example.com", ROOM, "@bob:remote.example.com")
        .kind(TimelineEventType::RoomCreate)
        .state_key("")
        .content(json!({"room_version": "10"}))
        .depth(1)
        .build();
    let v = pdu_builder("$v:remote.example.com", ROOM, "@bob:remote.example.com")
        .content(json!({"msgtype": "m.text", "body": "old talk"}))
        .prev_events(&["$u:remote.example.com"])
        .auth_events(&["$u:remote.example.com"])
        .depth(2)
        .build();
    let w = pdu_builder("$w:remote.example.com", ROOM, "@bob:remote.example.com")
        .content(json!({"msgtype": "m.text", "body": "older talk"}))
        .prev_events(&["$v:remote.example.com"])
        .auth_events(&["$u:remote.example.com"])
        .depth(3)
        .build();
    vec![w, v, u]
}

fn federated_request() -> PerformBackfillRequest {
    let mut request = request(
        server_name!("local.example.com"),
        &["$x:remote.example.com"],
        5,
    );
    request.backwards_extremities.insert(
        event_id("$y:local.example.com"),
        vec![event_id("$x:remote.example.com")],
    );
    request
}

#[test_log::test(tokio::test)]
async fn federated_backfill_persists_events_with_state_snapshots() {
    let db = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    build_partial_room(db.as_ref()).await;

    let mut client = ScriptedClient::default();
    client.backfill_by_server.insert(
        server_name!("remote.example.com").to_owned(),
        transaction(server_name!("remote.example.com"), remote_history()),
    );
    let client = Arc::new(client);

    let backfiller =
        Backfiller::new(config(), db.clone(), client.clone(), Arc::new(AcceptAll)).unwrap();

    let request = federated_request();
    let mut response = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut response)
        .await
        .unwrap();

    // Topological order, oldest first.
    let ids: Vec<&str> = response
        .events
        .iter()
        .map(|pdu| pdu.event_id.as_str())
        .collect();
    assert_eq!(
        ids,
        vec![
            "$u:remote.example.com",
            "$v:remote.example.com",
            "$w:remote.example.com"
        ]
    );
    assert_eq!(response.history_visibility, HistoryVisibility::Shared);

    // Every event was persisted and annotated with a before-state snapshot.
    let wanted: Vec<OwnedEventId> = ids.iter().map(|id| event_id(id)).collect();
    let nid_map = db.event_nids(&wanted).await.unwrap();
    assert_eq!(nid_map.len(), 3);
    let info = db
        .room_info(room_id!("!history:local.example.com"))
        .await
        .unwrap()
        .unwrap();
    for meta in nid_map.values() {
        let stored = db.events(&info, &[meta.event_nid]).await.unwrap();
        assert!(
            stored[0].before_state_snapshot.is_some(),
            "snapshot missing for {}",
            stored[0].pdu.event_id
        );
    }
}

#[test_log::test(tokio::test)]
async fn federated_backfill_twice_creates_no_duplicate_nids() {
    let db = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    build_partial_room(db.as_ref()).await;

    let mut client = ScriptedClient::default();
    client.backfill_by_server.insert(
        server_name!("remote.example.com").to_owned(),
        transaction(server_name!("remote.example.com"), remote_history()),
    );
    let client = Arc::new(client);
    let backfiller =
        Backfiller::new(config(), db.clone(), client, Arc::new(AcceptAll)).unwrap();

    let request = federated_request();
    let mut first = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut first)
        .await
        .unwrap();
    let wanted: Vec<OwnedEventId> = first.events.iter().map(|pdu| pdu.event_id.clone()).collect();
    let nids_before = db.event_nids(&wanted).await.unwrap();

    let mut second = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut second)
        .await
        .unwrap();
    let nids_after = db.event_nids(&wanted).await.unwrap();

    assert_eq!(
        first
            .events
            .iter()
            .map(|pdu| pdu.event_id.clone())
            .collect::<Vec<_>>(),
        second
            .events
            .iter()
            .map(|pdu| pdu.event_id.clone())
            .collect::<Vec<_>>()
    );
    assert_eq!(nids_before, nids_after);
}

#[test_log::test(tokio::test)]
async fn missing_state_events_are_fetched_before_snapshot_assignment() {
    let db = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    build_partial_room(db.as_ref()).await;

    // $w sits on a fork, so its before-state comes from /state_ids and
    // references $side, an event no backfill batch carried.
    let u = pdu_builder("$u:remote.example.com", ROOM, "@bob:remote.example.com")
        .kind(TimelineEventType::RoomCreate)
        .state_key("")
        .content(json!({"room_version": "10"}))
        .depth(1)
        .build();
    let v = pdu_builder("$v:remote.example.com", ROOM, "@bob:remote.example.com")
        .content(json!({"msgtype": "m.text", "body": "old talk"}))
        .prev_events(&["$u:remote.example.com"])
        .depth(2)
        .build();
    let w = pdu_builder("$w:remote.example.com", ROOM, "@bob:remote.example.com")
        .content(json!({"msgtype": "m.text", "body": "merge"}))
        .prev_events(&["$v:remote.example.com", "$fork:remote.example.com"])
        .depth(3)
        .build();
    let side = pdu_builder("$side:remote.example.com", ROOM, "@carol:remote.example.com")
        .kind(TimelineEventType::RoomMember)
        .state_key("@carol:remote.example.com")
        .content(json!({"membership": "join"}))
        .depth(2)
        .build();

    let mut client = ScriptedClient::default();
    client.backfill_by_server.insert(
        server_name!("remote.example.com").to_owned(),
        transaction(server_name!("remote.example.com"), vec![w, v, u]),
    );
    client.state_ids.insert(
        event_id("$w:remote.example.com"),
        vec![
            event_id("$u:remote.example.com"),
            event_id("$side:remote.example.com"),
        ],
    );
    client
        .events
        .insert(event_id("$side:remote.example.com"), side);
    let client = Arc::new(client);

    let backfiller =
        Backfiller::new(config(), db.clone(), client, Arc::new(AcceptAll)).unwrap();

    let request = federated_request();
    let mut response = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut response)
        .await
        .unwrap();

    assert_eq!(response.events.len(), 3);
    // the referenced state event was recovered and persisted
    let recovered = db
        .event_nids(&[event_id("$side:remote.example.com")])
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    // and $w still got its snapshot
    let info = db
        .room_info(room_id!("!history:local.example.com"))
        .await
        .unwrap()
        .unwrap();
    let w_meta = db
        .event_nids(&[event_id("$w:remote.example.com")])
        .await
        .unwrap();
    let stored = db
        .events(&info, &[w_meta[&event_id("$w:remote.example.com")].event_nid])
        .await
        .unwrap();
    assert!(stored[0].before_state_snapshot.is_some());
}

#[test_log::test(tokio::test)]
async fn verification_failures_follow_the_classification_table() {
    let db = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    build_partial_room(db.as_ref()).await;

    let mut client = ScriptedClient::default();
    client.backfill_by_server.insert(
        server_name!("remote.example.com").to_owned(),
        transaction(server_name!("remote.example.com"), remote_history()),
    );
    // $w rolls forward from $v; with $v dropped it must ask /state_ids.
    client.state_ids.insert(
        event_id("$w:remote.example.com"),
        vec![event_id("$u:remote.example.com")],
    );
    let client = Arc::new(client);

    let mut verifier = ScriptedVerifier::default();
    verifier.failures.insert(
        event_id("$u:remote.example.com"),
        VerificationError::Signature("key ID reused".into()),
    );
    verifier.failures.insert(
        event_id("$v:remote.example.com"),
        VerificationError::AuthRules("sender not in room".into()),
    );

    let backfiller =
        Backfiller::new(config(), db.clone(), client, Arc::new(verifier)).unwrap();

    let request = federated_request();
    let mut response = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut response)
        .await
        .unwrap();

    let ids: Vec<&str> = response
        .events
        .iter()
        .map(|pdu| pdu.event_id.as_str())
        .collect();
    // signature mismatch kept, auth failure dropped
    assert_eq!(ids, vec!["$u:remote.example.com", "$w:remote.example.com"]);
    let dropped = db
        .event_nids(&[event_id("$v:remote.example.com")])
        .await
        .unwrap();
    assert!(dropped.is_empty(), "auth-failed event must not be persisted");
}

#[test_log::test(tokio::test)]
async fn server_selection_prefers_configured_servers_and_excludes_local() {
    let db = MemoryDatabase::new(vec![server_name!("local.example.com").to_owned()]);
    let mut state = Vec::new();
    let members = [
        ("$create:local.example.com", "@alice:local.example.com", None),
        ("$vis:local.example.com", "@alice:local.example.com", Some("joined")),
        ("$alice:local.example.com", "@alice:local.example.com", None),
        ("$m1:a.example.com", "@u1:a.example.com", None),
        ("$m2:b.example.com", "@u2:b.example.com", None),
        ("$m3:c.example.com", "@u3:c.example.com", None),
    ];
    for (id, user, visibility) in members {
        let pdu = match visibility {
            Some(visibility) => pdu_builder(id, ROOM, user)
                .kind(TimelineEventType::RoomHistoryVisibility)
                .state_key("")
                .content(json!({"history_visibility": visibility}))
                .build(),
            None if id.starts_with("$create") => pdu_builder(id, ROOM, user)
                .kind(TimelineEventType::RoomCreate)
                .state_key("")
                .content(json!({"room_version": "10"}))
                .build(),
            None => pdu_builder(id, ROOM, user)
                .kind(TimelineEventType::RoomMember)
                .state_key(user)
                .content(json!({"membership": "join"}))
                .build(),
        };
        store_event_with_state(&db, &pdu, &mut state).await.unwrap();
    }
    let successor = pdu_builder("$y:local.example.com", ROOM, "@alice:local.example.com")
        .prev_events(&["$x:remote.example.com"])
        .depth(10)
        .build();
    store_event_with_state(&db, &successor, &mut state)
        .await
        .unwrap();

    let client = ScriptedClient::default();
    let info = db
        .room_info(room_id!("!history:local.example.com"))
        .await
        .unwrap()
        .unwrap();
    let mut requester = BackfillRequester::new(
        &db,
        &client,
        info,
        server_name!("local.example.com").to_owned(),
        vec![server_name!("local.example.com").to_owned()],
        HashMap::from([(
            event_id("$y:local.example.com"),
            vec![event_id("$x:remote.example.com")],
        )]),
        vec![server_name!("c.example.com").to_owned()],
    );

    let servers = requester
        .servers_at_event(
            room_id!("!history:local.example.com"),
            &event_id("$x:remote.example.com"),
        )
        .await;

    assert_eq!(servers.len(), 3);
    assert_eq!(servers[0], server_name!("c.example.com"));
    assert!(servers.contains(&server_name!("a.example.com").to_owned()));
    assert!(servers.contains(&server_name!("b.example.com").to_owned()));
    assert!(!servers.contains(&server_name!("local.example.com").to_owned()));
}

/// Store wrapper simulating a pruned event body: the event still resolves
/// and scans, but bulk loads cannot produce it.
struct PrunedDb {
    inner: Arc<MemoryDatabase>,
    hidden: OwnedEventId,
}

#[async_trait]
impl Database for PrunedDb {
    async fn room_info(
        &self,
        room_id: &RoomId,
    ) -> tessera_rooms::Result<Option<tessera_core::RoomInfo>> {
        self.inner.room_info(room_id).await
    }

    async fn event_nids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> tessera_rooms::Result<HashMap<OwnedEventId, tessera_core::EventMetadata>> {
        self.inner.event_nids(event_ids).await
    }

    async fn events(
        &self,
        room_info: &tessera_core::RoomInfo,
        event_nids: &[tessera_core::EventNid],
    ) -> tessera_rooms::Result<Vec<tessera_core::StoredEvent>> {
        let mut events = self.inner.events(room_info, event_nids).await?;
        if event_nids.len() > 1 {
            events.retain(|stored| stored.pdu.event_id != self.hidden);
        }
        Ok(events)
    }

    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[OwnedEventId],
        exclude_rejected: bool,
    ) -> tessera_rooms::Result<Vec<StateEntry>> {
        self.inner
            .state_entries_for_event_ids(event_ids, exclude_rejected)
            .await
    }

    async fn state_entries_for_snapshot(
        &self,
        snapshot: tessera_core::StateSnapshotNid,
    ) -> tessera_rooms::Result<Vec<StateEntry>> {
        self.inner.state_entries_for_snapshot(snapshot).await
    }

    async fn add_state(
        &self,
        room_nid: tessera_core::RoomNid,
        base_snapshots: &[tessera_core::StateSnapshotNid],
        entries: Vec<StateEntry>,
    ) -> tessera_rooms::Result<tessera_core::StateSnapshotNid> {
        self.inner.add_state(room_nid, base_snapshots, entries).await
    }

    async fn set_state(
        &self,
        event_nid: tessera_core::EventNid,
        snapshot: tessera_core::StateSnapshotNid,
    ) -> tessera_rooms::Result<()> {
        self.inner.set_state(event_nid, snapshot).await
    }

    async fn get_or_create_room_info(
        &self,
        event: &Pdu,
    ) -> tessera_rooms::Result<tessera_core::RoomInfo> {
        self.inner.get_or_create_room_info(event).await
    }

    async fn get_or_create_event_type_nid(
        &self,
        event_type: &TimelineEventType,
    ) -> tessera_rooms::Result<tessera_core::EventTypeNid> {
        self.inner.get_or_create_event_type_nid(event_type).await
    }

    async fn get_or_create_event_state_key_nid(
        &self,
        state_key: Option<&str>,
    ) -> tessera_rooms::Result<tessera_core::EventStateKeyNid> {
        self.inner.get_or_create_event_state_key_nid(state_key).await
    }

    async fn store_event(
        &self,
        event: &Pdu,
        room_info: &tessera_core::RoomInfo,
        event_type_nid: tessera_core::EventTypeNid,
        event_state_key_nid: tessera_core::EventStateKeyNid,
        auth_event_nids: Vec<tessera_core::EventNid>,
        rejected: bool,
    ) -> tessera_rooms::Result<tessera_core::EventNid> {
        self.inner
            .store_event(
                event,
                room_info,
                event_type_nid,
                event_state_key_nid,
                auth_event_nids,
                rejected,
            )
            .await
    }

    async fn maybe_redact_event(
        &self,
        room_info: &tessera_core::RoomInfo,
        event_nid: tessera_core::EventNid,
        event: &Pdu,
    ) -> tessera_rooms::Result<Option<Pdu>> {
        self.inner.maybe_redact_event(room_info, event_nid, event).await
    }

    async fn get_membership_event_nids_for_room(
        &self,
        room_nid: tessera_core::RoomNid,
        joined_only: bool,
        local_only: bool,
    ) -> tessera_rooms::Result<Vec<tessera_core::EventNid>> {
        self.inner
            .get_membership_event_nids_for_room(room_nid, joined_only, local_only)
            .await
    }
}

#[test_log::test(tokio::test)]
async fn pruned_local_store_falls_back_to_federation() {
    let memory = Arc::new(MemoryDatabase::new(vec![
        server_name!("local.example.com").to_owned()
    ]));
    build_linear_room(memory.as_ref(), "shared").await;
    // bob's remote counterpart lets server selection find a peer
    let mut state = Vec::new();
    let remote_member = pdu_builder(
        "$bobjoin:remote.example.com",
        ROOM,
        "@bob2:remote.example.com",
    )
    .kind(TimelineEventType::RoomMember)
    .state_key("@bob2:remote.example.com")
    .content(json!({"membership": "join"}))
    .depth(8)
    .build();
    store_event_with_state(memory.as_ref(), &remote_member, &mut state)
        .await
        .unwrap();

    let db = Arc::new(PrunedDb {
        inner: memory.clone(),
        hidden: event_id("$b:local.example.com"),
    });

    let z = pdu_builder("$z:remote.example.com", ROOM, "@bob2:remote.example.com")
        .content(json!({"msgtype": "m.text", "body": "recovered"}))
        .prev_events(&["$p1:remote.example.com", "$p2:remote.example.com"])
        .depth(3)
        .build();
    let mut client = ScriptedClient::default();
    client.backfill_by_server.insert(
        server_name!("remote.example.com").to_owned(),
        transaction(server_name!("remote.example.com"), vec![z]),
    );
    client.state_ids.insert(
        event_id("$z:remote.example.com"),
        vec![event_id("$bobjoin:remote.example.com")],
    );
    let client = Arc::new(client);

    let backfiller = Backfiller::new(config(), db, client, Arc::new(AcceptAll)).unwrap();

    // A remote requester walks the DAG; the pruned event forces the local
    // load to fail and the engine recovers via federation.
    let mut request = request(
        server_name!("requester.example.com"),
        &["$d:local.example.com"],
        10,
    );
    request.backwards_extremities.insert(
        event_id("$d:local.example.com"),
        vec![event_id("$d:local.example.com")],
    );
    let mut response = PerformBackfillResponse::default();
    backfiller
        .perform_backfill(&request, &mut response)
        .await
        .unwrap();

    let ids: Vec<&str> = response
        .events
        .iter()
        .map(|pdu| pdu.event_id.as_str())
        .collect();
    assert_eq!(ids, vec!["$z:remote.example.com"]);
    // the recovered event is persisted with its snapshot
    let nid_map = memory
        .event_nids(&[event_id("$z:remote.example.com")])
        .await
        .unwrap();
    assert_eq!(nid_map.len(), 1);
}
