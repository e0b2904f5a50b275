//! Authorization Tests
//!
//! Who may do what at the request boundary: session membership, manager-only
//! operations, token control, and failing closed when the authorization
//! backend is unavailable.

use serde_json::json;

use crate::core::broadcast::Outbound;
use crate::core::collaborators::MockTacticalDecisionProvider;
use crate::core::encounter::{EncounterMachine, EventContext};
use crate::core::engine::{Engine, EngineSettings};
use crate::core::error::EngineError;
use crate::core::persistence::{SessionStatus, SessionStatusStore};
use crate::core::protocol::OutboundType;
use crate::tests::common::*;
use crate::tests::mocks::{allow_all, mock_services, sessions_with, unreachable_authorization};

async fn subscribed(h: &TestHarness, user: &str, encounter_id: &str) -> TestClient {
    let mut client = h.client(user).await;
    client
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    client.expect(OutboundType::EncounterSubscribed);
    client
}

async fn add_player_token(h: &TestHarness, gm: &mut TestClient, encounter_id: &str) {
    gm.send(
        "ADD_ACTOR",
        json!({ "encounterId": encounter_id, "actorId": PLAYER_TOKEN }),
        None,
    )
    .await;
    gm.expect(OutboundType::ActorAdded);
    assert!(h.engine.registry().contains(encounter_id));
}

#[tokio::test]
async fn test_requests_before_authentication_are_rejected() {
    let h = TestHarness::new().await;
    let (handle, mut rx) = h.engine.connect();

    h.engine
        .handle_text(
            handle.id(),
            &json!({ "type": "JOIN_SESSION", "payload": { "sessionId": SESSION }, "requestId": "early" })
                .to_string(),
        )
        .await;

    match rx.try_recv() {
        Ok(Outbound::Message(message)) => {
            assert_eq!(message.message_type, OutboundType::Error);
            assert_eq!(message.payload["code"], "UNAUTHORIZED");
            assert_eq!(message.request_id.as_deref(), Some("early"));
        }
        other => panic!("expected an error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_token_is_rejected() {
    let h = TestHarness::new().await;
    let (handle, mut rx) = h.engine.connect();

    h.engine
        .handle_text(handle.id(), r#"{"type":"AUTHENTICATE","payload":{"token":"  "}}"#)
        .await;

    match rx.try_recv() {
        Ok(Outbound::Message(message)) => {
            assert_eq!(message.message_type, OutboundType::Error);
        }
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(h.engine.broadcaster().user_of(handle.id()), None);
}

#[tokio::test]
async fn test_outsider_cannot_subscribe() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut mallory = h.client(OUTSIDER).await;
    mallory
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;

    assert_eq!(mallory.expect_error().payload["code"], "UNAUTHORIZED");
    assert!(!h.engine.broadcaster().is_subscribed(mallory.id(), &encounter_id));
}

#[tokio::test]
async fn test_outsider_cannot_join_session() {
    let h = TestHarness::new().await;
    let mut mallory = h.client(OUTSIDER).await;

    mallory
        .send("JOIN_SESSION", json!({ "sessionId": SESSION }), None)
        .await;
    assert_eq!(mallory.expect_error().payload["code"], "UNAUTHORIZED");
    assert_eq!(h.engine.supervisor().live_connections(SESSION), 0);
}

#[tokio::test]
async fn test_players_cannot_manage_encounters() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;
    let mut alice = subscribed(&h, PLAYER, &encounter_id).await;

    for kind in ["PAUSE_ENCOUNTER", "RESET_ENCOUNTER", "END_ENCOUNTER"] {
        alice.send(kind, json!({ "encounterId": encounter_id }), None).await;
        assert_eq!(alice.expect_error().payload["code"], "UNAUTHORIZED", "{}", kind);
    }
    alice
        .send(
            "CREATE_ENCOUNTER",
            json!({ "sessionId": SESSION, "name": "Side fight" }),
            None,
        )
        .await;
    assert_eq!(alice.expect_error().payload["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_player_controls_own_token_only() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;
    add_player_token(&h, &mut gm, &encounter_id).await;

    let mut alice = subscribed(&h, PLAYER, &encounter_id).await;
    let mut bob = subscribed(&h, OTHER_PLAYER, &encounter_id).await;

    alice
        .send(
            "APPLY_HEALING",
            json!({ "encounterId": encounter_id, "actorId": PLAYER_TOKEN, "amount": 4 }),
            Some("heal-self"),
        )
        .await;
    let own = alice.expect(OutboundType::ActorHealthUpdated);
    assert_eq!(own.request_id.as_deref(), Some("heal-self"));
    bob.expect(OutboundType::ActorHealthUpdated);

    alice
        .send(
            "APPLY_DAMAGE",
            json!({ "encounterId": encounter_id, "actorId": "goblin", "amount": 4 }),
            None,
        )
        .await;
    assert_eq!(alice.expect_error().payload["code"], "UNAUTHORIZED");

    bob.send(
        "APPLY_DAMAGE",
        json!({ "encounterId": encounter_id, "actorId": PLAYER_TOKEN, "amount": 4 }),
        None,
    )
    .await;
    assert_eq!(bob.expect_error().payload["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_turn_can_be_ended_by_active_combatant_controller() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;
    add_player_token(&h, &mut gm, &encounter_id).await;
    let mut alice = subscribed(&h, PLAYER, &encounter_id).await;

    // fighter's turn: not alice's
    alice.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
    assert_eq!(alice.expect_error().payload["code"], "UNAUTHORIZED");

    // fighter -> goblin -> Aria
    for _ in 0..2 {
        gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
    }
    alice.drain();

    alice.send("NEXT_TURN", json!({ "encounterId": encounter_id }), Some("mine")).await;
    let advanced = alice.expect(OutboundType::TurnAdvanced);
    assert_eq!(advanced.payload["currentCombatant"]["id"], "wizard");
}

#[tokio::test]
async fn test_terminal_session_cannot_be_joined() {
    let h = TestHarness::new().await;
    h.db.set_session_status(SESSION, SessionStatus::Abandoned).await.unwrap();

    let mut bob = h.client(OTHER_PLAYER).await;
    bob.send("JOIN_SESSION", json!({ "sessionId": SESSION }), None).await;
    assert_eq!(bob.expect_error().payload["code"], "INVALID_STATE");
}

// =============================================================================
// Mocked collaborators
// =============================================================================

#[tokio::test]
async fn test_authorization_outage_fails_closed() {
    let services = mock_services(
        unreachable_authorization(),
        sessions_with(SessionStatus::Active),
        MockTacticalDecisionProvider::new(),
    );
    let (engine, sync) = Engine::new(services, EngineSettings::default());
    tokio::spawn(sync.run());
    engine
        .registry()
        .create(EncounterMachine::new("enc-1", SESSION, "Bridge", Vec::new()), &EventContext::system())
        .unwrap();

    let (handle, mut rx) = engine.connect();
    engine
        .handle_text(handle.id(), r#"{"type":"AUTHENTICATE","payload":{"token":"gm"}}"#)
        .await;
    engine
        .handle_text(
            handle.id(),
            r#"{"type":"SUBSCRIBE_ENCOUNTER","payload":{"encounterId":"enc-1"},"requestId":"s"}"#,
        )
        .await;

    let mut codes = Vec::new();
    while let Ok(Outbound::Message(message)) = rx.try_recv() {
        if message.message_type == OutboundType::Error {
            codes.push(message.payload["code"].as_str().unwrap_or_default().to_string());
        }
    }
    assert_eq!(codes, vec!["UNAUTHORIZED"]);
    assert!(!engine.broadcaster().is_subscribed(handle.id(), "enc-1"));
}

#[tokio::test]
async fn test_tactical_provider_error_is_returned_to_requester() {
    let mut tactics = MockTacticalDecisionProvider::new();
    tactics
        .expect_decide()
        .times(1)
        .returning(|_, _| Err(EngineError::Validation("No model loaded".into())));
    let services = mock_services(allow_all(), sessions_with(SessionStatus::Active), tactics);
    let (engine, sync) = Engine::new(services, EngineSettings::default());
    tokio::spawn(sync.run());
    engine
        .registry()
        .create(EncounterMachine::new("enc-1", SESSION, "Bridge", Vec::new()), &EventContext::system())
        .unwrap();

    let (handle, mut rx) = engine.connect();
    engine
        .handle_text(handle.id(), r#"{"type":"AUTHENTICATE","payload":{"token":"gm"}}"#)
        .await;
    engine
        .handle_text(
            handle.id(),
            r#"{"type":"REQUEST_TACTICAL_DECISION","payload":{"encounterId":"enc-1","actorId":"x"},"requestId":"t"}"#,
        )
        .await;

    let mut last = None;
    while let Ok(Outbound::Message(message)) = rx.try_recv() {
        last = Some(message);
    }
    let last = last.expect("no reply");
    assert_eq!(last.message_type, OutboundType::Error);
    assert_eq!(last.request_id.as_deref(), Some("t"));
    assert_eq!(last.payload["code"], "VALIDATION_ERROR");
}
