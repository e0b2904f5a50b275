//! Engine Request Tests
//!
//! Request dispatch, replies and write-back, driven through in-process
//! connections against a temporary SQLite database.

use serde_json::json;

use crate::core::encounter::EncounterStatus;
use crate::core::persistence::EncounterStore;
use crate::core::protocol::OutboundType;
use crate::tests::common::*;

fn combatant_ids(payload: &serde_json::Value) -> Vec<String> {
    payload["encounter"]["combatants"]
        .as_array()
        .expect("combatants missing")
        .iter()
        .map(|c| c["id"].as_str().unwrap_or_default().to_string())
        .collect()
}

// =============================================================================
// Subscription
// =============================================================================

#[tokio::test]
async fn test_subscribe_delivers_snapshot() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), Some("sub-1"))
        .await;

    let messages = alice.drain();
    assert_eq!(messages.len(), 1);
    let subscribed = &messages[0];
    assert_eq!(subscribed.message_type, OutboundType::EncounterSubscribed);
    assert_eq!(subscribed.request_id.as_deref(), Some("sub-1"));
    assert_eq!(subscribed.ack_id, None);
    assert_eq!(subscribed.payload["encounter"]["status"], "ACTIVE");
    assert_eq!(combatant_ids(&subscribed.payload), vec!["fighter", "goblin", "wizard"]);
    assert_eq!(alice.handle.pending_acks(), 0);
}

#[tokio::test]
async fn test_ack_with_request_id_is_confirmed() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send("END_ENCOUNTER", json!({ "encounterId": encounter_id }), None).await;
    let ended = gm.expect(OutboundType::EncounterEnded);
    let ack_id = ended.ack_id.unwrap();
    assert_eq!(gm.handle.pending_acks(), 1);

    gm.send("ACK", json!({ "ackId": ack_id }), Some("ack-1")).await;
    let confirmed = gm.expect(OutboundType::Acknowledged);
    assert_eq!(confirmed.request_id.as_deref(), Some("ack-1"));
    assert_eq!(confirmed.payload["ackId"], ack_id);
    assert_eq!(gm.handle.pending_acks(), 0);

    // already settled
    gm.send("ACK", json!({ "ackId": ack_id }), Some("ack-2")).await;
    let error = gm.expect_error();
    assert_eq!(error.payload["code"], "NOT_FOUND");
    assert_eq!(error.request_id.as_deref(), Some("ack-2"));
}

#[tokio::test]
async fn test_plain_ack_gets_no_reply() {
    let h = TestHarness::new().await;
    let mut alice = h.client(PLAYER).await;

    alice.send("ACK", json!({ "ackId": 42 }), None).await;
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn test_legacy_subscribe_alias() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("COMBAT_SUBSCRIBE", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.expect(OutboundType::EncounterSubscribed);
    assert!(h.engine.broadcaster().is_subscribed(alice.id(), &encounter_id));
}

#[tokio::test]
async fn test_subscribe_unknown_encounter_is_not_found() {
    let h = TestHarness::new().await;
    let mut alice = h.client(PLAYER).await;

    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": "missing" }), Some("r1"))
        .await;

    let error = alice.expect_error();
    assert_eq!(error.payload["code"], "NOT_FOUND");
    assert_eq!(error.request_id.as_deref(), Some("r1"));
}

#[tokio::test]
async fn test_unsubscribe_stops_deltas() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.drain();

    alice
        .send("UNSUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), Some("u1"))
        .await;
    assert_eq!(alice.types(), vec![OutboundType::EncounterUnsubscribed]);

    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
    assert!(alice.drain().is_empty());
    assert_eq!(gm.types(), vec![OutboundType::TurnAdvanced]);
}

// =============================================================================
// Turn Flow
// =============================================================================

#[tokio::test]
async fn test_next_turn_reaches_subscribers_and_origin() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.drain();

    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), Some("turn-1"))
        .await;

    let to_gm = gm.expect(OutboundType::TurnAdvanced);
    assert_eq!(to_gm.request_id.as_deref(), Some("turn-1"));
    assert_eq!(to_gm.payload["currentTurn"], 1);
    assert_eq!(to_gm.payload["currentCombatant"]["id"], "goblin");

    let to_alice = alice.expect(OutboundType::TurnAdvanced);
    assert_eq!(to_alice.request_id, None);
    assert_eq!(to_alice.payload["sequence"], to_gm.payload["sequence"]);
}

#[tokio::test]
async fn test_wrapping_turn_starts_new_round() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    for _ in 0..2 {
        gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
    }
    gm.drain();
    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;

    let messages = gm.drain();
    let types: Vec<_> = messages.iter().map(|m| m.message_type).collect();
    assert_eq!(types, vec![OutboundType::RoundStarted, OutboundType::TurnAdvanced]);
    assert_eq!(messages[0].payload["round"], 2);
    assert_eq!(messages[1].payload["currentTurn"], 0);
    assert_eq!(messages[1].payload["currentRound"], 2);
}

#[tokio::test]
async fn test_noop_request_answers_with_state() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send(
        "APPLY_DAMAGE",
        json!({ "encounterId": encounter_id, "actorId": "goblin", "amount": 0 }),
        Some("zero"),
    )
    .await;

    let messages = gm.drain();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, OutboundType::EncounterState);
    assert_eq!(messages[0].request_id.as_deref(), Some("zero"));
}

#[tokio::test]
async fn test_damage_to_zero_defeats() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send(
        "APPLY_DAMAGE",
        json!({ "encounterId": encounter_id, "actorId": "goblin", "amount": 10 }),
        None,
    )
    .await;

    let messages = gm.drain();
    let types: Vec<_> = messages.iter().map(|m| m.message_type).collect();
    assert_eq!(types, vec![OutboundType::ActorHealthUpdated, OutboundType::ActorDefeated]);
    assert_eq!(messages[0].payload["health"]["current"], 0);
    assert_eq!(messages[0].payload["defeated"], true);
    assert_eq!(messages[0].payload["change"], "damage");
}

#[tokio::test]
async fn test_invalid_transition_is_rejected() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send("RESUME_ENCOUNTER", json!({ "encounterId": encounter_id }), Some("r"))
        .await;
    let error = gm.expect_error();
    assert_eq!(error.payload["code"], "INVALID_STATE");
    assert_eq!(error.request_id.as_deref(), Some("r"));
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_unknown_message_type() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;

    gm.send("ROLL_DICE", json!({}), Some("dice")).await;

    let error = gm.expect_error();
    assert_eq!(error.payload["code"], "VALIDATION_ERROR");
    assert_eq!(error.request_id.as_deref(), Some("dice"));
}

#[tokio::test]
async fn test_unknown_fields_are_rejected() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send(
        "NEXT_TURN",
        json!({ "encounterId": encounter_id, "skip": 2 }),
        Some("extra"),
    )
    .await;
    assert_eq!(gm.expect_error().payload["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_malformed_frame_keeps_request_id() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;

    gm.send_raw(r#"{"type":"NEXT_TURN","requestId":"r9","bogus":1}"#).await;
    let error = gm.expect_error();
    assert_eq!(error.request_id.as_deref(), Some("r9"));

    gm.send_raw("not json").await;
    let error = gm.expect_error();
    assert_eq!(error.request_id, None);
}

#[tokio::test]
async fn test_errors_do_not_reach_other_subscribers() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.drain();

    gm.send(
        "APPLY_DAMAGE",
        json!({ "encounterId": encounter_id, "actorId": "nobody", "amount": 3 }),
        None,
    )
    .await;

    assert_eq!(gm.expect_error().payload["code"], "NOT_FOUND");
    assert!(alice.drain().is_empty());
}

// =============================================================================
// Membership & Combatants
// =============================================================================

#[tokio::test]
async fn test_join_session_reports_membership() {
    let h = TestHarness::new().await;
    let mut bob = h.client(OTHER_PLAYER).await;

    bob.send("JOIN_SESSION", json!({ "sessionId": SESSION }), Some("join"))
        .await;

    let joined = bob.expect(OutboundType::SessionJoined);
    assert_eq!(joined.payload["sessionId"], SESSION);
    assert_eq!(h.engine.supervisor().live_connections(SESSION), 1);
}

#[tokio::test]
async fn test_add_actor_from_token() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send(
        "ADD_ACTOR",
        json!({ "encounterId": encounter_id, "actorId": PLAYER_TOKEN }),
        Some("add"),
    )
    .await;

    let added = gm.expect(OutboundType::ActorAdded);
    assert_eq!(added.payload["actor"]["name"], "Aria");
    assert_eq!(added.payload["actor"]["token"]["tokenId"], PLAYER_TOKEN);
    // initiative 15 ties with the goblin and goes after it
    assert_eq!(added.payload["position"], 2);
    assert_eq!(added.payload["currentTurn"], 0);
}

#[tokio::test]
async fn test_add_actor_unknown_token() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send(
        "ADD_ACTOR",
        json!({ "encounterId": encounter_id, "actorId": "tok-ghost" }),
        None,
    )
    .await;
    assert_eq!(gm.expect_error().payload["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_tactical_decision_targets_weakest_opponent() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send(
        "REQUEST_TACTICAL_DECISION",
        json!({ "encounterId": encounter_id, "actorId": "goblin" }),
        Some("ai"),
    )
    .await;

    let reply = gm.expect(OutboundType::TacticalDecision);
    assert_eq!(reply.request_id.as_deref(), Some("ai"));
    assert_eq!(reply.payload["decision"]["action"], "attack");
    assert_eq!(reply.payload["decision"]["targetId"], "wizard");
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_changes_are_written_back() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
    gm.send(
        "APPLY_DAMAGE",
        json!({ "encounterId": encounter_id, "actorId": "fighter", "amount": 8 }),
        None,
    )
    .await;
    gm.send(
        "APPLY_CONDITION",
        json!({
            "encounterId": encounter_id,
            "actorId": "fighter",
            "condition": { "name": "Prone", "duration": 2 }
        }),
        None,
    )
    .await;
    h.engine.flush_persistence().await;

    let stored = h.db.load_encounter(&encounter_id).await.unwrap().unwrap();
    assert_eq!(stored.status, EncounterStatus::Active);
    assert_eq!(stored.turn_index, 1);
    let fighter = stored.combatant("fighter").unwrap();
    assert_eq!(fighter.hit_points.current, 22);
    assert!(fighter.conditions.has_condition("Prone"));
}

#[tokio::test]
async fn test_condition_names_ignore_case() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    for (name, duration) in [("Poisoned", 3), ("poisoned", 1)] {
        gm.send(
            "APPLY_CONDITION",
            json!({
                "encounterId": encounter_id,
                "actorId": "goblin",
                "condition": { "name": name, "duration": duration }
            }),
            None,
        )
        .await;
        gm.expect(OutboundType::ConditionApplied);
    }

    let snapshot = h.engine.registry().snapshot(&encounter_id).unwrap();
    let goblin = snapshot.combatant("goblin").unwrap();
    assert_eq!(goblin.conditions.len(), 1);
    assert_eq!(goblin.conditions.conditions()[0].remaining, Some(1));

    gm.send(
        "REMOVE_CONDITION",
        json!({ "encounterId": encounter_id, "actorId": "goblin", "condition": "POISONED" }),
        None,
    )
    .await;
    gm.expect(OutboundType::ConditionRemoved);

    let snapshot = h.engine.registry().snapshot(&encounter_id).unwrap();
    assert!(snapshot.combatant("goblin").unwrap().conditions.is_empty());
}

#[tokio::test]
async fn test_released_encounter_is_hydrated_on_subscribe() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;
    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
    h.engine.flush_persistence().await;

    h.engine.registry().release(&encounter_id);
    assert!(!h.engine.registry().contains(&encounter_id));

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;

    let subscribed = alice.expect(OutboundType::EncounterSubscribed);
    assert_eq!(subscribed.payload["encounter"]["turnIndex"], 1);
    assert_eq!(combatant_ids(&subscribed.payload), vec!["fighter", "goblin", "wizard"]);
    assert!(h.engine.registry().contains(&encounter_id));
}

#[tokio::test]
async fn test_end_encounter_completes_and_releases() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.drain();

    gm.send("END_ENCOUNTER", json!({ "encounterId": encounter_id }), Some("end"))
        .await;
    let ended = alice.expect(OutboundType::EncounterEnded);
    assert!(ended.ack_id.is_some());

    h.engine.flush_persistence().await;
    let stored = h.db.load_encounter(&encounter_id).await.unwrap().unwrap();
    assert_eq!(stored.status, EncounterStatus::Completed);
    assert!(!h.engine.registry().contains(&encounter_id));

    // completed encounters are not brought back
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    assert_eq!(alice.expect_error().payload["code"], "NOT_FOUND");
}
