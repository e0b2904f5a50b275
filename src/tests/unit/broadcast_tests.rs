//! Broadcast Tests
//!
//! Fan-out across several subscribers: identical ordering, isolation between
//! encounters, dead connections and acknowledged re-delivery.

use std::time::{Duration, Instant};

use serde_json::json;

use crate::core::protocol::{OutboundType, ServerMessage};
use crate::tests::common::*;

fn sequences(messages: &[ServerMessage]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|m| m.payload["sequence"].as_u64())
        .collect()
}

#[tokio::test]
async fn test_subscribers_see_identical_order() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    let mut bob = h.client(OTHER_PLAYER).await;
    for client in [&mut alice, &mut bob] {
        client
            .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
            .await;
        client.drain();
    }

    for i in 0..6 {
        gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
        gm.send(
            "APPLY_DAMAGE",
            json!({ "encounterId": encounter_id, "actorId": "fighter", "amount": i + 1 }),
            None,
        )
        .await;
    }

    let seen_by_alice = alice.drain();
    let seen_by_bob = bob.drain();
    let seen_by_gm = gm.drain();

    assert!(!seen_by_alice.is_empty());
    assert_eq!(seen_by_alice, seen_by_bob);
    assert_eq!(sequences(&seen_by_alice), sequences(&seen_by_gm));

    let seq = sequences(&seen_by_alice);
    assert!(seq.windows(2).all(|w| w[0] < w[1]), "sequence not increasing: {:?}", seq);
}

#[tokio::test]
async fn test_encounters_are_isolated() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let first = h.started_encounter(&mut gm).await;
    let second = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": first }), None)
        .await;
    alice.drain();

    gm.send("NEXT_TURN", json!({ "encounterId": second }), None).await;
    assert!(alice.drain().is_empty());

    gm.send("NEXT_TURN", json!({ "encounterId": first }), None).await;
    let messages = alice.drain();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload["encounterId"], first.as_str());
}

#[tokio::test]
async fn test_closed_connection_is_skipped() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    let mut bob = h.client(OTHER_PLAYER).await;
    for client in [&mut alice, &mut bob] {
        client
            .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
            .await;
        client.drain();
    }

    alice.handle.mark_closed();
    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;

    assert!(alice.drain().is_empty());
    assert_eq!(bob.types(), vec![OutboundType::TurnAdvanced]);
    assert_eq!(gm.types(), vec![OutboundType::TurnAdvanced]);
}

#[tokio::test]
async fn test_unacknowledged_message_is_resent() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.drain();

    gm.send("END_ENCOUNTER", json!({ "encounterId": encounter_id }), None).await;
    let original = alice.expect(OutboundType::EncounterEnded);
    assert!(original.ack_id.is_some());

    assert_eq!(alice.handle.resend_due(Instant::now()), 0);
    assert_eq!(alice.handle.resend_due(Instant::now() + Duration::from_secs(6)), 1);

    let resent = alice.expect(OutboundType::EncounterEnded);
    assert_eq!(resent.ack_id, original.ack_id);

    alice
        .send("ACK", json!({ "ackId": original.ack_id }), None)
        .await;
    assert_eq!(alice.handle.resend_due(Instant::now() + Duration::from_secs(60)), 0);
}

#[tokio::test]
async fn test_resend_never_replays_stale_snapshot() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.expect(OutboundType::EncounterSubscribed);

    // the client never acknowledges anything
    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;
    let advanced = alice.expect(OutboundType::TurnAdvanced);

    assert_eq!(alice.handle.resend_due(Instant::now() + Duration::from_secs(6)), 0);
    assert_eq!(alice.handle.resend_due(Instant::now() + Duration::from_secs(30)), 0);
    assert!(alice.drain().is_empty());
    assert_eq!(advanced.payload["encounterId"], encounter_id.as_str());
}

#[tokio::test]
async fn test_disconnect_drops_subscriptions_not_state() {
    let h = TestHarness::new().await;
    let mut gm = h.client(GM).await;
    let encounter_id = h.started_encounter(&mut gm).await;

    let mut alice = h.client(PLAYER).await;
    alice
        .send("SUBSCRIBE_ENCOUNTER", json!({ "encounterId": encounter_id }), None)
        .await;
    alice.drain();
    gm.send("NEXT_TURN", json!({ "encounterId": encounter_id }), None).await;

    h.engine.disconnect(alice.id());

    assert!(h.engine.broadcaster().subscriptions(&encounter_id).is_empty());
    let turn = h
        .engine
        .registry()
        .inspect(&encounter_id, |m| m.turn_index())
        .unwrap();
    assert_eq!(turn, 1);
}
