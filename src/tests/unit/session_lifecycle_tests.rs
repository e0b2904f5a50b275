//! Session Lifecycle Tests
//!
//! Grace-period pausing, reconnects and forced termination, with sweeps
//! driven at explicit instants.

use std::time::{Duration, Instant};

use serde_json::json;

use crate::core::broadcast::Outbound;
use crate::core::engine::EngineSettings;
use crate::core::persistence::{SessionStatus, SessionStatusStore};
use crate::core::protocol::OutboundType;
use crate::tests::common::*;

const GRACE: Duration = Duration::from_secs(30);

async fn harness() -> TestHarness {
    TestHarness::with_settings(EngineSettings {
        grace_period: GRACE,
        ..EngineSettings::default()
    })
    .await
}

async fn joined(h: &TestHarness, user: &str) -> TestClient {
    let mut client = h.client(user).await;
    client
        .send("JOIN_SESSION", json!({ "sessionId": SESSION }), None)
        .await;
    client.expect(OutboundType::SessionJoined);
    client
}

async fn status(h: &TestHarness) -> SessionStatus {
    h.db.session_status(SESSION).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_empty_session_paused_after_grace_period() {
    let h = harness().await;
    let alice = joined(&h, PLAYER).await;

    h.engine.disconnect(alice.id());
    assert!(h.engine.supervisor().pause_pending(SESSION));

    let early = h.engine.supervisor().sweep_at(Instant::now() + GRACE / 2).await;
    assert!(early.paused_sessions.is_empty());
    assert_eq!(status(&h).await, SessionStatus::Active);

    let late = h
        .engine
        .supervisor()
        .sweep_at(Instant::now() + GRACE + Duration::from_secs(1))
        .await;
    assert_eq!(late.paused_sessions, vec![SESSION.to_string()]);
    assert_eq!(status(&h).await, SessionStatus::Paused);

    // paused exactly once
    let again = h
        .engine
        .supervisor()
        .sweep_at(Instant::now() + GRACE * 3)
        .await;
    assert!(again.paused_sessions.is_empty());
}

#[tokio::test]
async fn test_reconnect_within_grace_cancels_pause() {
    let h = harness().await;
    let alice = joined(&h, PLAYER).await;
    h.engine.disconnect(alice.id());

    let _alice_again = joined(&h, PLAYER).await;
    assert!(!h.engine.supervisor().pause_pending(SESSION));

    let report = h
        .engine
        .supervisor()
        .sweep_at(Instant::now() + GRACE * 2)
        .await;
    assert!(report.paused_sessions.is_empty());
    assert_eq!(status(&h).await, SessionStatus::Active);
}

#[tokio::test]
async fn test_joining_paused_session_reactivates_it() {
    let h = harness().await;
    h.db.set_session_status(SESSION, SessionStatus::Paused).await.unwrap();

    let _bob = joined(&h, OTHER_PLAYER).await;
    assert_eq!(status(&h).await, SessionStatus::Active);
}

#[tokio::test]
async fn test_dead_transport_is_reaped() {
    let h = harness().await;
    let alice = joined(&h, PLAYER).await;
    alice.handle.mark_closed();

    let report = h.engine.supervisor().sweep_at(Instant::now()).await;
    assert_eq!(report.reaped_connections, 1);
    assert!(h.engine.broadcaster().record(alice.id()).is_none());
    assert!(h.engine.supervisor().pause_pending(SESSION));
}

#[tokio::test]
async fn test_terminal_status_closes_connections() {
    let h = harness().await;
    let mut alice = joined(&h, PLAYER).await;
    let mut bob = joined(&h, OTHER_PLAYER).await;

    h.db.set_session_status(SESSION, SessionStatus::Completed).await.unwrap();
    let report = h.engine.supervisor().sweep().await;
    assert_eq!(report.terminated_sessions, vec![SESSION.to_string()]);

    for client in [&mut alice, &mut bob] {
        let frames = client.drain_outbound();
        assert_eq!(frames.len(), 2, "{:?}", frames);
        match &frames[0] {
            Outbound::Message(message) => {
                assert_eq!(message.message_type, OutboundType::SessionTerminated);
                assert_eq!(message.payload["status"], "COMPLETED");
                assert!(message.ack_id.is_none());
            }
            other => panic!("expected SESSION_TERMINATED, got {:?}", other),
        }
        assert!(matches!(frames[1], Outbound::Close { .. }));
        assert!(!client.handle.is_open());
    }
    assert_eq!(h.engine.broadcaster().connection_count(), 0);
    assert!(!h.engine.supervisor().is_tracking(SESSION));
}
