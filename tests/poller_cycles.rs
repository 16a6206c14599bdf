//! Integration tests for the poll cycle: baseline suppression, transitions,
//! partial provider failure, credential invalidation, and the run loop.
//!
//! Each test gets its own mock server; cycles are driven one at a time with
//! `run_cycle` except where the loop itself is under test.

mod common;

use common::{describe, Fixture};
use livewatch::poller::{CycleOutcome, PollError};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Transitions
// ============================================================================

#[tokio::test]
async fn test_first_cycle_suppressed_then_transitions_reported() {
    let mut fx = Fixture::new(true).await;

    fx.mock.providers(&["A", "B"], &["A"], &[]).await;
    let outcome = fx.poller.run_cycle(false).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Updated {
            went_live: 0,
            went_offline: 0,
            suppressed: true
        }
    );
    assert!(fx.drain_events().is_empty());
    assert!(fx.state.lock().await.is_ready());

    fx.mock.providers(&["A", "B"], &["A", "B"], &[]).await;
    fx.poller.run_cycle(false).await.unwrap();
    let events: Vec<String> = fx.drain_events().iter().map(describe).collect();
    assert_eq!(events, vec!["live:B".to_string()]);

    fx.mock.providers(&["A", "B"], &["B"], &[]).await;
    fx.poller.run_cycle(false).await.unwrap();
    let events: Vec<String> = fx.drain_events().iter().map(describe).collect();
    assert_eq!(events, vec!["offline:A".to_string()]);

    let state = fx.state.lock().await;
    assert_eq!(state.live_set().names().collect::<Vec<_>>(), vec!["b"]);
}

#[tokio::test]
async fn test_public_channels_join_the_live_set() {
    let mut fx = Fixture::new(true).await;

    fx.mock.providers(&["A"], &["A"], &["X"]).await;
    fx.poller.run_cycle(false).await.unwrap();

    fx.mock.providers(&["A"], &["A"], &["X", "Y"]).await;
    fx.poller.run_cycle(false).await.unwrap();
    let events: Vec<String> = fx.drain_events().iter().map(describe).collect();
    assert_eq!(events, vec!["live:Y".to_string()]);

    let state = fx.state.lock().await;
    assert_eq!(state.snapshot().followed.len(), 1);
    assert_eq!(state.snapshot().public.len(), 2);
    assert_eq!(state.snapshot().refresh_interval, common::INTERVAL);
}

#[tokio::test]
async fn test_held_follow_scope_is_reused_until_forced() {
    let fx = Fixture::new(true).await;

    fx.mock.providers(&["A"], &[], &[]).await;
    fx.poller.run_cycle(false).await.unwrap();
    assert_eq!(fx.mock.hits("/helix/channels/followed").await, 1);

    fx.poller.run_cycle(false).await.unwrap();
    assert_eq!(fx.mock.hits("/helix/channels/followed").await, 1);

    fx.poller.run_cycle(true).await.unwrap();
    assert_eq!(fx.mock.hits("/helix/channels/followed").await, 2);
}

// ============================================================================
// Missing authorization
// ============================================================================

#[tokio::test]
async fn test_without_user_credential_only_public_updates() {
    let mut fx = Fixture::new(false).await;
    fx.mock.providers(&["A"], &["A"], &["X"]).await;

    let outcome = fx.poller.run_cycle(false).await.unwrap();
    assert_eq!(outcome, CycleOutcome::FollowsUnavailable);
    assert!(fx.drain_events().is_empty());
    assert_eq!(fx.mock.hits("/helix/streams").await, 0);
    assert_eq!(fx.mock.hits("/helix/channels/followed").await, 0);

    let state = fx.state.lock().await;
    assert!(state.snapshot().followed.is_empty());
    assert_eq!(state.snapshot().public.len(), 1);
    assert!(state.live_set().is_empty());
    assert!(!state.is_ready());
}

#[tokio::test]
async fn test_rejected_follows_request_drops_user_credential() {
    let fx = Fixture::new(true).await;
    fx.mock.mount_app_token().await;
    fx.mock.mount_status("GET", "/helix/channels/followed", 401).await;
    fx.mock.mount_json("/api", common::public_list(&[])).await;

    let outcome = fx.poller.run_cycle(false).await.unwrap();
    assert_eq!(outcome, CycleOutcome::FollowsUnavailable);

    let state = fx.state.lock().await;
    assert!(!state.tokens.has_user_credential());
    assert!(state.follow_scope().is_none());
}

#[tokio::test]
async fn test_rejected_refresh_requires_reauthorization() {
    let fx = Fixture::new(true).await;
    {
        let mut state = fx.state.lock().await;
        let mut expired = common::user_credential();
        expired.expiry = livewatch::auth::TokenExpiry::new(chrono::Utc::now(), 0);
        state.tokens.install_user_credential(expired);
    }
    fx.mock.providers(&["A"], &["A"], &[]).await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(wiremock::matchers::query_param("grant_type", "refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "status": 400,
            "message": "Invalid refresh token"
        })))
        .mount(fx.mock.server())
        .await;

    let outcome = fx.poller.run_cycle(false).await.unwrap();
    assert_eq!(outcome, CycleOutcome::FollowsUnavailable);
    assert!(!fx.state.lock().await.tokens.has_user_credential());
}

// ============================================================================
// Provider failures
// ============================================================================

#[tokio::test]
async fn test_failed_provider_keeps_previous_contribution() {
    let mut fx = Fixture::new(true).await;
    fx.mock.providers(&["A"], &["A"], &["X"]).await;
    fx.poller.run_cycle(false).await.unwrap();

    fx.mock.reset().await;
    fx.mock.mount_app_token().await;
    fx.mock.mount_json("/helix/streams", common::followed_streams(&["A"])).await;
    fx.mock.mount_status("GET", "/api", 503).await;

    let outcome = fx.poller.run_cycle(false).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Updated {
            went_live: 0,
            went_offline: 0,
            suppressed: false
        }
    );
    assert!(fx.drain_events().is_empty());

    let state = fx.state.lock().await;
    assert_eq!(state.snapshot().public[0].channel, "X");
    assert!(state.live_set().contains("x"));
}

#[tokio::test]
async fn test_failing_provider_does_not_block_baseline() {
    let mut fx = Fixture::new(true).await;

    fx.mock.mount_app_token().await;
    fx.mock.mount_follows(&["A", "B"]).await;
    fx.mock.mount_json("/helix/streams", common::followed_streams(&["A"])).await;
    fx.mock.mount_status("GET", "/api", 500).await;
    let outcome = fx.poller.run_cycle(false).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Updated { suppressed: true, .. }));
    assert!(fx.state.lock().await.is_ready());

    // The public list is still down; followed transitions are reported anyway.
    fx.mock.reset().await;
    fx.mock.mount_app_token().await;
    fx.mock.mount_json("/helix/streams", common::followed_streams(&["A", "B"])).await;
    fx.mock.mount_status("GET", "/api", 500).await;
    let outcome = fx.poller.run_cycle(false).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Updated { suppressed: false, .. }));

    let events: Vec<String> = fx.drain_events().iter().map(describe).collect();
    assert_eq!(events, vec!["live:B".to_string()]);
    assert!(fx.state.lock().await.snapshot().public.is_empty());
}

#[tokio::test]
async fn test_followed_feed_rejection_invalidates_app_credential() {
    let fx = Fixture::new(true).await;
    fx.mock.providers(&["A"], &["A"], &[]).await;
    fx.poller.run_cycle(false).await.unwrap();
    assert!(fx.state.lock().await.tokens.app_credential().is_some());

    fx.mock.reset().await;
    fx.mock.mount_app_token().await;
    fx.mock.mount_status("GET", "/helix/streams", 401).await;
    fx.mock.mount_json("/api", common::public_list(&[])).await;
    fx.poller.run_cycle(false).await.unwrap();

    let state = fx.state.lock().await;
    assert!(state.tokens.app_credential().is_none());
    assert_eq!(state.snapshot().followed.len(), 1);
}

#[tokio::test]
async fn test_stalled_pagination_abandons_cycle() {
    let fx = Fixture::new(true).await;
    fx.mock.mount_app_token().await;
    fx.mock.mount_json(
        "/helix/channels/followed",
        json!({
            "data": [{ "broadcaster_id": "1", "broadcaster_name": "a" }],
            "pagination": {},
            "total": 5
        }),
    )
    .await;

    let err = fx.poller.run_cycle(false).await.unwrap_err();
    assert!(matches!(err, PollError::Follows(_)));
    assert!(!err.is_fatal());
    assert_eq!(fx.mock.hits("/helix/streams").await, 0);
}

#[tokio::test]
async fn test_app_credential_failure_is_fatal() {
    let fx = Fixture::new(true).await;
    fx.mock.mount_status("POST", "/oauth2/token", 500).await;

    let err = fx.poller.run_cycle(false).await.unwrap_err();
    assert!(matches!(err, PollError::AppCredential(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_run_returns_fatal_error() {
    let fx = Fixture::new(true).await;
    fx.mock.mount_status("POST", "/oauth2/token", 500).await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel();
    let result = tokio::time::timeout(WAIT, fx.poller.run(shutdown_rx))
        .await
        .expect("run should stop on a fatal error");
    assert!(matches!(result, Err(PollError::AppCredential(_))));
}

#[tokio::test]
async fn test_unknown_follower_is_fatal() {
    let fx = Fixture::without_user_id().await;
    fx.mock.providers(&["A"], &["A"], &[]).await;

    let err = fx.poller.run_cycle(false).await.unwrap_err();
    assert!(matches!(err, PollError::UserId(_)));
    assert!(err.is_fatal());
    assert_eq!(fx.mock.hits("/helix/channels/followed").await, 0);
}

#[tokio::test]
async fn test_run_stops_when_follower_unknown() {
    let fx = Fixture::without_user_id().await;
    fx.mock.providers(&["A"], &["A"], &[]).await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel();
    let result = tokio::time::timeout(WAIT, fx.poller.run(shutdown_rx))
        .await
        .expect("run should stop when the follower cannot be identified");
    assert!(matches!(result, Err(PollError::UserId(_))));
    assert!(!fx.state.lock().await.is_ready());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_reader_sees_complete_snapshot() {
    let fx = Fixture::new(true).await;
    fx.mock.providers(&["A"], &[], &[]).await;
    fx.poller.run_cycle(false).await.unwrap();

    fx.mock.reset().await;
    fx.mock.mount_app_token().await;
    Mock::given(method("GET"))
        .and(path("/helix/streams"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::followed_streams(&["A"]))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(fx.mock.server())
        .await;
    fx.mock.mount_json("/api", common::public_list(&["X"])).await;

    let state = fx.state.clone();
    let before = state.lock().await.snapshot().last_fetched;
    let poller = fx.poller;
    let cycle = tokio::spawn(async move { poller.run_cycle(false).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = state.lock().await.snapshot().clone();

    // The cycle held the lock throughout, so the read saw it finished.
    assert!(snapshot.last_fetched > before);
    assert_eq!(snapshot.followed.len(), 1);
    assert_eq!(snapshot.public.len(), 1);
    cycle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_force_check_never_blocks() {
    let fx = Fixture::new(true).await;

    for _ in 0..10 {
        assert!(fx.force.request());
    }

    drop(fx.poller);
    assert!(!fx.force.request());
}

#[tokio::test]
async fn test_run_loop_forced_check_and_shutdown() {
    let mut fx = Fixture::new(true).await;
    fx.mock.providers(&["A", "B"], &["A"], &[]).await;

    let state = fx.state.clone();
    let force = fx.force.clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(fx.poller.run(shutdown_rx));

    tokio::time::timeout(WAIT, async {
        while !state.lock().await.is_ready() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("first cycle should complete");

    fx.mock.providers(&["A", "B"], &["A", "B"], &[]).await;
    assert!(force.request());

    let event = tokio::time::timeout(WAIT, fx.events.recv())
        .await
        .expect("forced cycle should report")
        .expect("listener channel open");
    assert_eq!(describe(&event), "live:B");

    shutdown_tx.send(()).unwrap();
    let result = tokio::time::timeout(WAIT, handle)
        .await
        .expect("loop should stop")
        .unwrap();
    assert!(result.is_ok());
    assert!(!force.request());
}
