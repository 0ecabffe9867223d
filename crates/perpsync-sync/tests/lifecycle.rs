mod common;

use common::{config, fast_retry, seed_user, user, Harness};
use perpsync_core::{ResourceKind, SyncError};
use perpsync_remote::ops;
use perpsync_sync::{
    InvalidationEvent, InvalidationReason, Positions, RefreshMode, ScopePhase, SyncOrchestrator,
};
use std::time::Duration;

fn orchestrator(h: &Harness) -> SyncOrchestrator {
    SyncOrchestrator::new(h.engine.clone())
}

#[tokio::test(start_paused = true)]
async fn test_open_initializes_then_polls() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);

    let mut scope = orchestrator(&h).open(Positions::new(alice));
    let view = scope.wait_for(|v| v.phase == ScopePhase::Ready).await.unwrap();
    assert!(view.is_loaded());
    assert!(view.error.is_none());
    assert_eq!(view.cycles, 1);
    assert_eq!(view.value().unwrap().len(), 1);

    h.expire();
    let view = scope.wait_for(|v| v.cycles >= 2).await.unwrap();
    assert_eq!(view.phase, ScopePhase::Ready);
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 2);

    scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_within_ttl_serves_cache() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);
    let mut scope = orchestrator(&h).open_with_interval(
        Positions::new(alice),
        Duration::from_secs(2),
    );

    scope.wait_for(|v| v.cycles >= 3).await.unwrap();
    // ttl is 10s on the cache clock, which has not moved
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_initialization_then_recovery() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);
    h.chain
        .fail_always(ops::USER_POSITIONS, SyncError::TransientNetwork("down".into()));

    let mut scope = orchestrator(&h).open(Positions::new(alice));
    let view = scope.wait_for(|v| v.phase == ScopePhase::Failed).await.unwrap();
    assert!(!view.is_loaded());
    match view.error {
        Some(SyncError::NotInitialized { cause, .. }) => assert!(cause.is_exhausted()),
        other => panic!("expected NotInitialized, got {other:?}"),
    }

    h.chain.clear_failures(ops::USER_POSITIONS);
    let view = scope.refresh_now().await.unwrap();
    assert_eq!(view.phase, ScopePhase::Ready);
    assert!(view.is_loaded());
    assert!(view.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_keeps_last_good_data() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);

    let scope = orchestrator(&h).open(Positions::new(alice));
    let first = scope.refresh_now().await.unwrap();
    let fetched_at = first.data.fetched_at().unwrap();

    h.chain
        .fail_always(ops::USER_POSITIONS, SyncError::TransientNetwork("down".into()));
    let view = scope.refresh_now().await.unwrap();

    assert_eq!(view.phase, ScopePhase::Ready);
    assert!(view.is_stale());
    assert_eq!(view.value(), first.value());
    assert_eq!(view.stale_since, Some(fetched_at));
    assert!(view.error.as_ref().is_some_and(SyncError::is_exhausted));

    h.chain.clear_failures(ops::USER_POSITIONS);
    let view = scope.refresh_now().await.unwrap();
    assert!(!view.is_stale());
    assert_eq!(view.stale_since, None);
    assert!(view.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_adopts_fresher_cached_data() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);

    let scope = orchestrator(&h).open(Positions::new(alice.clone()));
    let first = scope.refresh_now().await.unwrap();

    // another consumer refreshes the same key a second later
    h.clock.advance(Duration::from_secs(1));
    let newer = h
        .engine
        .refresh(&Positions::new(alice), RefreshMode::Force)
        .await
        .unwrap();
    assert!(newer.fetched_at > first.data.fetched_at().unwrap());

    h.chain
        .fail_always(ops::USER_POSITIONS, SyncError::TransientNetwork("down".into()));
    let view = scope.refresh_now().await.unwrap();

    assert_eq!(view.phase, ScopePhase::Ready);
    assert_eq!(view.data.fetched_at(), Some(newer.fetched_at));
    assert!(!view.is_stale());
    assert_eq!(view.stale_since, None);
    assert!(view.error.as_ref().is_some_and(SyncError::is_exhausted));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_past_stale_threshold_is_withdrawn() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);

    let scope = orchestrator(&h).open(Positions::new(alice.clone()));
    let first = scope.refresh_now().await.unwrap();
    assert!(first.is_loaded());

    h.chain
        .fail_always(ops::USER_POSITIONS, SyncError::TransientNetwork("down".into()));
    h.clock.advance(Duration::from_secs(3600));
    assert!(h.engine.cached(&Positions::new(alice)).is_none());

    let view = scope.refresh_now().await.unwrap();
    assert_eq!(view.phase, ScopePhase::Failed);
    assert!(!view.is_loaded());
    assert_eq!(view.stale_since, None);
    match view.error {
        Some(SyncError::NotInitialized { cause, .. }) => assert!(cause.is_exhausted()),
        other => panic!("expected NotInitialized, got {other:?}"),
    }

    h.chain.clear_failures(ops::USER_POSITIONS);
    let view = scope.refresh_now().await.unwrap();
    assert_eq!(view.phase, ScopePhase::Ready);
    assert!(view.is_loaded());
    assert!(view.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_suspended_scope_does_not_poll() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);

    let mut scope = orchestrator(&h).open(Positions::new(alice));
    scope.wait_for(|v| v.phase == ScopePhase::Ready).await.unwrap();

    scope.suspend();
    scope
        .wait_for(|v| v.phase == ScopePhase::Suspended)
        .await
        .unwrap();
    h.expire();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 1);
    assert_eq!(scope.view().cycles, 1);

    scope.resume();
    let view = scope
        .wait_for(|v| v.cycles >= 2 && v.phase == ScopePhase::Ready)
        .await
        .unwrap();
    assert!(!view.is_stale());
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_while_suspended_refreshes_on_resume() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);

    let mut scope = orchestrator(&h).open(Positions::new(alice.clone()));
    scope.wait_for(|v| v.phase == ScopePhase::Ready).await.unwrap();
    scope.suspend();
    scope
        .wait_for(|v| v.phase == ScopePhase::Suspended)
        .await
        .unwrap();

    h.engine.invalidate(InvalidationEvent::for_user(
        ResourceKind::Positions,
        alice,
        InvalidationReason::ChainEvent("PositionUpdated".into()),
    ));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 1);

    // cache is still fresh; the pending invalidation forces the read
    scope.resume();
    scope.wait_for(|v| v.cycles >= 2).await.unwrap();
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 2);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_refresh_while_suspended_stays_suspended() {
    let h = Harness::new();
    let alice = user(1);
    seed_user(&h.chain, &alice);

    let mut scope = orchestrator(&h).open(Positions::new(alice));
    scope.wait_for(|v| v.phase == ScopePhase::Ready).await.unwrap();
    scope.suspend();
    scope
        .wait_for(|v| v.phase == ScopePhase::Suspended)
        .await
        .unwrap();

    let view = scope.refresh_now().await.unwrap();
    assert_eq!(view.phase, ScopePhase::Suspended);
    assert_eq!(view.cycles, 2);
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_discards_in_flight_refresh() {
    // attempts outlive the remote latency, so the flight itself succeeds
    let h = Harness::with_config(
        config().with_retry(fast_retry().with_attempt_timeout(Duration::from_secs(15))),
    );
    let alice = user(1);
    seed_user(&h.chain, &alice);
    h.chain.set_latency(Duration::from_secs(5));

    let scope = orchestrator(&h).open(Positions::new(alice.clone()));
    let mut views = scope.subscribe();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(views.borrow_and_update().phase, ScopePhase::Initializing);

    scope.shutdown().await;
    assert!(views.changed().await.is_err());
    assert_eq!(views.borrow().cycles, 0);
    assert!(!views.borrow().is_loaded());

    // the shared fetch still completes for the engine's other consumers
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.engine.cached(&Positions::new(alice)).is_some());
    assert_eq!(h.chain.calls(ops::USER_POSITIONS), 1);
}

#[tokio::test(start_paused = true)]
async fn test_orchestrator_shutdown_closes_every_scope() {
    let h = Harness::new();
    let (alice, bob) = (user(1), user(2));
    seed_user(&h.chain, &alice);
    seed_user(&h.chain, &bob);

    let orchestrator = orchestrator(&h);
    let mut a = orchestrator.open(Positions::new(alice));
    let mut b = orchestrator.open(Positions::new(bob));
    a.wait_for(|v| v.is_loaded()).await.unwrap();
    b.wait_for(|v| v.is_loaded()).await.unwrap();

    orchestrator.shutdown();
    assert!(a.is_closed());
    assert!(b.is_closed());
    a.shutdown().await;
    b.shutdown().await;
}
