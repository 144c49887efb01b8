mod common;

use chrono::Utc;
use common::{source, Harness};
use std::sync::Arc;
use std::time::Duration;
use tvmux_orchestrator::monitor::TickOutcome;
use tvmux_orchestrator::session::SessionStatus;
use tvmux_orchestrator::{
    FailoverOutcome, HealthMonitor, ProcessHealth, SessionKey, SessionRegistry, StaticCatalog, StreamType,
};

fn key() -> SessionKey {
    SessionKey::new(StreamType::Channel, 1)
}

fn catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_source(source(1, 10, 1), vec![2])
        .with_source(source(2, 20, 1), vec![])
}

fn monitor(h: &Harness) -> HealthMonitor {
    HealthMonitor::new(Arc::clone(&h.controller), h.queue.clone(), Duration::from_secs(10))
}

#[tokio::test]
async fn test_healthy_session_reschedules() {
    let h = Harness::new(catalog());
    h.controller.resolve_and_start(key()).await.unwrap();
    let task = h.queue.last().unwrap();

    let outcome = monitor(&h).tick(&task).await.unwrap();
    assert_eq!(outcome, TickOutcome::Reschedule);
    assert_eq!(h.active(10).await, 1);
}

#[tokio::test]
async fn test_dead_process_fails_over_to_next_source() {
    let h = Harness::new(catalog());
    h.controller.resolve_and_start(key()).await.unwrap();
    let task = h.queue.last().unwrap();
    let first = h.launcher.handle(1).unwrap();
    first.set_health(ProcessHealth::Exited { code: Some(1) });

    let outcome = monitor(&h).tick(&task).await.unwrap();
    let TickOutcome::FailedOver(FailoverOutcome::Recovered(active)) = outcome else {
        panic!("expected recovery, got {outcome:?}");
    };
    assert_eq!(active.source_id, 2);
    assert!(first.is_stopped());
    assert_eq!(h.active(10).await, 0);
    assert_eq!(h.active(20).await, 1);

    let next = h.queue.last().unwrap();
    assert_eq!(next.active_stream_id, 2);
    assert_eq!(next.current_index_in_source_ids, 1);
    assert_eq!(next.stream_source_ids, vec![1, 2]);

    // the old task no longer matches the session
    assert_eq!(monitor(&h).tick(&task).await.unwrap(), TickOutcome::Stale);
}

#[tokio::test]
async fn test_stalled_process_counts_as_degraded() {
    let h = Harness::new(catalog());
    h.controller.resolve_and_start(key()).await.unwrap();
    let task = h.queue.last().unwrap();
    h.launcher
        .handle(1)
        .unwrap()
        .set_health(ProcessHealth::Stalled { idle_secs: 45 });

    let outcome = monitor(&h).tick(&task).await.unwrap();
    assert!(matches!(outcome, TickOutcome::FailedOver(FailoverOutcome::Recovered(_))));
}

#[tokio::test]
async fn test_exhausted_failover_terminates_session() {
    let h = Harness::new(catalog());
    h.controller.resolve_and_start(key()).await.unwrap();
    let task = h.queue.last().unwrap();
    h.probe.fail(2);
    h.launcher
        .handle(1)
        .unwrap()
        .set_health(ProcessHealth::Exited { code: None });

    let outcome = monitor(&h).tick(&task).await.unwrap();
    assert_eq!(outcome, TickOutcome::FailedOver(FailoverOutcome::Exhausted));
    assert_eq!(h.active(10).await, 0);
    assert_eq!(h.active(20).await, 0);
    assert_eq!(h.sessions.status(key()).await.unwrap(), Some(SessionStatus::Terminated));
    assert!(h.sessions.get(key()).await.unwrap().is_none());
    assert_eq!(h.queue.tasks().len(), 1);

    assert_eq!(monitor(&h).tick(&task).await.unwrap(), TickOutcome::NoSession);
}

#[tokio::test]
async fn test_suppressed_session_is_left_alone() {
    let h = Harness::new(catalog());
    h.controller.resolve_and_start(key()).await.unwrap();
    let task = h.queue.last().unwrap();
    h.launcher
        .handle(1)
        .unwrap()
        .set_health(ProcessHealth::Exited { code: None });
    let until = Utc::now() + chrono::Duration::seconds(60);
    assert!(h.sessions.set_monitoring_suppressed(key(), Some(until)).await.unwrap());

    let outcome = monitor(&h).tick(&task).await.unwrap();
    assert_eq!(outcome, TickOutcome::Reschedule);
    assert_eq!(h.active(10).await, 1);
    assert_eq!(h.launcher.launches(), vec![1]);
}

#[tokio::test]
async fn test_manual_stop_ends_supervision() {
    let h = Harness::new(catalog());
    h.controller.resolve_and_start(key()).await.unwrap();
    let task = h.queue.last().unwrap();

    assert!(h.controller.stop(key()).await.unwrap());
    assert_eq!(monitor(&h).tick(&task).await.unwrap(), TickOutcome::NoSession);
    assert_eq!(h.active(10).await, 0);
    assert_eq!(h.launcher.launches(), vec![1]);
}
