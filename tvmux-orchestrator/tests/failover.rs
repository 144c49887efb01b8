mod common;

use common::{source, Harness};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tvmux_orchestrator::quota::QuotaStore;
use tvmux_orchestrator::{OrchestratorError, SessionKey, SessionRegistry, StaticCatalog, StreamType};

fn channel(id: u64) -> SessionKey {
    SessionKey::new(StreamType::Channel, id)
}

/// 1 -> [2, 3], one owner per source, limit 1 each
fn three_source_catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_source(source(1, 10, 1), vec![2, 3])
        .with_source(source(2, 20, 1), vec![])
        .with_source(source(3, 30, 1), vec![])
}

#[tokio::test]
async fn test_single_healthy_source() {
    let h = Harness::new(StaticCatalog::new().with_source(source(1, 10, 2), vec![]));

    let active = h.controller.resolve_and_start(channel(1)).await.unwrap();
    assert_eq!(active.source_id, 1);
    assert_eq!(active.source_index, 0);
    assert_eq!(h.active(10).await, 1);

    let tasks = h.queue.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].stream_source_ids, vec![1]);
    assert_eq!(tasks[0].current_index_in_source_ids, 0);
    assert_eq!(tasks[0].active_stream_id, 1);
    assert_eq!(tasks[0].playlist_id_of_active_stream, 10);
}

#[tokio::test]
async fn test_failed_probe_falls_through_to_next_source() {
    let h = Harness::new(
        StaticCatalog::new()
            .with_source(source(1, 10, 1), vec![2])
            .with_source(source(2, 20, 1), vec![]),
    );
    h.probe.fail(1);

    let active = h.controller.resolve_and_start(channel(1)).await.unwrap();
    assert_eq!(active.source_id, 2);
    assert_eq!(h.active(10).await, 0);
    assert_eq!(h.active(20).await, 1);

    let task = h.queue.last().unwrap();
    assert_eq!(task.stream_source_ids, vec![1, 2]);
    assert_eq!(task.current_index_in_source_ids, 1);
    assert_eq!(task.original_model_id, 1);
    assert_eq!(task.original_model_title, "Channel 1");
    assert_eq!(task.active_stream_id, 2);
}

#[tokio::test]
async fn test_all_sources_failing_exhausts_chain() {
    let h = Harness::new(
        StaticCatalog::new()
            .with_source(source(1, 10, 1), vec![2])
            .with_source(source(2, 20, 1), vec![]),
    );
    h.probe.fail(1);
    h.probe.fail(2);

    let err = h.controller.resolve_and_start(channel(1)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ChainExhausted { .. }));
    assert_eq!(h.active(10).await, 0);
    assert_eq!(h.active(20).await, 0);
    assert!(h.queue.tasks().is_empty());
    assert!(h.sessions.get(channel(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_owner_at_capacity_is_skipped_without_probing() {
    let h = Harness::new(
        StaticCatalog::new()
            .with_source(source(1, 10, 1), vec![2])
            .with_source(source(2, 20, 1), vec![]),
    );
    // owner 10 already serves another stream
    h.quota.increment(10).await.unwrap();

    let active = h.controller.resolve_and_start(channel(1)).await.unwrap();
    assert_eq!(active.source_id, 2);
    assert_eq!(h.probe.calls(), vec![2]);
    assert_eq!(h.active(10).await, 1);
    assert_eq!(h.active(20).await, 1);
}

#[tokio::test]
async fn test_chain_order_is_preserved() {
    let h = Harness::new(three_source_catalog());
    h.probe.fail(1);
    h.launcher.fail(2);

    let active = h.controller.resolve_and_start(channel(1)).await.unwrap();
    assert_eq!(active.source_id, 3);
    assert_eq!(active.source_index, 2);
    assert_eq!(h.probe.calls(), vec![1, 2, 3]);
    assert_eq!(h.launcher.launches(), vec![2, 3]);
}

#[tokio::test]
async fn test_launch_failure_releases_claim() {
    let h = Harness::new(three_source_catalog());
    h.launcher.fail(1);

    let active = h.controller.resolve_and_start(channel(1)).await.unwrap();
    assert_eq!(active.source_id, 2);
    assert_eq!(h.active(10).await, 0);
    assert_eq!(h.active(20).await, 1);
}

#[tokio::test]
async fn test_concurrent_requests_start_one_session() {
    let h = Harness::new(three_source_catalog());
    h.launcher.set_delay(Duration::from_millis(150));

    let results = futures::future::join_all((0..5).map(|_| h.controller.resolve_and_start(channel(1)))).await;

    let actives: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(actives.iter().all(|a| a.source_id == 1));
    assert_eq!(actives.iter().filter(|a| !a.reused).count(), 1);
    assert_eq!(h.launcher.launches(), vec![1]);
    assert_eq!(h.active(10).await, 1);
}

#[tokio::test]
async fn test_quota_is_conserved_across_start_and_stop() {
    let catalog = StaticCatalog::new()
        .with_source(source(1, 10, 2), vec![3])
        .with_source(source(2, 10, 2), vec![3])
        .with_source(source(3, 30, 0), vec![])
        .with_source(source(4, 10, 2), vec![3]);
    let h = Harness::new(catalog);
    h.probe.fail(4);

    for id in 1..=4 {
        h.controller.resolve_and_start(channel(id)).await.unwrap();
    }
    // 1 and 2 on owner 10; 3 and 4 (after failover) on unlimited owner 30
    assert_eq!(h.active(10).await, 2);
    assert_eq!(h.active(30).await, 2);

    for id in 1..=4 {
        assert!(h.controller.stop(channel(id)).await.unwrap());
    }
    assert_eq!(h.active(10).await, 0);
    assert_eq!(h.active(30).await, 0);
    assert_eq!(h.controller.local_process_count(), 0);
    assert!(h.launcher.handle(1).unwrap().is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_releases_claim() {
    let h = Harness::new(three_source_catalog());
    h.launcher.set_delay(Duration::from_secs(10));
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let err = h
        .controller
        .resolve_and_start_with_cancel(channel(1), cancel)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(h.active(10).await, 0);
    assert!(h.launcher.launches().is_empty());
    assert!(h.sessions.get(channel(1)).await.unwrap().is_none());

    // the creation marker was released with the attempt
    h.launcher.set_delay(Duration::ZERO);
    let active = h.controller.resolve_and_start(channel(1)).await.unwrap();
    assert_eq!(active.source_id, 1);
}

#[tokio::test]
async fn test_unknown_source() {
    let h = Harness::new(StaticCatalog::new());
    let err = h.controller.resolve_and_start(channel(99)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
    assert!(!err.is_retryable());
}
