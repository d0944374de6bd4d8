//! Execution pass tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    component, gated, harness, harness_with_store, request, request_with, Call, RecordingStore,
    ScriptedLocks,
};
use deploymon::models::request::RequestStatus;
use deploymon::models::result::ResultStatus;
use deploymon::persistence::RequestsSource;
use deploymon::processor::sources::CancellationSources;
use deploymon::workers::executor;
use tokio_util::sync::CancellationToken;

async fn execute(h: &common::Harness) {
    h.processor
        .execute_requests(false, &CancellationSources::new(), &CancellationToken::new())
        .await
        .unwrap();
}

// ================================= LOCKING ====================================== //

#[tokio::test(start_paused = true)]
async fn test_denied_lock_backs_off_environment() {
    let h = harness(
        vec![request(1, "EnvA", RequestStatus::Pending)],
        ScriptedLocks::enabled(vec![false]),
    );

    // Denied
    execute(&h).await;
    assert_eq!(h.locks.attempts(), vec!["env:EnvA".to_string()]);
    assert_eq!(h.processor.backoff().active_keys(), vec!["env:EnvA".to_string()]);
    assert_eq!(h.store.status_of(1).await, RequestStatus::Pending);

    // Backed off, no new attempt
    execute(&h).await;
    assert_eq!(h.locks.attempts().len(), 1);

    // Interval elapsed, lock granted
    tokio::time::advance(Duration::from_secs(31)).await;
    execute(&h).await;
    assert_eq!(h.locks.attempts().len(), 2);
    assert!(h.processor.backoff().active_keys().is_empty());
    assert_eq!(h.store.status_of(1).await, RequestStatus::Completed);
    assert_eq!(h.locks.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_per_environment() {
    let h = harness(
        vec![
            request(1, "EnvA", RequestStatus::Pending),
            request(2, "EnvB", RequestStatus::Pending),
        ],
        // Both environments race for the script; exactly one is denied
        ScriptedLocks::enabled(vec![false]),
    );

    execute(&h).await;

    let backed_off = h.processor.backoff().active_keys();
    assert_eq!(backed_off.len(), 1);

    let statuses = [h.store.status_of(1).await, h.store.status_of(2).await];
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == RequestStatus::Completed)
            .count(),
        1
    );
    assert_eq!(h.locks.released(), 1);
}

#[tokio::test]
async fn test_disabled_locking_never_skips() {
    let h = harness(
        vec![request(1, "EnvA", RequestStatus::Pending)],
        ScriptedLocks::disabled(),
    );
    h.processor.backoff().record_failure("env:EnvA");

    execute(&h).await;
    assert_eq!(h.store.status_of(1).await, RequestStatus::Completed);

    // A later pass still runs the environment
    h.store
        .inner
        .insert_request(request(2, "EnvA", RequestStatus::Pending));
    execute(&h).await;

    assert!(h.locks.attempts().is_empty());
    assert_eq!(h.locks.released(), 0);
    assert_eq!(h.store.status_of(2).await, RequestStatus::Completed);
}

// ================================= STEPS ======================================== //

#[tokio::test]
async fn test_request_runs_every_component() {
    let h = harness(
        vec![request_with(
            1,
            "EnvA",
            RequestStatus::Pending,
            vec![component("db", "echo migrating"), component("web", "exit 0")],
        )],
        ScriptedLocks::disabled(),
    );

    execute(&h).await;

    let request = h.store.inner.get_request(1).await.unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert!(request.started_at.is_some());
    assert!(request.completed_at.is_some());

    let results = h.store.inner.results_of(1);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ResultStatus::Completed));
    assert_eq!(results[0].exit_code, Some(0));
    assert!(results[0].log.as_deref().unwrap_or_default().contains("migrating"));

    assert_eq!(
        h.publisher.events_of(1),
        vec![RequestStatus::Running, RequestStatus::Completed]
    );
}

#[tokio::test]
async fn test_failed_component_stops_the_request() {
    let h = harness(
        vec![request_with(
            1,
            "EnvA",
            RequestStatus::Pending,
            vec![
                component("db", "exit 0"),
                component("web", "exit 3"),
                component("cache", "exit 0"),
            ],
        )],
        ScriptedLocks::disabled(),
    );

    execute(&h).await;

    assert_eq!(h.store.status_of(1).await, RequestStatus::Failed);

    let results = h.store.inner.results_of(1);
    assert_eq!(results[0].status, ResultStatus::Completed);
    assert_eq!(results[1].status, ResultStatus::Failed);
    assert_eq!(results[1].exit_code, Some(3));
    // Never started
    assert_eq!(results[2].status, ResultStatus::Pending);

    assert_eq!(
        h.publisher.events_of(1),
        vec![RequestStatus::Running, RequestStatus::Failed]
    );
}

#[tokio::test]
async fn test_skipped_components_complete_with_disabled_steps() {
    let mut skipped = request_with(
        1,
        "EnvA",
        RequestStatus::Pending,
        vec![component("db", "exit 9"), component("web", "exit 0")],
    );
    skipped.detail.skip_components = vec!["db".to_string()];
    let h = harness(vec![skipped], ScriptedLocks::disabled());

    execute(&h).await;

    assert_eq!(
        h.store.status_of(1).await,
        RequestStatus::CompletedWithDisabledSteps
    );
    let results = h.store.inner.results_of(1);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].component_id, "web");
}

// ================================= CONFIRMATION ================================= //

#[tokio::test]
async fn test_confirmation_pauses_and_resumes() {
    let h = harness(
        vec![request_with(
            1,
            "EnvA",
            RequestStatus::Pending,
            vec![component("db", "exit 0"), gated("web", "exit 0")],
        )],
        ScriptedLocks::disabled(),
    );

    // Runs up to the gated component
    execute(&h).await;
    assert_eq!(h.store.status_of(1).await, RequestStatus::WaitingConfirmation);
    let results = h.store.inner.results_of(1);
    assert_eq!(results[0].status, ResultStatus::Completed);
    assert_eq!(results[1].status, ResultStatus::WaitingConfirmation);

    // Waiting requests are not picked up
    execute(&h).await;
    assert_eq!(h.store.status_of(1).await, RequestStatus::WaitingConfirmation);

    // User confirms
    h.store
        .inner
        .set_request_status(1, RequestStatus::Confirmed)
        .unwrap();
    execute(&h).await;

    assert_eq!(h.store.status_of(1).await, RequestStatus::Completed);
    let results = h.store.inner.results_of(1);
    assert!(results.iter().all(|r| r.status == ResultStatus::Completed));

    assert_eq!(
        h.publisher.events_of(1),
        vec![
            RequestStatus::Running,
            RequestStatus::WaitingConfirmation,
            RequestStatus::Running,
            RequestStatus::Completed,
        ]
    );
}

// ================================= OWNERSHIP ==================================== //

#[tokio::test]
async fn test_orphaned_running_request_is_failed() {
    let h = harness(
        vec![request_with(
            1,
            "EnvA",
            RequestStatus::Running,
            vec![component("db", "exit 0"), component("web", "exit 0")],
        )],
        ScriptedLocks::disabled(),
    );
    let results = h
        .store
        .inner
        .create_deployment_results(1, &[component("db", "exit 0"), component("web", "exit 0")])
        .await
        .unwrap();
    let mut running = results[0].clone();
    running.status = ResultStatus::Running;
    h.store.inner.update_deployment_result(&running).await.unwrap();

    execute(&h).await;

    assert_eq!(h.store.status_of(1).await, RequestStatus::Failed);
    let results = h.store.inner.results_of(1);
    assert_eq!(results[0].status, ResultStatus::Failed);
    assert_eq!(results[1].status, ResultStatus::Pending);
    assert_eq!(h.publisher.events_of(1), vec![RequestStatus::Failed]);
}

#[tokio::test]
async fn test_request_in_flight_here_is_not_touched() {
    let h = harness(
        vec![request(1, "EnvA", RequestStatus::Running)],
        ScriptedLocks::disabled(),
    );
    let sources = CancellationSources::new();
    sources.add(1, CancellationToken::new());

    h.processor
        .execute_requests(false, &sources, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.store.status_of(1).await, RequestStatus::Running);
    assert!(h.store.calls().is_empty());
    assert!(sources.contains(1));
}

#[tokio::test]
async fn test_only_one_monitor_claims_a_request() {
    let store = Arc::new(RecordingStore::new(vec![request_with(
        1,
        "EnvA",
        RequestStatus::Pending,
        vec![component("db", "exit 0")],
    )]));
    let locks = Arc::new(ScriptedLocks::exclusive());
    let a = harness_with_store(store.clone(), locks.clone());
    let b = harness_with_store(store.clone(), locks.clone());

    futures::join!(execute(&a), execute(&b));

    let claims = store
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Claim { changed: 1, .. }))
        .count();
    assert_eq!(claims, 1);
    assert_eq!(store.status_of(1).await, RequestStatus::Completed);
    assert_eq!(store.inner.results_of(1).len(), 1);

    let completed = [a.publisher.events_of(1), b.publisher.events_of(1)]
        .concat()
        .into_iter()
        .filter(|s| *s == RequestStatus::Completed)
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_shutdown_leaves_pending_requests() {
    let h = harness(
        vec![request(1, "EnvA", RequestStatus::Pending)],
        ScriptedLocks::disabled(),
    );
    let token = CancellationToken::new();
    token.cancel();

    h.processor
        .execute_requests(false, &CancellationSources::new(), &token)
        .await
        .unwrap();

    assert_eq!(h.store.status_of(1).await, RequestStatus::Pending);
}

#[tokio::test]
async fn test_cancellation_by_another_monitor_stops_execution() {
    let marker = std::env::temp_dir().join(format!("deploymon-marker-{}", uuid::Uuid::new_v4()));
    let store = Arc::new(RecordingStore::new(vec![request_with(
        1,
        "EnvA",
        RequestStatus::Pending,
        vec![
            component("db", "sleep 30"),
            component("web", &format!("touch {}", marker.display())),
        ],
    )]));
    let locks = Arc::new(ScriptedLocks::disabled());
    let a = harness_with_store(store.clone(), locks.clone());
    let b = harness_with_store(store.clone(), locks.clone());

    let processor = a.processor.clone();
    let running = tokio::spawn(async move {
        processor
            .execute_requests(false, &CancellationSources::new(), &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.status_of(1).await, RequestStatus::Running);

    // The user cancels and monitor B applies it, A has no local handle
    store
        .inner
        .set_request_status(1, RequestStatus::Cancelling)
        .unwrap();
    b.processor
        .cancel_requests(false, &CancellationSources::new(), &CancellationToken::new())
        .await
        .unwrap();

    let joined = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("monitor A kept running the cancelled request");
    assert!(joined.unwrap().is_ok());

    assert_eq!(store.status_of(1).await, RequestStatus::Cancelled);
    let results = store.inner.results_of(1);
    assert!(results.iter().all(|r| r.status == ResultStatus::Cancelled));
    assert!(!marker.exists());
    assert_eq!(b.publisher.events_of(1), vec![RequestStatus::Cancelled]);
    assert_eq!(a.publisher.events_of(1), vec![RequestStatus::Running]);
}

#[tokio::test]
async fn test_lost_lock_fails_the_running_request() {
    let marker = std::env::temp_dir().join(format!("deploymon-marker-{}", uuid::Uuid::new_v4()));
    let h = harness(
        vec![
            request_with(
                1,
                "EnvA",
                RequestStatus::Pending,
                vec![
                    component("db", "sleep 30"),
                    component("web", &format!("touch {}", marker.display())),
                ],
            ),
            request(2, "EnvA", RequestStatus::Pending),
        ],
        ScriptedLocks::enabled(vec![]),
    );

    let processor = h.processor.clone();
    let running = tokio::spawn(async move {
        processor
            .execute_requests(false, &CancellationSources::new(), &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.store.status_of(1).await, RequestStatus::Running);
    h.locks.lose_leases();

    let joined = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("the batch kept running without its lock");
    assert!(joined.unwrap().is_ok());

    assert_eq!(h.store.status_of(1).await, RequestStatus::Failed);
    assert_eq!(h.store.inner.results_of(1)[0].status, ResultStatus::Failed);
    assert!(!marker.exists());
    // The rest of the batch waits for whoever holds the lock next
    assert_eq!(h.store.status_of(2).await, RequestStatus::Pending);
    assert_eq!(h.locks.released(), 1);
}

// ================================= PASSES ======================================= //

#[tokio::test]
async fn test_busy_environment_is_skipped_by_later_pass() {
    let h = harness(
        vec![request_with(
            1,
            "EnvA",
            RequestStatus::Pending,
            vec![component("db", "sleep 30")],
        )],
        ScriptedLocks::disabled(),
    );
    let sources = CancellationSources::new();
    let shutdown = CancellationToken::new();

    let processor = h.processor.clone();
    let (first_sources, first_shutdown) = (sources.clone(), shutdown.clone());
    let first = tokio::spawn(async move {
        processor
            .execute_requests(false, &first_sources, &first_shutdown)
            .await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.processor.busy_environments(), vec!["EnvA".to_string()]);

    h.store.inner.insert_request(request_with(
        2,
        "EnvB",
        RequestStatus::Pending,
        vec![component("web", "exit 0")],
    ));
    tokio::time::timeout(
        Duration::from_secs(5),
        h.processor.execute_requests(false, &sources, &shutdown),
    )
    .await
    .expect("second pass waited for the busy environment")
    .unwrap();

    assert_eq!(h.store.status_of(2).await, RequestStatus::Completed);
    assert_eq!(h.store.status_of(1).await, RequestStatus::Running);
    let claims_of_1 = h
        .store
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Claim { id: 1, .. }))
        .count();
    assert_eq!(claims_of_1, 1);

    shutdown.cancel();
    let joined = tokio::time::timeout(Duration::from_secs(10), first)
        .await
        .unwrap();
    assert!(joined.unwrap().is_ok());
    assert_eq!(h.store.status_of(1).await, RequestStatus::Failed);
    assert!(h.processor.busy_environments().is_empty());
}

#[tokio::test]
async fn test_executor_keeps_serving_other_environments() {
    let h = harness(
        vec![request_with(
            1,
            "EnvA",
            RequestStatus::Pending,
            vec![component("db", "sleep 30")],
        )],
        ScriptedLocks::disabled(),
    );
    let sources = CancellationSources::new();
    let shutdown = CancellationToken::new();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let processor = h.processor.clone();
    let (worker_sources, worker_shutdown) = (sources.clone(), shutdown.clone());
    let worker = tokio::spawn(async move {
        let options = executor::Options {
            interval: Duration::from_millis(50),
            is_prod: false,
        };
        executor::run(
            &options,
            &processor,
            &worker_sources,
            &worker_shutdown,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.store.status_of(1).await, RequestStatus::Running);

    h.store.inner.insert_request(request_with(
        2,
        "EnvB",
        RequestStatus::Pending,
        vec![component("web", "exit 0")],
    ));
    let mut waited = Duration::ZERO;
    while h.store.status_of(2).await != RequestStatus::Completed {
        assert!(waited < Duration::from_secs(5), "EnvB waited for EnvA's step");
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert_eq!(h.store.status_of(1).await, RequestStatus::Running);

    stop_tx.send(()).unwrap();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.store.status_of(1).await, RequestStatus::Failed);
    assert!(sources.is_empty());
}

