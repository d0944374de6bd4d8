//! Script dispatcher tests

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::{component, request_with};
use deploymon::filesys::dir::Dir;
use deploymon::models::request::RequestStatus;
use deploymon::runner::dispatcher::{Options, ScriptDispatcher, Termination};
use deploymon::runner::process::PROCESS_TERMINATED_EXIT_CODE;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

async fn dispatcher() -> (ScriptDispatcher, Dir) {
    let base = Dir::create_temp_dir("runner").await.unwrap();
    let dispatcher = ScriptDispatcher::new(Options {
        scripts_dir: base.path().to_path_buf(),
        logs_dir: base.path().join("logs"),
        default_step_timeout: None,
    });
    (dispatcher, base)
}

#[tokio::test]
async fn test_step_sees_request_context() {
    let (dispatcher, _base) = dispatcher().await;
    let step = component(
        "db",
        "echo \"$DEPLOY_REQUEST_ID $DEPLOY_ENVIRONMENT $DEPLOY_COMPONENT $DEPLOY_PROP_DB_HOST\"",
    );
    let mut request = request_with(42, "EnvA", RequestStatus::Running, vec![step.clone()]);
    request.detail.property_overrides =
        HashMap::from([("db.host".to_string(), "10.0.0.5".to_string())]);

    let outcome = assert_ok!(
        dispatcher
            .dispatch(&request, &step, &CancellationToken::new())
            .await
    );

    assert!(outcome.succeeded());
    assert_eq!(outcome.log.trim(), "42 EnvA db 10.0.0.5");

    // Output is kept on disk per request
    let log_file = dispatcher.request_log_dir(42).file("db.log");
    assert!(log_file.exists().await);
}

#[tokio::test]
async fn test_exit_code_and_stderr_are_captured() {
    let (dispatcher, _base) = dispatcher().await;
    let step = component("web", "echo broken >&2; exit 4");
    let request = request_with(1, "EnvA", RequestStatus::Running, vec![step.clone()]);

    let outcome = assert_ok!(
        dispatcher
            .dispatch(&request, &step, &CancellationToken::new())
            .await
    );

    assert!(!outcome.succeeded());
    assert_eq!(outcome.exit_code, 4);
    assert_eq!(outcome.termination, None);
    assert!(outcome.log.contains("broken"));
}

#[tokio::test]
async fn test_step_timeout_terminates_the_process() {
    let (dispatcher, _base) = dispatcher().await;
    let mut step = component("slow", "sleep 30");
    step.script.timeout_secs = Some(1);
    let request = request_with(1, "EnvA", RequestStatus::Running, vec![step.clone()]);

    let started = Instant::now();
    let outcome = assert_ok!(
        dispatcher
            .dispatch(&request, &step, &CancellationToken::new())
            .await
    );

    assert_eq!(outcome.exit_code, PROCESS_TERMINATED_EXIT_CODE);
    assert_eq!(outcome.termination, Some(Termination::TimedOut));
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn test_cancellation_terminates_the_process() {
    let (dispatcher, _base) = dispatcher().await;
    let step = component("slow", "sleep 30");
    let request = request_with(1, "EnvA", RequestStatus::Running, vec![step.clone()]);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = dispatcher.dispatch(&request, &step, &token).await.unwrap();

    assert_eq!(outcome.exit_code, PROCESS_TERMINATED_EXIT_CODE);
    assert_eq!(outcome.termination, Some(Termination::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn test_missing_program_is_an_error() {
    let (dispatcher, _base) = dispatcher().await;
    let mut step = component("db", "true");
    step.script.program = "/nonexistent/deploy-step".to_string();
    step.script.args.clear();
    let request = request_with(1, "EnvA", RequestStatus::Running, vec![step.clone()]);

    assert_err!(
        dispatcher
            .dispatch(&request, &step, &CancellationToken::new())
            .await
    );
}
