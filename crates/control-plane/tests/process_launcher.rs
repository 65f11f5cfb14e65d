//! Local process launcher driven through the coordinator.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::contract;
use pg_dd_control_plane::dispatch::{
    ComputeLauncher, DispatchSettings, Dispatcher, ProcessLauncher, WorkerExit,
};
use pg_dd_control_plane::engine::{Coordinator, FailureSource, RunState, Sinks};

fn coordinator() -> Coordinator {
    Coordinator::new(
        Arc::new(ProcessLauncher::new("/bin/sh")),
        DispatchSettings {
            callback_timeout: Duration::from_secs(30),
            callback_url: None,
        },
        Sinks::default(),
    )
}

fn script(body: &str) -> Vec<String> {
    vec!["-c".to_string(), body.to_string()]
}

async fn run_to_end(coordinator: &Coordinator, commands: Vec<String>) -> (RunState, String) {
    let dispatched = coordinator.dispatch(commands, contract()).await.unwrap();
    let snapshot = coordinator
        .wait(&dispatched.run_id, Duration::from_secs(10))
        .await
        .unwrap();
    let error = snapshot.failure.map(|f| f.error).unwrap_or_default();
    (snapshot.state, error)
}

#[tokio::test]
async fn test_nonzero_exit_fails_run() {
    let (state, error) = run_to_end(&coordinator(), script("exit 3")).await;
    assert_eq!(state, RunState::Failed);
    assert_eq!(error, "worker exited with status 3");
}

#[tokio::test]
async fn test_environment_is_exactly_the_contract() {
    let body = r#"[ -z "$HOME" ] && [ "$PG_DD_DATABASE_DB_SQL_DUMP" = "SELECT 1" ] && [ "$PG_DD_DATABASE_DB_SQL_LOAD" = "t1" ] && [ -n "$PG_DD_TASK_TOKEN" ] && exit 7; exit 1"#;
    let (state, error) = run_to_end(&coordinator(), script(body)).await;
    assert_eq!(state, RunState::Failed);
    assert_eq!(error, "worker exited with status 7");
}

#[tokio::test]
async fn test_commands_are_rendered() {
    let commands = vec![
        "-c".to_string(),
        r#"[ "$0" = "$PG_DD_OUTPUT_PREFIX" ] && exit 5; exit 1"#.to_string(),
        "{{ output_prefix }}".to_string(),
    ];
    let (_, error) = run_to_end(&coordinator(), commands).await;
    assert_eq!(error, "worker exited with status 5");
}

#[tokio::test]
async fn test_silent_success_exit_fails_run() {
    let coordinator = coordinator();
    let dispatched = coordinator
        .dispatch(script("exit 0"), contract())
        .await
        .unwrap();
    let snapshot = coordinator
        .wait(&dispatched.run_id, Duration::from_secs(10))
        .await
        .unwrap();
    let failure = snapshot.failure.unwrap();
    assert_eq!(failure.source, FailureSource::Compute);
    assert_eq!(failure.error, "worker exited without reporting completion");
}

#[tokio::test]
async fn test_terminate_kills_worker() {
    let launcher = Arc::new(ProcessLauncher::new("/bin/sh"));
    let dispatcher = Dispatcher::new(launcher.clone(), DispatchSettings::default());
    let prepared = dispatcher
        .prepare(script("sleep 30"), contract())
        .unwrap();

    let handle = launcher.launch(&prepared.spec).await.unwrap();
    launcher.terminate(&handle).await.unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(10), launcher.wait(&handle))
        .await
        .unwrap();
    assert!(matches!(exit, WorkerExit::Evicted { .. }));
}

#[tokio::test]
async fn test_missing_program_is_a_launch_error() {
    let coordinator = Coordinator::new(
        Arc::new(ProcessLauncher::new("/nonexistent/pg-dd")),
        DispatchSettings::default(),
        Sinks::default(),
    );
    let err = coordinator
        .dispatch(script("exit 0"), contract())
        .await
        .unwrap_err();
    assert!(!err.is_configuration());
    assert_eq!(coordinator.list().await[0].state, RunState::Pending);
}
