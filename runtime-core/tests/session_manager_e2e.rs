//! End-to-end scenarios against a real Docker daemon.
//!
//! These exercise the literal scenarios from the session lifecycle design:
//! round-trip file I/O, compute, timeout classification, post-close
//! isolation, the session cap, and path-escape rejection. They need a
//! running Docker daemon and a pulled `python:3.11-slim` image, so they
//! are skipped (not failed) when Docker isn't reachable, matching how the
//! rest of this codebase gates its own Docker-backed tests.

use serde_json::json;
use session_manager_core::config::{Backend, Config, DbConfig};
use session_manager_core::container_runtime::ContainerRuntime;
use session_manager_core::session_manager::{ExecuteReport, SessionManager};

fn is_docker_available() -> bool {
    if std::env::var("SKIP_DOCKER_TESTS").is_ok() {
        return false;
    }
    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn test_config(max_sandboxes: usize) -> Config {
    Config {
        sandbox_timeout_secs: 300,
        max_sandboxes,
        docker_image: "python:3.11-slim".to_string(),
        docker_host: None,
        log_level: "info".to_string(),
        workspace_root: None,
        db: DbConfig::default(),
        max_code_chars: 100_000,
        max_output_bytes: 65_536,
        max_file_read_bytes: 10_485_760,
        max_file_write_bytes: 10_485_760,
        default_exec_timeout_secs: 10.0,
        backend: Backend::Stateless,
        evaluator_guest_port: 6311,
    }
}

#[tokio::test]
async fn round_trip_file_and_compute() {
    if !is_docker_available() {
        println!("Skipping test: Docker not available");
        return;
    }
    let config = test_config(10);
    let runtime = ContainerRuntime::connect(&config).await.unwrap();
    let manager = SessionManager::new(config, runtime);

    let summary = manager.create_session().await.unwrap();
    let session_id = summary.session_id;

    manager
        .write_session_file(&session_id, "data/x.txt", "hello")
        .await
        .unwrap();
    let content = manager.read_session_file(&session_id, "data/x.txt").await.unwrap();
    assert_eq!(content, "hello");

    let files = manager.list_session_files(&session_id, "data").await.unwrap();
    assert!(files.iter().any(|f| f.name == "x.txt" && !f.is_dir));

    let report = manager
        .execute_in_session(&session_id, "print('hi')", None)
        .await
        .unwrap();
    match report {
        ExecuteReport::Success(outcome) => {
            assert!(outcome.output.contains("hi"));
            assert_eq!(outcome.exit_code, Some(0));
        }
        ExecuteReport::Failure { error, .. } => panic!("expected success, got {error}"),
    }

    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn closed_session_is_unreachable() {
    if !is_docker_available() {
        println!("Skipping test: Docker not available");
        return;
    }
    let config = test_config(10);
    let runtime = ContainerRuntime::connect(&config).await.unwrap();
    let manager = SessionManager::new(config, runtime);

    let summary = manager.create_session().await.unwrap();
    manager.close_session(&summary.session_id).await.unwrap();

    let result = manager
        .execute_in_session(&summary.session_id, "1", None)
        .await;
    assert!(matches!(result, Err(session_manager_core::Error::SessionNotFound(_))));

    let second_close = manager.close_session(&summary.session_id).await;
    assert!(matches!(
        second_close,
        Err(session_manager_core::Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn session_cap_is_enforced() {
    if !is_docker_available() {
        println!("Skipping test: Docker not available");
        return;
    }
    let config = test_config(1);
    let runtime = ContainerRuntime::connect(&config).await.unwrap();
    let manager = SessionManager::new(config, runtime);

    let first = manager.create_session().await;
    assert!(first.is_ok());
    let second = manager.create_session().await;
    assert!(matches!(
        second,
        Err(session_manager_core::Error::MaxSessionsReached(1))
    ));

    manager.close_session(&first.unwrap().session_id).await.unwrap();
}

#[tokio::test]
async fn timeout_is_reported_and_session_stays_usable() {
    if !is_docker_available() {
        println!("Skipping test: Docker not available");
        return;
    }
    let config = test_config(10);
    let runtime = ContainerRuntime::connect(&config).await.unwrap();
    let manager = SessionManager::new(config, runtime);

    let summary = manager.create_session().await.unwrap();
    let session_id = summary.session_id;

    let limits = json!({"max_duration_secs": 1});
    let report = manager
        .execute_in_session(&session_id, "while True: pass", Some(&limits))
        .await
        .unwrap();
    match report {
        ExecuteReport::Failure {
            error,
            elapsed_secs,
            ..
        } => {
            assert_eq!(error.code(), "execution_timeout");
            assert!(elapsed_secs >= 1.0);
        }
        ExecuteReport::Success(outcome) => {
            panic!("expected a timeout, got success: {}", outcome.output)
        }
    }

    let sessions = manager.list_sessions(true).await;
    assert!(sessions.iter().any(|s| s.session_id == session_id));

    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn path_escape_is_rejected_before_touching_the_container() {
    if !is_docker_available() {
        println!("Skipping test: Docker not available");
        return;
    }
    let config = test_config(10);
    let runtime = ContainerRuntime::connect(&config).await.unwrap();
    let manager = SessionManager::new(config, runtime);

    let summary = manager.create_session().await.unwrap();
    let result = manager
        .read_session_file(&summary.session_id, "../etc/passwd")
        .await;
    assert!(matches!(
        result,
        Err(session_manager_core::Error::InvalidPath(_))
    ));

    manager.close_session(&summary.session_id).await.unwrap();
}
