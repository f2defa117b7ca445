mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use runbox::broadcast::{EventKind, StatusEvent, Subscription};
use runbox::registry::RuntimeStatus;
use runbox::{ResourceSpec, RunboxError};
use tempfile::TempDir;

use common::{files, flaky_service, local_service, test_config, FlakyDriver};

async fn next(sub: &mut Subscription) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("event within two seconds")
        .expect("subscription open")
}

#[tokio::test]
async fn create_reuse_remove_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    let mut sub = service.broadcaster().subscribe("u1");
    let snapshot = next(&mut sub).await;
    assert_eq!(snapshot.status(), Some(RuntimeStatus::Stopped));
    assert_eq!(snapshot.payload["exists"], false);

    let project = files(&[("index.js", "console.log(1)")]);
    let first = lifecycle
        .create_or_get_runtime("u1", project.clone(), ResourceSpec::default())
        .await
        .unwrap();
    assert_eq!(first.port, 4000);
    assert_eq!(first.status, RuntimeStatus::Running);
    assert_eq!(first.url, "http://localhost:4000");

    assert_eq!(next(&mut sub).await.status(), Some(RuntimeStatus::Creating));
    assert_eq!(next(&mut sub).await.status(), Some(RuntimeStatus::Running));

    let again = lifecycle
        .create_or_get_runtime("u1", project, ResourceSpec::default())
        .await
        .unwrap();
    assert_eq!(again.port, first.port);
    assert_eq!(again.runtime_id, first.runtime_id);
    assert_eq!(service.ports().allocated(), 1);

    let read = lifecycle
        .read_files("u1", &["index.js".to_string()])
        .await
        .unwrap();
    assert_eq!(read["index.js"], "console.log(1)");

    lifecycle.remove_runtime("u1").await.unwrap();
    assert!(!service.ports().is_allocated(4000));
    assert!(service.registry().get("u1").await.is_none());

    assert_eq!(next(&mut sub).await.status(), Some(RuntimeStatus::Stopping));
    let stopped = next(&mut sub).await;
    assert_eq!(stopped.status(), Some(RuntimeStatus::Stopped));
    assert_eq!(stopped.payload["exists"], false);

    lifecycle.remove_runtime("u1").await.unwrap();
    assert_eq!(service.ports().allocated(), 0);
}

#[tokio::test]
async fn concurrent_creates_converge_on_one_runtime() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let lifecycle = service.lifecycle().clone();
        tasks.push(tokio::spawn(async move {
            lifecycle
                .create_or_get_runtime("u1", files(&[("a.txt", "a")]), ResourceSpec::default())
                .await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        let view = task.await.unwrap().unwrap();
        ids.push((view.runtime_id, view.port));
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(service.ports().allocated(), 1);
    assert_eq!(service.registry().len().await, 1);

    service.lifecycle().shutdown().await;
}

#[tokio::test]
async fn pool_exhaustion_fails_without_side_effects() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    let a = lifecycle
        .create_or_get_runtime("a", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    let b = lifecycle
        .create_or_get_runtime("b", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    assert_ne!(a.port, b.port);

    let err = lifecycle
        .create_or_get_runtime("c", files(&[]), ResourceSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunboxError::PortPoolExhausted { start: 4000, end: 4001 }));
    assert!(!err.rolled_back());
    assert!(service.registry().get("c").await.is_none());
    assert_eq!(service.registry().len().await, 2);

    lifecycle.remove_runtime("a").await.unwrap();
    let c = lifecycle
        .create_or_get_runtime("c", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    assert_eq!(c.port, a.port);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn failed_file_write_rolls_back() {
    let tmp = TempDir::new().unwrap();
    let driver = Arc::new(FlakyDriver::new(tmp.path()));
    FlakyDriver::set(&driver.fail_write, true);
    let service = flaky_service(test_config(tmp.path()), driver.clone());

    let mut sub = service.broadcaster().subscribe("u1");
    next(&mut sub).await;

    let err = service
        .lifecycle()
        .create_or_get_runtime("u1", files(&[("index.js", "x")]), ResourceSpec::default())
        .await
        .unwrap_err();
    match &err {
        RunboxError::RuntimeCreateFailed { stage, .. } => assert_eq!(*stage, "write_files"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.rolled_back());
    assert!(service.registry().get("u1").await.is_none());
    assert_eq!(service.ports().allocated(), 0);

    let work = tmp.path().join("work");
    let leftovers = std::fs::read_dir(&work).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0, "workspace should be removed on rollback");

    let mut saw_error = false;
    for _ in 0..4 {
        let ev = next(&mut sub).await;
        if ev.kind == EventKind::Error {
            assert_eq!(ev.payload["code"], "runtime_create_failed");
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "an error event is published");

    // The next attempt succeeds once the fault is gone.
    FlakyDriver::set(&driver.fail_write, false);
    let view = service
        .lifecycle()
        .create_or_get_runtime("u1", files(&[("index.js", "x")]), ResourceSpec::default())
        .await
        .unwrap();
    assert_eq!(view.port, 4000);
    service.lifecycle().shutdown().await;
}

#[tokio::test]
async fn unavailable_driver_is_reported_as_such() {
    let tmp = TempDir::new().unwrap();
    let driver = Arc::new(FlakyDriver::new(tmp.path()));
    driver.unavailable.store(true, Ordering::SeqCst);
    let service = flaky_service(test_config(tmp.path()), driver);

    assert!(service.check_driver().await.is_err());
    let err = service
        .lifecycle()
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunboxError::DriverUnavailable { rolled_back: true, .. }));
    assert_eq!(service.ports().allocated(), 0);
}

#[tokio::test]
async fn create_deadline_rolls_back() {
    let tmp = TempDir::new().unwrap();
    let mut driver = FlakyDriver::new(tmp.path());
    driver.create_delay = Some(Duration::from_secs(5));
    let config = runbox::Config {
        create_timeout: Duration::from_millis(200),
        ..test_config(tmp.path())
    };
    let service = flaky_service(config, Arc::new(driver));

    let started = std::time::Instant::now();
    let err = service
        .lifecycle()
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(err, RunboxError::RuntimeCreateFailed { stage: "create", .. }));
    assert!(service.registry().is_empty().await);
    assert_eq!(service.ports().allocated(), 0);

    // The workspace made before the deadline fired is removed too.
    let leftovers = std::fs::read_dir(tmp.path().join("work")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn failed_removal_keeps_port_until_retried() {
    let tmp = TempDir::new().unwrap();
    let driver = Arc::new(FlakyDriver::new(tmp.path()));
    let service = flaky_service(test_config(tmp.path()), driver.clone());
    let lifecycle = service.lifecycle();

    lifecycle
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap();

    FlakyDriver::set(&driver.fail_stop, true);
    assert!(lifecycle.remove_runtime("u1").await.is_err());
    let record = service.registry().get("u1").await.unwrap();
    assert_eq!(record.status, RuntimeStatus::Error);
    assert!(service.ports().is_allocated(4000));

    FlakyDriver::set(&driver.fail_stop, false);
    lifecycle.remove_runtime("u1").await.unwrap();
    assert!(service.registry().get("u1").await.is_none());
    assert!(!service.ports().is_allocated(4000));
}

#[tokio::test]
async fn update_files_requires_running_runtime() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    let err = lifecycle
        .update_files("nobody", files(&[("a.txt", "a")]))
        .await
        .unwrap_err();
    assert!(matches!(err, RunboxError::RuntimeNotFound(_)));

    lifecycle
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap();

    let err = lifecycle
        .update_files("u1", files(&[("../escape.txt", "x")]))
        .await
        .unwrap_err();
    assert!(matches!(err, RunboxError::InvalidPath { .. }));

    let written = lifecycle
        .update_files("u1", files(&[("src/app.js", "export {}")]))
        .await
        .unwrap();
    assert_eq!(written, 1);
    let read = lifecycle
        .read_files("u1", &["src/app.js".to_string()])
        .await
        .unwrap();
    assert_eq!(read["src/app.js"], "export {}");

    service
        .registry()
        .set_status("u1", RuntimeStatus::Stopping)
        .await
        .unwrap();
    let err = lifecycle
        .update_files("u1", files(&[("a.txt", "a")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunboxError::RuntimeNotRunning { status: RuntimeStatus::Stopping, .. }
    ));

    service
        .registry()
        .set_status("u1", RuntimeStatus::Running)
        .await
        .unwrap();
    lifecycle.remove_runtime("u1").await.unwrap();
}

#[tokio::test]
async fn stored_project_is_restored_on_empty_create() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    lifecycle
        .create_or_get_runtime("u1", files(&[("index.js", "v1")]), ResourceSpec::default())
        .await
        .unwrap();
    lifecycle
        .update_files("u1", files(&[("index.js", "v2")]))
        .await
        .unwrap();
    lifecycle.remove_runtime("u1").await.unwrap();

    lifecycle
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    let read = lifecycle
        .read_files("u1", &["index.js".to_string()])
        .await
        .unwrap();
    assert_eq!(read["index.js"], "v2");
    lifecycle.remove_runtime("u1").await.unwrap();
}

#[tokio::test]
async fn resources_are_clamped_and_stats_are_best_effort() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    let view = lifecycle
        .create_or_get_runtime(
            "u1",
            files(&[]),
            ResourceSpec {
                cpus: Some(64.0),
                memory_mb: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(view.resources.cpus, Some(2.0));
    assert_eq!(view.resources.memory_mb, Some(512));

    let stats = lifecycle.get_stats("u1").await.unwrap();
    assert_eq!(stats.status, RuntimeStatus::Running);

    assert!(matches!(
        lifecycle.get_stats("nobody").await,
        Err(RunboxError::RuntimeNotFound(_))
    ));
    lifecycle.remove_runtime("u1").await.unwrap();
}
