mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use runbox::executor::ExecOptions;
use runbox::registry::{RuntimeRecord, RuntimeStatus};
use runbox::reaper::SweepReport;
use runbox::ResourceSpec;
use tempfile::TempDir;

use common::{files, flaky_service, local_service, test_config, FlakyDriver};

#[tokio::test]
async fn sweep_evicts_only_idle_running_runtimes() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    let idle = lifecycle
        .create_or_get_runtime("idle", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    lifecycle
        .create_or_get_runtime("busy", files(&[]), ResourceSpec::default())
        .await
        .unwrap();

    let now = Instant::now();
    service
        .registry()
        .touch("busy", now + Duration::from_secs(50))
        .await;

    let report = service
        .reaper()
        .sweep_at(now + Duration::from_secs(61))
        .await;
    assert_eq!(
        report,
        SweepReport {
            examined: 2,
            evicted: 1,
            failed: 0
        }
    );
    assert!(service.registry().get("idle").await.is_none());
    assert!(service.registry().get("busy").await.is_some());
    assert!(!service.ports().is_allocated(idle.port));

    // The freed port can be handed out again.
    let again = lifecycle
        .create_or_get_runtime("next", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    assert_eq!(again.port, idle.port);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn sweep_never_touches_creating_records() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));

    let record = RuntimeRecord::new("pending", 4001, ResourceSpec::default());
    assert_eq!(record.status, RuntimeStatus::Creating);
    service.registry().upsert(record).await;

    let report = service
        .reaper()
        .sweep_at(Instant::now() + Duration::from_secs(3600))
        .await;
    assert_eq!(report.examined, 1);
    assert_eq!(report.evicted, 0);
    assert!(service.registry().get("pending").await.is_some());
}

#[tokio::test]
async fn sweep_within_threshold_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    service
        .lifecycle()
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap();

    let report = service.reaper().sweep().await;
    assert_eq!(report.evicted, 0);
    assert_eq!(service.registry().len().await, 1);
    service.lifecycle().shutdown().await;
}

#[tokio::test]
async fn background_reaper_evicts_and_stops_on_shutdown() {
    let tmp = TempDir::new().unwrap();
    let config = runbox::Config {
        idle_timeout: Duration::from_millis(300),
        reaper_interval: Duration::from_millis(100),
        ..test_config(tmp.path())
    };
    let service = local_service(config);
    service.start();

    service
        .lifecycle()
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while service.registry().get("u1").await.is_some() {
        assert!(Instant::now() < deadline, "idle runtime was not reaped");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(service.ports().allocated(), 0);

    tokio::time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .expect("shutdown completes");
}

#[tokio::test]
async fn runtime_used_during_a_sweep_is_not_evicted() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    lifecycle
        .create_or_get_runtime("a", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    let b = lifecycle
        .create_or_get_runtime("b", files(&[]), ResourceSpec::default())
        .await
        .unwrap();

    // "a" ignores SIGTERM, so tearing it down waits out the stop grace period.
    let _stubborn = service
        .executor()
        .exec_stream("a", "trap '' TERM; sleep 100", ExecOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let t0 = Instant::now();
    let reaper = service.reaper().clone();
    let sweep = tokio::spawn(async move { reaper.sweep_at(t0 + Duration::from_secs(61)).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!sweep.is_finished(), "teardown of a should still be running");
    service
        .registry()
        .touch("b", t0 + Duration::from_secs(5))
        .await;

    let report = sweep.await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            examined: 2,
            evicted: 1,
            failed: 0
        }
    );
    assert!(service.registry().get("a").await.is_none());
    let kept = service.registry().get("b").await.expect("b was active");
    assert_eq!(kept.status, RuntimeStatus::Running);
    assert!(service.ports().is_allocated(b.port));

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn replaced_runtime_is_not_evicted_by_a_stale_sweep() {
    let tmp = TempDir::new().unwrap();
    let service = local_service(test_config(tmp.path()));
    let lifecycle = service.lifecycle();

    let first = lifecycle
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    lifecycle.remove_runtime("u1").await.unwrap();
    lifecycle
        .create_or_get_runtime("u1", files(&[]), ResourceSpec::default())
        .await
        .unwrap();

    let removed = lifecycle
        .evict_if_idle(
            "u1",
            first.runtime_id,
            Instant::now() + Duration::from_secs(3600),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    assert!(!removed);
    assert!(service.registry().get("u1").await.is_some());

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn failed_eviction_does_not_stop_the_sweep() {
    let tmp = TempDir::new().unwrap();
    let driver = Arc::new(FlakyDriver::new(tmp.path()));
    let service = flaky_service(test_config(tmp.path()), driver.clone());
    let lifecycle = service.lifecycle();

    let stuck = lifecycle
        .create_or_get_runtime("a", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    let fine = lifecycle
        .create_or_get_runtime("b", files(&[]), ResourceSpec::default())
        .await
        .unwrap();
    driver.fail_stop_for(Some("a"));

    let later = Instant::now() + Duration::from_secs(61);
    let report = service.reaper().sweep_at(later).await;
    assert_eq!(
        report,
        SweepReport {
            examined: 2,
            evicted: 1,
            failed: 1
        }
    );
    let record = service.registry().get("a").await.unwrap();
    assert_eq!(record.status, RuntimeStatus::Error);
    assert!(service.ports().is_allocated(stuck.port));
    assert!(service.registry().get("b").await.is_none());
    assert!(!service.ports().is_allocated(fine.port));

    // The next sweep retries the record left in Error.
    driver.fail_stop_for(None);
    let report = service.reaper().sweep_at(later).await;
    assert_eq!(
        report,
        SweepReport {
            examined: 1,
            evicted: 1,
            failed: 0
        }
    );
    assert!(service.registry().is_empty().await);
    assert_eq!(service.ports().allocated(), 0);
}
