// tests/runtime_fake_executor.rs

mod common;

use std::sync::Arc;

use serde_json::{Map, json};
use tokio::sync::mpsc;

use flowmgr::access::{ManagerHandle, Principal, policy_for};
use flowmgr::config::Settings;
use flowmgr::data::{DataObject, DataRequest, DataStatus, ErrorKind};
use flowmgr::engine::{CancelOutcome, CoreManager, ManagerEvent, ManagerOptions, Runtime};
use flowmgr::process::Process;
use flowmgr::types::PermissionMode;
use flowmgr_test_utils::builders::{SettingsBuilder, registry_of};
use flowmgr_test_utils::fake_executor::{FakeBehaviour, FakeExecutor};

use crate::common::{align_process, init_tracing, reads_process, sleep_process, wait_for_status, with_timeout};

struct Harness {
    tx: mpsc::Sender<ManagerEvent>,
    handle: ManagerHandle,
    runtime: tokio::task::JoinHandle<flowmgr::errors::Result<CoreManager>>,
    results: mpsc::Receiver<DataObject>,
    log: Arc<std::sync::Mutex<flowmgr_test_utils::fake_executor::FakeLog>>,
}

fn start(settings: Settings, processes: Vec<Process>, behaviour: FakeBehaviour, exit_when_idle: bool) -> Harness {
    init_tracing();

    let (tx, rx) = mpsc::channel(64);
    let core = CoreManager::new(
        Arc::new(settings),
        Arc::new(registry_of(processes)),
        ManagerOptions {
            exit_when_idle,
            channel_available: true,
        },
    );

    let executor = FakeExecutor::new(tx.clone(), behaviour);
    let log = executor.log();
    let (results_tx, results) = mpsc::channel(64);
    let runtime = Runtime::new(core, &tx, rx, executor).with_results(results_tx);

    Harness {
        handle: ManagerHandle::new(tx.clone(), policy_for(PermissionMode::Owner)),
        tx,
        runtime: tokio::spawn(runtime.run()),
        results,
        log,
    }
}

#[tokio::test]
async fn chain_runs_to_completion_and_runtime_exits_when_idle() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();
    let mut output = Map::new();
    output.insert("fastq".to_string(), json!("reads.fq"));

    let mut h = start(
        settings,
        vec![reads_process(), align_process()],
        FakeBehaviour::Succeed(output),
        true,
    );

    let who = Principal::user("ana");
    let reads = h.handle.create(&who, DataRequest::new("reads")).await.unwrap();
    let align = h
        .handle
        .create(&who, DataRequest::new("align").input("reads", reads))
        .await
        .unwrap();
    h.handle.close_submissions().await.unwrap();

    let core = with_timeout(h.runtime).await.unwrap().unwrap();

    for id in [reads, align] {
        let obj = core.get(id).unwrap();
        assert_eq!(obj.status, DataStatus::Done, "data object {id}");
        assert_eq!(obj.owner.as_deref(), Some("ana"));
    }
    assert_eq!(core.get(align).unwrap().command.as_deref(), Some("align reads.fq"));

    let launched: Vec<_> = h.log.lock().unwrap().launched.iter().map(|c| c.data_id).collect();
    assert_eq!(launched, vec![reads, align]);

    let mut reported = Vec::new();
    while let Ok(obj) = h.results.try_recv() {
        reported.push(obj.id);
    }
    assert_eq!(reported, vec![reads, align]);
}

#[tokio::test]
async fn launch_failures_are_retried_until_the_object_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path())
        .launch_retries(3)
        .retry_backoff_ms(1)
        .build();

    let h = start(settings, vec![reads_process()], FakeBehaviour::FailLaunch, true);

    let id = h
        .handle
        .create(&Principal::Superuser, DataRequest::new("reads"))
        .await
        .unwrap();
    h.handle.close_submissions().await.unwrap();

    let core = with_timeout(h.runtime).await.unwrap().unwrap();
    let obj = core.get(id).unwrap();
    assert_eq!(obj.status, DataStatus::Error);
    assert_eq!(obj.error.as_ref().unwrap().kind, ErrorKind::Launch);
    assert_eq!(obj.launch_attempts, 3);

    let attempts: Vec<_> = h.log.lock().unwrap().launched.iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn nonzero_exit_is_reported_as_execution_error() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();

    let h = start(settings, vec![sleep_process()], FakeBehaviour::Exit(3), true);

    let id = h
        .handle
        .create(&Principal::Superuser, DataRequest::new("sleep").input("seconds", 1))
        .await
        .unwrap();
    h.handle.close_submissions().await.unwrap();

    let core = with_timeout(h.runtime).await.unwrap().unwrap();
    let obj = core.get(id).unwrap();
    assert_eq!(obj.exit_code, Some(3));
    let err = obj.error.as_ref().unwrap();
    assert_eq!(err.kind, ErrorKind::Execution);
    assert!(err.message.contains("exited with 3"));
}

#[tokio::test]
async fn limit_and_cancel_through_the_handle() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).max_concurrent(2).build();

    let h = start(settings, vec![sleep_process()], FakeBehaviour::Hold, false);
    let ana = Principal::user("ana");

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = h
            .handle
            .create(&ana, DataRequest::new("sleep").input("seconds", 60))
            .await
            .unwrap();
        ids.push(id);
    }

    wait_for_status(&h.tx, ids[1], DataStatus::Processing).await;
    assert_eq!(h.handle.status(&ana, ids[2]).await.unwrap().status, DataStatus::Waiting);
    assert_eq!(h.log.lock().unwrap().launched.len(), 2);

    // Someone else cannot see, and so cannot cancel, ana's objects.
    let bo = Principal::user("bo");
    assert!(h.handle.cancel(&bo, ids[0]).await.is_err());
    assert!(h.handle.list(&bo).await.unwrap().is_empty());
    assert_eq!(h.handle.list(&ana).await.unwrap().len(), 3);

    assert_eq!(h.handle.cancel(&ana, ids[0]).await.unwrap(), CancelOutcome::Terminating);

    // The freed slot goes to the waiting object.
    wait_for_status(&h.tx, ids[2], DataStatus::Processing).await;
    {
        let log = h.log.lock().unwrap();
        assert_eq!(log.terminated, vec![ids[0]]);
        assert_eq!(log.launched.len(), 3);
    }

    let cancelled = h.handle.status(&ana, ids[0]).await.unwrap();
    assert_eq!(cancelled.error.as_ref().unwrap().kind, ErrorKind::Cancelled);

    h.tx.send(ManagerEvent::ShutdownRequested).await.unwrap();
    let core = with_timeout(h.runtime).await.unwrap().unwrap();
    assert_eq!(core.running(), 2);
}

#[tokio::test]
async fn anonymous_submissions_are_refused_under_owner_permissions() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();

    let h = start(settings, vec![sleep_process()], FakeBehaviour::Hold, false);

    let err = h
        .handle
        .create(&Principal::Anonymous, DataRequest::new("sleep").input("seconds", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, flowmgr::errors::FlowError::PermissionDenied(_)));

    h.tx.send(ManagerEvent::ShutdownRequested).await.unwrap();
    let core = with_timeout(h.runtime).await.unwrap().unwrap();
    assert!(core.store().is_empty());
}
