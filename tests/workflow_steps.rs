// tests/workflow_steps.rs

mod common;

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use flowmgr::access::{ManagerHandle, Principal, policy_for};
use flowmgr::data::{DataRequest, DataStatus, ErrorKind};
use flowmgr::engine::{CancelOutcome, CoreManager, ManagerEvent, ManagerOptions, Runtime};
use flowmgr::types::PermissionMode;
use flowmgr_test_utils::builders::{ProcessBuilder, SettingsBuilder, core_with, registry_of};
use flowmgr_test_utils::fake_executor::{FakeBehaviour, FakeExecutor};

use crate::common::{
    init_tracing, shout_and_count_workflow, upper_process, wait_for_status, with_timeout, word_count_process,
};

fn output(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn shout_core(max_concurrent: usize) -> (tempfile::TempDir, CoreManager) {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).max_concurrent(max_concurrent).build();
    let core = core_with(
        settings,
        [upper_process(), word_count_process(), shout_and_count_workflow()],
    );
    (tmp, core)
}

#[test]
fn steps_run_in_order_and_the_workflow_reports_their_ids() {
    let (_tmp, mut core) = shout_core(4);

    let wf = core
        .submit(
            DataRequest::new("shout-and-count").input("text", "hello world"),
            Some("ana".to_string()),
        )
        .unwrap();
    let (shout, count) = (wf + 1, wf + 2);

    assert_eq!(core.get(wf).unwrap().status, DataStatus::Processing);
    assert_eq!(core.get(shout).unwrap().status, DataStatus::Waiting);
    assert_eq!(core.get(count).unwrap().status, DataStatus::Created);
    assert_eq!(core.get(count).unwrap().dependencies, vec![shout]);
    assert_eq!(core.get(count).unwrap().owner.as_deref(), Some("ana"));
    // The workflow itself never takes a slot.
    assert_eq!(core.running(), 0);

    let launched = core.dispatch_ready();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].command, "echo 'hello world' | tr a-z A-Z");

    assert!(core.on_completion(shout, 1, 0, output(&[("text", json!("HELLO WORLD"))]), vec![]));
    assert_eq!(core.get(wf).unwrap().status, DataStatus::Processing);

    let launched = core.dispatch_ready();
    assert_eq!(launched[0].data_id, count);
    assert_eq!(launched[0].command, "wc -w 'HELLO WORLD'");

    assert!(core.on_completion(count, 1, 0, output(&[("count", json!(2))]), vec![]));

    let done = core.get(wf).unwrap();
    assert_eq!(done.status, DataStatus::Done);
    assert_eq!(done.output, output(&[("shout", json!(shout)), ("count", json!(count))]));
    assert!(core.is_idle());

    let reported: Vec<_> = core.take_finished().iter().map(|o| o.id).collect();
    assert_eq!(reported, vec![shout, count, wf]);
}

#[test]
fn failed_step_fails_the_workflow_and_the_steps_after_it() {
    let (_tmp, mut core) = shout_core(4);

    let wf = core
        .submit(DataRequest::new("shout-and-count").input("text", "hi"), None)
        .unwrap();
    let (shout, count) = (wf + 1, wf + 2);

    core.dispatch_ready();
    core.on_completion(shout, 1, 1, Map::new(), vec!["tr: broken pipe".to_string()]);

    assert_eq!(core.get(count).unwrap().error.as_ref().unwrap().kind, ErrorKind::DependencyFailed);
    let failed = core.get(wf).unwrap();
    assert_eq!(failed.status, DataStatus::Error);
    let err = failed.error.as_ref().unwrap();
    assert_eq!(err.kind, ErrorKind::StepFailed);
    assert!(err.message.contains(&format!("shout ({shout})")), "{}", err.message);
    assert!(core.is_idle());
}

#[test]
fn workflow_waits_for_running_steps_before_failing() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).max_concurrent(2).build();
    let pair = ProcessBuilder::workflow("pair")
        .step("left", "upper", json!({ "text": "a" }))
        .step("right", "upper", json!({ "text": "b" }))
        .build();
    let mut core = core_with(settings, [upper_process(), pair]);

    let wf = core.submit(DataRequest::new("pair"), None).unwrap();
    let (left, right) = (wf + 1, wf + 2);
    assert_eq!(core.dispatch_ready().len(), 2);

    core.on_completion(left, 1, 3, Map::new(), vec![]);
    assert_eq!(core.get(wf).unwrap().status, DataStatus::Processing);
    assert_eq!(core.get(right).unwrap().status, DataStatus::Processing);

    core.on_completion(right, 1, 0, output(&[("text", json!("B"))]), vec![]);
    assert_eq!(core.get(right).unwrap().status, DataStatus::Done);

    let err = core.get(wf).unwrap().error.clone().unwrap();
    assert_eq!(err.kind, ErrorKind::StepFailed);
    assert!(err.message.contains("left"));
    assert!(!err.message.contains("right"));
}

#[test]
fn cancelling_a_workflow_cancels_its_steps() {
    let (_tmp, mut core) = shout_core(4);

    let wf = core
        .submit(DataRequest::new("shout-and-count").input("text", "hi"), None)
        .unwrap();
    let (shout, count) = (wf + 1, wf + 2);
    core.dispatch_ready();
    assert_eq!(core.running(), 1);

    assert_eq!(core.cancel(wf).unwrap(), CancelOutcome::Terminating);
    assert_eq!(core.take_terminations(), vec![shout]);
    assert!(core.take_terminations().is_empty());
    assert_eq!(core.running(), 0);

    assert_eq!(core.get(wf).unwrap().error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    for step in [shout, count] {
        let obj = core.get(step).unwrap();
        assert_eq!(obj.status, DataStatus::Error, "step {step}");
        assert_eq!(obj.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    // The running step's late result changes nothing.
    assert!(!core.on_completion(shout, 1, 0, output(&[("text", json!("HI"))]), vec![]));
    assert!(core.is_idle());
}

#[test]
fn cancelling_one_step_fails_the_workflow_once_the_rest_settle() {
    let (_tmp, mut core) = shout_core(4);

    let wf = core
        .submit(DataRequest::new("shout-and-count").input("text", "hi"), None)
        .unwrap();
    let (shout, count) = (wf + 1, wf + 2);
    core.dispatch_ready();

    assert_eq!(core.cancel(count).unwrap(), CancelOutcome::Cancelled);
    assert_eq!(core.get(wf).unwrap().status, DataStatus::Processing);

    core.on_completion(shout, 1, 0, output(&[("text", json!("HI"))]), vec![]);
    let err = core.get(wf).unwrap().error.clone().unwrap();
    assert_eq!(err.kind, ErrorKind::StepFailed);
    assert!(err.message.contains(&format!("count ({count})")));
}

#[test]
fn step_running_an_unknown_process_fails_the_workflow() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();
    let broken = ProcessBuilder::workflow("broken")
        .step("first", "upper", json!({ "text": "a" }))
        .step("second", "does-not-exist", json!({}))
        .build();
    let mut core = core_with(settings, [upper_process(), broken]);

    let wf = core.submit(DataRequest::new("broken"), None).unwrap();
    let err = core.get(wf).unwrap().error.clone().unwrap();
    assert_eq!(err.kind, ErrorKind::Resolution);
    assert!(err.message.contains("step 'second'"), "{}", err.message);

    let first = core.get(wf + 1).unwrap();
    assert_eq!(first.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(core.dispatch_ready().is_empty());
    assert!(core.is_idle());
}

#[test]
fn finished_objects_beyond_the_retention_limit_are_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).retain_finished(2).build();
    let mut core = core_with(settings, [upper_process(), word_count_process()]);

    let a = core.submit(DataRequest::new("upper").input("text", "a"), None).unwrap();
    let b = core.submit(DataRequest::new("upper").input("text", "b"), None).unwrap();
    // `c` keeps `b` alive until it finishes.
    let c = core.submit(DataRequest::new("word-count").input("source", b), None).unwrap();

    core.dispatch_ready();
    core.on_completion(a, 1, 0, output(&[("text", json!("A"))]), vec![]);
    core.on_completion(b, 1, 0, output(&[("text", json!("B"))]), vec![]);
    assert_eq!(core.take_finished().len(), 2);

    let d = core.submit(DataRequest::new("upper").input("text", "d"), None).unwrap();
    core.dispatch_ready();
    core.on_completion(d, 1, 0, output(&[("text", json!("D"))]), vec![]);
    core.take_finished();

    // `a` is the oldest; `b` still has an unfinished dependent.
    assert!(core.get(a).is_none());
    assert!(core.get(b).is_some());
    assert_eq!(core.store().len(), 3);

    core.dispatch_ready();
    core.on_completion(c, 1, 0, output(&[("count", json!(1))]), vec![]);
    core.take_finished();

    assert!(core.get(b).is_none());
    assert!(core.get(c).is_some());
    assert!(core.get(d).is_some());
    assert!(core.cancel(a).is_err());
}

#[test]
fn steps_of_a_running_workflow_are_never_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).retain_finished(0).build();
    let pair = ProcessBuilder::workflow("pair")
        .step("left", "upper", json!({ "text": "a" }))
        .step("right", "upper", json!({ "text": "b" }))
        .build();
    let mut core = core_with(settings, [upper_process(), pair]);

    let wf = core.submit(DataRequest::new("pair"), None).unwrap();
    let (left, right) = (wf + 1, wf + 2);
    core.dispatch_ready();

    core.on_completion(left, 1, 0, output(&[("text", json!("A"))]), vec![]);
    core.take_finished();
    assert!(core.get(left).is_some());

    core.on_completion(right, 1, 0, output(&[("text", json!("B"))]), vec![]);
    let reported = core.take_finished();
    assert_eq!(reported.last().unwrap().status, DataStatus::Done);
    assert!(core.store().is_empty());
}

#[tokio::test]
async fn workflow_runs_through_the_runtime() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();

    let (tx, rx) = mpsc::channel(64);
    let core = CoreManager::new(
        Arc::new(settings),
        Arc::new(registry_of([
            upper_process(),
            word_count_process(),
            shout_and_count_workflow(),
        ])),
        ManagerOptions {
            exit_when_idle: false,
            channel_available: true,
        },
    );
    let executor = FakeExecutor::new(tx.clone(), FakeBehaviour::Hold);
    let log = executor.log();
    let runtime = tokio::spawn(Runtime::new(core, &tx, rx, executor).run());
    let handle = ManagerHandle::new(tx.clone(), policy_for(PermissionMode::Owner));

    let ana = Principal::user("ana");
    let wf = handle
        .create(&ana, DataRequest::new("shout-and-count").input("text", "hi"))
        .await
        .unwrap();
    let shout = wf + 1;
    wait_for_status(&tx, shout, DataStatus::Processing).await;

    // Steps belong to whoever submitted the workflow.
    assert_eq!(handle.status(&ana, shout).await.unwrap().owner.as_deref(), Some("ana"));

    assert_eq!(handle.cancel(&ana, wf).await.unwrap(), CancelOutcome::Terminating);
    wait_for_status(&tx, wf + 2, DataStatus::Error).await;
    assert_eq!(log.lock().unwrap().terminated, vec![shout]);

    tx.send(ManagerEvent::ShutdownRequested).await.unwrap();
    let core = with_timeout(runtime).await.unwrap().unwrap();
    assert_eq!(core.running(), 0);
    assert_eq!(log.lock().unwrap().launched.len(), 1);
}
