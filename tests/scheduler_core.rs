// tests/scheduler_core.rs

mod common;

use serde_json::{Map, Value, json};

use flowmgr::data::{DataRequest, DataStatus, ErrorKind};
use flowmgr::engine::{CancelOutcome, LaunchFailureOutcome};
use flowmgr::errors::FlowError;
use flowmgr::notify::LaunchFailureKind;
use flowmgr_test_utils::builders::{ProcessBuilder, SettingsBuilder, core_with};

use crate::common::{align_process, reads_process, sleep_process};

fn fastq_output() -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("fastq".to_string(), json!("reads.fq"));
    out
}

#[test]
fn dependent_waits_in_created_until_its_input_is_done() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();
    let mut core = core_with(settings, [reads_process(), align_process()]);

    let reads = core.submit(DataRequest::new("reads"), None).unwrap();
    let align = core.create(DataRequest::new("align").input("reads", reads), None).unwrap();

    match core.enqueue(align) {
        Err(FlowError::UnresolvedInput { id, waiting_on }) => {
            assert_eq!(id, align);
            assert_eq!(waiting_on, vec![reads]);
        }
        other => panic!("expected UnresolvedInput, got {other:?}"),
    }
    assert_eq!(core.get(align).unwrap().status, DataStatus::Created);
    assert!(!core.is_idle());

    let launched = core.dispatch_ready();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].data_id, reads);

    assert!(core.on_completion(reads, 1, 0, fastq_output(), vec![]));

    let obj = core.get(align).unwrap();
    assert_eq!(obj.status, DataStatus::Waiting);
    assert_eq!(obj.command.as_deref(), Some("align reads.fq"));

    // Enqueueing it again by hand is accepted and changes nothing.
    core.enqueue(align).unwrap();
    assert_eq!(core.queued(), 1);
}

#[test]
fn failed_input_fails_the_whole_downstream_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();
    let mut core = core_with(settings, [reads_process(), align_process()]);

    let reads = core.submit(DataRequest::new("reads"), None).unwrap();
    let align = core.submit(DataRequest::new("align").input("reads", reads), None).unwrap();
    assert_eq!(core.get(align).unwrap().status, DataStatus::Created);

    core.dispatch_ready();
    core.on_completion(reads, 1, 2, Map::new(), vec!["boom".to_string()]);

    let failed = core.get(reads).unwrap();
    assert_eq!(failed.status, DataStatus::Error);
    let err = failed.error.as_ref().unwrap();
    assert_eq!(err.kind, ErrorKind::Execution);
    assert!(err.message.contains("exit code 2"));
    assert!(err.message.contains("boom"));

    let downstream = core.get(align).unwrap();
    assert_eq!(downstream.status, DataStatus::Error);
    assert_eq!(downstream.error.as_ref().unwrap().kind, ErrorKind::DependencyFailed);
    assert!(core.is_idle());

    // Submitting against an already failed input fails straight away.
    let late = core.submit(DataRequest::new("align").input("reads", reads), None).unwrap();
    assert_eq!(core.get(late).unwrap().status, DataStatus::Error);
}

#[test]
fn launch_is_retried_then_fails_and_frees_the_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path())
        .launch_retries(3)
        .max_concurrent(1)
        .build();
    let mut core = core_with(settings, [reads_process()]);

    let id = core.submit(DataRequest::new("reads"), None).unwrap();
    let next = core.submit(DataRequest::new("reads"), None).unwrap();
    assert_eq!(core.dispatch_ready()[0].attempt, 1);

    for attempt in 1..3 {
        match core.on_launch_failure(id, attempt, LaunchFailureKind::AfterDataDir, "image not found") {
            LaunchFailureOutcome::Retry { .. } => {}
            other => panic!("attempt {attempt}: expected retry, got {other:?}"),
        }
        let ctx = core.retry_launch(id).expect("retry context");
        assert_eq!(ctx.attempt, attempt + 1);
        assert!(ctx.owns_data_dir);
        assert_eq!(core.get(id).unwrap().status, DataStatus::Processing);
        assert_eq!(core.running(), 1);
    }

    assert_eq!(core.on_launch_failure(id, 3, LaunchFailureKind::AfterDataDir, "image not found"), LaunchFailureOutcome::Failed);
    let obj = core.get(id).unwrap();
    assert_eq!(obj.status, DataStatus::Error);
    assert_eq!(obj.error.as_ref().unwrap().kind, ErrorKind::Launch);
    assert_eq!(obj.launch_attempts, 3);
    assert_eq!(core.running(), 0);

    let launched = core.dispatch_ready();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].data_id, next);
}

#[test]
fn foreign_data_directory_is_not_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).launch_retries(3).build();
    let mut core = core_with(settings, [reads_process()]);

    let id = core.submit(DataRequest::new("reads"), None).unwrap();
    let ctx = core.dispatch_ready().pop().unwrap();
    assert!(!ctx.owns_data_dir);

    assert_eq!(
        core.on_launch_failure(id, 1, LaunchFailureKind::DataDirTaken, "data directory exists"),
        LaunchFailureOutcome::Failed
    );
    let obj = core.get(id).unwrap();
    assert_eq!(obj.status, DataStatus::Error);
    assert_eq!(obj.error.as_ref().unwrap().kind, ErrorKind::Launch);
    assert_eq!(obj.launch_attempts, 1);
    assert_eq!(core.running(), 0);
    assert!(core.retry_launch(id).is_none());
}

#[test]
fn retry_after_early_launch_failure_does_not_claim_the_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).launch_retries(2).build();
    let mut core = core_with(settings, [reads_process()]);

    let id = core.submit(DataRequest::new("reads"), None).unwrap();
    core.dispatch_ready();
    assert!(matches!(
        core.on_launch_failure(id, 1, LaunchFailureKind::Transient, "mkdir failed"),
        LaunchFailureOutcome::Retry { .. }
    ));
    assert!(!core.retry_launch(id).unwrap().owns_data_dir);
}

#[test]
fn global_limit_holds_back_the_third_object() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).max_concurrent(2).build();
    let mut core = core_with(settings, [sleep_process()]);

    let ids: Vec<_> = (0..3)
        .map(|_| core.submit(DataRequest::new("sleep").input("seconds", 1), None).unwrap())
        .collect();

    let launched = core.dispatch_ready();
    assert_eq!(launched.len(), 2);
    assert_eq!(core.running(), 2);
    assert_eq!(core.get(ids[2]).unwrap().status, DataStatus::Waiting);
    assert!(core.dispatch_ready().is_empty());

    core.on_completion(ids[0], 1, 0, Map::new(), vec![]);
    let launched = core.dispatch_ready();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].data_id, ids[2]);
}

#[test]
fn class_limit_applies_on_top_of_the_global_limit() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path())
        .max_concurrent(4)
        .class_limit("heavy", 1)
        .build();
    let heavy = ProcessBuilder::new("heavy", "true").resource_class("heavy").build();
    let light = ProcessBuilder::new("light", "true").build();
    let mut core = core_with(settings, [heavy, light]);

    let h1 = core.submit(DataRequest::new("heavy"), None).unwrap();
    let h2 = core.submit(DataRequest::new("heavy"), None).unwrap();
    let l1 = core.submit(DataRequest::new("light"), None).unwrap();

    let mut launched: Vec<_> = core.dispatch_ready().into_iter().map(|c| c.data_id).collect();
    launched.sort_unstable();
    assert_eq!(launched, vec![h1, l1]);
    assert_eq!(core.get(h2).unwrap().status, DataStatus::Waiting);
}

#[test]
fn higher_priority_is_dispatched_first_then_fifo() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).max_concurrent(1).build();
    let mut core = core_with(settings, [ProcessBuilder::new("p", "true").build()]);

    let low = core.submit(DataRequest::new("p"), None).unwrap();
    let high = core.submit(DataRequest::new("p").priority(10), None).unwrap();
    let low2 = core.submit(DataRequest::new("p"), None).unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let ctx = core.dispatch_ready().pop().unwrap();
        order.push(ctx.data_id);
        core.on_completion(ctx.data_id, ctx.attempt, 0, Map::new(), vec![]);
    }
    assert_eq!(order, vec![high, low, low2]);
}

#[test]
fn cancellation_depends_on_where_the_object_is() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).max_concurrent(1).build();
    let mut core = core_with(settings, [ProcessBuilder::new("p", "true").build()]);

    let running = core.submit(DataRequest::new("p"), None).unwrap();
    let waiting = core.submit(DataRequest::new("p"), None).unwrap();
    core.dispatch_ready();

    assert_eq!(core.cancel(waiting).unwrap(), CancelOutcome::Cancelled);
    assert_eq!(core.queued(), 0);

    assert_eq!(core.cancel(running).unwrap(), CancelOutcome::Terminating);
    assert_eq!(core.running(), 0);

    assert_eq!(
        core.cancel(running).unwrap(),
        CancelOutcome::AlreadyFinished(DataStatus::Error)
    );
    assert!(matches!(core.cancel(999), Err(FlowError::UnknownData(999))));
    assert!(core.is_idle());
}

#[test]
fn enqueue_after_dispatch_is_an_invalid_transition() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).build();
    let mut core = core_with(settings, [ProcessBuilder::new("p", "true").build()]);

    let id = core.submit(DataRequest::new("p"), None).unwrap();
    core.enqueue(id).unwrap();
    assert_eq!(core.queued(), 1);

    core.dispatch_ready();
    assert!(matches!(
        core.enqueue(id),
        Err(FlowError::InvalidTransition {
            from: DataStatus::Processing,
            ..
        })
    ));
}

#[test]
fn each_processing_object_gets_its_own_output_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = SettingsBuilder::new(tmp.path()).max_concurrent(3).build();
    let mut core = core_with(settings, [ProcessBuilder::new("p", "true").build()]);

    for _ in 0..3 {
        core.submit(DataRequest::new("p"), None).unwrap();
    }
    let launched = core.dispatch_ready();
    let mut dirs: Vec<_> = launched.iter().map(|c| c.output_dir.clone()).collect();
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), 3);
    assert!(dirs.iter().all(|d| d.starts_with(tmp.path().join("data"))));
}
