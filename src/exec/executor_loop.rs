// src/exec/executor_loop.rs

//! Background loop owning every running execution.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::data::DataId;
use crate::exec::context::ExecutionContext;
use crate::exec::engine::EngineSet;
use crate::exec::runner::run_execution;
use crate::notify::{LaunchFailureKind, Notification, NotificationPublisher};

/// Work sent to the executor loop.
#[derive(Debug, Clone)]
pub enum ExecRequest {
    Launch(ExecutionContext),
    Terminate(DataId),
}

struct ActiveRun {
    output_dir: PathBuf,
    cancel: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

/// Spawn the executor loop and return its request sender.
///
/// Per data id there is never more than one running execution, and no two
/// running executions share a writable data directory. A conflicting launch
/// is reported back as `LaunchFailed` rather than started.
pub fn spawn_executor(engines: EngineSet, publisher: NotificationPublisher) -> mpsc::Sender<ExecRequest> {
    let (tx, mut rx) = mpsc::channel::<ExecRequest>(64);

    tokio::spawn(async move {
        info!("executor loop started");

        let mut active: HashMap<DataId, ActiveRun> = HashMap::new();

        while let Some(request) = rx.recv().await {
            active.retain(|_, run| !run.handle.is_finished());

            match request {
                ExecRequest::Launch(ctx) => handle_launch(ctx, &engines, &publisher, &mut active).await,
                ExecRequest::Terminate(id) => handle_terminate(id, &mut active),
            }
        }

        info!("executor loop finished (channel closed)");
    });

    tx
}

async fn handle_launch(
    ctx: ExecutionContext,
    engines: &EngineSet,
    publisher: &NotificationPublisher,
    active: &mut HashMap<DataId, ActiveRun>,
) {
    let Some(engine) = engines.get(ctx.engine).cloned() else {
        let reason = format!("engine {} cannot run a command", ctx.engine);
        refuse(&ctx, reason, publisher).await;
        return;
    };
    if let Some(reason) = conflict(&ctx, active) {
        refuse(&ctx, reason, publisher).await;
        return;
    }

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let data_id = ctx.data_id;
    let output_dir = ctx.output_dir.clone();
    let publisher = publisher.clone();

    let handle = tokio::spawn(async move {
        run_execution(engine, ctx, publisher, cancel_rx).await;
        debug!(data_id, "execution runner finished");
    });

    active.insert(
        data_id,
        ActiveRun {
            output_dir,
            cancel: Some(cancel_tx),
            handle,
        },
    );
}

fn conflict(ctx: &ExecutionContext, active: &HashMap<DataId, ActiveRun>) -> Option<String> {
    if active.contains_key(&ctx.data_id) {
        return Some(format!("data object {} is already running", ctx.data_id));
    }
    active
        .iter()
        .find(|(_, run)| run.output_dir == ctx.output_dir)
        .map(|(other, _)| {
            format!(
                "data directory {} is held by data object {other}",
                ctx.output_dir.display()
            )
        })
}

async fn refuse(ctx: &ExecutionContext, reason: String, publisher: &NotificationPublisher) {
    error!(data_id = ctx.data_id, attempt = ctx.attempt, %reason, "refusing launch");
    let notification = Notification::LaunchFailed {
        data_id: ctx.data_id,
        attempt: ctx.attempt,
        error: reason,
        kind: LaunchFailureKind::Transient,
    };
    if let Err(e) = publisher.publish(notification).await {
        error!(data_id = ctx.data_id, error = %e, "could not report refused launch");
    }
}

fn handle_terminate(id: DataId, active: &mut HashMap<DataId, ActiveRun>) {
    let Some(run) = active.get_mut(&id) else {
        debug!(data_id = id, "terminate requested for an execution that is not running");
        return;
    };

    match run.cancel.take() {
        Some(cancel) => {
            info!(data_id = id, "terminating execution");
            if cancel.send(()).is_err() {
                debug!(data_id = id, "execution already finished while terminating");
            }
        }
        None => debug!(data_id = id, "execution already being terminated"),
    }
}
