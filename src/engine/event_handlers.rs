// src/engine/event_handlers.rs

//! Event handling logic for the manager core.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::data::{DataId, DataObject, DataRequest};
use crate::engine::core::{CancelOutcome, CoreManager, LaunchFailureOutcome};
use crate::errors::Result;
use crate::exec::ExecutionContext;
use crate::notify::Notification;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Hand these executions to the executor.
    Launch(Vec<ExecutionContext>),
    /// Stop the running execution of a data object.
    Terminate(DataId),
    /// Feed `RetryLaunch { id }` back in after `delay`.
    ScheduleRetry { id: DataId, delay: Duration },
    /// These objects reached `Done` or `Error`.
    Finished(Vec<DataObject>),
    /// Request that the process exits (used for `--once` when idle).
    RequestExit,
}

/// Decision returned by the core after handling a single `ManagerEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub fn idle() -> Self {
        Self {
            commands: Vec::new(),
            keep_running: true,
        }
    }
}

fn respond<T>(reply: Option<oneshot::Sender<T>>, value: T) {
    if let Some(tx) = reply {
        if tx.send(value).is_err() {
            debug!("reply receiver dropped");
        }
    }
}

pub fn handle_submit(
    core: &mut CoreManager,
    request: DataRequest,
    owner: Option<String>,
    reply: Option<oneshot::Sender<Result<DataId>>>,
) -> CoreStep {
    let process = request.process.clone();
    let result = core.submit(request, owner);
    if let Err(ref e) = result {
        warn!(%process, error = %e, "submission rejected");
    }
    respond(reply, result);
    settle(core, Vec::new())
}

pub fn handle_enqueue(
    core: &mut CoreManager,
    id: DataId,
    reply: Option<oneshot::Sender<Result<()>>>,
) -> CoreStep {
    let result = core.enqueue(id);
    if let Err(ref e) = result {
        debug!(data_id = id, error = %e, "enqueue did not queue the data object");
    }
    respond(reply, result);
    settle(core, Vec::new())
}

pub fn handle_notification(core: &mut CoreManager, notification: Notification) -> CoreStep {
    let mut commands = Vec::new();

    match notification {
        Notification::Finished {
            data_id,
            attempt,
            exit_code,
            output,
            diagnostics,
        } => {
            core.on_completion(data_id, attempt, exit_code, output, diagnostics);
        }
        Notification::LaunchFailed {
            data_id,
            attempt,
            error,
            kind,
        } => {
            if let LaunchFailureOutcome::Retry { delay } = core.on_launch_failure(data_id, attempt, kind, &error) {
                commands.push(CoreCommand::ScheduleRetry { id: data_id, delay });
            }
        }
    }

    settle(core, commands)
}

pub fn handle_retry(core: &mut CoreManager, id: DataId) -> CoreStep {
    let mut commands = Vec::new();
    if let Some(ctx) = core.retry_launch(id) {
        commands.push(CoreCommand::Launch(vec![ctx]));
    }
    settle(core, commands)
}

pub fn handle_cancel(
    core: &mut CoreManager,
    id: DataId,
    reply: Option<oneshot::Sender<Result<CancelOutcome>>>,
) -> CoreStep {
    let result = core.cancel(id);
    if let Ok(CancelOutcome::Terminating) = result {
        debug!(data_id = id, "cancelled while running");
    }
    respond(reply, result);
    settle(core, Vec::new())
}

pub fn handle_query(core: &CoreManager, id: DataId, reply: oneshot::Sender<Option<DataObject>>) -> CoreStep {
    respond(Some(reply), core.get(id).cloned());
    CoreStep::idle()
}

pub fn handle_list(core: &CoreManager, reply: oneshot::Sender<Vec<DataObject>>) -> CoreStep {
    respond(Some(reply), core.store().iter().cloned().collect());
    CoreStep::idle()
}

pub fn handle_channel_status(core: &mut CoreManager, available: bool) -> CoreStep {
    core.set_channel_available(available);
    settle(core, Vec::new())
}

pub fn handle_close_submissions(core: &mut CoreManager) -> CoreStep {
    core.close_submissions();
    settle(core, Vec::new())
}

/// Common tail of every state-changing event: stop cancelled executions,
/// dispatch whatever became runnable, report finished objects, and decide
/// whether to exit.
fn settle(core: &mut CoreManager, mut commands: Vec<CoreCommand>) -> CoreStep {
    commands.extend(core.take_terminations().into_iter().map(CoreCommand::Terminate));

    let ready = core.dispatch_ready();
    if !ready.is_empty() {
        commands.push(CoreCommand::Launch(ready));
    }

    let finished = core.take_finished();
    if !finished.is_empty() {
        commands.push(CoreCommand::Finished(finished));
    }

    let keep_running = !core.should_exit();
    if !keep_running {
        commands.push(CoreCommand::RequestExit);
    }

    CoreStep {
        commands,
        keep_running,
    }
}
