// src/exec/runner.rs

//! Runs a single execution to completion and reports back.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::errors::FlowError;
use crate::exec::context::ExecutionContext;
use crate::exec::engine::{CollectedOutput, DIAGNOSTIC_TAIL, ExecutionEngine, collect_output, for_each_line};
use crate::exec::mappings::apply_mappings;
use crate::notify::{LaunchFailureKind, Notification, NotificationPublisher};

/// Launch `ctx` on `engine` and publish how it ended.
///
/// - A launch error is published as `LaunchFailed`, saying whether the data
///   directory had been created by then.
/// - A process that exits (with any code) is published as `Finished`.
/// - If `cancel_rx` fires first the execution is terminated and nothing is
///   published; the manager already recorded the cancellation.
pub async fn run_execution(
    engine: ExecutionEngine,
    ctx: ExecutionContext,
    publisher: NotificationPublisher,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let data_id = ctx.data_id;
    let attempt = ctx.attempt;

    info!(
        data_id,
        attempt,
        process = %ctx.process,
        engine = %engine.kind(),
        cmd = %ctx.command,
        "starting execution"
    );

    if let Err(e) = apply_mappings(&ctx.mappings, ctx.owns_data_dir).await {
        let kind = match &e {
            FlowError::DataDirTaken(_) => LaunchFailureKind::DataDirTaken,
            _ => LaunchFailureKind::Transient,
        };
        report_launch_failure(&publisher, &ctx, e, kind).await;
        return;
    }

    let mut child = match engine.spawn(&ctx) {
        Ok(child) => child,
        Err(e) => {
            report_launch_failure(&publisher, &ctx, e, LaunchFailureKind::AfterDataDir).await;
            return;
        }
    };

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(collect_output(data_id, out)));

    let stderr_task = child.stderr.take().map(|err| {
        tokio::spawn(async move {
            let mut tail = VecDeque::new();
            for_each_line(data_id, err, |line| {
                debug!(data_id, "stderr: {}", line);
                if tail.len() == DIAGNOSTIC_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            })
            .await;
            tail
        })
    });

    tokio::select! {
        status_res = child.wait() => {
            let exit_code = match status_res {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    error!(data_id, attempt, error = %e, "waiting for execution failed");
                    -1
                }
            };

            let mut collected = match stdout_task {
                Some(task) => task.await.unwrap_or_default(),
                None => CollectedOutput::default(),
            };
            if let Some(task) = stderr_task {
                for line in task.await.unwrap_or_default() {
                    collected.push_diagnostic(line);
                }
            }

            info!(data_id, attempt, exit_code, "execution exited");

            publish(
                &publisher,
                Notification::Finished {
                    data_id,
                    attempt,
                    exit_code,
                    output: collected.output,
                    diagnostics: collected.diagnostics.into_iter().collect(),
                },
            )
            .await;
        }

        Ok(()) = &mut cancel_rx => {
            info!(data_id, attempt, "cancellation requested; terminating execution");
            engine.terminate(&ctx, &mut child).await;
        }
    }
}

async fn report_launch_failure(
    publisher: &NotificationPublisher,
    ctx: &ExecutionContext,
    error: FlowError,
    kind: LaunchFailureKind,
) {
    warn!(data_id = ctx.data_id, attempt = ctx.attempt, error = %error, ?kind, "launch failed");
    publish(
        publisher,
        Notification::LaunchFailed {
            data_id: ctx.data_id,
            attempt: ctx.attempt,
            error: error.to_string(),
            kind,
        },
    )
    .await;
}

async fn publish(publisher: &NotificationPublisher, notification: Notification) {
    let data_id = notification.data_id();
    if let Err(e) = publisher.publish(notification).await {
        error!(data_id, error = %e, "could not deliver completion notification");
    }
}
