// src/engine/runtime.rs

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::data::{DataObject, DataStatus};
use crate::errors::Result;
use crate::exec::{ExecutionContext, ExecutorBackend};

use super::core::CoreManager;
use super::{CoreCommand, ManagerEvent};

/// Drives the manager core in response to `ManagerEvent`s and delegates
/// execution to an `ExecutorBackend`.
///
/// All manager semantics live in `CoreManager`; this shell only reads
/// events, runs the commands the core returns, and arms retry timers.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreManager,
    event_rx: mpsc::Receiver<ManagerEvent>,
    /// Weak so pending timers do not keep the event channel open forever.
    retry_tx: mpsc::WeakSender<ManagerEvent>,
    executor: E,
    results: Option<mpsc::Sender<DataObject>>,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(
        core: CoreManager,
        event_tx: &mpsc::Sender<ManagerEvent>,
        event_rx: mpsc::Receiver<ManagerEvent>,
        executor: E,
    ) -> Self {
        Self {
            core,
            event_rx,
            retry_tx: event_tx.downgrade(),
            executor,
            results: None,
        }
    }

    /// Also send every finished data object to `tx`.
    pub fn with_results(mut self, tx: mpsc::Sender<DataObject>) -> Self {
        self.results = Some(tx);
        self
    }

    /// Main event loop. Returns the core so callers can inspect final state.
    pub async fn run(mut self) -> Result<CoreManager> {
        info!("flowmgr runtime started");

        loop {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("manager event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            let step = self.core.step(event);

            for command in step.commands {
                self.execute_command(command).await?;
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        info!(
            data_objects = self.core.store().len(),
            running = self.core.running(),
            "runtime exiting"
        );
        Ok(self.core)
    }

    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::Launch(contexts) => self.launch(contexts).await?,
            CoreCommand::Terminate(id) => {
                debug!(data_id = id, "requesting termination");
                self.executor.terminate(id).await?;
            }
            CoreCommand::ScheduleRetry { id, delay } => self.schedule_retry(id, delay),
            CoreCommand::Finished(objects) => self.report(objects).await,
            CoreCommand::RequestExit => {
                info!("core issued RequestExit command");
            }
        }
        Ok(())
    }

    async fn launch(&mut self, contexts: Vec<ExecutionContext>) -> Result<()> {
        if contexts.is_empty() {
            return Ok(());
        }
        let ids: Vec<_> = contexts.iter().map(|c| c.data_id).collect();
        debug!(?ids, "launching executions");
        self.executor.launch_ready(contexts).await
    }

    fn schedule_retry(&self, id: u64, delay: std::time::Duration) {
        let Some(tx) = self.retry_tx.upgrade() else {
            warn!(data_id = id, "event channel closed; dropping launch retry");
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(ManagerEvent::RetryLaunch { id }).await.is_err() {
                debug!(data_id = id, "runtime gone before launch retry");
            }
        });
    }

    async fn report(&mut self, objects: Vec<DataObject>) {
        for object in objects {
            match object.status {
                DataStatus::Done => info!(data_id = object.id, process = %object.process, "finished"),
                _ => warn!(
                    data_id = object.id,
                    process = %object.process,
                    error = ?object.error,
                    "finished with error"
                ),
            }
            if let Some(tx) = &self.results {
                if tx.send(object).await.is_err() {
                    debug!("results receiver dropped");
                }
            }
        }
    }
}
