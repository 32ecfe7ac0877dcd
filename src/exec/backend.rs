// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` rather than to the executor
//! loop directly, so tests can substitute a fake that never spawns a
//! process and reports completions straight back as manager events.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::data::DataId;
use crate::errors::{Error, Result};
use crate::exec::context::ExecutionContext;
use crate::exec::engine::EngineSet;
use crate::exec::executor_loop::{ExecRequest, spawn_executor};
use crate::notify::NotificationPublisher;

pub trait ExecutorBackend: Send {
    /// Start executions for the given contexts.
    fn launch_ready(
        &mut self,
        contexts: Vec<ExecutionContext>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask for the execution of `id` to be stopped. The effect is eventual.
    fn terminate(&mut self, id: DataId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Backend that runs commands through the configured engines.
pub struct RealExecutorBackend {
    tx: mpsc::Sender<ExecRequest>,
}

impl RealExecutorBackend {
    /// Spawns the background executor loop immediately.
    pub fn new(engines: EngineSet, publisher: NotificationPublisher) -> Self {
        Self {
            tx: spawn_executor(engines, publisher),
        }
    }
}

impl ExecutorBackend for RealExecutorBackend {
    fn launch_ready(
        &mut self,
        contexts: Vec<ExecutionContext>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.tx.clone();

        Box::pin(async move {
            for ctx in contexts {
                tx.send(ExecRequest::Launch(ctx)).await.map_err(Error::from)?;
            }
            Ok(())
        })
    }

    fn terminate(&mut self, id: DataId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.tx.clone();

        Box::pin(async move {
            tx.send(ExecRequest::Terminate(id)).await.map_err(Error::from)?;
            Ok(())
        })
    }
}
