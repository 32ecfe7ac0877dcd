use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use flowmgr::data::DataId;
use flowmgr::engine::ManagerEvent;
use flowmgr::errors::Result;
use flowmgr::exec::{ExecutionContext, ExecutorBackend};
use flowmgr::notify::{LaunchFailureKind, Notification};

/// How the fake reacts to a launch.
#[derive(Debug, Clone)]
pub enum FakeBehaviour {
    /// Report `Finished` with exit code 0 and this output.
    Succeed(Map<String, Value>),
    /// Report `Finished` with this exit code.
    Exit(i32),
    /// Report `LaunchFailed`.
    FailLaunch,
    /// Report nothing; the test delivers notifications itself.
    Hold,
}

/// Everything the fake was asked to do.
#[derive(Debug, Default)]
pub struct FakeLog {
    pub launched: Vec<ExecutionContext>,
    pub terminated: Vec<DataId>,
}

/// A fake executor that records launches and reports completions straight
/// back to the manager as `ManagerEvent::Notified`.
pub struct FakeExecutor {
    manager_tx: mpsc::Sender<ManagerEvent>,
    log: Arc<Mutex<FakeLog>>,
    behaviour: FakeBehaviour,
}

impl FakeExecutor {
    pub fn new(manager_tx: mpsc::Sender<ManagerEvent>, behaviour: FakeBehaviour) -> Self {
        Self {
            manager_tx,
            log: Arc::new(Mutex::new(FakeLog::default())),
            behaviour,
        }
    }

    pub fn log(&self) -> Arc<Mutex<FakeLog>> {
        Arc::clone(&self.log)
    }
}

impl ExecutorBackend for FakeExecutor {
    fn launch_ready(
        &mut self,
        contexts: Vec<ExecutionContext>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.manager_tx.clone();
        let log = Arc::clone(&self.log);
        let behaviour = self.behaviour.clone();

        Box::pin(async move {
            for ctx in contexts {
                let notification = match &behaviour {
                    FakeBehaviour::Succeed(output) => Some(Notification::Finished {
                        data_id: ctx.data_id,
                        attempt: ctx.attempt,
                        exit_code: 0,
                        output: output.clone(),
                        diagnostics: Vec::new(),
                    }),
                    FakeBehaviour::Exit(code) => Some(Notification::Finished {
                        data_id: ctx.data_id,
                        attempt: ctx.attempt,
                        exit_code: *code,
                        output: Map::new(),
                        diagnostics: vec![format!("exited with {code}")],
                    }),
                    FakeBehaviour::FailLaunch => Some(Notification::LaunchFailed {
                        data_id: ctx.data_id,
                        attempt: ctx.attempt,
                        error: "fake launch failure".to_string(),
                        kind: LaunchFailureKind::Transient,
                    }),
                    FakeBehaviour::Hold => None,
                };

                log.lock().unwrap().launched.push(ctx);

                // Sent from a separate task: the runtime is busy awaiting this
                // future and must not block on its own event channel.
                if let Some(n) = notification {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(ManagerEvent::Notified(n)).await;
                    });
                }
            }
            Ok(())
        })
    }

    fn terminate(&mut self, id: DataId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let log = Arc::clone(&self.log);
        Box::pin(async move {
            log.lock().unwrap().terminated.push(id);
            Ok(())
        })
    }
}
