// src/engine/core.rs

//! Pure manager state machine.
//!
//! `CoreManager` consumes [`ManagerEvent`]s and returns [`CoreStep`]s that
//! describe what the IO shell should do next (launch, terminate, schedule a
//! retry, report results). It owns the data store, so it is the only writer
//! of data object state. It has no channels and performs no IO beyond
//! answering `oneshot` replies, which makes it easy to unit test.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::data::{DataId, DataObject, DataRequest, DataStatus, DataStore, ErrorKind};
use crate::engine::event_handlers::{
    CoreStep, handle_cancel, handle_channel_status, handle_close_submissions, handle_enqueue, handle_list,
    handle_notification, handle_query, handle_retry, handle_submit,
};
use crate::engine::limits::ConcurrencyLimits;
use crate::engine::queue::DispatchQueue;
use crate::engine::{ManagerEvent, ManagerOptions};
use crate::errors::{FlowError, Result};
use crate::exec::ExecutionContext;
use crate::expression::{ProcBinding, bind_inputs, data_dependencies, resolve, resolve_step_inputs};
use crate::notify::LaunchFailureKind;
use crate::process::{Process, ProcessRegistry};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The object had not started; it is now in `Error`.
    Cancelled,
    /// The object (or, for a workflow, some of its steps) was running; it
    /// is now in `Error` and those executions are being terminated.
    Terminating,
    /// Nothing to do.
    AlreadyFinished(DataStatus),
}

/// What the core decided after a failed launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailureOutcome {
    Retry { delay: Duration },
    Failed,
    /// Stale or duplicate notification.
    Ignored,
}

/// A workflow object in `Processing` and the steps it submitted.
#[derive(Debug, Default)]
struct WorkflowRun {
    /// Step name and data object, in submission order.
    steps: Vec<(String, DataId)>,
    /// Every step has been submitted.
    expanded: bool,
}

#[derive(Debug)]
pub struct CoreManager {
    settings: Arc<Settings>,
    registry: Arc<ProcessRegistry>,
    options: ManagerOptions,
    store: DataStore,
    queue: DispatchQueue,
    limits: ConcurrencyLimits,
    /// Planned executions of objects in `Waiting` or `Processing`.
    contexts: HashMap<DataId, ExecutionContext>,
    /// Objects left in `Created` because a dependency is not `Done` yet.
    parked: BTreeSet<DataId>,
    /// Objects that reached a terminal status since the last step.
    finished: Vec<DataId>,
    /// Running workflows by data id.
    workflows: HashMap<DataId, WorkflowRun>,
    /// Step data object -> the workflow that submitted it.
    step_of: HashMap<DataId, DataId>,
    /// Cancelled executions the IO shell still has to stop.
    terminating: Vec<DataId>,
    /// Reported terminal objects, oldest first.
    retained: VecDeque<DataId>,
    channel_available: bool,
    submissions_closed: bool,
}

impl CoreManager {
    pub fn new(settings: Arc<Settings>, registry: Arc<ProcessRegistry>, options: ManagerOptions) -> Self {
        Self::with_store(settings, registry, options, DataStore::new())
    }

    /// Use a pre-built store, e.g. one whose ids continue after existing
    /// data directories.
    pub fn with_store(
        settings: Arc<Settings>,
        registry: Arc<ProcessRegistry>,
        options: ManagerOptions,
        store: DataStore,
    ) -> Self {
        let limits = ConcurrencyLimits::from_settings(&settings.manager);
        Self {
            settings,
            registry,
            options,
            store,
            queue: DispatchQueue::new(),
            limits,
            contexts: HashMap::new(),
            parked: BTreeSet::new(),
            finished: Vec::new(),
            workflows: HashMap::new(),
            step_of: HashMap::new(),
            terminating: Vec::new(),
            retained: VecDeque::new(),
            channel_available: options.channel_available,
            submissions_closed: false,
        }
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn get(&self, id: DataId) -> Option<&DataObject> {
        self.store.get(id)
    }

    pub fn running(&self) -> usize {
        self.limits.running()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Create a data object in `Created` without enqueueing it.
    pub fn create(&mut self, request: DataRequest, owner: Option<String>) -> Result<DataId> {
        let process = self.registry.get(&request.process, request.version)?;
        let dependencies = data_dependencies(&process, &request.inputs);
        self.store
            .insert(&process, request.inputs, dependencies, owner, request.priority)
    }

    /// Create and enqueue.
    ///
    /// Failures that are recorded on the new object (unresolvable inputs,
    /// failed dependencies) still return its id; the object simply ends up
    /// parked or in `Error`.
    pub fn submit(&mut self, request: DataRequest, owner: Option<String>) -> Result<DataId> {
        let id = self.create(request, owner)?;
        self.enqueue_created(id)?;
        Ok(id)
    }

    fn enqueue_created(&mut self, id: DataId) -> Result<()> {
        match self.enqueue(id) {
            Ok(()) => {}
            Err(FlowError::UnresolvedInput { waiting_on, .. }) => {
                debug!(data_id = id, ?waiting_on, "parked until dependencies are done");
            }
            Err(e) if self.store.status_of(id) == Some(DataStatus::Error) => {
                debug!(data_id = id, error = %e, "data object failed on enqueue");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Resolve a `Created` object and put it on the dispatch queue.
    ///
    /// - Dependencies not yet `Done`: `UnresolvedInput`, the object stays
    ///   `Created` and is enqueued again automatically once they finish.
    /// - A dependency in `Error`: the object moves to `Error`.
    /// - Resolution failure: the object moves to `Error`.
    /// - Already `Waiting`: nothing to do.
    /// - A workflow goes straight to `Processing` and submits its steps.
    pub fn enqueue(&mut self, id: DataId) -> Result<()> {
        let object = self.store.get(id).ok_or(FlowError::UnknownData(id))?;
        if object.status == DataStatus::Waiting {
            // Already queued, e.g. automatically once its inputs finished.
            return Ok(());
        }
        if object.status != DataStatus::Created {
            return Err(FlowError::InvalidTransition {
                id,
                from: object.status,
                to: DataStatus::Resolving,
            });
        }

        let dependencies = object.dependencies.clone();

        let failed: Vec<DataId> = dependencies
            .iter()
            .copied()
            .filter(|d| self.store.status_of(*d) == Some(DataStatus::Error))
            .collect();
        if !failed.is_empty() {
            self.fail(
                id,
                ErrorKind::DependencyFailed,
                format!("input data objects {failed:?} failed"),
            );
            return Err(FlowError::DependencyFailed { id, failed });
        }

        let waiting_on: Vec<DataId> = dependencies
            .iter()
            .copied()
            .filter(|d| self.store.status_of(*d) != Some(DataStatus::Done))
            .collect();
        if !waiting_on.is_empty() {
            self.parked.insert(id);
            return Err(FlowError::UnresolvedInput { id, waiting_on });
        }

        self.parked.remove(&id);
        self.store.transition(id, DataStatus::Resolving)?;

        let process_ref = self.store.get(id).map(|o| o.process.clone()).ok_or(FlowError::UnknownData(id))?;
        let process = self.registry.get_ref(&process_ref)?;
        if process.is_workflow() {
            return self.expand_workflow(id, &process);
        }

        let ctx = match self.prepare(id) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.fail(id, ErrorKind::Resolution, e.to_string());
                return Err(e);
            }
        };

        self.store.set_command(id, ctx.command.clone())?;
        self.store.transition(id, DataStatus::Waiting)?;

        let (priority, class) = self
            .store
            .get(id)
            .map(|o| (o.priority, o.resource_class.clone()))
            .ok_or(FlowError::UnknownData(id))?;
        self.queue.push(id, priority, class);
        debug!(data_id = id, command = %ctx.command, "data object queued");
        self.contexts.insert(id, ctx);
        Ok(())
    }

    /// Submit one data object per step of workflow `id`.
    ///
    /// The workflow stays `Processing` without holding a concurrency slot
    /// until every step is terminal.
    fn expand_workflow(&mut self, id: DataId, process: &Process) -> Result<()> {
        let object = self.store.get(id).ok_or(FlowError::UnknownData(id))?;
        let owner = object.owner.clone();
        let outputs = self.store.outputs_of(&object.dependencies);
        let binding = ProcBinding {
            data_id: id,
            data_dir: String::new(),
        };
        let bound = match bind_inputs(process, &object.inputs, &outputs, &binding) {
            Ok(bound) => bound,
            Err(e) => {
                self.fail(id, ErrorKind::Resolution, e.to_string());
                return Err(e.into());
            }
        };

        self.store.transition(id, DataStatus::Waiting)?;
        self.store.transition(id, DataStatus::Processing)?;
        self.workflows.insert(id, WorkflowRun::default());

        let mut step_ids = HashMap::new();
        for step in &process.steps {
            let submitted = resolve_step_inputs(&step.inputs, &bound, &step_ids)
                .map_err(FlowError::from)
                .and_then(|inputs| {
                    let request = DataRequest {
                        process: step.run.clone(),
                        version: step.version,
                        inputs,
                        priority: None,
                    };
                    self.create(request, owner.clone())
                });
            let child = match submitted {
                Ok(child) => child,
                Err(e) => {
                    self.fail(id, ErrorKind::Resolution, format!("step '{}': {e}", step.id));
                    return Err(e);
                }
            };

            self.step_of.insert(child, id);
            if let Some(run) = self.workflows.get_mut(&id) {
                run.steps.push((step.id.clone(), child));
            }
            step_ids.insert(step.id.clone(), child);
            debug!(data_id = id, step = %step.id, step_data_id = child, "workflow step submitted");
            self.enqueue_created(child)?;
        }

        if let Some(run) = self.workflows.get_mut(&id) {
            run.expanded = true;
        }
        info!(data_id = id, steps = step_ids.len(), "workflow started");
        self.settle_workflow(id);
        Ok(())
    }

    /// How workflow `id` ended, once all of its steps are terminal.
    ///
    /// `Ok` carries the output (step name -> step data id), `Err` the failure
    /// message.
    fn workflow_outcome(&self, id: DataId) -> Option<std::result::Result<Map<String, Value>, String>> {
        let run = self.workflows.get(&id)?;
        if !run.expanded || self.store.status_of(id) != Some(DataStatus::Processing) {
            return None;
        }

        let mut failed = Vec::new();
        for (name, step) in &run.steps {
            match self.store.status_of(*step) {
                Some(DataStatus::Done) => {}
                Some(DataStatus::Error) => failed.push(format!("{name} ({step})")),
                _ => return None,
            }
        }

        if failed.is_empty() {
            Some(Ok(run
                .steps
                .iter()
                .map(|(name, step)| (name.clone(), Value::from(*step)))
                .collect()))
        } else {
            Some(Err(format!("workflow steps failed: {}", failed.join(", "))))
        }
    }

    /// Finish workflow `id` if all of its steps are terminal.
    fn settle_workflow(&mut self, id: DataId) {
        match self.workflow_outcome(id) {
            None => {}
            Some(Ok(output)) => {
                self.workflows.remove(&id);
                if let Err(e) = self.store.complete(id, output) {
                    error!(data_id = id, error = %e, "could not complete workflow");
                    return;
                }
                info!(data_id = id, "workflow done");
                self.after_done(id);
            }
            Some(Err(message)) => {
                self.fail(id, ErrorKind::StepFailed, message);
            }
        }
    }

    /// Plan the execution and resolve the command for `id`.
    fn prepare(&self, id: DataId) -> Result<ExecutionContext> {
        let object = self.store.get(id).ok_or(FlowError::UnknownData(id))?;
        let process = self.registry.get_ref(&object.process)?;

        let mut ctx = ExecutionContext::plan(&self.settings, &process, id)?;
        let outputs = self.store.outputs_of(&object.dependencies);
        let bound = bind_inputs(&process, &object.inputs, &outputs, &ctx.proc_binding())?;
        ctx.command = resolve(&process.command, &bound)?;
        Ok(ctx)
    }

    /// Move as many queued objects to `Processing` as the limits allow.
    ///
    /// Nothing is dispatched while the notification channel is down, since
    /// completions could not be delivered.
    pub fn dispatch_ready(&mut self) -> Vec<ExecutionContext> {
        let mut launched = Vec::new();

        if !self.channel_available {
            if !self.queue.is_empty() {
                debug!(queued = self.queue.len(), "notification channel unavailable; dispatch paused");
            }
            return launched;
        }

        while self.limits.has_global_capacity() {
            let limits = &self.limits;
            let Some((id, class)) = self.queue.pop_next(|c| limits.class_has_capacity(c)) else {
                break;
            };

            match self.start(id, &class) {
                Ok(ctx) => launched.push(ctx),
                Err(e) => {
                    error!(data_id = id, error = %e, "could not dispatch data object");
                    self.fail(id, ErrorKind::Launch, e.to_string());
                }
            }
        }

        launched
    }

    fn start(&mut self, id: DataId, class: &str) -> Result<ExecutionContext> {
        self.store.transition(id, DataStatus::Processing)?;
        self.limits.acquire(class);
        let attempt = self.store.record_launch_attempt(id)?;
        let ctx = self.contexts.get_mut(&id).ok_or(FlowError::UnknownData(id))?;
        ctx.attempt = attempt;
        info!(data_id = id, attempt, process = %ctx.process, "dispatching data object");
        Ok(ctx.clone())
    }

    /// Whether `attempt` is the live launch of a `Processing` object.
    fn is_current_attempt(&self, id: DataId, attempt: u32) -> bool {
        self.store
            .get(id)
            .map(|o| o.status == DataStatus::Processing && o.launch_attempts == attempt)
            .unwrap_or(false)
    }

    /// Apply a finished execution. Returns whether it was applied.
    ///
    /// Completions for objects no longer `Processing` (cancelled, already
    /// completed) or for an earlier attempt are ignored.
    pub fn on_completion(
        &mut self,
        id: DataId,
        attempt: u32,
        exit_code: i32,
        output: Map<String, Value>,
        diagnostics: Vec<String>,
    ) -> bool {
        if !self.is_current_attempt(id, attempt) {
            debug!(data_id = id, attempt, "ignoring stale completion");
            return false;
        }

        if let Err(e) = self.store.set_exit_code(id, exit_code) {
            error!(data_id = id, error = %e, "could not record exit code");
        }

        if exit_code != 0 {
            let tail = diagnostics.join("\n");
            let message = if tail.is_empty() {
                format!("exit code {exit_code}")
            } else {
                format!("exit code {exit_code}: {tail}")
            };
            self.fail(id, ErrorKind::Execution, message);
            return true;
        }

        let missing = self.missing_outputs(id, &output);
        if !missing.is_empty() {
            self.fail(
                id,
                ErrorKind::Execution,
                format!("required outputs not produced: {}", missing.join(", ")),
            );
            return true;
        }

        if let Some(class) = self.store.get(id).map(|o| o.resource_class.clone()) {
            self.limits.release(&class);
        }
        self.contexts.remove(&id);

        if let Err(e) = self.store.complete(id, output) {
            error!(data_id = id, error = %e, "could not complete data object");
            return false;
        }
        info!(data_id = id, "data object done");
        self.after_done(id);
        true
    }

    /// Report `id` and queue whatever was waiting on it.
    fn after_done(&mut self, id: DataId) {
        self.finished.push(id);

        let parked_dependents: Vec<DataId> = self
            .store
            .dependents_of(id)
            .iter()
            .copied()
            .filter(|d| self.parked.contains(d))
            .collect();
        for dependent in parked_dependents {
            match self.enqueue(dependent) {
                Ok(()) => debug!(data_id = dependent, "dependencies done; queued"),
                Err(e) => debug!(data_id = dependent, error = %e, "dependent not queued"),
            }
        }

        if let Some(workflow) = self.step_of.get(&id).copied() {
            self.settle_workflow(workflow);
        }
    }

    fn missing_outputs(&self, id: DataId, output: &Map<String, Value>) -> Vec<String> {
        let Some(process) = self
            .store
            .get(id)
            .and_then(|o| self.registry.get_ref(&o.process).ok())
        else {
            return Vec::new();
        };
        process
            .outputs
            .iter()
            .filter(|f| f.required && f.default.is_none() && !output.contains_key(&f.name))
            .map(|f| f.name.clone())
            .collect()
    }

    /// Decide what happens after launch attempt `attempt` failed.
    ///
    /// While attempts remain the object keeps its slot and stays
    /// `Processing`; the caller schedules [`CoreManager::retry_launch`] after
    /// the returned delay. A data directory the object does not own fails it
    /// straight away.
    pub fn on_launch_failure(
        &mut self,
        id: DataId,
        attempt: u32,
        kind: LaunchFailureKind,
        error: &str,
    ) -> LaunchFailureOutcome {
        if !self.is_current_attempt(id, attempt) {
            debug!(data_id = id, attempt, "ignoring stale launch failure");
            return LaunchFailureOutcome::Ignored;
        }

        if !kind.is_retryable() {
            self.fail(id, ErrorKind::Launch, format!("launch failed: {error}"));
            return LaunchFailureOutcome::Failed;
        }
        if kind == LaunchFailureKind::AfterDataDir {
            if let Some(ctx) = self.contexts.get_mut(&id) {
                ctx.owns_data_dir = true;
            }
        }

        let max = self.settings.manager.launch_retries;
        if attempt < max {
            let delay = self.settings.retry_delay(attempt);
            warn!(data_id = id, attempt, max, ?delay, %error, "launch failed; will retry");
            return LaunchFailureOutcome::Retry { delay };
        }

        self.fail(
            id,
            ErrorKind::Launch,
            format!("launch failed after {attempt} attempts: {error}"),
        );
        LaunchFailureOutcome::Failed
    }

    /// Next launch attempt for a `Processing` object, if it is still wanted.
    pub fn retry_launch(&mut self, id: DataId) -> Option<ExecutionContext> {
        if self.store.status_of(id) != Some(DataStatus::Processing) {
            debug!(data_id = id, "retry no longer needed");
            return None;
        }
        let attempt = self.store.record_launch_attempt(id).ok()?;
        let ctx = self.contexts.get_mut(&id)?;
        ctx.attempt = attempt;
        info!(data_id = id, attempt, "retrying launch");
        Some(ctx.clone())
    }

    /// Cancel `id`. A running execution still has to be terminated by the
    /// caller; anything it reports afterwards is ignored.
    pub fn cancel(&mut self, id: DataId) -> Result<CancelOutcome> {
        let status = self.store.status_of(id).ok_or(FlowError::UnknownData(id))?;
        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(status));
        }

        let stopped = self.fail(id, ErrorKind::Cancelled, "cancelled on request".to_string());
        if stopped.is_empty() {
            Ok(CancelOutcome::Cancelled)
        } else {
            self.terminating.extend(stopped);
            Ok(CancelOutcome::Terminating)
        }
    }

    /// Executions cancelled since the last call.
    pub fn take_terminations(&mut self) -> Vec<DataId> {
        std::mem::take(&mut self.terminating)
    }

    /// Move `id` to `Error` and fail everything downstream of it.
    ///
    /// Frees the queue entry or concurrency slot each object held. Failing
    /// a workflow cancels its unfinished steps; a failed step fails its
    /// workflow once the other steps are terminal. Returns the objects that
    /// were running an execution.
    fn fail(&mut self, id: DataId, kind: ErrorKind, message: String) -> Vec<DataId> {
        let mut pending = VecDeque::from([(id, kind, message)]);
        let mut stopped = Vec::new();

        while let Some((id, kind, message)) = pending.pop_front() {
            let Some(object) = self.store.get(id) else {
                continue;
            };
            let status = object.status;
            let class = object.resource_class.clone();

            match self.store.fail(id, kind, message.clone()) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(data_id = id, error = %e, "could not record failure");
                    continue;
                }
            }

            let workflow = self.workflows.remove(&id);
            match status {
                DataStatus::Waiting => {
                    self.queue.remove(id);
                }
                DataStatus::Processing if workflow.is_none() => {
                    self.limits.release(&class);
                    stopped.push(id);
                }
                _ => {}
            }

            self.parked.remove(&id);
            self.contexts.remove(&id);
            warn!(data_id = id, ?kind, %message, "data object failed");
            self.finished.push(id);

            for dependent in self.store.dependents_of(id) {
                pending.push_back((
                    *dependent,
                    ErrorKind::DependencyFailed,
                    format!("input data object {id} failed"),
                ));
            }

            for (_, step) in workflow.map(|run| run.steps).unwrap_or_default() {
                pending.push_back((step, ErrorKind::Cancelled, format!("workflow {id} failed")));
            }

            if let Some(parent) = self.step_of.get(&id).copied() {
                if let Some(Err(message)) = self.workflow_outcome(parent) {
                    pending.push_back((parent, ErrorKind::StepFailed, message));
                }
            }
        }

        stopped
    }

    pub fn set_channel_available(&mut self, available: bool) {
        if self.channel_available != available {
            info!(available, "notification channel status changed");
        }
        self.channel_available = available;
    }

    pub fn close_submissions(&mut self) {
        self.submissions_closed = true;
    }

    /// Objects that became terminal since the last call.
    ///
    /// Once reported they count towards `[manager].retain_finished`; the
    /// oldest beyond that limit are dropped from the store.
    pub fn take_finished(&mut self) -> Vec<DataObject> {
        let finished: Vec<DataObject> = std::mem::take(&mut self.finished)
            .into_iter()
            .filter_map(|id| self.store.get(id).cloned())
            .collect();
        self.retained.extend(finished.iter().map(|o| o.id));
        self.evict_retained();
        finished
    }

    /// Drop the oldest reported objects beyond the retention limit.
    ///
    /// Objects with an unfinished dependent, and steps of a running
    /// workflow, are kept until that changes.
    fn evict_retained(&mut self) {
        let limit = self.settings.manager.retain_finished;
        let mut excess = self.retained.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }

        let mut kept = VecDeque::with_capacity(self.retained.len());
        while let Some(id) = self.retained.pop_front() {
            if excess > 0 && self.can_evict(id) {
                self.store.evict(id);
                self.step_of.remove(&id);
                excess -= 1;
            } else {
                kept.push_back(id);
            }
        }
        self.retained = kept;
    }

    fn can_evict(&self, id: DataId) -> bool {
        let dependents_finished = self
            .store
            .dependents_of(id)
            .iter()
            .all(|d| self.store.status_of(*d).is_none_or(DataStatus::is_terminal));
        let in_running_workflow = self
            .step_of
            .get(&id)
            .is_some_and(|workflow| self.workflows.contains_key(workflow));
        dependents_finished && !in_running_workflow
    }

    /// Nothing running, queued or parked.
    pub fn is_idle(&self) -> bool {
        self.limits.running() == 0 && self.queue.is_empty() && self.parked.is_empty()
    }

    pub fn should_exit(&self) -> bool {
        self.options.exit_when_idle && self.submissions_closed && self.is_idle()
    }

    /// Handle a single event, returning the commands for the IO shell.
    pub fn step(&mut self, event: ManagerEvent) -> CoreStep {
        match event {
            ManagerEvent::Submit { request, owner, reply } => handle_submit(self, request, owner, reply),
            ManagerEvent::Enqueue { id, reply } => handle_enqueue(self, id, reply),
            ManagerEvent::Notified(notification) => handle_notification(self, notification),
            ManagerEvent::RetryLaunch { id } => handle_retry(self, id),
            ManagerEvent::Cancel { id, reply } => handle_cancel(self, id, reply),
            ManagerEvent::Query { id, reply } => handle_query(self, id, reply),
            ManagerEvent::List { reply } => handle_list(self, reply),
            ManagerEvent::ChannelStatus { available } => handle_channel_status(self, available),
            ManagerEvent::CloseSubmissions => handle_close_submissions(self),
            ManagerEvent::ShutdownRequested => CoreStep {
                commands: Vec::new(),
                keep_running: false,
            },
        }
    }
}
