// src/data/store.rs

//! Owner of every data object's mutable state.
//!
//! All status changes go through [`DataStore::transition`]. The store is
//! owned by the manager core, which is the single writer, so concurrent
//! transition attempts on one id are serialized by construction.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use crate::data::lifecycle::DataStatus;
use crate::data::model::{DataError, DataId, DataObject, ErrorKind};
use crate::errors::{FlowError, Result};
use crate::process::Process;

#[derive(Debug, Default)]
pub struct DataStore {
    objects: BTreeMap<DataId, DataObject>,
    /// Reverse dependency edges: id -> data objects consuming its outputs.
    dependents: HashMap<DataId, Vec<DataId>>,
    last_id: DataId,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store whose first id is `last_id + 1`.
    pub fn starting_after(last_id: DataId) -> Self {
        Self {
            last_id,
            ..Self::default()
        }
    }

    /// Create a new object in `Created`. Dependencies must already exist.
    pub fn insert(
        &mut self,
        process: &Process,
        inputs: Map<String, Value>,
        dependencies: Vec<DataId>,
        owner: Option<String>,
        priority: Option<i32>,
    ) -> Result<DataId> {
        if let Some(missing) = dependencies.iter().find(|d| !self.objects.contains_key(d)) {
            return Err(FlowError::UnknownData(*missing));
        }

        self.last_id += 1;
        let id = self.last_id;

        for dep in &dependencies {
            self.dependents.entry(*dep).or_default().push(id);
        }

        let object = DataObject {
            id,
            process: process.process_ref(),
            owner,
            inputs,
            status: DataStatus::Created,
            priority: priority.unwrap_or(process.priority),
            resource_class: process.resource_class.clone(),
            dependencies,
            command: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: Map::new(),
            exit_code: None,
            error: None,
            launch_attempts: 0,
            history: vec![DataStatus::Created],
        };

        debug!(data_id = id, process = %object.process, "data object created");
        self.objects.insert(id, object);
        Ok(id)
    }

    pub fn get(&self, id: DataId) -> Option<&DataObject> {
        self.objects.get(&id)
    }

    pub fn status_of(&self, id: DataId) -> Option<DataStatus> {
        self.objects.get(&id).map(|o| o.status)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataObject> {
        self.objects.values()
    }

    /// Data objects that list `id` among their dependencies.
    pub fn dependents_of(&self, id: DataId) -> &[DataId] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Move `id` to `to`, enforcing the forward-only state machine.
    ///
    /// Returns the previous status.
    pub fn transition(&mut self, id: DataId, to: DataStatus) -> Result<DataStatus> {
        let object = self.objects.get_mut(&id).ok_or(FlowError::UnknownData(id))?;
        let from = object.status;

        if !from.can_transition_to(to) {
            return Err(FlowError::InvalidTransition { id, from, to });
        }

        object.status = to;
        object.history.push(to);
        match to {
            DataStatus::Processing => object.started_at = Some(Utc::now()),
            DataStatus::Done | DataStatus::Error => object.finished_at = Some(Utc::now()),
            _ => {}
        }

        debug!(data_id = id, ?from, ?to, "data object transition");
        Ok(from)
    }

    /// Move `id` to `Error`, recording why. Already-terminal objects are left
    /// untouched and `false` is returned.
    pub fn fail(&mut self, id: DataId, kind: ErrorKind, message: impl Into<String>) -> Result<bool> {
        match self.status_of(id) {
            None => return Err(FlowError::UnknownData(id)),
            Some(s) if s.is_terminal() => return Ok(false),
            Some(_) => {}
        }
        self.transition(id, DataStatus::Error)?;
        if let Some(object) = self.objects.get_mut(&id) {
            object.error = Some(DataError {
                kind,
                message: message.into(),
            });
        }
        Ok(true)
    }

    /// `Processing -> Done`, recording outputs.
    pub fn complete(&mut self, id: DataId, output: Map<String, Value>) -> Result<()> {
        self.transition(id, DataStatus::Done)?;
        if let Some(object) = self.objects.get_mut(&id) {
            object.output = output;
        }
        Ok(())
    }

    pub fn set_exit_code(&mut self, id: DataId, exit_code: i32) -> Result<()> {
        let object = self.objects.get_mut(&id).ok_or(FlowError::UnknownData(id))?;
        object.exit_code = Some(exit_code);
        Ok(())
    }

    pub fn set_command(&mut self, id: DataId, command: String) -> Result<()> {
        let object = self.objects.get_mut(&id).ok_or(FlowError::UnknownData(id))?;
        object.command = Some(command);
        Ok(())
    }

    /// Count one more launch attempt, returning the new total.
    pub fn record_launch_attempt(&mut self, id: DataId) -> Result<u32> {
        let object = self.objects.get_mut(&id).ok_or(FlowError::UnknownData(id))?;
        object.launch_attempts += 1;
        Ok(object.launch_attempts)
    }

    /// Forget a terminal object. Returns it, or `None` if it is unknown or
    /// still active.
    pub fn evict(&mut self, id: DataId) -> Option<DataObject> {
        if !self.status_of(id)?.is_terminal() {
            return None;
        }
        let object = self.objects.remove(&id)?;
        self.dependents.remove(&id);
        for dep in &object.dependencies {
            if let Some(list) = self.dependents.get_mut(dep) {
                list.retain(|d| *d != id);
            }
        }
        debug!(data_id = id, "data object evicted");
        Some(object)
    }

    /// Outputs of the given dependencies, for binding `data` inputs.
    pub fn outputs_of(&self, ids: &[DataId]) -> HashMap<DataId, Map<String, Value>> {
        ids.iter()
            .filter_map(|id| self.objects.get(id).map(|o| (*id, o.output.clone())))
            .collect()
    }
}
