// src/data/model.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::lifecycle::DataStatus;
use crate::process::{ProcessRef, ProcessVersion};

/// Identifier of a data object. Assigned in creation order, starting at 1.
pub type DataId = u64;

/// Category of a terminal failure recorded on a data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Inputs could not be bound into the command.
    Resolution,
    /// The engine could not start the execution.
    Launch,
    /// The command ran and failed.
    Execution,
    /// An input data object ended in error.
    DependencyFailed,
    /// Cancelled on request.
    Cancelled,
    /// A step of the workflow ended in error.
    StepFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One invocation of a process with bound input values.
#[derive(Debug, Clone, Serialize)]
pub struct DataObject {
    pub id: DataId,
    pub process: ProcessRef,
    pub owner: Option<String>,
    pub inputs: Map<String, Value>,
    pub status: DataStatus,
    pub priority: i32,
    pub resource_class: String,
    /// Data objects whose outputs feed this one.
    pub dependencies: Vec<DataId>,
    /// Resolved command, once past `Resolving`.
    pub command: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Map<String, Value>,
    pub exit_code: Option<i32>,
    pub error: Option<DataError>,
    pub launch_attempts: u32,
    /// Every status this object has been in, in order.
    pub history: Vec<DataStatus>,
}

/// Request to create a data object.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DataRequest {
    /// Process slug.
    pub process: String,
    /// Exact version; the latest registered version when omitted.
    #[serde(default, deserialize_with = "deserialize_version")]
    pub version: Option<ProcessVersion>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Overrides the process's priority.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl DataRequest {
    pub fn new(process: impl Into<String>) -> Self {
        Self {
            process: process.into(),
            version: None,
            inputs: Map::new(),
            priority: None,
        }
    }

    pub fn input(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.to_string(), value.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn version(mut self, version: ProcessVersion) -> Self {
        self.version = Some(version);
        self
    }
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<ProcessVersion>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}
