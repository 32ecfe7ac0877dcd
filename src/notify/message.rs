// src/notify/message.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::DataId;
use crate::errors::Result;

/// Typed message sent from an execution back to the manager.
///
/// `attempt` identifies which launch of the data object this is about, so
/// the manager can drop stale or duplicated deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// The command ran to completion (successfully or not).
    Finished {
        data_id: DataId,
        attempt: u32,
        exit_code: i32,
        #[serde(default)]
        output: Map<String, Value>,
        /// Trailing non-JSON output lines, kept for error reports.
        #[serde(default)]
        diagnostics: Vec<String>,
    },
    /// The engine could not start the command.
    LaunchFailed {
        data_id: DataId,
        attempt: u32,
        error: String,
        #[serde(default)]
        kind: LaunchFailureKind,
    },
}

/// How far a failed launch got, which decides what a retry may do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchFailureKind {
    /// Nothing was set up for the data object.
    #[default]
    Transient,
    /// The data directory was created by this attempt before the failure;
    /// the next attempt may reuse it.
    AfterDataDir,
    /// The data directory already existed and was not created by this data
    /// object. Retrying cannot help.
    DataDirTaken,
}

impl LaunchFailureKind {
    pub fn is_retryable(self) -> bool {
        self != LaunchFailureKind::DataDirTaken
    }
}

impl Notification {
    pub fn data_id(&self) -> DataId {
        match self {
            Notification::Finished { data_id, .. } | Notification::LaunchFailed { data_id, .. } => *data_id,
        }
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
