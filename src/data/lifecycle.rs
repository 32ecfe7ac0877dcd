// src/data/lifecycle.rs

//! Data object state machine.
//!
//! ```text
//! Created -> Resolving -> Waiting -> Processing -> Done
//!    \           \           \           \
//!     `-----------`-----------`-----------`--> Error
//! ```
//!
//! Status only ever moves forward. `Done` and `Error` are terminal.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStatus {
    /// Registered, inputs not yet bound.
    Created,
    /// Inputs are being bound into the command.
    Resolving,
    /// Queued; dependencies satisfied.
    Waiting,
    /// Dispatched to an execution engine.
    Processing,
    Done,
    Error,
}

impl DataStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DataStatus::Done | DataStatus::Error)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: DataStatus) -> bool {
        use DataStatus::*;
        match (self, to) {
            (Created, Resolving) | (Resolving, Waiting) | (Waiting, Processing) | (Processing, Done) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}
