// src/exec/mod.rs

//! Execution engine adapter.
//!
//! - [`context`] describes one dispatch of a data object.
//! - [`mappings`] renders and prepares host directories for it.
//! - [`engine`] is the closed set of engines (`Docker`, `Local`) with
//!   launch, terminate and output collection.
//! - [`runner`] runs one execution and publishes its notification.
//! - [`executor_loop`] owns all running executions.
//! - [`backend`] is the seam the manager runtime talks to.

pub mod backend;
pub mod context;
pub mod engine;
pub mod executor_loop;
pub mod mappings;
pub mod runner;

pub use backend::{ExecutorBackend, RealExecutorBackend};
pub use context::ExecutionContext;
pub use engine::{CollectedOutput, EngineSet, ExecutionEngine, collect_output};
pub use executor_loop::{ExecRequest, spawn_executor};
pub use mappings::DirectoryMapping;
