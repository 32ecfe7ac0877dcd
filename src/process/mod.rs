// src/process/mod.rs

//! Process definitions.
//!
//! - [`model`] holds the immutable `Process` type and its TOML form.
//! - [`registry`] indexes processes by `(slug, version)`.
//! - [`finder`] discovers definition files on disk.

pub mod finder;
pub mod model;
pub mod registry;

pub use finder::{FileSystemFinder, ProcessFinder};
pub use model::{FieldSchema, FieldType, Process, ProcessRef, ProcessVersion, WorkflowStep};
pub use registry::ProcessRegistry;
