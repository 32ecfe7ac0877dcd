// src/config/mod.rs

//! Settings loading and validation.
//!
//! - [`model`] defines the TOML-backed data model.
//! - [`loader`] reads a file from disk and applies environment overrides.
//! - [`validate`] turns `RawSettings` into immutable `Settings`.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ApiSection, ExecutorSection, ManagerSection, MappingSection, MappingTemplate,
    ProcessesSection, RawSettings, RedisSection, Settings,
};
