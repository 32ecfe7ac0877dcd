// src/data/mod.rs

//! Data objects and their lifecycle.
//!
//! - [`model`] defines `DataObject` and creation requests.
//! - [`lifecycle`] defines the forward-only status state machine.
//! - [`store`] owns all data objects and is the only place status changes.

pub mod lifecycle;
pub mod model;
pub mod store;

pub use lifecycle::DataStatus;
pub use model::{DataError, DataId, DataObject, DataRequest, ErrorKind};
pub use store::DataStore;
