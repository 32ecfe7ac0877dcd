// src/expression/mod.rs

//! Expression resolution: turning a process's command template plus bound
//! input values into the concrete command string.

pub mod resolver;
pub mod template;

pub use resolver::{
    PROC_ROOT, ProcBinding, bind_inputs, data_dependencies, resolve, resolve_step_inputs, shell_quote, step_ref,
};
pub use template::{Filter, Segment, Template};
