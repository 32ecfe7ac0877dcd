// src/exec/context.rs

use std::path::PathBuf;

use crate::config::Settings;
use crate::data::DataId;
use crate::errors::{FlowError, Result};
use crate::exec::mappings::{DirectoryMapping, data_mapping, render_mappings};
use crate::expression::ProcBinding;
use crate::process::{Process, ProcessRef};
use crate::types::EngineKind;

/// Everything an engine needs to run one data object.
///
/// Built when the object is resolved; `attempt` is bumped on every dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub data_id: DataId,
    pub process: ProcessRef,
    pub engine: EngineKind,
    /// Resolved command line, run through `/bin/sh -c`.
    pub command: String,
    pub container_image: String,
    pub container_name: String,
    pub mappings: Vec<DirectoryMapping>,
    /// Host path of the data object's writable directory.
    pub output_dir: PathBuf,
    /// Channel the completion notification goes to.
    pub notify_channel: String,
    pub attempt: u32,
    /// An earlier attempt of this data object created `output_dir`, so the
    /// next launch may reuse it.
    pub owns_data_dir: bool,
}

impl ExecutionContext {
    /// Plan the execution of `process` as data object `data_id`.
    ///
    /// The command is left empty; fill it in after resolving with
    /// [`ExecutionContext::proc_binding`].
    pub fn plan(settings: &Settings, process: &Process, data_id: DataId) -> Result<Self> {
        let mappings = render_mappings(&settings.mappings, &settings.executor, data_id);
        let output_dir = data_mapping(&mappings)
            .map(|m| m.source.clone())
            .ok_or_else(|| {
                FlowError::ConfigError("no writable per-data directory mapping configured".to_string())
            })?;

        Ok(Self {
            data_id,
            process: process.process_ref(),
            engine: process.engine.unwrap_or(settings.executor.name),
            command: String::new(),
            container_image: process
                .container_image
                .clone()
                .unwrap_or_else(|| settings.executor.container_image.clone()),
            container_name: format!("{}-{}", settings.executor.container_name_prefix, data_id),
            mappings,
            output_dir,
            notify_channel: settings.notification_channel(),
            attempt: 0,
            owns_data_dir: false,
        })
    }

    /// Values bound under `proc.*` when resolving the command.
    ///
    /// `proc.data_dir` is the path the command itself sees: the container
    /// destination for docker, the host directory for local runs.
    pub fn proc_binding(&self) -> ProcBinding {
        let data_dir = match self.engine {
            EngineKind::Docker => data_mapping(&self.mappings)
                .map(|m| m.destination.to_string_lossy().into_owned())
                .unwrap_or_default(),
            EngineKind::Local | EngineKind::Workflow => self.output_dir.to_string_lossy().into_owned(),
        };
        ProcBinding {
            data_id: self.data_id,
            data_dir,
        }
    }
}
