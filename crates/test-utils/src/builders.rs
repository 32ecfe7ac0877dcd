#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use flowmgr::config::{RawSettings, Settings};
use flowmgr::engine::{CoreManager, ManagerOptions};
use flowmgr::process::model::{RawField, RawProcess, RawStep};
use flowmgr::process::{Process, ProcessRegistry};
use flowmgr::types::{EngineKind, NotificationMode};

/// Builder for `Settings` suited to tests: local engine, in-process
/// notifications, directories under `root`.
pub struct SettingsBuilder {
    raw: RawSettings,
}

impl SettingsBuilder {
    pub fn new(root: &Path) -> Self {
        let mut raw = RawSettings::default();
        raw.executor.name = EngineKind::Local;
        raw.executor.data_dir = root.join("data");
        raw.executor.upload_dir = root.join("upload");
        raw.executor.runtime_dir = root.join("runtime");
        raw.manager.notification = NotificationMode::InProcess;
        raw.manager.retry_backoff_ms = 1;
        Self { raw }
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.raw.manager.max_concurrent = n;
        self
    }

    pub fn class_limit(mut self, class: &str, n: usize) -> Self {
        self.raw.manager.class_limits.insert(class.to_string(), n);
        self
    }

    pub fn launch_retries(mut self, n: u32) -> Self {
        self.raw.manager.launch_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.raw.manager.retry_backoff_ms = ms;
        self
    }

    pub fn retain_finished(mut self, n: usize) -> Self {
        self.raw.manager.retain_finished = n;
        self
    }

    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.raw.executor.name = engine;
        self
    }

    pub fn build(self) -> Settings {
        Settings::try_from(self.raw).expect("Failed to build valid settings from builder")
    }
}

/// Builder for `Process` definitions.
pub struct ProcessBuilder {
    raw: RawProcess,
}

impl ProcessBuilder {
    pub fn new(slug: &str, command: &str) -> Self {
        Self {
            raw: RawProcess {
                slug: slug.to_string(),
                name: None,
                version: "1.0.0".to_string(),
                engine: None,
                command: command.to_string(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                resource_class: None,
                priority: 0,
                container_image: None,
                steps: Vec::new(),
            },
        }
    }

    /// A `workflow` process; add its steps with [`ProcessBuilder::step`].
    pub fn workflow(slug: &str) -> Self {
        Self::new(slug, "").engine(EngineKind::Workflow)
    }

    /// Add a workflow step. `inputs` must be a JSON object.
    pub fn step(mut self, id: &str, run: &str, inputs: Value) -> Self {
        self.raw.steps.push(RawStep {
            id: id.to_string(),
            run: run.to_string(),
            version: None,
            input: inputs.as_object().cloned().unwrap_or_default(),
        });
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.raw.version = version.to_string();
        self
    }

    pub fn input(mut self, name: &str, field_type: &str) -> Self {
        self.raw.inputs.push(field(name, field_type, true));
        self
    }

    pub fn optional_input(mut self, name: &str, field_type: &str) -> Self {
        self.raw.inputs.push(field(name, field_type, false));
        self
    }

    pub fn output(mut self, name: &str, field_type: &str) -> Self {
        self.raw.outputs.push(field(name, field_type, true));
        self
    }

    pub fn resource_class(mut self, class: &str) -> Self {
        self.raw.resource_class = Some(class.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.raw.priority = priority;
        self
    }

    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.raw.engine = Some(engine);
        self
    }

    pub fn build(self) -> Process {
        Process::try_from(self.raw).expect("Failed to build valid process from builder")
    }
}

fn field(name: &str, field_type: &str, required: bool) -> RawField {
    RawField {
        name: name.to_string(),
        field_type: field_type.to_string(),
        required,
        default: None,
    }
}

pub fn registry_of(processes: impl IntoIterator<Item = Process>) -> ProcessRegistry {
    let mut registry = ProcessRegistry::new();
    for p in processes {
        registry
            .register(p)
            .expect("Failed to register process in test registry");
    }
    registry
}

/// A core with default options over `settings` and `processes`.
pub fn core_with(settings: Settings, processes: impl IntoIterator<Item = Process>) -> CoreManager {
    CoreManager::new(
        Arc::new(settings),
        Arc::new(registry_of(processes)),
        ManagerOptions::default(),
    )
}
