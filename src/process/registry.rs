// src/process/registry.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::{FlowError, Result};
use crate::process::finder::ProcessFinder;
use crate::process::model::{Process, ProcessRef, ProcessVersion};

/// Holds process definitions keyed by `(slug, version)`.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct ProcessRegistry {
    processes: BTreeMap<String, BTreeMap<ProcessVersion, Arc<Process>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from every process the finders discover.
    pub fn from_finders(finders: &[&dyn ProcessFinder]) -> Result<Self> {
        let mut registry = Self::new();
        for finder in finders {
            for process in finder.find()? {
                registry.register(process)?;
            }
        }
        info!(processes = registry.len(), "process registry loaded");
        Ok(registry)
    }

    /// Register a definition. A second definition with the same slug and
    /// version is rejected.
    pub fn register(&mut self, process: Process) -> Result<Arc<Process>> {
        let versions = self.processes.entry(process.slug.clone()).or_default();
        if versions.contains_key(&process.version) {
            return Err(FlowError::DuplicateProcess(process.process_ref().to_string()));
        }
        debug!(process = %process.process_ref(), "registered process");
        let process = Arc::new(process);
        versions.insert(process.version, Arc::clone(&process));
        Ok(process)
    }

    /// Exact lookup, or the latest version when `version` is `None`.
    pub fn get(&self, slug: &str, version: Option<ProcessVersion>) -> Result<Arc<Process>> {
        let versions = self
            .processes
            .get(slug)
            .ok_or_else(|| FlowError::ProcessNotFound(slug.to_string()))?;

        let found = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };

        found.cloned().ok_or_else(|| {
            FlowError::ProcessNotFound(match version {
                Some(v) => format!("{slug}@{v}"),
                None => slug.to_string(),
            })
        })
    }

    pub fn get_ref(&self, process: &ProcessRef) -> Result<Arc<Process>> {
        self.get(&process.slug, Some(process.version))
    }

    pub fn len(&self) -> usize {
        self.processes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// All registered processes, ordered by slug then version.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Process>> {
        self.processes.values().flat_map(BTreeMap::values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::model::parse_process_file;

    fn versions(slug: &str, vs: &[&str]) -> Vec<Process> {
        vs.iter()
            .flat_map(|v| {
                parse_process_file(&format!(
                    "[[process]]\nslug = \"{slug}\"\nversion = \"{v}\"\ncommand = \"echo {v}\"\n"
                ))
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn latest_version_wins_without_explicit_version() {
        let mut reg = ProcessRegistry::new();
        for p in versions("align", &["1.0.0", "1.10.0", "1.2.0"]) {
            reg.register(p).unwrap();
        }

        let latest = reg.get("align", None).unwrap();
        assert_eq!(latest.version, ProcessVersion::new(1, 10, 0));

        let exact = reg.get("align", Some(ProcessVersion::new(1, 2, 0))).unwrap();
        assert_eq!(exact.version, ProcessVersion::new(1, 2, 0));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn duplicate_and_missing_are_errors() {
        let mut reg = ProcessRegistry::new();
        for p in versions("align", &["1.0.0"]) {
            reg.register(p).unwrap();
        }
        let dup = versions("align", &["1.0"]).pop().unwrap();
        assert!(matches!(reg.register(dup), Err(FlowError::DuplicateProcess(_))));
        assert!(matches!(reg.get("nope", None), Err(FlowError::ProcessNotFound(_))));
        assert!(matches!(
            reg.get("align", Some(ProcessVersion::new(9, 0, 0))),
            Err(FlowError::ProcessNotFound(_))
        ));
    }
}
