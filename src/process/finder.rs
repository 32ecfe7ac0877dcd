// src/process/finder.rs

//! Process discovery.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{FlowError, Result};
use crate::process::model::{Process, parse_process_file};

/// Source of process definitions.
pub trait ProcessFinder {
    fn find(&self) -> Result<Vec<Process>>;
}

/// Finds `*.toml` process definition files under a set of directories,
/// recursively, in sorted path order.
#[derive(Debug, Clone)]
pub struct FileSystemFinder {
    roots: Vec<PathBuf>,
}

impl FileSystemFinder {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for path in entries {
            if path.is_dir() {
                Self::collect_files(&path, out)?;
            } else if path.extension().is_some_and(|ext| ext == "toml") {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl ProcessFinder for FileSystemFinder {
    fn find(&self) -> Result<Vec<Process>> {
        let mut files = Vec::new();
        for root in &self.roots {
            if !root.is_dir() {
                warn!(path = %root.display(), "process directory does not exist; skipping");
                continue;
            }
            Self::collect_files(root, &mut files)?;
        }

        let mut processes = Vec::new();
        for file in files {
            let contents = fs::read_to_string(&file)?;
            let found = parse_process_file(&contents).map_err(|e| {
                FlowError::ConfigError(format!("{}: {e}", file.display()))
            })?;
            debug!(file = %file.display(), count = found.len(), "loaded process definitions");
            processes.extend(found);
        }
        Ok(processes)
    }
}
