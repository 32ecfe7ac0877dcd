// src/exec/mappings.rs

//! Host-directory to container-path mappings for one data object.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{ExecutorSection, MappingTemplate};
use crate::data::DataId;
use crate::errors::{FlowError, Result};
use crate::types::{AccessMode, MappingMode};

/// A mapping with every placeholder filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryMapping {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: MappingMode,
    /// Source is specific to this data object.
    pub per_data: bool,
}

impl DirectoryMapping {
    pub fn is_writable(&self) -> bool {
        self.mode.access == AccessMode::ReadWrite
    }

    /// `src:dest:mode`, as passed to `docker run -v`.
    pub fn volume_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source.display(),
            self.destination.display(),
            self.mode
        )
    }
}

/// Fill in `{data_dir}`, `{upload_dir}`, `{runtime_dir}` and `{data_id}`.
pub fn render_mappings(
    templates: &[MappingTemplate],
    executor: &ExecutorSection,
    data_id: DataId,
) -> Vec<DirectoryMapping> {
    templates
        .iter()
        .map(|t| {
            let source = t
                .source
                .replace("{data_dir}", &executor.data_dir.to_string_lossy())
                .replace("{upload_dir}", &executor.upload_dir.to_string_lossy())
                .replace("{runtime_dir}", &executor.runtime_dir.to_string_lossy())
                .replace("{data_id}", &data_id.to_string());
            DirectoryMapping {
                source: PathBuf::from(source),
                destination: t.destination.clone(),
                mode: t.mode,
                per_data: t.is_per_data(),
            }
        })
        .collect()
}

/// The data object's own writable directory.
///
/// Settings validation guarantees exactly one such mapping exists.
pub fn data_mapping(mappings: &[DirectoryMapping]) -> Option<&DirectoryMapping> {
    mappings.iter().find(|m| m.per_data && m.is_writable())
}

/// Create every mapped source directory before the execution starts.
///
/// Shared directories are created if missing. The per-data directory comes
/// last and is built under a staging name and renamed into place, so a
/// half-created directory is never visible and an error from here means this
/// call did not create it.
///
/// An existing per-data directory is only accepted when `owns_data_dir` says
/// an earlier attempt of the same data object created it; anything else is
/// [`FlowError::DataDirTaken`].
pub async fn apply_mappings(mappings: &[DirectoryMapping], owns_data_dir: bool) -> Result<()> {
    for m in mappings.iter().filter(|m| !m.per_data) {
        tokio::fs::create_dir_all(&m.source).await?;
    }
    for m in mappings.iter().filter(|m| m.per_data) {
        create_private_dir(&m.source, owns_data_dir).await?;
    }
    Ok(())
}

async fn create_private_dir(dir: &Path, owned: bool) -> Result<()> {
    if tokio::fs::try_exists(dir).await? {
        if owned {
            debug!(dir = %dir.display(), "reusing data directory from earlier attempt");
            return Ok(());
        }
        return Err(FlowError::DataDirTaken(dir.to_path_buf()));
    }

    let (parent, name) = match (dir.parent(), dir.file_name()) {
        (Some(parent), Some(name)) => (parent, name.to_string_lossy()),
        _ => {
            return Err(FlowError::ConfigError(format!(
                "invalid data directory path {}",
                dir.display()
            )));
        }
    };

    tokio::fs::create_dir_all(parent).await?;

    let staging = parent.join(format!(".{name}.staging"));
    if tokio::fs::try_exists(&staging).await? {
        tokio::fs::remove_dir_all(&staging).await?;
    }
    tokio::fs::create_dir(&staging).await?;
    tokio::fs::rename(&staging, dir).await?;

    debug!(dir = %dir.display(), "data directory created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{RawSettings, Settings};

    fn settings(root: &Path) -> Settings {
        let mut raw = RawSettings::default();
        raw.executor.data_dir = root.join("data");
        raw.executor.upload_dir = root.join("upload");
        Settings::try_from(raw).unwrap()
    }

    #[test]
    fn renders_default_mappings_for_a_data_id() {
        let tmp = tempfile::tempdir().unwrap();
        let s = settings(tmp.path());
        let mappings = render_mappings(&s.mappings, &s.executor, 12);

        let own = data_mapping(&mappings).unwrap();
        assert_eq!(own.source, tmp.path().join("data").join("12"));
        assert_eq!(own.destination, PathBuf::from("/data"));
        assert!(own.volume_arg().ends_with(":/data:rw,Z"));

        let shared: Vec<_> = mappings.iter().filter(|m| !m.per_data).collect();
        assert_eq!(shared.len(), 2);
    }

    #[tokio::test]
    async fn creates_directories_and_reuses_only_its_own() {
        let tmp = tempfile::tempdir().unwrap();
        let s = settings(tmp.path());
        let mappings = render_mappings(&s.mappings, &s.executor, 3);

        apply_mappings(&mappings, false).await.unwrap();
        assert!(tmp.path().join("data/3").is_dir());
        assert!(tmp.path().join("upload").is_dir());
        assert!(!tmp.path().join("data/.3.staging").exists());

        assert!(matches!(
            apply_mappings(&mappings, false).await,
            Err(FlowError::DataDirTaken(_))
        ));
        apply_mappings(&mappings, true).await.unwrap();
    }

    #[tokio::test]
    async fn leftover_directory_is_never_adopted() {
        let tmp = tempfile::tempdir().unwrap();
        let s = settings(tmp.path());
        let mappings = render_mappings(&s.mappings, &s.executor, 1);
        std::fs::create_dir_all(tmp.path().join("data/1")).unwrap();
        std::fs::write(tmp.path().join("data/1/foreign.txt"), "x").unwrap();

        match apply_mappings(&mappings, false).await {
            Err(FlowError::DataDirTaken(dir)) => assert_eq!(dir, tmp.path().join("data/1")),
            other => panic!("expected DataDirTaken, got {other:?}"),
        }
        // Shared directories are still prepared.
        assert!(tmp.path().join("upload").is_dir());
    }
}
