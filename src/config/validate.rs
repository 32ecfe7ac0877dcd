// src/config/validate.rs

use std::collections::HashSet;
use std::path::{Component, PathBuf};

use crate::config::model::{MappingSection, MappingTemplate, RawSettings, Settings, default_mappings};
use crate::errors::{FlowError, Result};
use crate::types::{AccessMode, EngineKind, IsolationLevel, MappingMode};

const KNOWN_PLACEHOLDERS: [&str; 4] = ["{data_dir}", "{upload_dir}", "{runtime_dir}", "{data_id}"];

impl TryFrom<RawSettings> for Settings {
    type Error = FlowError;

    fn try_from(raw: RawSettings) -> std::result::Result<Self, Self::Error> {
        validate_executor(&raw)?;
        validate_manager(&raw)?;

        let sections = if raw.mapping.is_empty() {
            default_mappings()
        } else {
            raw.mapping.clone()
        };
        let mappings = validate_mappings(&sections)?;

        Ok(Settings::new_unchecked(raw, mappings))
    }
}

fn validate_executor(cfg: &RawSettings) -> Result<()> {
    if cfg.executor.name == EngineKind::Workflow {
        return Err(FlowError::ConfigError(
            "[executor].name must be \"docker\" or \"local\"; \"workflow\" is only valid on a process".to_string(),
        ));
    }
    if cfg.executor.name == EngineKind::Docker && cfg.executor.container_image.trim().is_empty() {
        return Err(FlowError::ConfigError(
            "[executor].container_image must be set for the docker engine".to_string(),
        ));
    }
    if cfg.executor.docker_command.trim().is_empty() {
        return Err(FlowError::ConfigError(
            "[executor].docker_command must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_manager(cfg: &RawSettings) -> Result<()> {
    let manager = &cfg.manager;

    if manager.redis_prefix.trim().is_empty() {
        return Err(FlowError::ConfigError(
            "[manager].redis_prefix must not be empty".to_string(),
        ));
    }

    if manager.max_concurrent == 0 {
        return Err(FlowError::ConfigError(
            "[manager].max_concurrent must be >= 1 (got 0)".to_string(),
        ));
    }

    for (class, limit) in manager.class_limits.iter() {
        if *limit == 0 {
            return Err(FlowError::ConfigError(format!(
                "[manager.class_limits].{class} must be >= 1 (got 0)"
            )));
        }
    }

    if manager.launch_retries == 0 {
        return Err(FlowError::ConfigError(
            "[manager].launch_retries must be >= 1 (got 0)".to_string(),
        ));
    }

    Ok(())
}

/// Parse modes and check that the mapping set gives every data object one
/// exclusive writable directory.
fn validate_mappings(sections: &[MappingSection]) -> Result<Vec<MappingTemplate>> {
    let mut templates = Vec::with_capacity(sections.len());
    let mut destinations = HashSet::new();

    for m in sections {
        let mode: MappingMode = m.mode.parse().map_err(FlowError::ConfigError)?;

        let destination = PathBuf::from(&m.dest);
        if !destination.is_absolute() {
            return Err(FlowError::ConfigError(format!(
                "mapping destination '{}' must be an absolute path",
                m.dest
            )));
        }
        if destination.components().any(|c| c == Component::ParentDir) {
            return Err(FlowError::ConfigError(format!(
                "mapping destination '{}' must not contain '..'",
                m.dest
            )));
        }
        if !destinations.insert(destination.clone()) {
            return Err(FlowError::ConfigError(format!(
                "mapping destination '{}' is used more than once",
                m.dest
            )));
        }

        check_placeholders(&m.src)?;

        let template = MappingTemplate {
            source: m.src.clone(),
            destination,
            mode,
        };

        if mode.isolation == IsolationLevel::Private && !template.is_per_data() {
            return Err(FlowError::ConfigError(format!(
                "mapping '{}' is private ('Z') but its source is shared by all data objects; \
                 include {{data_id}} in src",
                m.src
            )));
        }

        templates.push(template);
    }

    let writable_per_data = templates
        .iter()
        .filter(|t| t.is_per_data() && t.mode.access == AccessMode::ReadWrite)
        .count();
    if writable_per_data != 1 {
        return Err(FlowError::ConfigError(format!(
            "exactly one writable mapping must contain {{data_id}} (found {writable_per_data})"
        )));
    }

    Ok(templates)
}

fn check_placeholders(src: &str) -> Result<()> {
    let mut rest = src;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            return Err(FlowError::ConfigError(format!(
                "unterminated placeholder in mapping source '{src}'"
            )));
        };
        let placeholder = &rest[start..start + len + 1];
        if !KNOWN_PLACEHOLDERS.contains(&placeholder) {
            return Err(FlowError::ConfigError(format!(
                "unknown placeholder {placeholder} in mapping source '{src}'"
            )));
        }
        rest = &rest[start + len + 1..];
    }
    Ok(())
}
