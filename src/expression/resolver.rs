// src/expression/resolver.rs

//! Binding runtime input values into a process's command template.
//!
//! Everything here is pure: no IO, no clocks, safe to retry.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value, json};

use crate::data::DataId;
use crate::errors::ResolutionError;
use crate::expression::template::{Filter, Segment, Template};
use crate::process::model::{FieldType, Process, json_kind};

/// Root name under which per-execution values are bound.
pub const PROC_ROOT: &str = "proc";

const STEP_REF_PREFIX: char = '@';

/// Step name in a `"@name"` reference.
pub fn step_ref(s: &str) -> Option<&str> {
    s.strip_prefix(STEP_REF_PREFIX).filter(|name| !name.is_empty())
}

/// Values describing the execution itself, bound under `proc.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcBinding {
    pub data_id: DataId,
    /// Container path of the data object's private writable directory.
    pub data_dir: String,
}

/// Render `template` with `bound_inputs`.
///
/// Identical arguments always yield the identical command string.
pub fn resolve(template: &Template, bound_inputs: &Map<String, Value>) -> Result<String, ResolutionError> {
    let mut out = String::with_capacity(template.source().len());

    for segment in template.segments() {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder { path, filters, .. } => {
                let value = lookup(bound_inputs, path);
                out.push_str(&render(path, value, filters)?);
            }
        }
    }

    Ok(out)
}

/// Validate raw inputs against the process schema and produce the binding
/// map used by [`resolve`].
///
/// - Undeclared inputs and type mismatches are errors.
/// - Missing optional inputs fall back to their default (or stay unbound).
/// - `data` inputs are replaced by `{ "id": <id>, ..outputs }` of the
///   referenced data object, looked up in `dependency_outputs`.
/// - `proc.*` is always bound.
pub fn bind_inputs(
    process: &Process,
    inputs: &Map<String, Value>,
    dependency_outputs: &HashMap<DataId, Map<String, Value>>,
    proc_binding: &ProcBinding,
) -> Result<Map<String, Value>, ResolutionError> {
    for name in inputs.keys() {
        if process.input(name).is_none() {
            return Err(ResolutionError::UndeclaredInput(name.clone()));
        }
    }

    for root in process.command.roots() {
        if root != PROC_ROOT && process.input(root).is_none() {
            return Err(ResolutionError::UndeclaredInput(root.to_string()));
        }
    }

    let mut bound = Map::new();

    for field in &process.inputs {
        let value = match inputs.get(&field.name).filter(|v| !v.is_null()) {
            Some(v) => v.clone(),
            None => match (&field.default, field.required) {
                (Some(d), _) => d.clone(),
                (None, true) => return Err(ResolutionError::MissingInput(field.name.clone())),
                (None, false) => continue,
            },
        };

        if !field.field_type.accepts(&value) {
            return Err(ResolutionError::TypeMismatch {
                name: field.name.clone(),
                expected: field.field_type.to_string(),
                found: json_kind(&value).to_string(),
            });
        }

        let value = expand_data_refs(&field.name, &field.field_type, value, dependency_outputs)?;
        bound.insert(field.name.clone(), value);
    }

    bound.insert(
        PROC_ROOT.to_string(),
        json!({
            "data_id": proc_binding.data_id,
            "data_dir": proc_binding.data_dir,
            "slug": process.slug,
            "version": process.version.to_string(),
        }),
    );

    Ok(bound)
}

/// Fill in the input values of a workflow step.
///
/// - `"@name"` becomes the data id of step `name`, looked up in `step_ids`.
/// - A string that is a single bare placeholder, like `"{{ reads.id }}"`,
///   takes the bound value itself, keeping its JSON type.
/// - Any other string is rendered like a command template.
///
/// Lists and objects are filled in element by element.
pub fn resolve_step_inputs(
    inputs: &Map<String, Value>,
    bound: &Map<String, Value>,
    step_ids: &HashMap<String, DataId>,
) -> Result<Map<String, Value>, ResolutionError> {
    inputs
        .iter()
        .map(|(name, value)| Ok((name.clone(), resolve_step_value(value, bound, step_ids)?)))
        .collect()
}

fn resolve_step_value(
    value: &Value,
    bound: &Map<String, Value>,
    step_ids: &HashMap<String, DataId>,
) -> Result<Value, ResolutionError> {
    match value {
        Value::String(s) => {
            if let Some(step) = step_ref(s) {
                return step_ids
                    .get(step)
                    .map(|id| Value::from(*id))
                    .ok_or_else(|| ResolutionError::UnknownStep(step.to_string()));
            }
            let template = Template::parse(s)?;
            if let [Segment::Placeholder { path, filters, .. }] = template.segments() {
                if filters.is_empty() {
                    return lookup(bound, path)
                        .filter(|v| !v.is_null())
                        .cloned()
                        .ok_or_else(|| ResolutionError::MissingInput(path.join(".")));
                }
            }
            resolve(&template, bound).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_step_value(v, bound, step_ids))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_step_inputs(map, bound, step_ids).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Ids of data objects referenced by `data` / `list:data` inputs.
///
/// Values of the wrong shape are skipped here; [`bind_inputs`] reports them.
pub fn data_dependencies(process: &Process, inputs: &Map<String, Value>) -> Vec<DataId> {
    let mut deps = Vec::new();
    for field in process.inputs.iter().filter(|f| f.field_type.references_data()) {
        if let Some(value) = inputs.get(&field.name) {
            collect_ids(&field.field_type, value, &mut deps);
        }
    }
    deps.sort_unstable();
    deps.dedup();
    deps
}

fn collect_ids(field_type: &FieldType, value: &Value, out: &mut Vec<DataId>) {
    match field_type {
        FieldType::Data => {
            if let Some(id) = value.as_u64() {
                out.push(id);
            }
        }
        FieldType::List(inner) => {
            for item in value.as_array().into_iter().flatten() {
                collect_ids(inner, item, out);
            }
        }
        _ => {}
    }
}

fn expand_data_refs(
    name: &str,
    field_type: &FieldType,
    value: Value,
    outputs: &HashMap<DataId, Map<String, Value>>,
) -> Result<Value, ResolutionError> {
    match field_type {
        FieldType::Data => {
            let id = value.as_u64().ok_or_else(|| ResolutionError::TypeMismatch {
                name: name.to_string(),
                expected: "data".to_string(),
                found: json_kind(&value).to_string(),
            })?;
            let output = outputs
                .get(&id)
                .ok_or_else(|| ResolutionError::MissingInput(format!("{name} (data object {id})")))?;
            let mut expanded = output.clone();
            expanded.insert("id".to_string(), Value::from(id));
            Ok(Value::Object(expanded))
        }
        FieldType::List(inner) if inner.references_data() => {
            let items = match value {
                Value::Array(items) => items,
                other => return Ok(other),
            };
            items
                .into_iter()
                .map(|item| expand_data_refs(name, inner, item, outputs))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        _ => Ok(value),
    }
}

fn lookup<'a>(root: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = root.get(first)?;
    for key in rest {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render(path: &[String], value: Option<&Value>, filters: &[Filter]) -> Result<String, ResolutionError> {
    let mut current: Option<Value> = value.filter(|v| !v.is_null()).cloned();

    for filter in filters {
        current = match (filter, current) {
            (Filter::Default(d), None) => Some(Value::String(d.clone())),
            (Filter::Join(sep), Some(Value::Array(items))) => {
                Some(Value::String(items.iter().map(scalar_text).collect::<Vec<_>>().join(sep)))
            }
            (Filter::Basename, Some(v)) => {
                let text = scalar_text(&v);
                let base = Path::new(&text)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(text);
                Some(Value::String(base))
            }
            (Filter::Quote, Some(v)) => Some(Value::String(shell_quote(&scalar_text(&v)))),
            (_, other) => other,
        };
    }

    match current {
        Some(v) => Ok(scalar_text(&v)),
        None => Err(ResolutionError::MissingInput(path.join("."))),
    }
}

/// Text form of a value inside a command line.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) => items.iter().map(scalar_text).collect::<Vec<_>>().join(" "),
        Value::Object(map) => match map.get("file") {
            Some(Value::String(f)) => f.clone(),
            _ => value.to_string(),
        },
    }
}

/// POSIX shell quoting: safe strings pass through, others are single-quoted.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'"'"'"#))
    }
}
