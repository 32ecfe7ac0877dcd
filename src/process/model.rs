// src/process/model.rs

//! Immutable process definitions and their on-disk TOML form.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::{FlowError, Result};
use crate::expression::{PROC_ROOT, Template, step_ref};
use crate::types::EngineKind;

/// Dotted numeric version, e.g. `1.0.2`. Missing components count as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProcessVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Ord for ProcessVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for ProcessVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ProcessVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(format!("invalid version '{s}' (expected MAJOR[.MINOR[.PATCH]])"));
        }
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(parts.iter()) {
            *slot = part
                .parse()
                .map_err(|_| format!("invalid version component '{part}' in '{s}'"))?;
        }
        Ok(ProcessVersion::new(nums[0], nums[1], nums[2]))
    }
}

impl Serialize for ProcessVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for ProcessVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Type of a process input or output field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Decimal,
    Boolean,
    /// A path string, or an object with a `file` key.
    File,
    /// Reference to another data object by id.
    Data,
    /// Anything JSON.
    Json,
    List(Box<FieldType>),
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("list:") {
            return Ok(FieldType::List(Box::new(inner.parse()?)));
        }
        match s {
            "string" => Ok(FieldType::String),
            "integer" => Ok(FieldType::Integer),
            "decimal" => Ok(FieldType::Decimal),
            "boolean" => Ok(FieldType::Boolean),
            "file" => Ok(FieldType::File),
            "data" => Ok(FieldType::Data),
            "json" => Ok(FieldType::Json),
            other => Err(format!("unknown field type '{other}'")),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Integer => f.write_str("integer"),
            FieldType::Decimal => f.write_str("decimal"),
            FieldType::Boolean => f.write_str("boolean"),
            FieldType::File => f.write_str("file"),
            FieldType::Data => f.write_str("data"),
            FieldType::Json => f.write_str("json"),
            FieldType::List(inner) => write!(f, "list:{inner}"),
        }
    }
}

impl FieldType {
    /// Whether `value` is an acceptable binding for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Decimal => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::File => {
                value.is_string() || value.get("file").map(Value::is_string).unwrap_or(false)
            }
            FieldType::Data => value.is_u64(),
            FieldType::Json => true,
            FieldType::List(inner) => value
                .as_array()
                .map(|items| items.iter().all(|v| inner.accepts(v)))
                .unwrap_or(false),
        }
    }

    /// Whether values of this type reference other data objects.
    pub fn references_data(&self) -> bool {
        match self {
            FieldType::Data => true,
            FieldType::List(inner) => inner.references_data(),
            _ => false,
        }
    }
}

/// Short name of a JSON value's kind, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "decimal",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// One typed input or output of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<Value>,
}

/// Identity of a process: `(slug, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessRef {
    pub slug: String,
    pub version: ProcessVersion,
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slug, self.version)
    }
}

/// One step of a workflow process: a data object submitted when the
/// workflow runs.
///
/// Input values may reference the workflow's own inputs with `{{ }}`
/// placeholders and earlier steps with `"@step_id"`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    /// Slug of the process the step runs.
    pub run: String,
    /// Latest registered version when unset.
    pub version: Option<ProcessVersion>,
    pub inputs: Map<String, Value>,
}

/// A registered, versioned unit of work definition. Never mutated.
#[derive(Debug, Clone)]
pub struct Process {
    pub slug: String,
    pub name: String,
    pub version: ProcessVersion,
    /// Engine override; `[executor].name` applies when unset.
    pub engine: Option<EngineKind>,
    pub command: Template,
    pub inputs: Vec<FieldSchema>,
    pub outputs: Vec<FieldSchema>,
    pub resource_class: String,
    pub priority: i32,
    /// Overrides `[executor].container_image` for this process.
    pub container_image: Option<String>,
    /// Steps of a `workflow` process, in submission order. Empty otherwise.
    pub steps: Vec<WorkflowStep>,
}

impl Process {
    pub fn is_workflow(&self) -> bool {
        self.engine == Some(EngineKind::Workflow)
    }

    pub fn process_ref(&self) -> ProcessRef {
        ProcessRef {
            slug: self.slug.clone(),
            version: self.version,
        }
    }

    pub fn input(&self, name: &str) -> Option<&FieldSchema> {
        self.inputs.iter().find(|f| f.name == name)
    }
}

pub const DEFAULT_RESOURCE_CLASS: &str = "default";

/// `[[process]]` entry as written in a process definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProcess {
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub engine: Option<EngineKind>,
    /// Empty for workflows.
    #[serde(default)]
    pub command: String,
    #[serde(default, rename = "input")]
    pub inputs: Vec<RawField>,
    #[serde(default, rename = "output")]
    pub outputs: Vec<RawField>,
    #[serde(default)]
    pub resource_class: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<RawStep>,
}

/// `[[process.step]]` entry of a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    pub id: String,
    pub run: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<toml::Value>,
}

fn default_required() -> bool {
    true
}

/// A process definition file: one or more `[[process]]` tables.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProcessFile {
    #[serde(default)]
    pub process: Vec<RawProcess>,
}

impl TryFrom<RawProcess> for Process {
    type Error = FlowError;

    fn try_from(raw: RawProcess) -> std::result::Result<Self, Self::Error> {
        let invalid = |msg: String| FlowError::ConfigError(format!("process '{}': {msg}", raw.slug));

        if raw.slug.trim().is_empty() {
            return Err(FlowError::ConfigError("process slug must not be empty".to_string()));
        }

        let version: ProcessVersion = raw.version.parse().map_err(&invalid)?;
        let command = Template::parse(&raw.command).map_err(|e| invalid(e.to_string()))?;
        let inputs = convert_fields(&raw.inputs).map_err(&invalid)?;
        let outputs = convert_fields(&raw.outputs).map_err(&invalid)?;

        let steps = if raw.engine == Some(EngineKind::Workflow) {
            if !raw.command.trim().is_empty() {
                return Err(invalid("a workflow has steps instead of a command".to_string()));
            }
            convert_steps(&raw.steps, &inputs).map_err(&invalid)?
        } else {
            if raw.command.trim().is_empty() {
                return Err(invalid("command must not be empty".to_string()));
            }
            if !raw.steps.is_empty() {
                return Err(invalid("only workflow processes may declare steps".to_string()));
            }
            Vec::new()
        };

        Ok(Process {
            name: raw.name.clone().unwrap_or_else(|| raw.slug.clone()),
            slug: raw.slug,
            version,
            engine: raw.engine,
            command,
            inputs,
            outputs,
            resource_class: raw
                .resource_class
                .unwrap_or_else(|| DEFAULT_RESOURCE_CLASS.to_string()),
            priority: raw.priority,
            container_image: raw.container_image,
            steps,
        })
    }
}

fn convert_fields(raw: &[RawField]) -> std::result::Result<Vec<FieldSchema>, String> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(raw.len());

    for f in raw {
        if !seen.insert(f.name.as_str()) {
            return Err(format!("field '{}' declared twice", f.name));
        }
        let field_type: FieldType = f.field_type.parse()?;
        let default = match &f.default {
            Some(v) => Some(serde_json::to_value(v).map_err(|e| e.to_string())?),
            None => None,
        };
        if let Some(ref d) = default {
            if !field_type.accepts(d) {
                return Err(format!(
                    "default for '{}' is {}, expected {field_type}",
                    f.name,
                    json_kind(d)
                ));
            }
        }
        fields.push(FieldSchema {
            name: f.name.clone(),
            field_type,
            required: f.required,
            default,
        });
    }

    Ok(fields)
}

fn convert_steps(raw: &[RawStep], inputs: &[FieldSchema]) -> std::result::Result<Vec<WorkflowStep>, String> {
    if raw.is_empty() {
        return Err("a workflow needs at least one step".to_string());
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut steps = Vec::with_capacity(raw.len());

    for (index, step) in raw.iter().enumerate() {
        if step.id.trim().is_empty() || step.run.trim().is_empty() {
            return Err(format!("step {} needs an id and a process to run", index + 1));
        }
        if seen.insert(step.id.as_str(), index).is_some() {
            return Err(format!("step '{}' declared twice", step.id));
        }

        let version = match &step.version {
            Some(v) => Some(v.parse::<ProcessVersion>().map_err(|e| format!("step '{}': {e}", step.id))?),
            None => None,
        };

        for value in step.input.values() {
            check_step_value(&step.id, value, index, &seen, inputs)?;
        }

        steps.push(WorkflowStep {
            id: step.id.clone(),
            run: step.run.clone(),
            version,
            inputs: step.input.clone(),
        });
    }

    Ok(steps)
}

/// Step references must point at earlier steps and placeholders at declared
/// workflow inputs.
fn check_step_value(
    step: &str,
    value: &Value,
    index: usize,
    seen: &HashMap<&str, usize>,
    inputs: &[FieldSchema],
) -> std::result::Result<(), String> {
    match value {
        Value::String(s) => {
            if let Some(target) = step_ref(s) {
                return match seen.get(target) {
                    Some(i) if *i < index => Ok(()),
                    _ => Err(format!("step '{step}' references '@{target}', which is not an earlier step")),
                };
            }
            let template = Template::parse(s).map_err(|e| format!("step '{step}': {e}"))?;
            for root in template.roots() {
                if root != PROC_ROOT && !inputs.iter().any(|f| f.name == root) {
                    return Err(format!("step '{step}' uses undeclared workflow input '{root}'"));
                }
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|v| check_step_value(step, v, index, seen, inputs)),
        Value::Object(map) => map
            .values()
            .try_for_each(|v| check_step_value(step, v, index, seen, inputs)),
        _ => Ok(()),
    }
}

/// Parse every `[[process]]` in a TOML document.
pub fn parse_process_file(contents: &str) -> Result<Vec<Process>> {
    let file: ProcessFile = toml::from_str(contents)?;
    file.process.into_iter().map(Process::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn versions_order_numerically() {
        let a: ProcessVersion = "1.2".parse().unwrap();
        let b: ProcessVersion = "1.10.0".parse().unwrap();
        assert!(a < b);
        assert_eq!(a.to_string(), "1.2.0");
        assert!("1.x".parse::<ProcessVersion>().is_err());
        assert!("1.2.3.4".parse::<ProcessVersion>().is_err());
    }

    #[test]
    fn field_types_check_values() {
        assert!(FieldType::Integer.accepts(&json!(3)));
        assert!(!FieldType::Integer.accepts(&json!(3.5)));
        assert!(FieldType::Decimal.accepts(&json!(3)));
        assert!(FieldType::File.accepts(&json!({"file": "reads.fq"})));
        assert!(!FieldType::Data.accepts(&json!("7")));

        let list: FieldType = "list:data".parse().unwrap();
        assert!(list.references_data());
        assert!(list.accepts(&json!([1, 2])));
        assert!(!list.accepts(&json!([1, "x"])));
    }

    #[test]
    fn parses_process_file() {
        let procs = parse_process_file(
            r#"
[[process]]
slug = "word-count"
version = "1.0.1"
engine = "local"
command = "wc -w {{ text | quote }}"
resource_class = "light"

[[process.input]]
name = "text"
type = "file"

[[process.input]]
name = "threads"
type = "integer"
default = 2
"#,
        )
        .unwrap();

        assert_eq!(procs.len(), 1);
        let p = &procs[0];
        assert_eq!(p.version, ProcessVersion::new(1, 0, 1));
        assert_eq!(p.engine, Some(EngineKind::Local));
        assert_eq!(p.resource_class, "light");
        assert_eq!(p.input("threads").unwrap().default, Some(json!(2)));
    }

    #[test]
    fn rejects_duplicate_fields_and_bad_defaults() {
        let dup = r#"
[[process]]
slug = "p"
version = "1"
command = "true"
[[process.input]]
name = "a"
type = "string"
[[process.input]]
name = "a"
type = "string"
"#;
        assert!(parse_process_file(dup).is_err());

        let bad_default = r#"
[[process]]
slug = "p"
version = "1"
command = "true"
[[process.input]]
name = "n"
type = "integer"
default = "three"
"#;
        assert!(parse_process_file(bad_default).is_err());
    }

    const WORKFLOW: &str = r#"
[[process]]
slug = "shout-and-count"
version = "1"
engine = "workflow"

[[process.input]]
name = "text"
type = "string"

[[process.step]]
id = "shout"
run = "upper"
[process.step.input]
text = "{{ text }}"

[[process.step]]
id = "count"
run = "word-count"
version = "1.0"
[process.step.input]
source = "@shout"
"#;

    #[test]
    fn parses_workflow_steps() {
        let p = parse_process_file(WORKFLOW).unwrap().pop().unwrap();
        assert!(p.is_workflow());
        assert!(p.command.segments().is_empty());
        let ids: Vec<_> = p.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["shout", "count"]);
        assert_eq!(p.steps[1].version, Some("1.0".parse().unwrap()));
        assert_eq!(p.steps[1].inputs["source"], json!("@shout"));
    }

    #[test]
    fn rejects_malformed_workflows() {
        let forward_ref = WORKFLOW.replace("text = \"{{ text }}\"", "text = \"@count\"");
        let err = parse_process_file(&forward_ref).unwrap_err().to_string();
        assert!(err.contains("not an earlier step"), "{err}");

        let undeclared = WORKFLOW.replace("{{ text }}", "{{ body }}");
        let err = parse_process_file(&undeclared).unwrap_err().to_string();
        assert!(err.contains("undeclared workflow input 'body'"), "{err}");

        let duplicate = WORKFLOW.replace("id = \"count\"", "id = \"shout\"");
        assert!(parse_process_file(&duplicate).is_err());

        let with_command = WORKFLOW.replace("engine = \"workflow\"", "engine = \"workflow\"\ncommand = \"true\"");
        assert!(parse_process_file(&with_command).is_err());

        let no_steps = r#"
[[process]]
slug = "empty"
version = "1"
engine = "workflow"
"#;
        assert!(parse_process_file(no_steps).is_err());

        let steps_on_local = r#"
[[process]]
slug = "p"
version = "1"
command = "true"
[[process.step]]
id = "a"
run = "b"
"#;
        assert!(parse_process_file(steps_on_local).is_err());
    }
}
