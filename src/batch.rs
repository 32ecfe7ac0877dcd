// src/batch.rs

//! Batch files: several data objects submitted together, wired to each
//! other by name.
//!
//! ```toml
//! [data.reads]
//! process = "upload-fastq"
//! inputs = { src = "reads.fq" }
//!
//! [data.aligned]
//! process = "align"
//! priority = 5
//! inputs = { reads = "@reads", threads = 4 }
//! ```
//!
//! A string input of the form `"@name"` is replaced by the id of the data
//! object created for `[data.name]`.

use std::collections::BTreeMap;
use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::access::{ManagerHandle, Principal};
use crate::data::{DataId, DataRequest};
use crate::errors::{FlowError, Result};
use crate::expression::step_ref;
use crate::process::ProcessVersion;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BatchFile {
    #[serde(default)]
    pub data: BTreeMap<String, BatchEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BatchEntry {
    pub process: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// A validated batch, in submission order.
#[derive(Debug, Clone)]
pub struct Batch {
    order: Vec<String>,
    entries: BTreeMap<String, BatchEntry>,
}

pub fn load_batch(path: impl AsRef<Path>) -> Result<Batch> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        FlowError::ConfigError(format!("failed to read batch file {}: {e}", path.display()))
    })?;
    parse_batch(&contents)
}

/// Parse a batch and check that its references form a DAG.
pub fn parse_batch(contents: &str) -> Result<Batch> {
    let file: BatchFile = toml::from_str(contents)?;

    // Edge direction: referenced entry -> referencing entry.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in file.data.keys() {
        graph.add_node(name.as_str());
    }

    for (name, entry) in file.data.iter() {
        let mut refs = Vec::new();
        for value in entry.inputs.values() {
            collect_refs(value, &mut refs);
        }
        for target in refs {
            let Some((key, _)) = file.data.get_key_value(target) else {
                return Err(FlowError::ConfigError(format!(
                    "batch entry '{name}' references unknown entry '@{target}'"
                )));
            };
            graph.add_edge(key.as_str(), name.as_str(), ());
        }
    }

    let order = match toposort(&graph, None) {
        Ok(order) => order.into_iter().map(str::to_string).collect(),
        Err(cycle) => return Err(FlowError::BatchCycle(cycle.node_id().to_string())),
    };

    Ok(Batch {
        order,
        entries: file.data,
    })
}

fn collect_refs<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => {
            if let Some(name) = step_ref(s) {
                out.push(name);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

fn substitute_refs(value: &Value, ids: &BTreeMap<String, DataId>) -> Value {
    match value {
        Value::String(s) => match step_ref(s).and_then(|name| ids.get(name)) {
            Some(id) => Value::from(*id),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_refs(v, ids)).collect()),
        other => other.clone(),
    }
}

impl Batch {
    /// Entry names, each after everything it references.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the creation request for `name`, given the ids of the entries
    /// submitted before it.
    pub fn request_for(&self, name: &str, ids: &BTreeMap<String, DataId>) -> Result<DataRequest> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| FlowError::ConfigError(format!("no batch entry '{name}'")))?;

        let version = match &entry.version {
            Some(v) => Some(
                v.parse::<ProcessVersion>()
                    .map_err(|e| FlowError::ConfigError(format!("batch entry '{name}': {e}")))?,
            ),
            None => None,
        };

        Ok(DataRequest {
            process: entry.process.clone(),
            version,
            inputs: entry
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), substitute_refs(v, ids)))
                .collect(),
            priority: entry.priority,
        })
    }

    /// Submit every entry in dependency order. Returns name -> data id.
    pub async fn submit(&self, handle: &ManagerHandle, who: &Principal) -> Result<BTreeMap<String, DataId>> {
        let mut ids = BTreeMap::new();
        for name in &self.order {
            let request = self.request_for(name, &ids)?;
            let id = handle.create(who, request).await?;
            info!(entry = %name, data_id = id, "batch entry submitted");
            ids.insert(name.clone(), id);
        }
        Ok(ids)
    }
}
