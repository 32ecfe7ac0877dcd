use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which execution engine runs a data object's command.
///
/// Selected once at startup from `[executor].name`, and per process from its
/// `engine` field. `workflow` is only valid on a process: such a process has
/// no command and runs by submitting its steps as data objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Run inside a container via the configured docker-compatible CLI.
    Docker,
    /// Run as a plain local shell process.
    Local,
    /// Expand into one data object per step.
    Workflow,
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Docker
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(EngineKind::Docker),
            "local" => Ok(EngineKind::Local),
            "workflow" => Ok(EngineKind::Workflow),
            other => Err(format!(
                "invalid execution engine: {other} (expected \"docker\", \"local\" or \"workflow\")"
            )),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Docker => f.write_str("docker"),
            EngineKind::Local => f.write_str("local"),
            EngineKind::Workflow => f.write_str("workflow"),
        }
    }
}

/// How completion notifications travel back to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    /// Redis pub/sub on `{redis_prefix}.notifications`.
    Redis,
    /// In-process channel (single binary, tests).
    InProcess,
}

impl Default for NotificationMode {
    fn default() -> Self {
        NotificationMode::Redis
    }
}

/// Which permission policy the access layer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Only owners (and superusers) may view a data object.
    Owner,
    /// Everyone may create and view everything.
    AllowAll,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Owner
    }
}

/// Access mode of a directory mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Abstract isolation level of a directory mapping.
///
/// `Shared` content may be seen by every execution; `Private` content belongs
/// to one execution only. Engines decide how (or whether) to enforce it; the
/// docker engine maps these onto SELinux relabel flags `z` / `Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    None,
    Shared,
    Private,
}

/// Parsed form of a mapping `mode` string such as `"rw,Z"` or `"ro,z"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingMode {
    pub access: AccessMode,
    pub isolation: IsolationLevel,
}

impl FromStr for MappingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut access = None;
        let mut isolation = IsolationLevel::None;

        for flag in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "rw" | "ro" if access.is_some() => {
                    return Err(format!("mode '{s}' specifies access twice"));
                }
                "rw" => access = Some(AccessMode::ReadWrite),
                "ro" => access = Some(AccessMode::ReadOnly),
                "z" | "Z" if isolation != IsolationLevel::None => {
                    return Err(format!("mode '{s}' specifies isolation twice"));
                }
                "z" => isolation = IsolationLevel::Shared,
                "Z" => isolation = IsolationLevel::Private,
                other => return Err(format!("unknown mapping flag '{other}' in mode '{s}'")),
            }
        }

        let access = access.ok_or_else(|| format!("mode '{s}' must contain 'rw' or 'ro'"))?;
        Ok(MappingMode { access, isolation })
    }
}

impl fmt::Display for MappingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.access {
            AccessMode::ReadOnly => "ro",
            AccessMode::ReadWrite => "rw",
        };
        match self.isolation {
            IsolationLevel::None => f.write_str(access),
            IsolationLevel::Shared => write!(f, "{access},z"),
            IsolationLevel::Private => write!(f, "{access},Z"),
        }
    }
}
