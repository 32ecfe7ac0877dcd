// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::{EngineKind, MappingMode, NotificationMode, PermissionMode};

/// Top-level settings as read from a TOML file, before validation.
///
/// ```toml
/// [executor]
/// name = "docker"
/// container_image = "resolwe/base"
/// data_dir = "test_data"
///
/// [redis]
/// port = 57000
///
/// [manager]
/// redis_prefix = "pipelines-template.manager"
/// max_concurrent = 2
///
/// [[mapping]]
/// src = "{data_dir}/{data_id}"
/// dest = "/data"
/// mode = "rw,Z"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawSettings {
    #[serde(default)]
    pub executor: ExecutorSection,

    #[serde(default)]
    pub redis: RedisSection,

    #[serde(default)]
    pub manager: ManagerSection,

    /// Directory-to-container mount mappings from `[[mapping]]`.
    ///
    /// When empty, [`default_mappings`] is used.
    #[serde(default)]
    pub mapping: Vec<MappingSection>,

    #[serde(default)]
    pub processes: ProcessesSection,

    #[serde(default)]
    pub api: ApiSection,
}

/// Validated, immutable settings passed to the manager and the executor at
/// startup.
///
/// Only obtainable through `Settings::try_from(RawSettings)`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub executor: ExecutorSection,
    pub redis: RedisSection,
    pub manager: ManagerSection,
    pub mappings: Vec<MappingTemplate>,
    pub processes: ProcessesSection,
    pub api: ApiSection,
}

impl Settings {
    pub(crate) fn new_unchecked(raw: RawSettings, mappings: Vec<MappingTemplate>) -> Self {
        Self {
            executor: raw.executor,
            redis: raw.redis,
            manager: raw.manager,
            mappings,
            processes: raw.processes,
            api: raw.api,
        }
    }

    /// Channel name used for completion notifications.
    pub fn notification_channel(&self) -> String {
        format!("{}.notifications", self.manager.redis_prefix)
    }

    /// Backoff before launch attempt number `attempt` (1-based) is retried.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.manager.retry_backoff_ms;
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(base.saturating_mul(factor))
    }
}

/// `[executor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// `"docker"` or `"local"`.
    #[serde(default)]
    pub name: EngineKind,

    #[serde(default = "default_container_image")]
    pub container_image: String,

    /// Prefix for container names; the data id is appended.
    #[serde(default = "default_container_name_prefix")]
    pub container_name_prefix: String,

    /// Docker-compatible CLI (e.g. `docker`, `podman`).
    #[serde(default = "default_docker_command")]
    pub docker_command: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
}

fn default_container_image() -> String {
    "resolwe/base".to_string()
}

fn default_container_name_prefix() -> String {
    "flowmgr".to_string()
}

fn default_docker_command() -> String {
    "docker".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("upload")
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("runtime")
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            name: EngineKind::default(),
            container_image: default_container_image(),
            container_name_prefix: default_container_name_prefix(),
            docker_command: default_docker_command(),
            data_dir: default_data_dir(),
            upload_dir: default_upload_dir(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

impl ExecutorSection {
    /// Make relative directories absolute against `base`.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        for dir in [&mut self.data_dir, &mut self.upload_dir, &mut self.runtime_dir] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}

/// `[redis]` section: connection used for notifications.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RedisSection {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
        }
    }
}

impl RedisSection {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// `[manager]` section: queueing and dispatch behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    /// Key prefix for the notification channel.
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,

    #[serde(default)]
    pub notification: NotificationMode,

    /// Maximum number of data objects in `Processing` at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Optional per-resource-class limits, on top of `max_concurrent`.
    #[serde(default)]
    pub class_limits: BTreeMap<String, usize>,

    /// Total launch attempts before a data object is marked as failed.
    #[serde(default = "default_launch_retries")]
    pub launch_retries: u32,

    /// Base delay between launch attempts; doubled on every retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Finished data objects kept for queries; older ones are dropped once
    /// nothing still depends on them.
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

fn default_redis_prefix() -> String {
    "flowmgr.manager".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_launch_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retain_finished() -> usize {
    10_000
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            redis_prefix: default_redis_prefix(),
            notification: NotificationMode::default(),
            max_concurrent: default_max_concurrent(),
            class_limits: BTreeMap::new(),
            launch_retries: default_launch_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retain_finished: default_retain_finished(),
        }
    }
}

/// One `[[mapping]]` entry as written in TOML.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MappingSection {
    /// Host path template. May contain `{data_dir}`, `{upload_dir}`,
    /// `{runtime_dir}` and `{data_id}`.
    pub src: String,
    /// Absolute path inside the container.
    pub dest: String,
    /// Access and isolation flags, e.g. `"rw,Z"`.
    pub mode: String,
}

/// The mappings used when the config declares none.
///
/// The per-object data directory is private to its data object; the data
/// root and the upload directory are shared among all containers.
pub fn default_mappings() -> Vec<MappingSection> {
    vec![
        MappingSection {
            src: "{data_dir}/{data_id}".to_string(),
            dest: "/data".to_string(),
            mode: "rw,Z".to_string(),
        },
        MappingSection {
            src: "{data_dir}".to_string(),
            dest: "/data_all".to_string(),
            mode: "ro,z".to_string(),
        },
        MappingSection {
            src: "{upload_dir}".to_string(),
            dest: "/upload".to_string(),
            mode: "rw,z".to_string(),
        },
    ]
}

/// A validated mapping, still keyed by data id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingTemplate {
    pub source: String,
    pub destination: PathBuf,
    pub mode: MappingMode,
}

impl MappingTemplate {
    /// Whether the source path differs for every data object.
    pub fn is_per_data(&self) -> bool {
        self.source.contains("{data_id}")
    }
}

/// `[processes]` section: where the file-system finder looks for process
/// definitions.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProcessesSection {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl ProcessesSection {
    pub fn resolve_relative_to(&mut self, base: &Path) {
        for p in self.paths.iter_mut() {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }
}

/// `[api]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiSection {
    #[serde(default)]
    pub permissions: PermissionMode,
}
