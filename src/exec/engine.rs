// src/exec/engine.rs

//! Execution engines: how a resolved command is actually started.
//!
//! Engines are a closed set chosen from settings at startup, so they are a
//! tagged enum rather than a trait object.

use std::collections::VecDeque;
use std::process::Stdio;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::ExecutorSection;
use crate::data::DataId;
use crate::errors::Result;
use crate::exec::context::ExecutionContext;
use crate::exec::mappings::data_mapping;
use crate::types::EngineKind;

/// Number of non-JSON output lines kept for error reports.
pub const DIAGNOSTIC_TAIL: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerEngine {
    /// Docker-compatible CLI binary.
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEngine {
    Docker(DockerEngine),
    Local,
}

impl ExecutionEngine {
    pub fn kind(&self) -> EngineKind {
        match self {
            ExecutionEngine::Docker(_) => EngineKind::Docker,
            ExecutionEngine::Local => EngineKind::Local,
        }
    }

    /// Build the OS command that runs `ctx`.
    pub fn command_for(&self, ctx: &ExecutionContext) -> Command {
        match self {
            ExecutionEngine::Docker(docker) => {
                let mut c = Command::new(&docker.command);
                c.arg("run").arg("--rm").arg("--name").arg(&ctx.container_name);
                for m in &ctx.mappings {
                    c.arg("-v").arg(m.volume_arg());
                }
                if let Some(own) = data_mapping(&ctx.mappings) {
                    c.arg("-w").arg(&own.destination);
                }
                c.arg("-e")
                    .arg(format!("DATA_ID={}", ctx.data_id))
                    .arg(&ctx.container_image)
                    .arg("/bin/sh")
                    .arg("-c")
                    .arg(&ctx.command);
                c
            }
            ExecutionEngine::Local => {
                let mut c = Command::new("sh");
                c.arg("-c")
                    .arg(&ctx.command)
                    .current_dir(&ctx.output_dir)
                    .env("DATA_ID", ctx.data_id.to_string())
                    .env("DATA_DIR", &ctx.output_dir);
                c
            }
        }
    }

    /// Spawn the command. Directory mappings must already be in place.
    ///
    /// The child's stdout and stderr are piped; it is killed if dropped.
    pub fn spawn(&self, ctx: &ExecutionContext) -> Result<Child> {
        let mut cmd = self.command_for(ctx);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        debug!(
            data_id = ctx.data_id,
            engine = %self.kind(),
            pid = child.id(),
            "execution spawned"
        );
        Ok(child)
    }

    /// Stop a running execution.
    pub async fn terminate(&self, ctx: &ExecutionContext, child: &mut Child) {
        if let ExecutionEngine::Docker(docker) = self {
            // Killing the CLI client alone can leave the container running.
            let res = Command::new(&docker.command)
                .arg("kill")
                .arg(&ctx.container_name)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = res {
                warn!(data_id = ctx.data_id, container = %ctx.container_name, error = %e, "docker kill failed");
            }
        }

        if let Err(e) = child.kill().await {
            warn!(data_id = ctx.data_id, error = %e, "failed to kill execution process");
        }
    }
}

/// Both engines, built once from settings.
#[derive(Debug, Clone)]
pub struct EngineSet {
    docker: ExecutionEngine,
    local: ExecutionEngine,
}

impl EngineSet {
    pub fn from_settings(executor: &ExecutorSection) -> Self {
        Self {
            docker: ExecutionEngine::Docker(DockerEngine {
                command: executor.docker_command.clone(),
            }),
            local: ExecutionEngine::Local,
        }
    }

    /// `None` for workflows, which the manager expands instead of running.
    pub fn get(&self, kind: EngineKind) -> Option<&ExecutionEngine> {
        match kind {
            EngineKind::Docker => Some(&self.docker),
            EngineKind::Local => Some(&self.local),
            EngineKind::Workflow => None,
        }
    }
}

/// Output gathered from an execution's stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedOutput {
    /// Union of every JSON object line; later keys win.
    pub output: Map<String, Value>,
    /// Last [`DIAGNOSTIC_TAIL`] lines that were not JSON objects.
    pub diagnostics: VecDeque<String>,
}

impl CollectedOutput {
    pub fn push_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed.starts_with('{') {
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
                self.output.extend(obj);
                return;
            }
        }
        self.push_diagnostic(trimmed.to_string());
    }

    pub fn push_diagnostic(&mut self, line: String) {
        if self.diagnostics.len() == DIAGNOSTIC_TAIL {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(line);
    }
}

/// Read `reader` to the end, sorting lines into outputs and diagnostics.
pub async fn collect_output<R>(data_id: DataId, reader: R) -> CollectedOutput
where
    R: AsyncRead + Unpin,
{
    let mut collected = CollectedOutput::default();
    for_each_line(data_id, reader, |line| collected.push_line(&line)).await;
    collected
}

/// Feed every line of `reader` to `f`.
///
/// Lines are decoded lossily, so invalid UTF-8 does not cut the stream
/// short. A read error is logged and ends it.
pub async fn for_each_line<R, F>(data_id: DataId, reader: R, mut f: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                f(line.trim_end_matches(['\n', '\r']).to_string());
            }
            Err(e) => {
                warn!(data_id, error = %e, "reading execution output failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn json_lines_become_output_and_the_rest_diagnostics() {
        let text = b"starting\n{\"count\": 3}\nnot {json\n{\"count\": 4, \"file\": \"out.txt\"}\n[1,2]\n";
        let collected = collect_output(1, &text[..]).await;
        assert_eq!(collected.output.get("count"), Some(&json!(4)));
        assert_eq!(collected.output.get("file"), Some(&json!("out.txt")));
        assert_eq!(
            collected.diagnostics.iter().cloned().collect::<Vec<_>>(),
            vec!["starting", "not {json", "[1,2]"]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_hide_later_output() {
        let text = b"\xff\xfe garbage\n{\"n\": 1}\nlast\r\n";
        let collected = collect_output(1, &text[..]).await;
        assert_eq!(collected.output.get("n"), Some(&json!(1)));
        assert_eq!(collected.diagnostics.len(), 2);
        assert!(collected.diagnostics[0].ends_with(" garbage"));
        assert_eq!(collected.diagnostics[1], "last");
    }

    #[test]
    fn diagnostics_keep_only_the_tail() {
        let mut c = CollectedOutput::default();
        for i in 0..(DIAGNOSTIC_TAIL + 5) {
            c.push_line(&format!("line {i}"));
        }
        assert_eq!(c.diagnostics.len(), DIAGNOSTIC_TAIL);
        assert_eq!(c.diagnostics.front().map(String::as_str), Some("line 5"));
    }

    #[test]
    fn docker_command_carries_volumes_and_name() {
        let engine = ExecutionEngine::Docker(DockerEngine {
            command: "podman".to_string(),
        });
        let ctx = ExecutionContext {
            data_id: 9,
            process: crate::process::ProcessRef {
                slug: "p".to_string(),
                version: crate::process::ProcessVersion::new(1, 0, 0),
            },
            engine: EngineKind::Docker,
            command: "echo hi".to_string(),
            container_image: "img".to_string(),
            container_name: "flowmgr-9".to_string(),
            mappings: vec![crate::exec::mappings::DirectoryMapping {
                source: "/srv/data/9".into(),
                destination: "/data".into(),
                mode: "rw,Z".parse().unwrap(),
                per_data: true,
            }],
            output_dir: "/srv/data/9".into(),
            notify_channel: "x.notifications".to_string(),
            attempt: 1,
            owns_data_dir: false,
        };

        let cmd = engine.command_for(&ctx);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "podman");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "run", "--rm", "--name", "flowmgr-9", "-v", "/srv/data/9:/data:rw,Z", "-w", "/data", "-e",
                "DATA_ID=9", "img", "/bin/sh", "-c", "echo hi"
            ]
        );
    }
}
