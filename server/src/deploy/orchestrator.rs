//! Docker Compose orchestration

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::DockyardError;
use crate::filesys::dir::Dir;
use crate::models::deployment::compose_project_name;

/// Compose file name inside a stack's project directory
pub const COMPOSE_FILE: &str = "docker-compose.yml";
/// Environment file name inside a stack's project directory
pub const ENV_FILE: &str = ".env";

/// Runtime state of one service of a stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
}

/// Executes stack operations against a container runtime
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Bring a stack up from compose source and environment
    async fn deploy(
        &self,
        stack_name: &str,
        compose_source: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), DockyardError>;

    async fn stop(&self, stack_name: &str) -> Result<(), DockyardError>;

    async fn start(&self, stack_name: &str) -> Result<(), DockyardError>;

    async fn restart(&self, stack_name: &str) -> Result<(), DockyardError>;

    /// Service name to runtime state
    async fn status(&self, stack_name: &str) -> Result<BTreeMap<String, ServiceState>, DockyardError>;

    /// Tear a stack down, optionally with its volumes
    async fn remove(&self, stack_name: &str, remove_volumes: bool) -> Result<(), DockyardError>;
}

/// Orchestrator driving the `docker compose` CLI.
///
/// Stacks map to lowercase compose projects, each with its own directory
/// under `projects_dir`.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    /// Program followed by leading arguments
    command: Vec<String>,
    projects_dir: Dir,
    timeout: Duration,
}

impl ComposeCli {
    pub fn new(command: Vec<String>, projects_dir: Dir, timeout: Duration) -> Self {
        Self {
            command,
            projects_dir,
            timeout,
        }
    }

    fn project_dir(&self, stack_name: &str) -> Dir {
        self.projects_dir.subdir(&compose_project_name(stack_name))
    }

    /// Run one compose subcommand, killing it when the timeout elapses
    async fn run(&self, stack_name: &str, args: &[&str]) -> Result<String, DockyardError> {
        let (program, prefix) = self.command.split_first().ok_or_else(|| {
            DockyardError::ConfigError("compose command is empty".to_string())
        })?;

        let project = self.project_dir(stack_name);
        let compose_file = project.file(COMPOSE_FILE);
        let env_file = project.file(ENV_FILE);

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .arg("--project-name")
            .arg(compose_project_name(stack_name));
        if compose_file.exists().await {
            cmd.arg("--file").arg(compose_file.path());
            cmd.current_dir(project.path());
        }
        if env_file.exists().await {
            cmd.arg("--env-file").arg(env_file.path());
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} compose {} for stack {}", program, args.join(" "), stack_name);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                DockyardError::OrchestrationFailure(format!(
                    "compose {} for stack {} timed out after {:?}",
                    args.join(" "),
                    stack_name,
                    self.timeout
                ))
            })?
            .map_err(|e| {
                DockyardError::OrchestrationFailure(format!("Failed to run {}: {}", program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DockyardError::OrchestrationFailure(format!(
                "compose {} for stack {} exited with {}: {}",
                args.join(" "),
                stack_name,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Orchestrator for ComposeCli {
    async fn deploy(
        &self,
        stack_name: &str,
        compose_source: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), DockyardError> {
        let project = self.project_dir(stack_name);
        project.create().await?;
        project.file(COMPOSE_FILE).write_string(compose_source).await?;
        let env_file = project.file(ENV_FILE);
        env_file.write_string(&render_env_file(env)).await?;
        env_file.set_permissions_600().await?;

        self.run(stack_name, &["up", "--detach", "--remove-orphans"])
            .await?;
        info!("Stack {} is up", stack_name);
        Ok(())
    }

    async fn stop(&self, stack_name: &str) -> Result<(), DockyardError> {
        self.run(stack_name, &["stop"]).await.map(|_| ())
    }

    async fn start(&self, stack_name: &str) -> Result<(), DockyardError> {
        self.run(stack_name, &["start"]).await.map(|_| ())
    }

    async fn restart(&self, stack_name: &str) -> Result<(), DockyardError> {
        self.run(stack_name, &["restart"]).await.map(|_| ())
    }

    async fn status(&self, stack_name: &str) -> Result<BTreeMap<String, ServiceState>, DockyardError> {
        let stdout = self
            .run(stack_name, &["ps", "--all", "--format", "json"])
            .await?;
        parse_ps_output(&stdout)
    }

    async fn remove(&self, stack_name: &str, remove_volumes: bool) -> Result<(), DockyardError> {
        let mut args = vec!["down", "--remove-orphans"];
        if remove_volumes {
            args.push("--volumes");
        }
        self.run(stack_name, &args).await?;
        self.project_dir(stack_name).delete().await?;
        info!("Stack {} removed", stack_name);
        Ok(())
    }
}

/// Render `KEY=VALUE` lines sorted by key
pub fn render_env_file(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(key);
        out.push('=');
        if value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '$' | '\\'))
        {
            out.push('"');
            for c in value.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '$' => out.push_str("$$"),
                    other => out.push(other),
                }
            }
            out.push('"');
        } else {
            out.push_str(value);
        }
        out.push('\n');
    }
    out
}

#[derive(Deserialize)]
struct PsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
}

/// Parse `compose ps --format json`, which is a JSON array in older
/// releases and one object per line in newer ones
pub fn parse_ps_output(stdout: &str) -> Result<BTreeMap<String, ServiceState>, DockyardError> {
    let trimmed = stdout.trim();
    let entries: Vec<PsEntry> = if trimmed.is_empty() {
        Vec::new()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };

    Ok(entries
        .into_iter()
        .map(|entry| {
            let health = (!entry.health.is_empty()).then_some(entry.health);
            (
                entry.service,
                ServiceState {
                    state: entry.state,
                    health,
                },
            )
        })
        .collect())
}
